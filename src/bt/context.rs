//! The typed, non-owning service context injected into the blackboard on
//! every tick (§4.7, §9 REDESIGN FLAG: replaces an "opaque pointer through
//! blackboard" anti-pattern with borrowed references the compiler checks).
//!
//! A [`ServiceContext`] is built fresh inside [`super::runtime::BtRuntime`]'s
//! tick loop and handed to node execution by reference. It must not be
//! retained past the tick that constructed it — nothing in this module makes
//! that a compile error (the nodes only ever see `&ServiceContext<'_>`), but
//! no code in this crate stores one, and none should be added.

use crate::device_registry::DeviceRegistry;
use crate::parameters::ParameterManager;
use crate::provider::registry::ProviderRegistry;
use crate::router::CallRouter;
use crate::state_cache::StateCache;

pub struct ServiceContext<'a> {
    pub state_cache: &'a StateCache,
    pub call_router: &'a CallRouter,
    pub devices: &'a DeviceRegistry,
    pub providers: &'a ProviderRegistry,
    pub parameters: &'a ParameterManager,
}

impl<'a> ServiceContext<'a> {
    pub fn new(
        state_cache: &'a StateCache,
        call_router: &'a CallRouter,
        devices: &'a DeviceRegistry,
        providers: &'a ProviderRegistry,
        parameters: &'a ParameterManager,
    ) -> Self {
        Self {
            state_cache,
            call_router,
            devices,
            providers,
            parameters,
        }
    }
}
