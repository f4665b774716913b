//! Call Router (C7): validates a call against capabilities, preconditions,
//! and mode-gating policy, then dispatches to the correct provider (§4.6).

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::device_registry::{Device, DeviceHandle, DeviceRegistry};
use crate::error::{ErrorKind, RuntimeError};
use crate::mode::{Mode, ModeManager};
use crate::provider::protocol::ResponsePayload;
use crate::provider::registry::ProviderRegistry;
use crate::state_cache::{ExternalQuality, StateCache};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatingPolicy {
    Block,
    Override,
}

impl Default for GatingPolicy {
    fn default() -> Self {
        GatingPolicy::Block
    }
}

#[derive(Debug, Clone)]
pub struct CallRequest {
    pub device_handle: String,
    pub function_name: String,
    pub args: HashMap<String, Value>,
    pub is_automated: bool,
}

#[derive(Debug, Clone)]
pub struct CallResult {
    pub success: bool,
    pub error_message: Option<String>,
    pub return_value: Option<Value>,
}

impl CallResult {
    fn ok(return_value: Option<Value>) -> Self {
        Self {
            success: true,
            error_message: None,
            return_value,
        }
    }

    fn err(e: RuntimeError) -> Self {
        Self {
            success: false,
            error_message: Some(e.to_string()),
            return_value: None,
        }
    }
}

/// A predicate over a single cached signal, composed into preconditions
/// (§4.6 step 5: "AND/OR composition ... evaluated").
pub enum SignalPredicate {
    QualityIs(ExternalQuality),
    ValueEquals(Value),
    ValueAtLeast(f64),
    ValueAtMost(f64),
}

impl SignalPredicate {
    fn evaluate(&self, view: &crate::state_cache::SignalView) -> bool {
        match self {
            SignalPredicate::QualityIs(q) => view.quality == *q,
            SignalPredicate::ValueEquals(v) => &view.value == v,
            SignalPredicate::ValueAtLeast(min) => view.value.as_f64().map_or(false, |n| n >= *min),
            SignalPredicate::ValueAtMost(max) => view.value.as_f64().map_or(false, |n| n <= *max),
        }
    }
}

pub struct Precondition {
    pub device_handle: String,
    pub signal_id: String,
    pub predicate: SignalPredicate,
}

pub enum PreconditionExpr {
    Leaf(Precondition),
    And(Vec<PreconditionExpr>),
    Or(Vec<PreconditionExpr>),
}

impl PreconditionExpr {
    fn evaluate(&self, cache: &StateCache) -> bool {
        match self {
            PreconditionExpr::Leaf(p) => {
                let Ok(handle) = DeviceHandle::parse(&p.device_handle) else {
                    return false;
                };
                match cache.get_signal_value(&handle, &p.signal_id) {
                    Some(view) => p.predicate.evaluate(&view),
                    None => false,
                }
            }
            PreconditionExpr::And(children) => children.iter().all(|c| c.evaluate(cache)),
            PreconditionExpr::Or(children) => children.iter().any(|c| c.evaluate(cache)),
        }
    }
}

/// Validated call-router configuration: per-function preconditions keyed by
/// `"provider_id/device_id::function_name"`, plus the mode-gating policy
/// applied to calls made outside MANUAL (§4.6 step 6).
pub struct CallRouter {
    preconditions: HashMap<String, PreconditionExpr>,
    manual_gating_policy: GatingPolicy,
    mode_manager: Option<Arc<ModeManager>>,
    prompt_poll_enabled: bool,
}

impl CallRouter {
    pub fn new(manual_gating_policy: GatingPolicy) -> Self {
        Self {
            preconditions: HashMap::new(),
            manual_gating_policy,
            mode_manager: None,
            prompt_poll_enabled: true,
        }
    }

    pub fn with_mode_manager(mut self, mode_manager: Arc<ModeManager>) -> Self {
        self.mode_manager = Some(mode_manager);
        self
    }

    pub fn set_prompt_poll_enabled(&mut self, enabled: bool) {
        self.prompt_poll_enabled = enabled;
    }

    pub fn set_precondition(&mut self, device_handle: &str, function_name: &str, expr: PreconditionExpr) {
        self.preconditions
            .insert(format!("{device_handle}::{function_name}"), expr);
    }

    /// Runs the validation pipeline (§4.6 steps 1-6) without dispatching.
    pub fn validate_call(
        &self,
        request: &CallRequest,
        devices: &DeviceRegistry,
        cache: &StateCache,
    ) -> Result<(DeviceHandle, Device, String), RuntimeError> {
        // 1. Parse device_handle.
        let handle = DeviceHandle::parse(&request.device_handle)?;

        // 2. Resolve device.
        let device = devices
            .get_by_handle(&handle)
            .ok_or_else(|| RuntimeError::not_found(format!("NOT_FOUND: unknown device '{handle}'")))?;

        // 3. Resolve function by name.
        let function = device.function_by_name(&request.function_name).ok_or_else(|| {
            RuntimeError::not_found(format!(
                "NOT_FOUND: device '{handle}' has no function '{}'",
                request.function_name
            ))
        })?;
        let function_id = function.function_id.clone();

        // 4. Validate each declared arg; reject undeclared args outright.
        for spec in &function.args {
            match request.args.get(&spec.name) {
                None => {
                    if spec.required {
                        return Err(RuntimeError::invalid_argument(format!(
                            "INVALID_ARGUMENT: missing required arg '{}'",
                            spec.name
                        )));
                    }
                }
                Some(value) => {
                    if value.type_tag() != spec.type_tag {
                        return Err(RuntimeError::invalid_argument(format!(
                            "INVALID_ARGUMENT: arg '{}' has type {:?}, expected {:?}",
                            spec.name,
                            value.type_tag(),
                            spec.type_tag
                        )));
                    }
                    if let Some(bounds) = &spec.bounds {
                        if let Some(n) = value.as_f64() {
                            if let Some(min) = bounds.min {
                                if n < min {
                                    return Err(RuntimeError::invalid_argument(format!(
                                        "INVALID_ARGUMENT: arg '{}' value {n} below minimum {min}",
                                        spec.name
                                    )));
                                }
                            }
                            if let Some(max) = bounds.max {
                                if n > max {
                                    return Err(RuntimeError::invalid_argument(format!(
                                        "INVALID_ARGUMENT: arg '{}' value {n} above maximum {max}",
                                        spec.name
                                    )));
                                }
                            }
                        }
                    }
                }
            }
        }
        let declared: std::collections::HashSet<&str> = function.args.iter().map(|a| a.name.as_str()).collect();
        for name in request.args.keys() {
            if !declared.contains(name.as_str()) {
                return Err(RuntimeError::invalid_argument(format!(
                    "INVALID_ARGUMENT: unknown arg '{name}'"
                )));
            }
        }

        // 5. Precondition check.
        let key = format!("{handle}::{}", request.function_name);
        if let Some(expr) = self.preconditions.get(&key) {
            if !expr.evaluate(cache) {
                return Err(RuntimeError::failed_precondition(
                    "FAILED_PRECONDITION: precondition not satisfied".to_string(),
                ));
            }
        }

        // 6. Mode gating (§3.6): MANUAL admits everything; AUTO admits
        // automated calls and manual calls only under the override policy;
        // IDLE blocks everything; FAULT admits only manual intervention.
        if let Some(mode_manager) = &self.mode_manager {
            let mode = mode_manager.current_mode();
            let blocked = match mode {
                Mode::Manual => false,
                Mode::Auto => !request.is_automated && self.manual_gating_policy == GatingPolicy::Block,
                Mode::Idle => true,
                Mode::Fault => request.is_automated,
            };
            if blocked {
                return Err(RuntimeError::failed_precondition(format!(
                    "FAILED_PRECONDITION: mode {:?} rejects this call (automated={})",
                    mode, request.is_automated
                )));
            }
        }

        Ok((handle, device, function_id))
    }

    /// Validates and, on success, dispatches the call and (optionally)
    /// triggers a prompt poll (§4.6 "Execution").
    pub fn execute_call(
        &self,
        request: &CallRequest,
        devices: &DeviceRegistry,
        providers: &ProviderRegistry,
        cache: &StateCache,
    ) -> CallResult {
        let (handle, _device, function_id) = match self.validate_call(request, devices, cache) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(error = %e, "call validation failed");
                return CallResult::err(e);
            }
        };

        let Some(provider) = providers.get(&handle.provider_id) else {
            return CallResult::err(RuntimeError::unavailable(format!(
                "UNAVAILABLE: provider '{}' is not registered",
                handle.provider_id
            )));
        };

        let dispatch = provider.call(&handle.device_id, &function_id, &request.function_name, request.args.clone());

        let result = match dispatch {
            Ok(resp) => {
                if resp.status.code == crate::error::StatusCode::Ok {
                    let return_value = match resp.payload {
                        ResponsePayload::Call { return_value } => return_value,
                        _ => None,
                    };
                    CallResult::ok(return_value)
                } else {
                    let kind: ErrorKind = resp.status.code.into();
                    CallResult::err(RuntimeError::new(kind, resp.status.message))
                }
            }
            Err(e) => {
                let kind = if e.is_transport_class() {
                    ErrorKind::Unavailable
                } else {
                    ErrorKind::Internal
                };
                CallResult::err(RuntimeError::new(kind, e.to_string()))
            }
        };

        if result.success {
            info!(device = %handle, function = %request.function_name, automated = request.is_automated, "call dispatched");
            if self.prompt_poll_enabled {
                cache.prompt_poll(&handle.provider_id, &handle.device_id);
            }
        }

        result
    }
}
