//! Runtime Orchestrator (C12): staged init, main monitoring loop, graceful
//! shutdown (§4.10).
//!
//! Owns exactly one instance of every other kernel service (§3.9) and is the
//! only thing in this crate that knows the full init/shutdown order. The HTTP
//! front-end and telemetry sink are external collaborators (§1) — this crate
//! only reserves their place in the staged init/shutdown sequence, as no-ops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::bt::BtRuntime;
use crate::config::Config;
use crate::device_registry::DeviceRegistry;
use crate::error::{ErrorKind, Result, RuntimeError};
use crate::events::EventEmitter;
use crate::mode::{Mode, ModeManager};
use crate::parameters::ParameterManager;
use crate::provider::{ProviderHandle, ProviderRegistry, ProviderSpawnSpec};
use crate::router::CallRouter;
use crate::shutdown::ShutdownFlag;
use crate::state_cache::StateCache;
use crate::supervisor::ProviderSupervisor;

const MAIN_LOOP_PERIOD: Duration = Duration::from_millis(100);

/// Everything the orchestrator needs to (re)build one provider, kept around
/// so `restart_provider` (§4.10) doesn't need to go back to the original
/// config document.
struct ManagedProvider {
    spawn_spec: ProviderSpawnSpec,
}

/// Owns one instance of every kernel service and drives the staged init,
/// main monitoring loop, and graceful shutdown described in §4.10.
pub struct Orchestrator {
    devices: Arc<DeviceRegistry>,
    providers: Arc<ProviderRegistry>,
    emitter: Arc<EventEmitter>,
    cache: Arc<StateCache>,
    router: Arc<CallRouter>,
    supervisor: Arc<ProviderSupervisor>,
    mode_manager: Arc<ModeManager>,
    parameters: Arc<ParameterManager>,
    bt_runtime: Option<Arc<BtRuntime>>,
    tick_rate_hz: u64,
    managed: Mutex<Vec<ManagedProvider>>,
    shutdown_flag: ShutdownFlag,
    running: AtomicBool,
}

impl Orchestrator {
    /// Stage 1: core services. (registry, emitter, cache wired to emitter,
    /// router, supervisor) — §4.10 init order.
    pub fn init(config: &Config) -> Result<Self> {
        info!("init: core services");
        let devices = Arc::new(DeviceRegistry::new());
        let providers = Arc::new(ProviderRegistry::new());
        let emitter = Arc::new(EventEmitter::new(
            config.events.queue_capacity,
            config.events.subscriber_cap,
        ));
        let cache = Arc::new(StateCache::new(
            devices.clone(),
            providers.clone(),
            emitter.clone(),
            config.polling_interval_ms,
        ));
        let supervisor = Arc::new(ProviderSupervisor::new(config.restart_policy.clone().into()));

        let initial_mode = config
            .initial_mode()
            .ok_or_else(|| RuntimeError::new(ErrorKind::InvalidArgument, format!("runtime.mode '{}' is not a valid mode", config.runtime_mode)))?;
        let mode_manager = Arc::new(ModeManager::with_emitter(initial_mode, emitter.clone()));
        let router = Arc::new(
            CallRouter::new(config.gating_policy()).with_mode_manager(mode_manager.clone()),
        );
        let parameters = Arc::new(ParameterManager::with_emitter(emitter.clone()));

        let mut orchestrator = Self {
            devices,
            providers,
            emitter,
            cache,
            router,
            supervisor,
            mode_manager,
            parameters,
            bt_runtime: None,
            tick_rate_hz: config.tick_rate_hz,
            managed: Mutex::new(Vec::new()),
            shutdown_flag: ShutdownFlag::new(),
            running: AtomicBool::new(false),
        };

        // Stage 2: providers (spawn, register in supervisor, discover, add
        // to provider registry).
        info!("init: providers");
        for provider_cfg in &config.providers {
            orchestrator.spawn_and_discover(provider_cfg)?;
        }

        // Stage 3: prime poll_once.
        info!("init: priming state cache");
        orchestrator.cache.poll_once();

        // Stage 4: automation (mode, parameters, BT).
        info!("init: automation");
        for param in &config.parameters {
            orchestrator.define_parameter(param)?;
        }
        if let Some(tree_path) = &config.bt_tree_path {
            let bt = Arc::new(BtRuntime::new(
                orchestrator.cache.clone(),
                orchestrator.router.clone(),
                orchestrator.devices.clone(),
                orchestrator.providers.clone(),
                orchestrator.parameters.clone(),
                orchestrator.mode_manager.clone(),
                orchestrator.emitter.clone(),
            ));
            bt.load_tree(std::path::Path::new(tree_path))?;
            orchestrator.bt_runtime = Some(bt);
        }

        // Stage 5/6: HTTP front-end, telemetry sink — external collaborators
        // out of scope (§1); nothing to construct here.
        info!("init: http front-end (external, not constructed here)");
        info!("init: telemetry sink (external, not constructed here)");

        Ok(orchestrator)
    }

    fn spawn_and_discover(&mut self, provider_cfg: &crate::config::ProviderConfig) -> Result<()> {
        let spawn_spec = ProviderSpawnSpec {
            provider_id: provider_cfg.provider_id.clone(),
            command: provider_cfg.command.clone(),
            args: provider_cfg.args.clone(),
            timeout: Duration::from_millis(provider_cfg.timeout_ms),
        };
        let handle = Arc::new(ProviderHandle::new(spawn_spec.clone()));
        handle
            .start()
            .map_err(|e| RuntimeError::new(ErrorKind::Unavailable, format!("starting provider '{}': {e}", spawn_spec.provider_id)))?;
        self.devices
            .discover_provider(&spawn_spec.provider_id, &handle)
            .map_err(|e| RuntimeError::new(e.kind, format!("discovering provider '{}': {}", spawn_spec.provider_id, e.message)))?;
        self.cache.rebuild_poll_configs(&spawn_spec.provider_id);
        self.providers.insert(handle);
        self.managed.lock().unwrap().push(ManagedProvider { spawn_spec });
        Ok(())
    }

    fn define_parameter(&self, param_cfg: &crate::config::ParameterConfig) -> Result<()> {
        let type_tag = crate::parameters::parameter_type_from_string(&param_cfg.type_name)
            .ok_or_else(|| RuntimeError::invalid_argument(format!("unknown parameter type '{}'", param_cfg.type_name)))?;
        let default = json_to_value(type_tag, &param_cfg.default)
            .ok_or_else(|| RuntimeError::invalid_argument(format!("parameter '{}' default does not match its declared type", param_cfg.name)))?;
        let bounds = if param_cfg.min.is_some() || param_cfg.max.is_some() {
            Some(crate::parameters::NumericBounds {
                min: param_cfg.min,
                max: param_cfg.max,
            })
        } else {
            None
        };
        self.parameters
            .define(&param_cfg.name, type_tag, default, bounds, param_cfg.allowed.clone())
            .map_err(RuntimeError::invalid_argument)
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }
    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }
    pub fn emitter(&self) -> &Arc<EventEmitter> {
        &self.emitter
    }
    pub fn cache(&self) -> &Arc<StateCache> {
        &self.cache
    }
    pub fn router(&self) -> &Arc<CallRouter> {
        &self.router
    }
    pub fn supervisor(&self) -> &Arc<ProviderSupervisor> {
        &self.supervisor
    }
    pub fn mode_manager(&self) -> &Arc<ModeManager> {
        &self.mode_manager
    }
    pub fn parameters(&self) -> &Arc<ParameterManager> {
        &self.parameters
    }
    pub fn bt_runtime(&self) -> Option<&Arc<BtRuntime>> {
        self.bt_runtime.as_ref()
    }
    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown_flag.clone()
    }

    /// Spins the polling thread, starts the BT tick (if configured), then
    /// enters the 100ms main-monitoring loop (§4.10) until the shutdown flag
    /// is observed.
    pub fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.cache.start_polling();
        if let Some(bt) = &self.bt_runtime {
            bt.start(self.tick_rate_hz)?;
        }

        info!("orchestrator main loop started");
        while !self.shutdown_flag.is_set() {
            self.monitor_providers();
            std::thread::sleep(MAIN_LOOP_PERIOD);
        }
        info!("shutdown flag observed, leaving main loop");
        self.shutdown();
        Ok(())
    }

    /// One iteration of the provider health check / restart loop (§4.10
    /// step 2). Split out from `run` so tests can drive a single iteration
    /// deterministically.
    pub fn monitor_providers(&self) {
        let provider_ids: Vec<String> = self.managed.lock().unwrap().iter().map(|m| m.spawn_spec.provider_id.clone()).collect();
        for provider_id in provider_ids {
            let Some(handle) = self.providers.get(&provider_id) else {
                continue;
            };
            if !handle.is_available() {
                if !self.supervisor.is_circuit_open(&provider_id) {
                    self.supervisor.mark_crash_detected(&provider_id);
                    self.supervisor.record_crash(&provider_id);
                }
                if self.supervisor.should_restart(&provider_id) {
                    if let Err(e) = self.restart_provider(&provider_id) {
                        warn!(provider = %provider_id, error = %e, "restart attempt failed");
                    }
                }
            } else {
                if self.supervisor.crash_detected(&provider_id) {
                    self.supervisor.record_success(&provider_id);
                    self.supervisor.clear_crash_detected(&provider_id);
                }
            }
        }
    }

    /// Tears down the handle, clears the registry for `provider_id`,
    /// re-spawns, rediscovers devices, rebuilds the poll plan, re-adds the
    /// handle (§4.10, S3).
    fn restart_provider(&self, provider_id: &str) -> Result<()> {
        info!(provider = provider_id, "attempting restart");
        let spawn_spec = {
            let managed = self.managed.lock().unwrap();
            managed
                .iter()
                .find(|m| m.spawn_spec.provider_id == provider_id)
                .map(|m| m.spawn_spec.clone())
                .ok_or_else(|| RuntimeError::not_found(format!("no spawn spec for provider '{provider_id}'")))?
        };

        if let Some(old) = self.providers.remove(provider_id) {
            old.shutdown();
        }
        self.devices.clear_provider_devices(provider_id);

        let handle = Arc::new(ProviderHandle::new(spawn_spec.clone()));
        handle.start().map_err(|e| RuntimeError::unavailable(format!("restart spawn failed: {e}")))?;
        self.devices.discover_provider(provider_id, &handle)?;
        self.cache.rebuild_poll_configs(provider_id);
        self.providers.insert(handle);
        info!(provider = provider_id, "restart succeeded");
        Ok(())
    }

    /// Shutdown order: BT -> HTTP -> telemetry -> cache polling -> providers
    /// (§4.10).
    pub fn shutdown(&self) {
        info!("shutdown: stopping bt tick thread");
        if let Some(bt) = &self.bt_runtime {
            bt.stop();
        }
        info!("shutdown: http front-end (external, nothing to stop here)");
        info!("shutdown: telemetry sink (external, nothing to stop here)");
        info!("shutdown: stopping state cache polling");
        self.cache.stop_polling();
        info!("shutdown: tearing down providers");
        for handle in self.providers.all() {
            handle.shutdown();
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

fn json_to_value(type_tag: crate::value::ValueType, json: &serde_json::Value) -> Option<crate::value::Value> {
    use crate::value::{Value, ValueType};
    match type_tag {
        ValueType::Double => json.as_f64().map(Value::Double),
        ValueType::Int64 => json.as_i64().map(Value::Int64),
        ValueType::Uint64 => json.as_u64().map(Value::Uint64),
        ValueType::Bool => json.as_bool().map(Value::Bool),
        ValueType::String => json.as_str().map(|s| Value::String(s.to_string())),
        ValueType::Bytes => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_with_no_providers_succeeds() {
        let config = Config::default();
        let orchestrator = Orchestrator::init(&config).unwrap();
        assert_eq!(orchestrator.mode_manager.current_mode(), Mode::Idle);
        assert!(orchestrator.providers.all().is_empty());
    }

    #[test]
    fn init_honors_configured_initial_mode() {
        let mut config = Config::default();
        config.runtime_mode = "MANUAL".into();
        let orchestrator = Orchestrator::init(&config).unwrap();
        assert_eq!(orchestrator.mode_manager.current_mode(), Mode::Manual);
    }

    #[test]
    fn init_defines_configured_parameters() {
        let mut config = Config::default();
        config.parameters.push(crate::config::ParameterConfig {
            name: "target".into(),
            type_name: "double".into(),
            default: serde_json::json!(25.0),
            min: Some(0.0),
            max: Some(100.0),
            allowed: None,
        });
        let orchestrator = Orchestrator::init(&config).unwrap();
        assert_eq!(orchestrator.parameters.get_double("target", -1.0), 25.0);
    }

    #[test]
    fn shutdown_is_idempotent_with_no_providers() {
        let config = Config::default();
        let orchestrator = Orchestrator::init(&config).unwrap();
        orchestrator.shutdown();
        orchestrator.shutdown();
    }

    #[test]
    fn monitor_providers_is_a_no_op_with_nothing_managed() {
        let config = Config::default();
        let orchestrator = Orchestrator::init(&config).unwrap();
        orchestrator.monitor_providers();
    }
}
