//! The three end-to-end scenarios from spec §8: a happy-path manual call
//! (S1), a behavior tree driving a setpoint in AUTO (S2), and a provider
//! crash followed by a supervised restart (S3).
//!
//! None of these spin up a real provider subprocess — an in-process fake
//! transport stands in for the wire protocol, matching the test-tooling
//! convention in `SPEC_FULL.md` §A.4 (`ProviderTransport` as the seam between
//! the real subprocess client and a fixture).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anolis_runtime::bt::{tick, Blackboard, BtRuntime, NodeKind, PolicyNode, ServiceContext};
use anolis_runtime::device_registry::{DeviceHandle, DeviceRegistry};
use anolis_runtime::events::EventEmitter;
use anolis_runtime::mode::{Mode, ModeManager};
use anolis_runtime::parameters::ParameterManager;
use anolis_runtime::provider::client::ClientError;
use anolis_runtime::provider::{ProviderHandle, ProviderRegistry, ProviderSpawnSpec, ProviderTransport};
use anolis_runtime::provider::protocol::{
    ArgSpec, DeviceDescriptor, FunctionSpec, NumericBounds, ReadingQuality, Response, ResponsePayload,
    SignalReading, SignalSpec, Status,
};
use anolis_runtime::router::{CallRequest, CallRouter, GatingPolicy};
use anolis_runtime::state_cache::{ExternalQuality, StateCache};
use anolis_runtime::supervisor::{ProviderSupervisor, RestartPolicy};
use anolis_runtime::value::{Value, ValueType};

/// A simulated "sim0/tempctl0" device: one signal `temp_c`, one function
/// `set_temp(target: double in [0,100])`. Calling `set_temp` writes the
/// shared cell so the next `read_signals` reflects the side effect, the same
/// way a real provider subprocess would.
struct TempControllerTransport {
    temp_c: Arc<Mutex<f64>>,
    fail: Arc<Mutex<bool>>,
}

impl TempControllerTransport {
    fn device_descriptor() -> DeviceDescriptor {
        DeviceDescriptor {
            device_id: "tempctl0".into(),
            type_id: "thermostat".into(),
            label: "Temp Controller".into(),
            signals: vec![SignalSpec {
                signal_id: "temp_c".into(),
                type_tag: ValueType::Double,
                label: None,
                unit: None,
            }],
            functions: vec![FunctionSpec {
                function_id: "fn_set_temp".into(),
                function_name: "set_temp".into(),
                args: vec![ArgSpec {
                    name: "target".into(),
                    type_tag: ValueType::Double,
                    required: true,
                    bounds: Some(NumericBounds {
                        min: Some(0.0),
                        max: Some(100.0),
                    }),
                    unit: None,
                }],
            }],
        }
    }
}

impl ProviderTransport for TempControllerTransport {
    fn hello(&mut self) -> Result<Response, ClientError> {
        Ok(Response {
            request_id: 0,
            status: Status::ok(),
            payload: ResponsePayload::Hello {
                provider_name: "sim0".into(),
            },
        })
    }

    fn list_devices(&mut self) -> Result<Response, ClientError> {
        if *self.fail.lock().unwrap() {
            return Err(ClientError::Timeout);
        }
        Ok(Response {
            request_id: 0,
            status: Status::ok(),
            payload: ResponsePayload::Devices(vec![Self::device_descriptor()]),
        })
    }

    fn describe_device(&mut self, device_id: &str) -> Result<Response, ClientError> {
        if *self.fail.lock().unwrap() {
            return Err(ClientError::Timeout);
        }
        let mut descriptor = Self::device_descriptor();
        descriptor.device_id = device_id.to_string();
        Ok(Response {
            request_id: 0,
            status: Status::ok(),
            payload: ResponsePayload::Device(descriptor),
        })
    }

    fn read_signals(&mut self, _device_id: &str, signal_ids: &[String]) -> Result<Response, ClientError> {
        if *self.fail.lock().unwrap() {
            return Err(ClientError::Timeout);
        }
        let mut signals = HashMap::new();
        if signal_ids.iter().any(|s| s == "temp_c") {
            signals.insert(
                "temp_c".to_string(),
                SignalReading {
                    value: Value::Double(*self.temp_c.lock().unwrap()),
                    quality: ReadingQuality::Ok,
                },
            );
        }
        Ok(Response {
            request_id: 0,
            status: Status::ok(),
            payload: ResponsePayload::Signals(signals),
        })
    }

    fn call(
        &mut self,
        _device_id: &str,
        _function_id: &str,
        function_name: &str,
        args: HashMap<String, Value>,
    ) -> Result<Response, ClientError> {
        if *self.fail.lock().unwrap() {
            return Err(ClientError::Timeout);
        }
        assert_eq!(function_name, "set_temp");
        if let Some(Value::Double(target)) = args.get("target") {
            *self.temp_c.lock().unwrap() = *target;
        }
        Ok(Response {
            request_id: 0,
            status: Status::ok(),
            payload: ResponsePayload::Call { return_value: None },
        })
    }

    fn shutdown(&mut self) {}
}

struct Harness {
    devices: Arc<DeviceRegistry>,
    providers: Arc<ProviderRegistry>,
    emitter: Arc<EventEmitter>,
    cache: Arc<StateCache>,
    temp_c: Arc<Mutex<f64>>,
    fail: Arc<Mutex<bool>>,
}

fn build_harness(initial_temp: f64) -> Harness {
    let devices = Arc::new(DeviceRegistry::new());
    let providers = Arc::new(ProviderRegistry::new());
    let emitter = Arc::new(EventEmitter::default());
    let temp_c = Arc::new(Mutex::new(initial_temp));
    let fail = Arc::new(Mutex::new(false));

    let handle = Arc::new(ProviderHandle::with_transport(
        ProviderSpawnSpec {
            provider_id: "sim0".into(),
            command: "unused".into(),
            args: vec![],
            timeout: Duration::from_millis(100),
        },
        Box::new(TempControllerTransport {
            temp_c: temp_c.clone(),
            fail: fail.clone(),
        }),
    ));
    devices.discover_provider("sim0", &handle).unwrap();
    providers.insert(handle);

    let cache = Arc::new(StateCache::new(devices.clone(), providers.clone(), emitter.clone(), 100));
    cache.rebuild_poll_configs("sim0");

    Harness {
        devices,
        providers,
        emitter,
        cache,
        temp_c,
        fail,
    }
}

fn device_handle() -> DeviceHandle {
    DeviceHandle {
        provider_id: "sim0".into(),
        device_id: "tempctl0".into(),
    }
}

/// S1 — happy path call under MANUAL.
#[test]
fn s1_happy_path_manual_call_updates_cache_and_emits() {
    let h = build_harness(22.0);
    h.cache.poll_once();

    let view = h.cache.get_signal_value(&device_handle(), "temp_c").unwrap();
    assert_eq!(view.value, Value::Double(22.0));
    assert_eq!(view.quality, ExternalQuality::Ok);

    let subscriber = h.emitter.subscribe().unwrap();
    h.emitter.drain(subscriber); // discard the initial priming poll's events

    let router = CallRouter::new(GatingPolicy::Block);
    let request = CallRequest {
        device_handle: "sim0/tempctl0".into(),
        function_name: "set_temp".into(),
        args: HashMap::from([("target".to_string(), Value::Double(30.0))]),
        is_automated: false,
    };
    let result = router.execute_call(&request, &h.devices, &h.providers, &h.cache);
    assert!(result.success, "{:?}", result.error_message);

    // Prompt poll happens synchronously inside execute_call (§5 ordering
    // guarantee: success is followed by at least one poll before return).
    let view = h.cache.get_signal_value(&device_handle(), "temp_c").unwrap();
    assert_eq!(view.value, Value::Double(30.0));

    let events = h.emitter.drain(subscriber).unwrap();
    assert!(events
        .iter()
        .any(|e| matches!(e, anolis_runtime::events::Event::SignalUpdate { .. })));
}

/// S2 — BT in AUTO driving a setpoint.
#[test]
fn s2_bt_sequence_drives_setpoint_via_call_device() {
    let h = build_harness(22.0);
    h.cache.poll_once();

    let router = CallRouter::new(GatingPolicy::Block);
    let parameters = ParameterManager::new();
    parameters
        .define("target", ValueType::Double, Value::Double(25.0), None, None)
        .unwrap();

    let tree = PolicyNode::Sequence(vec![
        PolicyNode::Action(NodeKind::CheckQuality {
            device: "sim0/tempctl0".into(),
            signal_id: "temp_c".into(),
            accept: vec!["OK".into()],
        }),
        PolicyNode::Action(NodeKind::GetParameter {
            name: "target".into(),
            output_key: "t".into(),
        }),
        PolicyNode::Action(NodeKind::CallDevice {
            device: "sim0/tempctl0".into(),
            function: "set_temp".into(),
            args: r#"json:{"target": 25.0}"#.into(),
        }),
    ]);

    let ctx = ServiceContext::new(&h.cache, &router, &h.devices, &h.providers, &parameters);
    let mut bb = Blackboard::default();
    let status = tick(&tree, &ctx, &mut bb);
    assert!(matches!(status, bonsai_bt::Status::Success));
    assert_eq!(bb.get("t"), Some(&Value::Double(25.0)));

    assert_eq!(*h.temp_c.lock().unwrap(), 25.0);
}

/// S2 (continued) — the dedicated tick thread only drives the tree while
/// mode is AUTO, and a transition away from AUTO stops future ticks.
#[test]
fn s2_tick_thread_runs_only_in_auto_mode() {
    let h = build_harness(22.0);
    h.cache.poll_once();

    let router = Arc::new(CallRouter::new(GatingPolicy::Block));
    let parameters = Arc::new(ParameterManager::new());
    parameters
        .define("target", ValueType::Double, Value::Double(25.0), None, None)
        .unwrap();
    let mode_manager = Arc::new(ModeManager::new(Mode::Manual));

    let runtime = Arc::new(BtRuntime::new(
        h.cache.clone(),
        router,
        h.devices.clone(),
        h.providers.clone(),
        parameters,
        mode_manager.clone(),
        h.emitter.clone(),
    ));

    // Load through the public surface only: write a RON tree to a temp file
    // and use `load_tree`, matching how a real deployment wires this up.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tree.ron");
    std::fs::write(
        &path,
        r#"Action(CallDevice(device: "sim0/tempctl0", function: "set_temp", args: "json:{\"target\": 40.0}"))"#,
    )
    .unwrap();
    runtime.load_tree(&path).unwrap();

    runtime.start(50).unwrap();
    std::thread::sleep(Duration::from_millis(120));
    runtime.stop();

    assert_eq!(runtime.total_ticks(), 0, "no ticks expected while mode is MANUAL");

    mode_manager.set_mode(Mode::Auto);
    runtime.start(50).unwrap();
    std::thread::sleep(Duration::from_millis(120));
    runtime.stop();

    assert!(runtime.total_ticks() > 0, "expected ticks once mode is AUTO");
    assert_eq!(*h.temp_c.lock().unwrap(), 40.0);
}

/// S3 — provider crash + supervised restart.
#[test]
fn s3_provider_crash_marks_stale_and_supervisor_schedules_restart() {
    let h = build_harness(22.0);
    h.cache.poll_once();
    assert_eq!(
        h.cache.get_signal_value(&device_handle(), "temp_c").unwrap().quality,
        ExternalQuality::Ok
    );

    *h.fail.lock().unwrap() = true;
    h.cache.poll_once();

    let view = h.cache.get_signal_value(&device_handle(), "temp_c").unwrap();
    // Value is retained (never invented), quality degrades; provider itself
    // flips unavailable, which externalizes as UNAVAILABLE on top of STALE.
    assert_eq!(view.value, Value::Double(22.0));
    assert_eq!(view.quality, ExternalQuality::Unavailable);
    assert!(!h.providers.get("sim0").unwrap().is_available());

    let supervisor = ProviderSupervisor::new(RestartPolicy {
        enabled: true,
        max_attempts: 3,
        backoff_ms: vec![10, 20, 30],
        timeout_ms: 1000,
    });
    supervisor.mark_crash_detected("sim0");
    supervisor.record_crash("sim0");
    assert!(!supervisor.should_restart("sim0"));
    std::thread::sleep(Duration::from_millis(30));
    assert!(supervisor.should_restart("sim0"));

    // Orchestrator's restart_provider sequence, reproduced against the public
    // API: tear down, clear devices, re-spawn (a fresh transport stands in
    // for a respawned subprocess), rediscover, rebuild poll plan, re-add.
    if let Some(old) = h.providers.remove("sim0") {
        old.shutdown();
    }
    h.devices.clear_provider_devices("sim0");

    *h.fail.lock().unwrap() = false;
    let fresh_handle = Arc::new(ProviderHandle::with_transport(
        ProviderSpawnSpec {
            provider_id: "sim0".into(),
            command: "unused".into(),
            args: vec![],
            timeout: Duration::from_millis(100),
        },
        Box::new(TempControllerTransport {
            temp_c: h.temp_c.clone(),
            fail: h.fail.clone(),
        }),
    ));
    h.devices.discover_provider("sim0", &fresh_handle).unwrap();
    h.cache.rebuild_poll_configs("sim0");
    h.providers.insert(fresh_handle);
    supervisor.record_success("sim0");

    h.cache.poll_once();
    let view = h.cache.get_signal_value(&device_handle(), "temp_c").unwrap();
    assert_eq!(view.quality, ExternalQuality::Ok);
    assert_eq!(supervisor.get_attempt_count("sim0"), 0);
    assert!(!supervisor.is_circuit_open("sim0"));
}

/// S3 (continued) — a provider that fails every call opens the breaker after
/// `max_attempts` and is not retried again without an operator action.
#[test]
fn s3_breaker_opens_after_max_attempts() {
    let supervisor = ProviderSupervisor::new(RestartPolicy {
        enabled: true,
        max_attempts: 2,
        backoff_ms: vec![5, 5],
        timeout_ms: 1000,
    });
    supervisor.record_crash("sim0");
    std::thread::sleep(Duration::from_millis(10));
    assert!(supervisor.should_restart("sim0"));
    supervisor.record_crash("sim0");
    std::thread::sleep(Duration::from_millis(10));
    assert!(supervisor.should_restart("sim0"));
    // Third crash exceeds max_attempts (2): the breaker opens and no further
    // restart attempts are scheduled (§8: "retried no more than max_attempts
    // times within the backoff schedule").
    supervisor.record_crash("sim0");
    assert!(supervisor.is_circuit_open("sim0"));
    std::thread::sleep(Duration::from_millis(10));
    assert!(!supervisor.should_restart("sim0"));
}
