//! Custom behavior-tree nodes (C9, §4.7): `ReadSignal`, `CheckQuality`,
//! `CallDevice`, `GetParameter`. Every node returns `Status::Failure` on any
//! internal error condition — a missing port, an unreachable device, a bad
//! quality — it never panics, so one bad node cannot take down the tick
//! thread (§8 property 6).

use std::collections::HashMap;

use bonsai_bt::Status;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bt::context::ServiceContext;
use crate::device_registry::DeviceHandle;
use crate::error::ErrorKind;
use crate::router::CallRequest;
use crate::state_cache::ExternalQuality;
use crate::value::Value;

/// Simple string-keyed scratch space shared by nodes within one tick.
/// Distinct from [`ServiceContext`]: this is owned, mutable, per-tick state,
/// not a borrow into the runtime's long-lived subsystems.
#[derive(Debug, Default, Clone)]
pub struct Blackboard {
    values: HashMap<String, Value>,
}

impl Blackboard {
    pub fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

/// One leaf action, deserializable from the RON tree definition (§6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeKind {
    /// Reads `signal_id` off `device`, coerces it to `double` (bool -> 0/1;
    /// strings/bytes have no numeric coercion and fail the node), and stores
    /// the value under `output_key` and the quality string under
    /// `quality_key` (§4.7 `ReadSignal`). Fails if the device is unknown, the
    /// signal has never been read, or the coercion has no result.
    ReadSignal {
        device: String,
        signal_id: String,
        output_key: String,
        quality_key: String,
    },
    /// Succeeds only if `device`'s `signal_id` currently reports one of
    /// `accept`; used as a guard ahead of an action that depends on fresh
    /// data (e.g. don't `CallDevice` on a `STALE` reading).
    CheckQuality {
        device: String,
        signal_id: String,
        accept: Vec<String>,
    },
    /// Dispatches an automated call through the router. `args` is a JSON
    /// object string (an optional leading `json:` prefix is stripped for
    /// trees ported from an older structured-port convention, §9 open
    /// question — both forms decode identically here).
    CallDevice {
        device: String,
        function: String,
        args: String,
    },
    /// Reads a numeric parameter into `output_key`.
    GetParameter { name: String, output_key: String },
}

fn parse_quality(s: &str) -> Option<ExternalQuality> {
    match s {
        "OK" => Some(ExternalQuality::Ok),
        "STALE" => Some(ExternalQuality::Stale),
        "FAULT" => Some(ExternalQuality::Fault),
        "UNKNOWN" => Some(ExternalQuality::Unknown),
        "UNAVAILABLE" => Some(ExternalQuality::Unavailable),
        _ => None,
    }
}

fn quality_to_string(quality: ExternalQuality) -> &'static str {
    match quality {
        ExternalQuality::Ok => "OK",
        ExternalQuality::Stale => "STALE",
        ExternalQuality::Fault => "FAULT",
        ExternalQuality::Unknown => "UNKNOWN",
        ExternalQuality::Unavailable => "UNAVAILABLE",
    }
}

fn read_signal(
    ctx: &ServiceContext<'_>,
    bb: &mut Blackboard,
    device: &str,
    signal_id: &str,
    output_key: &str,
    quality_key: &str,
) -> Status {
    let handle = match DeviceHandle::parse(device) {
        Ok(h) => h,
        Err(e) => {
            warn!(error = %e, "ReadSignal: {}", ErrorKind::InvalidArgument.token());
            return Status::Failure;
        }
    };
    match ctx.state_cache.get_signal_value(&handle, signal_id) {
        Some(view) => match view.value.as_f64() {
            Some(as_double) => {
                bb.set(output_key, Value::Double(as_double));
                bb.set(quality_key, Value::String(quality_to_string(view.quality).to_string()));
                Status::Success
            }
            None => {
                warn!(signal_id, "ReadSignal: value has no double coercion");
                Status::Failure
            }
        },
        None => Status::Failure,
    }
}

fn check_quality(ctx: &ServiceContext<'_>, device: &str, signal_id: &str, accept: &[String]) -> Status {
    let Ok(handle) = DeviceHandle::parse(device) else {
        return Status::Failure;
    };
    let Some(view) = ctx.state_cache.get_signal_value(&handle, signal_id) else {
        return Status::Failure;
    };
    let accepted: Vec<ExternalQuality> = accept.iter().filter_map(|s| parse_quality(s)).collect();
    if accepted.iter().any(|q| *q == view.quality) {
        Status::Success
    } else {
        Status::Failure
    }
}

fn call_device(ctx: &ServiceContext<'_>, device: &str, function: &str, args: &str) -> Status {
    let stripped = args.strip_prefix("json:").unwrap_or(args);
    let parsed: serde_json::Value = match serde_json::from_str(stripped) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "CallDevice: {} args is not valid JSON", ErrorKind::InvalidArgument.token());
            return Status::Failure;
        }
    };
    let serde_json::Value::Object(map) = parsed else {
        warn!("CallDevice: {} args must be a JSON object", ErrorKind::InvalidArgument.token());
        return Status::Failure;
    };

    let mut call_args = HashMap::new();
    for (k, v) in map {
        match Value::from_json(&v) {
            Some(value) => {
                call_args.insert(k, value);
            }
            None => {
                warn!(key = %k, "CallDevice: {} arg has no Value counterpart", ErrorKind::InvalidArgument.token());
                return Status::Failure;
            }
        }
    }

    let request = CallRequest {
        device_handle: device.to_string(),
        function_name: function.to_string(),
        args: call_args,
        is_automated: true,
    };

    let result = ctx
        .call_router
        .execute_call(&request, ctx.devices, ctx.providers, ctx.state_cache);
    if result.success {
        Status::Success
    } else {
        Status::Failure
    }
}

fn get_parameter(ctx: &ServiceContext<'_>, bb: &mut Blackboard, name: &str, output_key: &str) -> Status {
    match ctx.parameters.get(name) {
        Some(value) if value.as_f64().is_some() => {
            bb.set(output_key, value);
            Status::Success
        }
        Some(_) => {
            warn!(name, "GetParameter: non-numeric parameter");
            Status::Failure
        }
        None => Status::Failure,
    }
}

/// Executes one leaf node. Dispatched from the tree evaluator on every
/// `Behavior::Action(node)` it encounters.
pub fn execute(node: &NodeKind, ctx: &ServiceContext<'_>, bb: &mut Blackboard) -> Status {
    match node {
        NodeKind::ReadSignal {
            device,
            signal_id,
            output_key,
            quality_key,
        } => read_signal(ctx, bb, device, signal_id, output_key, quality_key),
        NodeKind::CheckQuality { device, signal_id, accept } => check_quality(ctx, device, signal_id, accept),
        NodeKind::CallDevice { device, function, args } => call_device(ctx, device, function, args),
        NodeKind::GetParameter { name, output_key } => get_parameter(ctx, bb, name, output_key),
    }
}
