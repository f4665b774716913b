//! The Provider Protocol wire contract (§6.1, glossary ADPP).
//!
//! Frames are length-prefixed `bincode` payloads: a `u32` big-endian byte
//! count followed by that many bytes of a `bincode`-encoded [`Request`] or
//! [`Response`]. Exactly one request is outstanding per provider at a time
//! (§4.1) — the client and the child process take turns on one pipe pair.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::StatusCode;
use crate::value::{Value, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Hello,
    ListDevices,
    DescribeDevice,
    ReadSignals,
    Call,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub request_id: u64,
    pub op: Op,
    pub payload: RequestPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestPayload {
    Hello,
    ListDevices,
    DescribeDevice {
        device_id: String,
    },
    ReadSignals {
        device_id: String,
        signal_ids: Vec<String>,
    },
    Call {
        device_id: String,
        function_id: String,
        function_name: String,
        args: HashMap<String, Value>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub request_id: u64,
    pub status: Status,
    pub payload: ResponsePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponsePayload {
    Empty,
    Hello {
        provider_name: String,
    },
    Devices(Vec<DeviceDescriptor>),
    Device(DeviceDescriptor),
    Signals(HashMap<String, SignalReading>),
    Call {
        return_value: Option<Value>,
    },
}

/// One device as advertised by `DescribeDevice`/`ListDevices` (feeds C3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub device_id: String,
    pub type_id: String,
    pub label: String,
    pub signals: Vec<SignalSpec>,
    pub functions: Vec<FunctionSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSpec {
    pub signal_id: String,
    pub type_tag: ValueType,
    pub label: Option<String>,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadingQuality {
    Ok,
    Stale,
    Fault,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalReading {
    pub value: Value,
    pub quality: ReadingQuality,
}

/// §3.3 Function capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub function_id: String,
    pub function_name: String,
    pub args: Vec<ArgSpec>,
}

/// Per-type numeric bounds, the "richer" v1 `ArgSpec` variant called out in
/// §9's open questions as the one this crate implements.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NumericBounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    pub type_tag: ValueType,
    pub required: bool,
    pub bounds: Option<NumericBounds>,
    pub unit: Option<String>,
}
