//! Device Registry (C3): caches per-provider device capability sets (§4.2).
//!
//! Read-mostly; mutation happens only during discovery/clear, which the
//! orchestrator serializes with provider restarts (§4.10), so a single
//! `RwLock` over the whole map is sufficient — there is no polling-thread
//! write path into this registry (that's C4's job, over a separate store).

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::{debug, warn};

use crate::error::{ErrorKind, Result, RuntimeError};
use crate::provider::handle::ProviderHandle;
use crate::provider::protocol::{ArgSpec, DeviceDescriptor, ResponsePayload};
use crate::value::ValueType;

/// A parsed `"provider_id/device_id"` handle, shared by the router (C7) and
/// the BT nodes (C9) so the split logic lives in exactly one place.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub provider_id: String,
    pub device_id: String,
}

impl DeviceHandle {
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.splitn(2, '/');
        let provider_id = parts.next().unwrap_or_default();
        let device_id = parts.next().ok_or_else(|| {
            RuntimeError::invalid_argument(format!(
                "device handle '{s}' is not of the form provider_id/device_id"
            ))
        })?;
        if provider_id.is_empty() || device_id.is_empty() {
            return Err(RuntimeError::invalid_argument(format!(
                "device handle '{s}' has an empty provider_id or device_id"
            )));
        }
        Ok(Self {
            provider_id: provider_id.to_string(),
            device_id: device_id.to_string(),
        })
    }
}

impl std::fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.device_id)
    }
}

#[derive(Debug, Clone)]
pub struct SignalCapability {
    pub signal_id: String,
    pub type_tag: ValueType,
    pub label: Option<String>,
    pub unit: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FunctionCapability {
    pub function_id: String,
    pub function_name: String,
    pub args: Vec<ArgSpec>,
}

#[derive(Debug, Clone)]
pub struct Device {
    pub provider_id: String,
    pub device_id: String,
    pub type_id: String,
    pub label: String,
    pub signals_by_id: HashMap<String, SignalCapability>,
    pub functions_by_id: HashMap<String, FunctionCapability>,
    /// Secondary index: function name -> function_id, for C7 execution (§4.6).
    pub function_id_by_name: HashMap<String, String>,
}

impl Device {
    fn from_descriptor(provider_id: &str, d: DeviceDescriptor) -> Self {
        let signals_by_id = d
            .signals
            .into_iter()
            .map(|s| {
                (
                    s.signal_id.clone(),
                    SignalCapability {
                        signal_id: s.signal_id,
                        type_tag: s.type_tag,
                        label: s.label,
                        unit: s.unit,
                    },
                )
            })
            .collect();

        let mut function_id_by_name = HashMap::new();
        let functions_by_id = d
            .functions
            .into_iter()
            .map(|f| {
                function_id_by_name.insert(f.function_name.clone(), f.function_id.clone());
                (
                    f.function_id.clone(),
                    FunctionCapability {
                        function_id: f.function_id,
                        function_name: f.function_name,
                        args: f.args,
                    },
                )
            })
            .collect();

        Self {
            provider_id: provider_id.to_string(),
            device_id: d.device_id,
            type_id: d.type_id,
            label: d.label,
            signals_by_id,
            functions_by_id,
            function_id_by_name,
        }
    }

    pub fn function_by_name(&self, name: &str) -> Option<&FunctionCapability> {
        self.function_id_by_name
            .get(name)
            .and_then(|id| self.functions_by_id.get(id))
    }
}

#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<(String, String), Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `list_devices` then `describe_device` for each, materializing the
    /// capability set (§4.2). Idempotent: callers invoke
    /// `clear_provider_devices` first when rediscovering after a restart.
    pub fn discover_provider(&self, provider_id: &str, handle: &ProviderHandle) -> Result<usize> {
        let list_resp = handle
            .list_devices()
            .map_err(|e| RuntimeError::unavailable(format!("list_devices failed: {e}")))?;
        let ResponsePayload::Devices(stubs) = list_resp.payload else {
            return Err(RuntimeError::internal("list_devices returned unexpected payload"));
        };

        let mut discovered = Vec::with_capacity(stubs.len());
        for stub in &stubs {
            let desc_resp = handle
                .describe_device(&stub.device_id)
                .map_err(|e| RuntimeError::unavailable(format!("describe_device failed: {e}")))?;
            let ResponsePayload::Device(descriptor) = desc_resp.payload else {
                return Err(RuntimeError::internal("describe_device returned unexpected payload"));
            };
            discovered.push(Device::from_descriptor(provider_id, descriptor));
        }

        let count = discovered.len();
        let mut guard = self.devices.write().unwrap();
        for device in discovered {
            guard.insert((provider_id.to_string(), device.device_id.clone()), device);
        }
        debug!(provider = provider_id, devices = count, "discovered devices");
        Ok(count)
    }

    /// Invoked before a restart so discovery is idempotent (§4.2).
    pub fn clear_provider_devices(&self, provider_id: &str) {
        let mut guard = self.devices.write().unwrap();
        let before = guard.len();
        guard.retain(|(p, _), _| p != provider_id);
        let removed = before - guard.len();
        if removed > 0 {
            warn!(provider = provider_id, removed, "cleared provider devices");
        }
    }

    pub fn get(&self, provider_id: &str, device_id: &str) -> Option<Device> {
        self.devices
            .read()
            .unwrap()
            .get(&(provider_id.to_string(), device_id.to_string()))
            .cloned()
    }

    pub fn get_by_handle(&self, handle: &DeviceHandle) -> Option<Device> {
        self.get(&handle.provider_id, &handle.device_id)
    }

    pub fn devices_for_provider(&self, provider_id: &str) -> Vec<Device> {
        self.devices
            .read()
            .unwrap()
            .iter()
            .filter(|((p, _), _)| p == provider_id)
            .map(|(_, d)| d.clone())
            .collect()
    }

    pub fn all_devices(&self) -> Vec<Device> {
        self.devices.read().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_handle() {
        let h = DeviceHandle::parse("sim0/tempctl0").unwrap();
        assert_eq!(h.provider_id, "sim0");
        assert_eq!(h.device_id, "tempctl0");
    }

    #[test]
    fn parse_rejects_missing_slash() {
        assert_eq!(
            DeviceHandle::parse("sim0").unwrap_err().kind,
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn parse_rejects_empty_segments() {
        assert!(DeviceHandle::parse("/tempctl0").is_err());
        assert!(DeviceHandle::parse("sim0/").is_err());
    }

    #[test]
    fn parse_allows_nested_slash_in_device_id() {
        // splitn(2, ..) means only the first slash is a delimiter.
        let h = DeviceHandle::parse("sim0/a/b").unwrap();
        assert_eq!(h.device_id, "a/b");
    }
}
