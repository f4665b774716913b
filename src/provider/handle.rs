//! Provider Handle (C2): owns one provider's lifetime and exposes an
//! availability flag. Request/response is serialized per handle (§4.1, §5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::StatusCode;
use crate::provider::client::{ClientError, ProviderClient, ProviderTransport};
use crate::provider::protocol::Response;
use crate::value::Value;

/// Everything needed to (re)spawn a provider, carried so the supervisor and
/// orchestrator can restart it in place (§4.9, §4.10) without going back to
/// config.
#[derive(Debug, Clone)]
pub struct ProviderSpawnSpec {
    pub provider_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

/// Owns a provider's lifetime (spawn, hello, shutdown) and exposes whether it
/// is currently reachable. Shared (owning) between the registry and any
/// subsystem holding a live borrow during a call (§3.9).
pub struct ProviderHandle {
    pub spec: ProviderSpawnSpec,
    transport: Mutex<Option<Box<dyn ProviderTransport>>>,
    available: AtomicBool,
    last_error: Mutex<Option<String>>,
    last_status_code: Mutex<Option<StatusCode>>,
}

impl ProviderHandle {
    /// Construct a handle wired to the real subprocess transport. Does not
    /// spawn yet — call [`ProviderHandle::start`].
    pub fn new(spec: ProviderSpawnSpec) -> Self {
        Self {
            spec,
            transport: Mutex::new(None),
            available: AtomicBool::new(false),
            last_error: Mutex::new(None),
            last_status_code: Mutex::new(None),
        }
    }

    /// Construct a handle around an already-built transport (real or fake),
    /// used by tests and by restart to swap in a freshly spawned process.
    pub fn with_transport(spec: ProviderSpawnSpec, transport: Box<dyn ProviderTransport>) -> Self {
        Self {
            spec,
            transport: Mutex::new(Some(transport)),
            available: AtomicBool::new(true),
            last_error: Mutex::new(None),
            last_status_code: Mutex::new(None),
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.spec.provider_id
    }

    /// Spawns the subprocess and performs the initial `Hello` handshake.
    pub fn start(&self) -> Result<(), ClientError> {
        let client = ProviderClient::start(&self.spec.command, &self.spec.args, self.spec.timeout)?;
        let mut boxed: Box<dyn ProviderTransport> = Box::new(client);
        let hello = boxed.hello();
        let mut guard = self.transport.lock().unwrap();
        *guard = Some(boxed);
        drop(guard);
        match hello {
            Ok(_) => {
                self.available.store(true, Ordering::SeqCst);
                info!(provider = %self.spec.provider_id, "provider started");
                Ok(())
            }
            Err(e) => {
                self.note_failure(&e);
                Err(e)
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    pub fn last_status_code(&self) -> Option<StatusCode> {
        *self.last_status_code.lock().unwrap()
    }

    fn note_failure(&self, err: &ClientError) {
        *self.last_error.lock().unwrap() = Some(err.to_string());
        if err.is_transport_class() {
            self.available.store(false, Ordering::SeqCst);
            warn!(provider = %self.spec.provider_id, error = %err, "provider became unavailable");
        }
    }

    fn note_response(&self, resp: &Response) {
        *self.last_status_code.lock().unwrap() = Some(resp.status.code);
    }

    fn with_transport(
        &self,
        f: impl FnOnce(&mut dyn ProviderTransport) -> Result<Response, ClientError>,
    ) -> Result<Response, ClientError> {
        let mut guard = self.transport.lock().unwrap();
        let transport = guard
            .as_deref_mut()
            .ok_or_else(|| ClientError::Transport("provider not started".into()))?;
        let result = f(transport);
        match &result {
            Ok(resp) => self.note_response(resp),
            Err(e) => self.note_failure(e),
        }
        result
    }

    pub fn list_devices(&self) -> Result<Response, ClientError> {
        self.with_transport(|t| t.list_devices())
    }

    pub fn describe_device(&self, device_id: &str) -> Result<Response, ClientError> {
        self.with_transport(|t| t.describe_device(device_id))
    }

    pub fn read_signals(&self, device_id: &str, signal_ids: &[String]) -> Result<Response, ClientError> {
        self.with_transport(|t| t.read_signals(device_id, signal_ids))
    }

    pub fn call(
        &self,
        device_id: &str,
        function_id: &str,
        function_name: &str,
        args: HashMap<String, Value>,
    ) -> Result<Response, ClientError> {
        self.with_transport(|t| t.call(device_id, function_id, function_name, args))
    }

    /// Tears down the subprocess. Used during restart (§4.10) and final
    /// shutdown.
    pub fn shutdown(&self) {
        let mut guard = self.transport.lock().unwrap();
        if let Some(t) = guard.as_deref_mut() {
            t.shutdown();
        }
        *guard = None;
        self.available.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::protocol::{ResponsePayload, Status};
    use std::sync::atomic::{AtomicU64, Ordering as O};

    struct FakeTransport {
        next_id: AtomicU64,
        fail_next: bool,
    }

    impl FakeTransport {
        fn ok_response(&self, payload: ResponsePayload) -> Response {
            Response {
                request_id: self.next_id.fetch_add(1, O::SeqCst),
                status: Status::ok(),
                payload,
            }
        }
    }

    impl ProviderTransport for FakeTransport {
        fn hello(&mut self) -> Result<Response, ClientError> {
            Ok(self.ok_response(ResponsePayload::Hello {
                provider_name: "fake".into(),
            }))
        }
        fn list_devices(&mut self) -> Result<Response, ClientError> {
            if self.fail_next {
                return Err(ClientError::Timeout);
            }
            Ok(self.ok_response(ResponsePayload::Devices(vec![])))
        }
        fn describe_device(&mut self, _device_id: &str) -> Result<Response, ClientError> {
            Err(ClientError::Protocol("not implemented in fake".into()))
        }
        fn read_signals(&mut self, _d: &str, _s: &[String]) -> Result<Response, ClientError> {
            Ok(self.ok_response(ResponsePayload::Signals(Default::default())))
        }
        fn call(
            &mut self,
            _d: &str,
            _f: &str,
            _n: &str,
            _a: HashMap<String, Value>,
        ) -> Result<Response, ClientError> {
            Ok(self.ok_response(ResponsePayload::Call { return_value: None }))
        }
        fn shutdown(&mut self) {}
    }

    fn spec() -> ProviderSpawnSpec {
        ProviderSpawnSpec {
            provider_id: "sim0".into(),
            command: "unused".into(),
            args: vec![],
            timeout: Duration::from_millis(100),
        }
    }

    #[test]
    fn available_after_construction_with_transport() {
        let handle = ProviderHandle::with_transport(
            spec(),
            Box::new(FakeTransport {
                next_id: AtomicU64::new(1),
                fail_next: false,
            }),
        );
        assert!(handle.is_available());
        assert!(handle.list_devices().is_ok());
        assert!(handle.is_available());
    }

    #[test]
    fn transport_timeout_marks_unavailable() {
        let handle = ProviderHandle::with_transport(
            spec(),
            Box::new(FakeTransport {
                next_id: AtomicU64::new(1),
                fail_next: true,
            }),
        );
        assert!(handle.list_devices().is_err());
        assert!(!handle.is_available());
        assert!(handle.last_error().is_some());
    }

    #[test]
    fn shutdown_clears_availability() {
        let handle = ProviderHandle::with_transport(
            spec(),
            Box::new(FakeTransport {
                next_id: AtomicU64::new(1),
                fail_next: false,
            }),
        );
        handle.shutdown();
        assert!(!handle.is_available());
        assert!(handle.list_devices().is_err());
    }
}
