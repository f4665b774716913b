//! Provider Client (C1): frames one request/response at a time over a
//! provider subprocess's stdio (§4.1).
//!
//! A single request is outstanding at a time per provider; [`ProviderClient`]
//! enforces this by taking `&mut self` for every operation, and
//! [`super::handle::ProviderHandle`] is the thing that actually serializes
//! concurrent callers behind a mutex.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

use crate::provider::protocol::{Op, Request, RequestPayload, Response};

/// Distinguishes the three failure classes from §4.1 so callers can decide
/// whether the provider should be marked unavailable.
#[derive(Debug)]
pub enum ClientError {
    /// Transport failure: the provider becomes unavailable.
    Transport(String),
    /// Timed out waiting for a response: the provider becomes unavailable.
    Timeout,
    /// Decode/framing failure: counted as an error, provider stays nominally up.
    Protocol(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Transport(m) => write!(f, "transport error: {m}"),
            ClientError::Timeout => write!(f, "operation timed out"),
            ClientError::Protocol(m) => write!(f, "protocol error: {m}"),
        }
    }
}

impl std::error::Error for ClientError {}

/// True for failure classes that should mark the provider unavailable.
impl ClientError {
    pub fn is_transport_class(&self) -> bool {
        matches!(self, ClientError::Transport(_) | ClientError::Timeout)
    }
}

fn write_frame<W: Write>(w: &mut W, req: &Request) -> io::Result<()> {
    let bytes = bincode::serialize(req).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    w.write_u32::<BigEndian>(bytes.len() as u32)?;
    w.write_all(&bytes)?;
    w.flush()
}

fn read_frame<R: Read>(r: &mut R) -> io::Result<Response> {
    let len = r.read_u32::<BigEndian>()?;
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    bincode::deserialize(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// A background reader thread drains `ChildStdout` and forwards each decoded
/// frame on a channel, which is how we implement a read *timeout* over a
/// plain OS pipe (std's blocking `Read` has no deadline of its own).
struct ReaderThread {
    rx: mpsc::Receiver<io::Result<Response>>,
    _handle: std::thread::JoinHandle<()>,
}

impl ReaderThread {
    fn spawn(mut stdout: ChildStdout) -> Self {
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("provider-reader".into())
            .spawn(move || loop {
                let frame = read_frame(&mut stdout);
                let is_err = frame.is_err();
                if tx.send(frame).is_err() || is_err {
                    break;
                }
            })
            .expect("spawn provider reader thread");
        Self {
            rx,
            _handle: handle,
        }
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Response, ClientError> {
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(ClientError::Protocol(e.to_string())),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(ClientError::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(ClientError::Transport("reader thread exited".into()))
            }
        }
    }
}

/// Frames one request/response at a time over a spawned provider subprocess.
pub struct ProviderClient {
    child: Child,
    stdin: ChildStdin,
    reader: ReaderThread,
    next_request_id: u64,
    timeout: Duration,
}

impl ProviderClient {
    /// Spawns `command args...` with piped stdio. The operation-level
    /// timeout (§4.1, minimum 100ms) governs every subsequent call.
    pub fn start(command: &str, args: &[String], timeout: Duration) -> Result<Self, ClientError> {
        let timeout = timeout.max(Duration::from_millis(100));
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let stdin = child.stdin.take().ok_or_else(|| {
            ClientError::Transport("child did not expose stdin".into())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ClientError::Transport("child did not expose stdout".into())
        })?;

        Ok(Self {
            child,
            stdin,
            reader: ReaderThread::spawn(stdout),
            next_request_id: 0,
            timeout,
        })
    }

    fn next_id(&mut self) -> u64 {
        self.next_request_id += 1;
        self.next_request_id
    }

    fn roundtrip(&mut self, op: Op, payload: RequestPayload) -> Result<Response, ClientError> {
        let request = Request {
            request_id: self.next_id(),
            op,
            payload,
        };
        write_frame(&mut self.stdin, &request).map_err(|e| ClientError::Transport(e.to_string()))?;
        let response = self.reader.recv_timeout(self.timeout)?;
        if response.request_id != request.request_id {
            return Err(ClientError::Protocol(format!(
                "response id {} does not match request id {}",
                response.request_id, request.request_id
            )));
        }
        Ok(response)
    }

    pub fn hello(&mut self) -> Result<Response, ClientError> {
        self.roundtrip(Op::Hello, RequestPayload::Hello)
    }

    pub fn list_devices(&mut self) -> Result<Response, ClientError> {
        self.roundtrip(Op::ListDevices, RequestPayload::ListDevices)
    }

    pub fn describe_device(&mut self, device_id: &str) -> Result<Response, ClientError> {
        self.roundtrip(
            Op::DescribeDevice,
            RequestPayload::DescribeDevice {
                device_id: device_id.to_string(),
            },
        )
    }

    pub fn read_signals(
        &mut self,
        device_id: &str,
        signal_ids: &[String],
    ) -> Result<Response, ClientError> {
        self.roundtrip(
            Op::ReadSignals,
            RequestPayload::ReadSignals {
                device_id: device_id.to_string(),
                signal_ids: signal_ids.to_vec(),
            },
        )
    }

    pub fn call(
        &mut self,
        device_id: &str,
        function_id: &str,
        function_name: &str,
        args: std::collections::HashMap<String, crate::value::Value>,
    ) -> Result<Response, ClientError> {
        self.roundtrip(
            Op::Call,
            RequestPayload::Call {
                device_id: device_id.to_string(),
                function_id: function_id.to_string(),
                function_name: function_name.to_string(),
                args,
            },
        )
    }

    /// Best-effort termination used by the supervisor (§4.9) and orchestrator
    /// restart path (§4.10).
    pub fn shutdown(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for ProviderClient {
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

/// Object-safe facade over [`ProviderClient`] so [`super::handle::ProviderHandle`]
/// can be driven by a real subprocess in production and by an in-process fake
/// in tests (§A.4 of `SPEC_FULL.md`) without duplicating call-site logic.
pub trait ProviderTransport: Send {
    fn hello(&mut self) -> Result<Response, ClientError>;
    fn list_devices(&mut self) -> Result<Response, ClientError>;
    fn describe_device(&mut self, device_id: &str) -> Result<Response, ClientError>;
    fn read_signals(&mut self, device_id: &str, signal_ids: &[String]) -> Result<Response, ClientError>;
    fn call(
        &mut self,
        device_id: &str,
        function_id: &str,
        function_name: &str,
        args: std::collections::HashMap<String, crate::value::Value>,
    ) -> Result<Response, ClientError>;
    fn shutdown(&mut self);
}

impl ProviderTransport for ProviderClient {
    fn hello(&mut self) -> Result<Response, ClientError> {
        ProviderClient::hello(self)
    }
    fn list_devices(&mut self) -> Result<Response, ClientError> {
        ProviderClient::list_devices(self)
    }
    fn describe_device(&mut self, device_id: &str) -> Result<Response, ClientError> {
        ProviderClient::describe_device(self, device_id)
    }
    fn read_signals(&mut self, device_id: &str, signal_ids: &[String]) -> Result<Response, ClientError> {
        ProviderClient::read_signals(self, device_id, signal_ids)
    }
    fn call(
        &mut self,
        device_id: &str,
        function_id: &str,
        function_name: &str,
        args: std::collections::HashMap<String, crate::value::Value>,
    ) -> Result<Response, ClientError> {
        ProviderClient::call(self, device_id, function_id, function_name, args)
    }
    fn shutdown(&mut self) {
        ProviderClient::shutdown(self)
    }
}
