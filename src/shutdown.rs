//! Process-wide shutdown flag (§6.3, §9 "Global signal-handler state").
//!
//! Modeled exactly as the design notes prescribe: a single atomic, installed
//! once at orchestrator start, with implicit teardown at process exit. The
//! signal handler itself performs only an async-signal-safe store; everything
//! that reacts to the flag (the main monitoring loop, §4.10) polls it at its
//! own natural boundary instead of being interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

#[derive(Clone)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs SIGINT/SIGTERM handlers that store into `flag`. Unix-only: the
/// core runs on POSIX hosts per §6.3; a non-unix target gets a flag nobody
/// ever sets and relies on the process being killed directly.
#[cfg(unix)]
pub fn install(flag: ShutdownFlag) -> crate::error::Result<()> {
    use nix::sys::signal::{self, SigHandler, Signal};
    use std::sync::OnceLock;

    static SHUTDOWN_FLAG: OnceLock<ShutdownFlag> = OnceLock::new();
    // Only the first caller's flag is ever wired to the OS handler; the
    // orchestrator installs exactly one during its lifetime, so this is not
    // a practical limitation, only a documented one.
    let _ = SHUTDOWN_FLAG.set(flag);

    extern "C" fn handle_signal(_: i32) {
        if let Some(flag) = SHUTDOWN_FLAG.get() {
            flag.set();
        }
    }

    let handler = SigHandler::Handler(handle_signal);
    unsafe {
        signal::signal(Signal::SIGINT, handler).map_err(|e| {
            crate::error::RuntimeError::internal(format!("installing SIGINT handler: {e}"))
        })?;
        signal::signal(Signal::SIGTERM, handler).map_err(|e| {
            crate::error::RuntimeError::internal(format!("installing SIGTERM handler: {e}"))
        })?;
    }
    info!("installed SIGINT/SIGTERM handlers");
    Ok(())
}

#[cfg(not(unix))]
pub fn install(_flag: ShutdownFlag) -> crate::error::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_starts_clear_and_latches() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_set());
        flag.set();
        assert!(flag.is_set());
    }

    #[test]
    fn clone_shares_the_same_flag() {
        let flag = ShutdownFlag::new();
        let clone = flag.clone();
        clone.set();
        assert!(flag.is_set());
    }
}
