//! Mode Manager (C6): four-state machine with validated transitions (§3.6, §4.5).

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::events::EventEmitter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Manual,
    Auto,
    Idle,
    Fault,
}

pub fn mode_to_string(mode: Mode) -> &'static str {
    match mode {
        Mode::Manual => "MANUAL",
        Mode::Auto => "AUTO",
        Mode::Idle => "IDLE",
        Mode::Fault => "FAULT",
    }
}

/// Strict: unknown strings return `None` ("none"), never a silent default.
pub fn string_to_mode(s: &str) -> Option<Mode> {
    match s {
        "MANUAL" => Some(Mode::Manual),
        "AUTO" => Some(Mode::Auto),
        "IDLE" => Some(Mode::Idle),
        "FAULT" => Some(Mode::Fault),
        _ => None,
    }
}

fn allowed(from: Mode, to: Mode) -> bool {
    use Mode::*;
    matches!(
        (from, to),
        (Manual, Auto) | (Auto, Manual) | (Manual, Idle) | (Idle, Manual) | (Fault, Manual)
    ) || to == Fault
}

type ModeCallback = Box<dyn Fn(Mode, Mode) + Send + Sync>;

/// Validated transitions per §3.6. `set_mode` is a compare-and-swap under a
/// single lock; callbacks are snapshotted under the lock and invoked outside
/// it (§4.5, §9) — they must not call back into `set_mode`.
pub struct ModeManager {
    current: Mutex<Mode>,
    callbacks: Mutex<Vec<ModeCallback>>,
    emitter: Option<Arc<EventEmitter>>,
}

impl ModeManager {
    pub fn new(initial: Mode) -> Self {
        Self {
            current: Mutex::new(initial),
            callbacks: Mutex::new(Vec::new()),
            emitter: None,
        }
    }

    pub fn with_emitter(initial: Mode, emitter: Arc<EventEmitter>) -> Self {
        Self {
            current: Mutex::new(initial),
            callbacks: Mutex::new(Vec::new()),
            emitter: Some(emitter),
        }
    }

    pub fn current_mode(&self) -> Mode {
        *self.current.lock().unwrap()
    }

    pub fn register_callback<F>(&self, callback: F)
    where
        F: Fn(Mode, Mode) + Send + Sync + 'static,
    {
        self.callbacks.lock().unwrap().push(Box::new(callback));
    }

    /// Attempts the transition; returns `false` with no state change on an
    /// invalid transition (§8 property 1).
    pub fn set_mode(&self, to: Mode) -> bool {
        let from = {
            let mut guard = self.current.lock().unwrap();
            let from = *guard;
            if from == to {
                return true;
            }
            if !allowed(from, to) {
                warn!(from = mode_to_string(from), to = mode_to_string(to), "rejected mode transition");
                return false;
            }
            *guard = to;
            from
        };

        info!(from = mode_to_string(from), to = mode_to_string(to), "mode transition");
        if let Some(emitter) = &self.emitter {
            emitter.emit_mode_change(from, to);
        }

        let callbacks = self.callbacks.lock().unwrap();
        for cb in callbacks.iter() {
            cb(from, to);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn round_trip_is_identity() {
        for s in ["MANUAL", "AUTO", "IDLE", "FAULT"] {
            let mode = string_to_mode(s).unwrap();
            assert_eq!(mode_to_string(mode), s);
        }
    }

    #[test]
    fn unknown_string_returns_none() {
        assert!(string_to_mode("none").is_none());
        assert!(string_to_mode("manual").is_none());
    }

    #[test]
    fn manual_auto_idle_allowed_both_ways() {
        let mgr = ModeManager::new(Mode::Manual);
        assert!(mgr.set_mode(Mode::Auto));
        assert!(mgr.set_mode(Mode::Manual));
        assert!(mgr.set_mode(Mode::Idle));
        assert!(mgr.set_mode(Mode::Manual));
    }

    #[test]
    fn auto_idle_direct_transition_rejected() {
        let mgr = ModeManager::new(Mode::Auto);
        assert!(!mgr.set_mode(Mode::Idle));
        assert_eq!(mgr.current_mode(), Mode::Auto);
    }

    #[test]
    fn any_mode_can_enter_fault() {
        for start in [Mode::Manual, Mode::Auto, Mode::Idle] {
            let mgr = ModeManager::new(start);
            assert!(mgr.set_mode(Mode::Fault));
        }
    }

    #[test]
    fn fault_only_recovers_to_manual() {
        let mgr = ModeManager::new(Mode::Fault);
        assert!(!mgr.set_mode(Mode::Auto));
        assert!(!mgr.set_mode(Mode::Idle));
        assert!(mgr.set_mode(Mode::Manual));
    }

    #[test]
    fn failed_transition_leaves_state_unchanged() {
        let mgr = ModeManager::new(Mode::Idle);
        assert!(!mgr.set_mode(Mode::Auto));
        assert_eq!(mgr.current_mode(), Mode::Idle);
    }

    #[test]
    fn callbacks_invoked_on_success_only() {
        let mgr = ModeManager::new(Mode::Manual);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        mgr.register_callback(move |_from, _to| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        mgr.set_mode(Mode::Auto);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
