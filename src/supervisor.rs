//! Provider Supervisor (C11): circuit breaker and backoff schedule driving
//! restart attempts for a crashed provider subprocess (§4.9).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub backoff_ms: Vec<u64>,
    pub timeout_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            backoff_ms: vec![100, 250, 500, 1000, 2000],
            timeout_ms: 2000,
        }
    }
}

struct ProviderRestartState {
    attempt_count: u32,
    circuit_open: bool,
    crash_detected: bool,
    next_restart_at: Option<Instant>,
}

impl Default for ProviderRestartState {
    fn default() -> Self {
        Self {
            attempt_count: 0,
            circuit_open: false,
            crash_detected: false,
            next_restart_at: None,
        }
    }
}

/// One [`RestartPolicy`] per process, tracked by `provider_id` (§4.9). Jitter
/// on each backoff delay (supplemented beyond the base spec, §B.4 of
/// `SPEC_FULL.md`) avoids every crashed provider retrying in lockstep.
pub struct ProviderSupervisor {
    policy: RestartPolicy,
    state: Mutex<HashMap<String, ProviderRestartState>>,
}

impl ProviderSupervisor {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(HashMap::new()),
        }
    }

    fn backoff_for(&self, attempt_index: usize) -> Duration {
        let base_ms = self
            .policy
            .backoff_ms
            .get(attempt_index)
            .copied()
            .or_else(|| self.policy.backoff_ms.last().copied())
            .unwrap_or(1000);
        let jitter_frac = rand::thread_rng().gen_range(-0.1..=0.1);
        let jittered_ms = (base_ms as f64 * (1.0 + jitter_frac)).max(0.0) as u64;
        Duration::from_millis(jittered_ms)
    }

    /// Marks a provider as having just crashed, opening its restart window
    /// (§4.9). Idempotent while the crash flag is already set.
    pub fn mark_crash_detected(&self, provider_id: &str) {
        let mut guard = self.state.lock().unwrap();
        let entry = guard.entry(provider_id.to_string()).or_default();
        if entry.crash_detected {
            return;
        }
        entry.crash_detected = true;
        warn!(provider = provider_id, "crash detected");
    }

    pub fn clear_crash_detected(&self, provider_id: &str) {
        if let Some(entry) = self.state.lock().unwrap().get_mut(provider_id) {
            entry.crash_detected = false;
        }
    }

    /// Records one restart attempt, scheduling the next allowed attempt time
    /// and opening the circuit if `max_attempts` is exceeded.
    pub fn record_crash(&self, provider_id: &str) {
        if !self.policy.enabled {
            return;
        }
        let mut guard = self.state.lock().unwrap();
        let entry = guard.entry(provider_id.to_string()).or_default();
        entry.attempt_count += 1;
        if entry.attempt_count > self.policy.max_attempts {
            entry.circuit_open = true;
            warn!(provider = provider_id, attempts = entry.attempt_count, "restart circuit opened");
            return;
        }
        let delay = self.backoff_for((entry.attempt_count - 1) as usize);
        entry.next_restart_at = Some(Instant::now() + delay);
        info!(provider = provider_id, attempt = entry.attempt_count, delay_ms = delay.as_millis() as u64, "scheduled restart");
    }

    /// `true` once the crash has been recorded, the circuit is closed, and
    /// the backoff delay has elapsed.
    pub fn should_restart(&self, provider_id: &str) -> bool {
        if !self.policy.enabled {
            return false;
        }
        let guard = self.state.lock().unwrap();
        let Some(entry) = guard.get(provider_id) else {
            return false;
        };
        if entry.circuit_open {
            return false;
        }
        match entry.next_restart_at {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Resets attempt bookkeeping after a provider stays up through one full
    /// monitoring cycle (§4.9 "recovery clears the attempt counter").
    pub fn record_success(&self, provider_id: &str) {
        let mut guard = self.state.lock().unwrap();
        if let Some(entry) = guard.get_mut(provider_id) {
            entry.attempt_count = 0;
            entry.circuit_open = false;
            entry.crash_detected = false;
            entry.next_restart_at = None;
        }
    }

    pub fn is_circuit_open(&self, provider_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .get(provider_id)
            .map(|s| s.circuit_open)
            .unwrap_or(false)
    }

    pub fn get_attempt_count(&self, provider_id: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .get(provider_id)
            .map(|s| s.attempt_count)
            .unwrap_or(0)
    }

    pub fn crash_detected(&self, provider_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .get(provider_id)
            .map(|s| s.crash_detected)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RestartPolicy {
        RestartPolicy {
            enabled: true,
            max_attempts: 2,
            backoff_ms: vec![10, 20],
            timeout_ms: 1000,
        }
    }

    #[test]
    fn should_restart_false_before_crash_recorded() {
        let sup = ProviderSupervisor::new(policy());
        assert!(!sup.should_restart("p0"));
    }

    #[test]
    fn should_restart_true_after_backoff_elapses() {
        let sup = ProviderSupervisor::new(policy());
        sup.record_crash("p0");
        assert!(!sup.should_restart("p0"));
        std::thread::sleep(Duration::from_millis(50));
        assert!(sup.should_restart("p0"));
    }

    #[test]
    fn circuit_opens_after_max_attempts() {
        let sup = ProviderSupervisor::new(policy());
        sup.record_crash("p0");
        sup.record_crash("p0");
        assert!(!sup.is_circuit_open("p0"));
        sup.record_crash("p0");
        assert!(sup.is_circuit_open("p0"));
        assert!(!sup.should_restart("p0"));
    }

    #[test]
    fn success_resets_attempt_count_and_circuit() {
        let sup = ProviderSupervisor::new(policy());
        sup.record_crash("p0");
        sup.record_crash("p0");
        sup.record_crash("p0");
        assert!(sup.is_circuit_open("p0"));
        sup.record_success("p0");
        assert_eq!(sup.get_attempt_count("p0"), 0);
        assert!(!sup.is_circuit_open("p0"));
    }

    #[test]
    fn disabled_policy_never_restarts() {
        let mut p = policy();
        p.enabled = false;
        let sup = ProviderSupervisor::new(p);
        sup.record_crash("p0");
        std::thread::sleep(Duration::from_millis(50));
        assert!(!sup.should_restart("p0"));
    }

    #[test]
    fn mark_and_clear_crash_detected() {
        let sup = ProviderSupervisor::new(policy());
        assert!(!sup.crash_detected("p0"));
        sup.mark_crash_detected("p0");
        assert!(sup.crash_detected("p0"));
        sup.clear_crash_detected("p0");
        assert!(!sup.crash_detected("p0"));
    }
}
