//! Runtime configuration surface (§6.3): a single YAML document loaded at
//! startup and validated before anything else spins up.

use std::path::Path;

use serde::Deserialize;

use crate::error::{ErrorKind, Result, RuntimeError};
use crate::router::GatingPolicy;
use crate::state_cache::{DEFAULT_POLLING_INTERVAL_MS, MIN_POLLING_INTERVAL_MS};
use crate::supervisor::RestartPolicy;

fn default_polling_interval_ms() -> u64 {
    DEFAULT_POLLING_INTERVAL_MS
}

fn default_tick_rate_hz() -> u64 {
    crate::bt::DEFAULT_TICK_RATE_HZ
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_queue_capacity() -> usize {
    crate::events::DEFAULT_QUEUE_CAPACITY
}

fn default_subscriber_cap() -> usize {
    crate::events::DEFAULT_SUBSCRIBER_CAP
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_manual_gating_policy() -> String {
    "BLOCK".to_string()
}

fn default_runtime_mode() -> String {
    "IDLE".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestartPolicyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_schedule")]
    pub backoff_ms: Vec<u64>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_schedule() -> Vec<u64> {
    vec![100, 250, 500, 1000, 2000]
}

impl Default for RestartPolicyConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_schedule(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl From<RestartPolicyConfig> for RestartPolicy {
    fn from(c: RestartPolicyConfig) -> Self {
        RestartPolicy {
            enabled: c.enabled,
            max_attempts: c.max_attempts,
            backoff_ms: c.backoff_ms,
            timeout_ms: c.timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParameterConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub default: serde_json::Value,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub allowed: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_subscriber_cap")]
    pub subscriber_cap: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            subscriber_cap: default_subscriber_cap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    #[serde(default = "default_tick_rate_hz")]
    pub tick_rate_hz: u64,
    #[serde(default)]
    pub bt_tree_path: Option<String>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub restart_policy: RestartPolicyConfig,
    #[serde(default)]
    pub parameters: Vec<ParameterConfig>,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default = "default_manual_gating_policy")]
    pub manual_gating_policy: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_runtime_mode")]
    pub runtime_mode: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            polling_interval_ms: default_polling_interval_ms(),
            tick_rate_hz: default_tick_rate_hz(),
            bt_tree_path: None,
            providers: Vec::new(),
            restart_policy: RestartPolicyConfig::default(),
            parameters: Vec::new(),
            events: EventsConfig::default(),
            manual_gating_policy: default_manual_gating_policy(),
            log_level: default_log_level(),
            runtime_mode: default_runtime_mode(),
        }
    }
}

impl Config {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| RuntimeError::new(ErrorKind::Internal, format!("reading config '{}': {e}", path.display())))?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| RuntimeError::new(ErrorKind::Internal, format!("parsing config '{}': {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn gating_policy(&self) -> GatingPolicy {
        match self.manual_gating_policy.as_str() {
            "OVERRIDE" => GatingPolicy::Override,
            _ => GatingPolicy::Block,
        }
    }

    /// Resolves `runtime_mode` via the same strict parser as the rest of the
    /// mode state machine (§4.5: "unknown strings return none; no silent
    /// defaulting"). [`Config::validate`] rejects anything this returns
    /// `None` for, so callers past that point may unwrap.
    pub fn initial_mode(&self) -> Option<crate::mode::Mode> {
        crate::mode::string_to_mode(&self.runtime_mode)
    }

    /// Enforces every numeric/structural bound named in §6.3. Called by
    /// [`Config::load_from_path`] and directly by tests exercising malformed
    /// documents without touching the filesystem.
    pub fn validate(&self) -> Result<()> {
        if self.polling_interval_ms < MIN_POLLING_INTERVAL_MS {
            return Err(RuntimeError::invalid_argument(format!(
                "polling_interval_ms must be >= {MIN_POLLING_INTERVAL_MS}, got {}",
                self.polling_interval_ms
            )));
        }
        if !(crate::bt::MIN_TICK_RATE_HZ..=crate::bt::MAX_TICK_RATE_HZ).contains(&self.tick_rate_hz) {
            return Err(RuntimeError::invalid_argument(format!(
                "tick_rate_hz must be in [{}, {}], got {}",
                crate::bt::MIN_TICK_RATE_HZ,
                crate::bt::MAX_TICK_RATE_HZ,
                self.tick_rate_hz
            )));
        }
        for provider in &self.providers {
            if provider.timeout_ms < 100 {
                return Err(RuntimeError::invalid_argument(format!(
                    "provider '{}' timeout_ms must be >= 100, got {}",
                    provider.provider_id, provider.timeout_ms
                )));
            }
        }
        let rp = &self.restart_policy;
        if rp.backoff_ms.len() != rp.max_attempts as usize {
            return Err(RuntimeError::invalid_argument(format!(
                "restart_policy.backoff_ms must have exactly max_attempts ({}) entries, got {}",
                rp.max_attempts,
                rp.backoff_ms.len()
            )));
        }
        if rp.max_attempts < 1 {
            return Err(RuntimeError::invalid_argument(format!(
                "restart_policy.max_attempts must be >= 1, got {}",
                rp.max_attempts
            )));
        }
        if rp.timeout_ms < 1000 {
            return Err(RuntimeError::invalid_argument(format!(
                "restart_policy.timeout_ms must be >= 1000, got {}",
                rp.timeout_ms
            )));
        }
        if !matches!(self.manual_gating_policy.as_str(), "BLOCK" | "OVERRIDE") {
            return Err(RuntimeError::invalid_argument(format!(
                "manual_gating_policy must be BLOCK or OVERRIDE, got '{}'",
                self.manual_gating_policy
            )));
        }
        if !matches!(self.log_level.as_str(), "debug" | "info" | "warn" | "error") {
            return Err(RuntimeError::invalid_argument(format!(
                "logging.level must be one of debug, info, warn, error, got '{}'",
                self.log_level
            )));
        }
        if self.initial_mode().is_none() {
            return Err(RuntimeError::invalid_argument(format!(
                "runtime.mode must be one of MANUAL, AUTO, IDLE, FAULT, got '{}'",
                self.runtime_mode
            )));
        }
        for param in &self.parameters {
            if crate::parameters::parameter_type_from_string(&param.type_name).is_none() {
                return Err(RuntimeError::invalid_argument(format!(
                    "parameter '{}' has unknown type '{}'",
                    param.name, param.type_name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_polling_interval_below_minimum() {
        let mut cfg = Config::default();
        cfg.polling_interval_ms = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_tick_rate_out_of_bounds() {
        let mut cfg = Config::default();
        cfg.tick_rate_hz = 0;
        assert!(cfg.validate().is_err());
        cfg.tick_rate_hz = 5000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_backoff_schedule_length_mismatch() {
        let mut cfg = Config::default();
        cfg.restart_policy.backoff_ms = vec![100];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_gating_policy() {
        let mut cfg = Config::default();
        cfg.manual_gating_policy = "MAYBE".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_restart_policy_below_minimums() {
        let mut cfg = Config::default();
        cfg.restart_policy.max_attempts = 0;
        cfg.restart_policy.backoff_ms = vec![];
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.restart_policy.timeout_ms = 999;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut cfg = Config::default();
        cfg.log_level = "trace".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_runtime_mode() {
        let mut cfg = Config::default();
        cfg.runtime_mode = "BOGUS".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn initial_mode_resolves_configured_string() {
        let mut cfg = Config::default();
        assert_eq!(cfg.initial_mode(), Some(crate::mode::Mode::Idle));
        cfg.runtime_mode = "AUTO".into();
        assert_eq!(cfg.initial_mode(), Some(crate::mode::Mode::Auto));
    }

    #[test]
    fn load_from_path_reads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
polling_interval_ms: 250
tick_rate_hz: 20
manual_gating_policy: OVERRIDE
restart_policy:
  max_attempts: 2
  backoff_ms: [100, 200]
"#,
        )
        .unwrap();
        let cfg = Config::load_from_path(&path).unwrap();
        assert_eq!(cfg.polling_interval_ms, 250);
        assert_eq!(cfg.tick_rate_hz, 20);
        assert_eq!(cfg.gating_policy(), GatingPolicy::Override);
    }
}
