use std::time::Duration;

use crate::config::model::WatchdogConfig;

/// Thresholds and delays the watchdog state machine works from.
#[derive(Debug, Clone, PartialEq)]
pub struct CrashPolicy {
    pub failure_threshold: u32,
    pub restart_ceiling: u32,
    pub restart_window: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for CrashPolicy {
    fn default() -> Self {
        Self::from_config(&WatchdogConfig::default())
    }
}

impl CrashPolicy {
    pub fn from_config(cfg: &WatchdogConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold.max(1),
            restart_ceiling: cfg.restart_ceiling,
            restart_window: Duration::from_secs(cfg.restart_window_secs),
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
        }
    }

    /// Equal-jitter exponential backoff for the `failed`-th consecutive
    /// failed restart (1-based).
    pub fn backoff_delay(&self, failed: u32) -> Duration {
        let exponent = failed.saturating_sub(1).min(30) as i32;
        let base_ms = self.initial_backoff.as_millis() as f64 * 2_f64.powi(exponent);
        let capped_ms = base_ms.min(self.max_backoff.as_millis() as f64);
        let half = capped_ms / 2.0;
        let jitter = rand::random::<f64>() * half;
        Duration::from_millis((half + jitter) as u64)
    }
}

/// Everything the watchdog runtime needs besides the crash policy.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogSettings {
    pub crash: CrashPolicy,
    pub probe_interval: Duration,
    pub topic_timeout: Duration,
    pub shutdown_grace: Duration,
    pub swap_grace: Duration,
    pub deploy_probe_attempts: u32,
    pub startup_settle: Duration,
    pub terminate_grace: Duration,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self::from_config(&WatchdogConfig::default())
    }
}

impl WatchdogSettings {
    pub fn from_config(cfg: &WatchdogConfig) -> Self {
        Self {
            crash: CrashPolicy::from_config(cfg),
            probe_interval: Duration::from_millis(cfg.probe_interval_ms),
            topic_timeout: Duration::from_millis(cfg.topic_timeout_ms),
            shutdown_grace: Duration::from_secs(cfg.shutdown_grace_secs),
            swap_grace: Duration::from_secs(cfg.swap_grace_secs),
            deploy_probe_attempts: cfg.deploy_probe_attempts.max(1),
            startup_settle: Duration::from_millis(cfg.startup_settle_ms),
            terminate_grace: Duration::from_millis(cfg.terminate_grace_ms),
        }
    }
}
