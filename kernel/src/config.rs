//! Kernel configuration. Hosts typically deserialize this from their own
//! config surface and pass it to the root supervisor.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Per-syscall dispatch deadline.
    pub dispatch_timeout_ms: u64,
    /// Retries for transient delegator failures inside one dispatch task.
    pub retry_budget: u32,
    /// Bounded depth of each unit job queue.
    pub queue_capacity: usize,
    /// Metrics snapshot cadence, in system epochs.
    pub metrics_interval_epochs: i32,
    /// Keepalive tick for the matchmaker/watcher/adjuster loops.
    pub keepalive_ms: u64,
    /// How long the signal listener parks before re-checking the outbox.
    pub listener_park_ms: u64,
    /// Cap on the child restart backoff (retries x 1s otherwise).
    pub restart_backoff_cap_ms: u64,
    /// Largest chunk the storage provider accepts.
    pub max_chunk_size: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout_ms: 5_000,
            retry_budget: 3,
            queue_capacity: 64,
            metrics_interval_epochs: 10,
            keepalive_ms: 1_000,
            listener_park_ms: 100,
            restart_backoff_cap_ms: 5_000,
            max_chunk_size: 4 * 1024 * 1024,
        }
    }
}

impl KernelConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    pub fn restart_backoff(&self, retries: u32) -> Duration {
        let ms = (retries as u64).saturating_mul(1_000);
        Duration::from_millis(ms.min(self.restart_backoff_cap_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_deserialize_from_empty() {
        let cfg: KernelConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.dispatch_timeout_ms, 5_000);
        assert_eq!(cfg.retry_budget, 3);
    }

    #[test]
    fn test_restart_backoff_caps() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.restart_backoff(1), Duration::from_secs(1));
        assert_eq!(cfg.restart_backoff(3), Duration::from_secs(3));
        assert_eq!(cfg.restart_backoff(60), Duration::from_millis(5_000));
    }
}
