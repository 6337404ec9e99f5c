//! Runtime configuration for the pooled executor and shutdown coordinator.

use std::time::Duration;

/// Aggregate configuration for the concurrency substrate and connections.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Pooled executor settings.
    pub pool: PoolConfig,
    /// Shutdown drain settings.
    pub shutdown: ShutdownConfig,
    /// Connection pipeline settings.
    pub msgque: crate::network::config::MsgQueConfig,
}

/// Pooled executor settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Resident worker count above which a worker exits after its task
    /// instead of going idle. Submission is never refused.
    pub soft_ceiling: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            soft_ceiling: 80_000,
        }
    }
}

/// Shutdown drain settings.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Upper bound on waiting for general tasks to finish.
    pub drain_timeout: Duration,
    /// Interval between checks of the general task counter.
    pub poll_interval: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(1),
        }
    }
}
