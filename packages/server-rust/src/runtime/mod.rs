//! Concurrency substrate: pooled executor, coordinated shutdown, log drain.

pub mod config;
pub mod logging;
pub mod pool;
pub mod shutdown;

pub use config::{PoolConfig, RuntimeConfig, ShutdownConfig};
pub use logging::{init_tracing, ConsoleSink, LogPipe, LogSink};
pub use pool::{Executor, FailureReport, PoolStats, TaskCounter, TaskFailure};
pub use shutdown::{DrainCheckGuard, ExitHook, RunState, ShutdownCoordinator};
