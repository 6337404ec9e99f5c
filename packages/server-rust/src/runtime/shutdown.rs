//! Coordinated process shutdown.
//!
//! `Running -> Stopping -> Stopped`, entered exactly once. Stopping retires
//! idle pool workers and waits, up to the drain timeout, for general tasks to
//! finish. The exit sequence then runs caller exit functions, `at_exit`
//! hooks, storage close, cache close, and finally the logging drain.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::config::ShutdownConfig;
use super::pool::{Executor, TaskCounter};
use crate::traits::ClosableLayer;

/// Callback run once during the exit sequence.
pub type ExitHook = Box<dyn FnOnce() + Send>;

/// Process run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    /// General tasks are draining.
    Stopping,
    /// Draining finished or timed out.
    Stopped,
}

/// Identifies a registered drain check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrainCheckId(u64);

/// Identifies a registered `at_exit` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitHookId(u64);

/// Process-wide stop flag, drain diagnostics, and ordered exit hooks.
pub struct ShutdownCoordinator {
    config: ShutdownConfig,
    executor: Executor,
    state: ArcSwap<RunState>,
    stop_started: AtomicBool,
    exit_started: AtomicBool,
    stopped: watch::Sender<bool>,
    next_id: AtomicU64,
    drain_checks: DashMap<DrainCheckId, String>,
    at_exit: Mutex<HashMap<ExitHookId, ExitHook>>,
    storage: Mutex<Vec<Arc<dyn ClosableLayer>>>,
    cache: Mutex<Vec<Arc<dyn ClosableLayer>>>,
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new(config: ShutdownConfig, executor: Executor) -> Self {
        let (stopped, _) = watch::channel(false);
        Self {
            config,
            executor,
            state: ArcSwap::from_pointee(RunState::Running),
            stop_started: AtomicBool::new(false),
            exit_started: AtomicBool::new(false),
            stopped,
            next_id: AtomicU64::new(1),
            drain_checks: DashMap::new(),
            at_exit: Mutex::new(HashMap::new()),
            storage: Mutex::new(Vec::new()),
            cache: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        **self.state.load()
    }

    /// `true` once stopping has begun.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.state() != RunState::Running
    }

    /// Receiver flipped to `true` when the state reaches `Stopped`.
    #[must_use]
    pub fn stopped_receiver(&self) -> watch::Receiver<bool> {
        self.stopped.subscribe()
    }

    /// Announces outstanding work, logged if draining times out.
    pub fn add_drain_check(&self, description: impl Into<String>) -> DrainCheckId {
        let id = DrainCheckId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.drain_checks.insert(id, description.into());
        id
    }

    pub fn remove_drain_check(&self, id: DrainCheckId) {
        self.drain_checks.remove(&id);
    }

    /// Registers a drain check removed when the guard drops.
    #[must_use]
    pub fn drain_check(self: &Arc<Self>, description: impl Into<String>) -> DrainCheckGuard {
        DrainCheckGuard {
            id: self.add_drain_check(description),
            coordinator: Arc::clone(self),
        }
    }

    /// Descriptions of drain checks still registered.
    #[must_use]
    pub fn outstanding_drain_checks(&self) -> Vec<String> {
        self.drain_checks
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Registers a hook run during the exit sequence, after the caller's exit
    /// functions. Hooks run in no particular order relative to each other.
    pub fn at_exit<F>(&self, hook: F) -> ExitHookId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = ExitHookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.at_exit.lock().insert(id, Box::new(hook));
        id
    }

    /// Withdraws an `at_exit` hook. Returns `false` if it already ran or was
    /// never registered.
    pub fn cancel_at_exit(&self, id: ExitHookId) -> bool {
        self.at_exit.lock().remove(&id).is_some()
    }

    pub fn register_storage(&self, layer: Arc<dyn ClosableLayer>) {
        self.storage.lock().push(layer);
    }

    pub fn register_cache(&self, layer: Arc<dyn ClosableLayer>) {
        self.cache.lock().push(layer);
    }

    /// Moves to `Stopping`, retires idle workers, and drains general tasks
    /// until they finish or the drain timeout passes.
    ///
    /// Returns `false` if stopping had already been started by another call.
    pub async fn stop(&self) -> bool {
        if self
            .stop_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        self.state.store(Arc::new(RunState::Stopping));
        info!("stopping: draining general tasks");
        self.executor.retire_idle();

        let drained = self
            .executor
            .general()
            .wait_for_zero(self.config.poll_interval, Some(self.config.drain_timeout))
            .await;

        if drained {
            info!("general tasks drained");
        } else {
            let remaining = self.executor.general().count();
            warn!(
                remaining,
                timeout_ms = u64::try_from(self.config.drain_timeout.as_millis()).unwrap_or(u64::MAX),
                "drain timeout expired, proceeding"
            );
            for entry in &self.drain_checks {
                warn!(check = entry.key().0, description = %entry.value(), "drain check outstanding");
            }
        }

        self.state.store(Arc::new(RunState::Stopped));
        self.stopped.send_replace(true);
        true
    }

    /// Blocks until SIGINT, SIGTERM, or an explicit [`stop`](Self::stop),
    /// then runs the exit sequence.
    pub async fn wait_for_exit(&self, exits: Vec<ExitHook>) -> bool {
        let mut stopped = self.stopped.subscribe();
        tokio::select! {
            () = termination_signal() => info!("termination signal received"),
            _ = async { stopped.wait_for(|s| *s).await.is_ok() } => {}
        }
        self.shutdown(exits).await
    }

    /// Stops (if not already stopped) and runs the exit sequence.
    ///
    /// Returns `false` without running anything if the exit sequence has
    /// already been run or is running.
    pub async fn shutdown(&self, exits: Vec<ExitHook>) -> bool {
        self.stop().await;
        let mut stopped = self.stopped.subscribe();
        let _ = stopped.wait_for(|s| *s).await;

        if self
            .exit_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        for exit in exits {
            run_hook(exit, "exit function");
        }

        let hooks: Vec<ExitHook> = self.at_exit.lock().drain().map(|(_, hook)| hook).collect();
        for hook in hooks {
            run_hook(hook, "at_exit hook");
        }

        let storage: Vec<_> = self.storage.lock().drain(..).collect();
        self.close_layers("storage", storage, self.executor.storage())
            .await;
        let cache: Vec<_> = self.cache.lock().drain(..).collect();
        self.close_layers("cache", cache, self.executor.cache()).await;

        info!("closing logging");
        self.executor.close_logging();
        self.executor
            .logging()
            .wait_for_zero(self.config.poll_interval, None)
            .await;
        true
    }

    async fn close_layers(
        &self,
        category: &str,
        layers: Vec<Arc<dyn ClosableLayer>>,
        counter: &TaskCounter,
    ) {
        for layer in layers {
            if let Err(e) = layer.close().await {
                error!(category, layer = layer.name(), error = %e, "layer close failed");
            }
        }
        counter.wait_for_zero(self.config.poll_interval, None).await;
        info!(category, "layer drained");
    }
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("state", &self.state())
            .field("drain_checks", &self.drain_checks.len())
            .finish_non_exhaustive()
    }
}

/// Removes its drain check on drop.
#[derive(Debug)]
pub struct DrainCheckGuard {
    id: DrainCheckId,
    coordinator: Arc<ShutdownCoordinator>,
}

impl Drop for DrainCheckGuard {
    fn drop(&mut self) {
        self.coordinator.remove_drain_check(self.id);
    }
}

fn run_hook(hook: ExitHook, kind: &str) {
    if std::panic::catch_unwind(AssertUnwindSafe(hook)).is_err() {
        error!(kind, "exit hook panicked");
    }
}

async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::runtime::config::PoolConfig;

    fn coordinator(drain_timeout: Duration) -> (Arc<ShutdownCoordinator>, Executor) {
        let executor = Executor::new(&PoolConfig::default());
        let config = ShutdownConfig {
            drain_timeout,
            ..ShutdownConfig::default()
        };
        (
            Arc::new(ShutdownCoordinator::new(config, executor.clone())),
            executor,
        )
    }

    struct RecordingLayer {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ClosableLayer for RecordingLayer {
        fn name(&self) -> &str {
            self.name
        }

        async fn close(&self) -> anyhow::Result<()> {
            self.log.lock().push(self.name);
            Ok(())
        }
    }

    #[test]
    fn initial_state_is_running() {
        let executor = Executor::new(&PoolConfig::default());
        let coordinator = ShutdownCoordinator::new(ShutdownConfig::default(), executor);
        assert_eq!(coordinator.state(), RunState::Running);
        assert!(!coordinator.is_stopping());
    }

    #[tokio::test]
    async fn stop_transitions_once() {
        let (coordinator, _) = coordinator(Duration::from_secs(1));
        let mut stopped = coordinator.stopped_receiver();

        assert!(coordinator.stop().await);
        assert_eq!(coordinator.state(), RunState::Stopped);
        assert!(stopped.wait_for(|s| *s).await.is_ok());

        assert!(!coordinator.stop().await);
    }

    #[tokio::test]
    async fn stop_waits_for_general_tasks() {
        let (coordinator, executor) = coordinator(Duration::from_secs(2));
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        executor.submit(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            flag.store(true, Ordering::SeqCst);
        });

        coordinator.stop().await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_timeout_proceeds_with_checks_outstanding() {
        let (coordinator, executor) = coordinator(Duration::from_millis(20));
        let _check = coordinator.drain_check("stuck reader on conn 7");
        executor.submit(std::future::pending::<()>());

        coordinator.stop().await;
        assert_eq!(coordinator.state(), RunState::Stopped);
        assert_eq!(
            coordinator.outstanding_drain_checks(),
            vec!["stuck reader on conn 7".to_string()]
        );
    }

    #[test]
    fn drain_check_guard_removes_entry() {
        let (coordinator, _) = coordinator(Duration::from_secs(1));
        {
            let _guard = coordinator.drain_check("temporary");
            assert_eq!(coordinator.outstanding_drain_checks().len(), 1);
        }
        assert!(coordinator.outstanding_drain_checks().is_empty());

        let id = coordinator.add_drain_check("manual");
        coordinator.remove_drain_check(id);
        assert!(coordinator.outstanding_drain_checks().is_empty());
    }

    #[tokio::test]
    async fn exit_sequence_runs_in_order() {
        let (coordinator, executor) = coordinator(Duration::from_secs(1));
        let log = Arc::new(Mutex::new(Vec::new()));

        coordinator.register_cache(Arc::new(RecordingLayer {
            name: "cache",
            log: Arc::clone(&log),
        }));
        coordinator.register_storage(Arc::new(RecordingLayer {
            name: "storage",
            log: Arc::clone(&log),
        }));
        let l = Arc::clone(&log);
        coordinator.at_exit(move || l.lock().push("at_exit"));
        let l = Arc::clone(&log);
        let exits: Vec<ExitHook> = vec![Box::new(move || l.lock().push("exit"))];

        assert!(coordinator.shutdown(exits).await);
        assert_eq!(*log.lock(), vec!["exit", "at_exit", "storage", "cache"]);
        assert!(executor.is_logging_closed());
    }

    #[tokio::test]
    async fn shutdown_twice_does_not_rerun_hooks() {
        let (coordinator, _) = coordinator(Duration::from_secs(1));
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        coordinator.at_exit(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        assert!(coordinator.shutdown(Vec::new()).await);
        let r = Arc::clone(&runs);
        let exits: Vec<ExitHook> = vec![Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        })];
        assert!(!coordinator.shutdown(exits).await);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_hook_does_not_abort_sequence() {
        let (coordinator, _) = coordinator(Duration::from_secs(1));
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        coordinator.at_exit(move || r.store(true, Ordering::SeqCst));
        let exits: Vec<ExitHook> = vec![Box::new(|| panic!("exit failed"))];

        assert!(coordinator.shutdown(exits).await);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_at_exit() {
        let (coordinator, _) = coordinator(Duration::from_secs(1));
        let id = coordinator.at_exit(|| {});
        assert!(coordinator.cancel_at_exit(id));
        assert!(!coordinator.cancel_at_exit(id));
    }

    #[tokio::test]
    async fn explicit_stop_releases_wait_for_exit() {
        let (coordinator, _) = coordinator(Duration::from_secs(1));
        let waiter = Arc::clone(&coordinator);
        let handle = tokio::spawn(async move { waiter.wait_for_exit(Vec::new()).await });

        coordinator.stop().await;
        assert!(handle.await.unwrap());
    }
}
