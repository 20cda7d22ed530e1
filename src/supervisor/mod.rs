//! Fleet supervisor.
//!
//! # Responsibilities
//! - Own the socket registry and the snapshot publisher
//! - Observe reload edges (notification, semaphore poll, config file, SIGHUP)
//! - Run reload cycles and hand sockets to workers
//! - Keep `http_workers` workers alive, respawning crashed ones
//!
//! # Data Flow
//! ```text
//! NotificationChannel ─┐
//! SemaphoreSampler ────┤
//! config updates ──────┼─▶ select loop ─▶ reload.rs (cycle)
//! reload requests ─────┘        │              ├─▶ SocketRegistry::reconcile
//!                               │              ├─▶ SnapshotPublisher::publish
//! worker exits ─────────────────┘              └─▶ WorkerHandle::reconfigure
//! ```
//!
//! # Design Decisions
//! - One async loop; reload cycles never overlap
//! - Worker exits are handled between cycles; acks from a dead worker
//!   resolve as closed channels
//! - Supervisor state is passed in at construction, nothing is global

mod fleet;
mod reload;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{self, MissedTickBehavior};

use crate::config::HttpdConfig;
use crate::coordination::{ChannelListener, ReloadEdge, ReloadSemaphore, SemaphoreSampler};
use crate::handlers::SnapshotPublisher;
use crate::host::{HandlerStore, QueryExecutor};
use crate::net::SocketRegistry;
use crate::observability::metrics;
use crate::worker::{spawn_worker, WorkerContext, WorkerExit, WorkerId};

pub use fleet::Fleet;
pub use reload::ReloadOutcome;

/// Host-side collaborators of the supervisor.
pub struct SupervisorDeps {
    pub store: Arc<dyn HandlerStore>,
    pub executor: Arc<dyn QueryExecutor>,
    pub channel: ChannelListener,
    pub semaphore: Arc<ReloadSemaphore>,
}

/// Observable fleet state, updated after every cycle and worker event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetStatus {
    pub snapshot_version: u64,
    pub workers: usize,
    pub listeners: usize,
    /// Completed reload cycles, whatever their outcome.
    pub reload_cycles: u64,
    pub last_outcome: Option<ReloadOutcome>,
    /// Worker exits seen while running, requested or not.
    pub worker_exits: u64,
}

pub struct Supervisor {
    config: HttpdConfig,
    registry: SocketRegistry,
    snapshots: SnapshotPublisher,
    store: Arc<dyn HandlerStore>,
    executor: Arc<dyn QueryExecutor>,
    channel: ChannelListener,
    sampler: SemaphoreSampler,
    fleet: Fleet,
    exits_tx: mpsc::UnboundedSender<WorkerExit>,
    exits_rx: mpsc::UnboundedReceiver<WorkerExit>,
    config_updates: Option<mpsc::UnboundedReceiver<HttpdConfig>>,
    reload_requests: Option<mpsc::UnboundedReceiver<ReloadEdge>>,
    status: watch::Sender<FleetStatus>,
    /// Semaphore poll timer, created once the loop runs.
    poll: Option<time::Interval>,
    reload_cycles: u64,
    last_outcome: Option<ReloadOutcome>,
    worker_exits: u64,
}

impl Supervisor {
    pub fn new(
        config: HttpdConfig,
        registry: SocketRegistry,
        snapshots: SnapshotPublisher,
        deps: SupervisorDeps,
    ) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(FleetStatus {
            snapshot_version: snapshots.version(),
            ..FleetStatus::default()
        });
        Self {
            config,
            registry,
            snapshots,
            store: deps.store,
            executor: deps.executor,
            channel: deps.channel,
            sampler: SemaphoreSampler::new(deps.semaphore),
            fleet: Fleet::new(),
            exits_tx,
            exits_rx,
            config_updates: None,
            reload_requests: None,
            status,
            poll: None,
            reload_cycles: 0,
            last_outcome: None,
            worker_exits: 0,
        }
    }

    /// Validated configuration files from the watcher.
    pub fn with_config_updates(mut self, updates: mpsc::UnboundedReceiver<HttpdConfig>) -> Self {
        self.config_updates = Some(updates);
        self
    }

    /// Explicit reload requests, e.g. SIGHUP.
    pub fn with_reload_requests(mut self, requests: mpsc::UnboundedReceiver<ReloadEdge>) -> Self {
        self.reload_requests = Some(requests);
        self
    }

    pub fn status(&self) -> watch::Receiver<FleetStatus> {
        self.status.subscribe()
    }

    pub fn snapshots(&self) -> &SnapshotPublisher {
        &self.snapshots
    }

    /// Run until `shutdown` fires, then drain every worker and close all sockets.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            http_workers = self.config.worker_count(),
            channel = self.channel.name(),
            "Supervisor starting"
        );

        self.reload(ReloadEdge::Startup).await;
        self.ensure_worker_count();
        self.publish_status();

        self.poll = Some(semaphore_poll(&self.config));
        let mut channel_open = true;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Supervisor received shutdown signal");
                    break;
                }
                message = self.channel.recv(), if channel_open => match message {
                    Some(()) => {
                        self.reload(ReloadEdge::Notification).await;
                    }
                    None => {
                        tracing::warn!("Notification channel closed, relying on the semaphore");
                        channel_open = false;
                    }
                },
                _ = next_tick(&mut self.poll) => {
                    if self.sampler.sample() {
                        self.reload(ReloadEdge::Semaphore).await;
                    }
                }
                Some(exit) = self.exits_rx.recv() => {
                    self.on_worker_exit(exit);
                }
                update = next_or_pending(&mut self.config_updates) => match update {
                    Some(config) => self.apply_config(config),
                    None => self.config_updates = None,
                },
                request = next_or_pending(&mut self.reload_requests) => match request {
                    Some(edge) => {
                        self.reload(edge).await;
                    }
                    None => self.reload_requests = None,
                },
            }
            self.publish_status();
        }

        self.shutdown().await;
        tracing::info!("Supervisor stopped");
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            snapshots: self.snapshots.clone(),
            executor: self.executor.clone(),
            listener: self.config.listener.clone(),
            drain_grace: self.config.reload.drain_grace(),
            events: self.exits_tx.clone(),
        }
    }

    /// Spawn or trim workers until the active count matches `http_workers`.
    fn ensure_worker_count(&mut self) {
        let target = self.config.worker_count();

        while self.fleet.active_count() < target {
            if !self.spawn_one() {
                break;
            }
        }

        while self.fleet.active_count() > target {
            let Some(id) = self.fleet.newest_active() else {
                break;
            };
            self.fleet.retire(id);
            if let Some(handle) = self.fleet.get(id) {
                tracing::info!(worker = %id, "Trimming worker");
                handle.shutdown();
            }
        }

        metrics::record_workers(self.fleet.active_count());
    }

    fn spawn_one(&mut self) -> bool {
        let id = self.fleet.next_id();
        let sockets = match self.registry.handoff_to(id) {
            Ok(sockets) => sockets,
            Err(e) => {
                tracing::error!(worker = %id, error = %e, "Socket handoff failed");
                self.registry.release_all(id);
                return false;
            }
        };

        match spawn_worker(id, self.worker_context(), sockets) {
            Ok(handle) => {
                tracing::info!(worker = %id, "Worker spawned");
                self.fleet.insert(handle);
                true
            }
            Err(e) => {
                tracing::error!(worker = %id, error = %e, "Failed to spawn worker thread");
                self.registry.release_all(id);
                false
            }
        }
    }

    fn on_worker_exit(&mut self, exit: WorkerExit) {
        self.worker_exits += 1;
        metrics::record_worker_exit(exit.reason.label());
        self.registry.release_all(exit.worker);
        if let Some(handle) = self.fleet.remove(exit.worker) {
            tokio::task::spawn_blocking(move || handle.join());
        }

        if exit.reason.is_requested() {
            tracing::debug!(worker = %exit.worker, reason = exit.reason.label(), "Worker left");
        } else {
            tracing::warn!(worker = %exit.worker, reason = ?exit.reason, "Worker crashed, respawning");
        }
        self.ensure_worker_count();
    }

    fn apply_config(&mut self, config: HttpdConfig) {
        if config == self.config {
            return;
        }
        tracing::info!(
            http_workers = config.worker_count(),
            "Applying updated configuration"
        );
        self.registry.set_config(config.listener.clone());
        if self.poll.is_some() && config.reload.semaphore_poll() != self.config.reload.semaphore_poll() {
            tracing::info!(period = ?config.reload.semaphore_poll(), "Semaphore poll period changed");
            self.poll = Some(semaphore_poll(&config));
        }
        self.config = config;
        self.ensure_worker_count();
    }

    fn publish_status(&self) {
        self.status.send_replace(FleetStatus {
            snapshot_version: self.snapshots.version(),
            workers: self.fleet.active_count(),
            listeners: self.registry.len(),
            reload_cycles: self.reload_cycles,
            last_outcome: self.last_outcome,
            worker_exits: self.worker_exits,
        });
    }

    async fn shutdown(&mut self) {
        tracing::info!(workers = self.fleet.len(), "Draining workers");
        for handle in self.fleet.all() {
            handle.shutdown();
        }

        let timeout = self.config.reload.drain_timeout();
        if !self.await_exits(timeout).await {
            tracing::warn!(remaining = self.fleet.len(), "Drain timed out, terminating workers");
            for handle in self.fleet.all() {
                handle.terminate();
            }
            self.await_exits(timeout).await;
        }

        for handle in self.fleet.drain() {
            tracing::warn!(worker = %handle.id(), "Abandoning unresponsive worker");
            self.registry.release_all(handle.id());
        }
        self.registry.close_all();
        metrics::record_workers(0);
        self.publish_status();
    }

    /// Collect exit events until the fleet is empty. `false` on timeout.
    async fn await_exits(&mut self, timeout: std::time::Duration) -> bool {
        let deadline = time::Instant::now() + timeout;
        while !self.fleet.is_empty() {
            match time::timeout_at(deadline, self.exits_rx.recv()).await {
                Ok(Some(exit)) => {
                    metrics::record_worker_exit(exit.reason.label());
                    self.registry.release_all(exit.worker);
                    if let Some(handle) = self.fleet.remove(exit.worker) {
                        let _ = tokio::task::spawn_blocking(move || handle.join()).await;
                    }
                }
                Ok(None) => return false,
                Err(_) => return false,
            }
        }
        true
    }

    #[cfg(test)]
    fn worker_ids(&self) -> Vec<WorkerId> {
        self.fleet.active().map(|handle| handle.id()).collect()
    }
}

fn semaphore_poll(config: &HttpdConfig) -> time::Interval {
    let period = config.reload.semaphore_poll();
    let mut poll = time::interval_at(time::Instant::now() + period, period);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    poll
}

async fn next_tick(poll: &mut Option<time::Interval>) {
    match poll {
        Some(poll) => {
            poll.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn next_or_pending<T>(receiver: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerConfig;
    use crate::coordination::NotificationChannel;
    use crate::handlers::HandlerRow;
    use crate::host::{ConstantExecutor, MemoryHost};
    use std::time::Duration;

    fn quick_config(workers: i64) -> HttpdConfig {
        let mut config = HttpdConfig::default();
        config.fleet.http_workers = workers;
        config.reload.debounce_ms = 5;
        config.reload.semaphore_poll_ms = 20;
        config.reload.drain_grace_secs = 1;
        config.reload.drain_timeout_secs = 2;
        config
    }

    fn supervisor(config: HttpdConfig) -> (Supervisor, Arc<MemoryHost>) {
        let semaphore = Arc::new(ReloadSemaphore::anonymous().unwrap());
        let channel = NotificationChannel::configuration_reload();
        let host = Arc::new(MemoryHost::new(channel.clone(), semaphore.clone()));
        let deps = SupervisorDeps {
            store: host.clone(),
            executor: Arc::new(ConstantExecutor),
            channel: channel.subscribe(),
            semaphore,
        };
        let registry = SocketRegistry::new(ListenerConfig::default());
        (
            Supervisor::new(config, registry, SnapshotPublisher::default(), deps),
            host,
        )
    }

    #[tokio::test]
    async fn startup_spawns_the_configured_fleet() {
        let (mut supervisor, _host) = supervisor(quick_config(3));
        supervisor.reload(ReloadEdge::Startup).await;
        supervisor.ensure_worker_count();
        assert_eq!(supervisor.worker_ids().len(), 3);

        supervisor.shutdown().await;
        assert!(supervisor.fleet.is_empty());
    }

    #[tokio::test]
    async fn config_update_resizes_the_fleet() {
        let (mut supervisor, _host) = supervisor(quick_config(3));
        supervisor.ensure_worker_count();

        supervisor.apply_config(quick_config(1));
        assert_eq!(supervisor.worker_ids(), vec![WorkerId(1)]);

        supervisor.apply_config(quick_config(2));
        assert_eq!(supervisor.worker_ids(), vec![WorkerId(1), WorkerId(4)]);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn exited_workers_are_replaced() {
        let (mut supervisor, _host) = supervisor(quick_config(2));
        supervisor.ensure_worker_count();

        supervisor.fleet.get(WorkerId(1)).unwrap().terminate();
        let exit = tokio::time::timeout(Duration::from_secs(5), supervisor.exits_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.worker, WorkerId(1));
        supervisor.on_worker_exit(exit);

        assert_eq!(supervisor.worker_ids(), vec![WorkerId(2), WorkerId(3)]);
        supervisor.shutdown().await;
    }

    /// Store whose edits raise neither a notification nor a semaphore bump.
    #[derive(Default)]
    struct SilentStore(std::sync::Mutex<Vec<HandlerRow>>);

    impl HandlerStore for SilentStore {
        fn load_handlers(&self) -> Result<Vec<HandlerRow>, crate::host::StoreError> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn semaphore_bump_alone_triggers_a_reload() {
        let semaphore = Arc::new(ReloadSemaphore::anonymous().unwrap());
        let store = Arc::new(SilentStore::default());
        let deps = SupervisorDeps {
            store: store.clone(),
            executor: Arc::new(ConstantExecutor),
            channel: NotificationChannel::configuration_reload().subscribe(),
            semaphore: semaphore.clone(),
        };
        let supervisor = Supervisor::new(
            quick_config(1),
            SocketRegistry::new(ListenerConfig::default()),
            SnapshotPublisher::default(),
            deps,
        );
        let mut status = supervisor.status();
        let shutdown = crate::lifecycle::Shutdown::new();
        let task = tokio::spawn(supervisor.run(shutdown.subscribe()));

        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.reload_cycles >= 1))
            .await
            .unwrap()
            .unwrap();

        *store.0.lock().unwrap() = vec![HandlerRow::new(
            1,
            "127.0.0.1:0",
            &["GET"],
            "/hi",
            "SELECT 200, NULL, 'hello'",
        )];
        semaphore.bump();

        let reloaded = tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| s.snapshot_version >= 1),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(reloaded.last_outcome, Some(ReloadOutcome::Applied));
        assert_eq!(reloaded.listeners, 1);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn config_update_changes_the_poll_period() {
        let (mut supervisor, _host) = supervisor(quick_config(1));
        supervisor.poll = Some(semaphore_poll(&supervisor.config));

        let mut config = quick_config(1);
        config.reload.semaphore_poll_ms = 250;
        supervisor.apply_config(config);

        let period = supervisor.poll.as_ref().map(|poll| poll.period());
        assert_eq!(period, Some(Duration::from_millis(250)));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn status_tracks_published_versions() {
        let (mut supervisor, host) = supervisor(quick_config(1));
        let status = supervisor.status();
        host.insert(HandlerRow::new(1, "127.0.0.1:0", &["GET"], "/hi", "SELECT 200, NULL, 'hello'"))
            .unwrap();

        supervisor.reload(ReloadEdge::Notification).await;
        supervisor.publish_status();
        assert_eq!(status.borrow().snapshot_version, 1);
        assert_eq!(status.borrow().last_outcome, Some(ReloadOutcome::Applied));
        assert_eq!(status.borrow().listeners, 1);

        supervisor.shutdown().await;
    }
}
