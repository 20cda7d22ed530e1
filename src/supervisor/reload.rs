//! One reload cycle.
//!
//! ```text
//! debounce → coalesce pending edges → read handler table → build vN+1
//!     → (rejected | unchanged) stop, vN stays published;
//!       unchanged still retries binds that failed earlier
//!     → reconcile sockets → publish → reconfigure workers → await acks
//!     → terminate stragglers → resize fleet
//! ```

use std::collections::BTreeSet;

use tokio::sync::oneshot;
use tokio::time;

use crate::coordination::ReloadEdge;
use crate::handlers::{HandlerSnapshot, ListenAddress};
use crate::observability::metrics;
use crate::supervisor::Supervisor;
use crate::worker::{DrainReport, WorkerId};

/// How a reload cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// A new snapshot was published.
    Applied,
    /// The table matched the published snapshot.
    Unchanged,
    /// The table failed validation; the previous snapshot stays.
    Rejected,
    /// The table could not be read.
    Failed,
}

impl ReloadOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadOutcome::Applied => "applied",
            ReloadOutcome::Unchanged => "unchanged",
            ReloadOutcome::Rejected => "rejected",
            ReloadOutcome::Failed => "failed",
        }
    }
}

impl Supervisor {
    pub(super) async fn reload(&mut self, edge: ReloadEdge) -> ReloadOutcome {
        if edge != ReloadEdge::Startup {
            time::sleep(self.config.reload.debounce()).await;
        }
        let coalesced = self.coalesce_edges();

        let outcome = self.run_cycle().await;
        self.reload_cycles += 1;
        self.last_outcome = Some(outcome);
        metrics::record_reload(outcome.as_str());
        tracing::info!(
            edge = %edge,
            coalesced,
            outcome = outcome.as_str(),
            version = self.snapshots.version(),
            "Reload cycle finished"
        );

        self.ensure_worker_count();
        outcome
    }

    /// Swallow edges that arrived while debouncing; one cycle covers them all.
    fn coalesce_edges(&mut self) -> usize {
        let mut coalesced = self.channel.drain();
        if self.sampler.sample() {
            coalesced += 1;
        }
        if let Some(requests) = self.reload_requests.as_mut() {
            while requests.try_recv().is_ok() {
                coalesced += 1;
            }
        }
        coalesced
    }

    async fn run_cycle(&mut self) -> ReloadOutcome {
        let store = self.store.clone();
        let rows = match tokio::task::spawn_blocking(move || store.load_handlers()).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Failed to read handler table");
                return ReloadOutcome::Failed;
            }
            Err(e) => {
                tracing::error!(error = %e, "Handler table read aborted");
                return ReloadOutcome::Failed;
            }
        };

        let current = self.snapshots.load();
        let next = match HandlerSnapshot::build(current.version() + 1, &rows) {
            Ok(next) => next,
            Err(errors) => {
                for error in &errors {
                    tracing::error!(error = %error, "Handler table rejected");
                }
                tracing::warn!(
                    errors = errors.len(),
                    version = current.version(),
                    "Keeping the published snapshot"
                );
                return ReloadOutcome::Rejected;
            }
        };

        let desired = next.addresses();
        if next.same_handlers(&current) {
            if desired == self.registry.active_addresses() {
                return ReloadOutcome::Unchanged;
            }
            // Same table, but a bind failed earlier: retry it without a new version.
            let reconciled = self.registry.reconcile(&desired).await;
            for (address, error) in &reconciled.failed {
                tracing::error!(address = %address, error = %error, "Listener still unavailable");
            }
            if !reconciled.opened.is_empty() {
                tracing::info!(opened = reconciled.opened.len(), "Recovered listeners");
                self.reconfigure_workers().await;
            }
            return ReloadOutcome::Unchanged;
        }

        let reconciled = self.registry.reconcile(&desired).await;
        for (address, error) in &reconciled.failed {
            tracing::error!(address = %address, error = %error, "Listener unavailable this cycle");
        }

        let version = next.version();
        let handlers = next.len();
        self.snapshots.publish(next);
        tracing::info!(
            version,
            handlers,
            opened = reconciled.opened.len(),
            retired = reconciled.retired.len(),
            "Snapshot published"
        );

        if !reconciled.is_noop() {
            self.reconfigure_workers().await;
        }
        ReloadOutcome::Applied
    }

    /// Hand new sockets to every worker and drain retired ones where held.
    async fn reconfigure_workers(&mut self) {
        let workers: Vec<WorkerId> = self.fleet.active().map(|handle| handle.id()).collect();
        let mut pending: Vec<(WorkerId, oneshot::Receiver<DrainReport>)> = Vec::new();

        for id in workers {
            let adopt = match self.registry.handoff_to(id) {
                Ok(adopt) => adopt,
                Err(e) => {
                    tracing::error!(worker = %id, error = %e, "Socket handoff failed");
                    Vec::new()
                }
            };
            let retire = self.registry.retired_held_by(id);
            if adopt.is_empty() && retire.is_empty() {
                continue;
            }

            let Some(handle) = self.fleet.get(id) else {
                continue;
            };
            match handle.reconfigure(adopt, retire) {
                Some(ack) => pending.push((id, ack)),
                None => tracing::debug!(worker = %id, "Worker gone before reconfigure"),
            }
        }

        let deadline = time::Instant::now() + self.config.reload.drain_timeout();
        for (id, ack) in pending {
            match time::timeout_at(deadline, ack).await {
                Ok(Ok(report)) => self.settle(id, report),
                Ok(Err(_)) => {
                    // Exited mid-drain; its exit event releases everything.
                }
                Err(_) => {
                    tracing::warn!(worker = %id, "Drain timed out, terminating worker");
                    self.fleet.retire(id);
                    if let Some(handle) = self.fleet.get(id) {
                        handle.terminate();
                    }
                }
            }
        }
    }

    fn settle(&mut self, worker: WorkerId, report: DrainReport) {
        let released: BTreeSet<&ListenAddress> =
            report.released.iter().chain(report.failed.iter()).collect();
        for address in released {
            self.registry.release(address, worker);
        }
        if report.cut_connections > 0 {
            tracing::warn!(
                worker = %worker,
                cut = report.cut_connections,
                "Connections cut after drain grace"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HttpdConfig, ListenerConfig};
    use crate::coordination::{NotificationChannel, ReloadSemaphore};
    use crate::handlers::{HandlerRow, SnapshotPublisher};
    use crate::host::{ConstantExecutor, HandlerStore, MemoryHost, StoreError};
    use crate::net::SocketRegistry;
    use crate::supervisor::SupervisorDeps;
    use std::sync::Arc;

    struct FixedStore(Vec<HandlerRow>);

    impl HandlerStore for FixedStore {
        fn load_handlers(&self) -> Result<Vec<HandlerRow>, StoreError> {
            Ok(self.0.clone())
        }
    }

    fn supervisor(workers: i64) -> (Supervisor, Arc<MemoryHost>) {
        let mut config = HttpdConfig::default();
        config.fleet.http_workers = workers;
        config.reload.debounce_ms = 5;
        config.reload.drain_grace_secs = 1;
        config.reload.drain_timeout_secs = 2;

        let semaphore = Arc::new(ReloadSemaphore::anonymous().unwrap());
        let channel = NotificationChannel::configuration_reload();
        let host = Arc::new(MemoryHost::new(channel.clone(), semaphore.clone()));
        let deps = SupervisorDeps {
            store: host.clone(),
            executor: Arc::new(ConstantExecutor),
            channel: channel.subscribe(),
            semaphore,
        };
        let supervisor = Supervisor::new(
            config,
            SocketRegistry::new(ListenerConfig::default()),
            SnapshotPublisher::default(),
            deps,
        );
        (supervisor, host)
    }

    fn row(id: i64, listen: &str) -> HandlerRow {
        HandlerRow::new(id, listen, &["GET"], "/hi", "SELECT 200, NULL, 'hello'")
    }

    #[tokio::test]
    async fn identical_table_is_a_noop() {
        let (mut supervisor, host) = supervisor(1);
        host.insert(row(1, "127.0.0.1:0")).unwrap();
        assert_eq!(supervisor.reload(ReloadEdge::Startup).await, ReloadOutcome::Applied);
        let address: ListenAddress = "127.0.0.1:0".parse().unwrap();
        let generation = supervisor.registry.generation(&address);

        assert_eq!(
            supervisor.reload(ReloadEdge::Notification).await,
            ReloadOutcome::Unchanged
        );
        assert_eq!(supervisor.snapshots.version(), 1);
        assert_eq!(supervisor.registry.generation(&address), generation);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn edges_coalesce_into_one_cycle() {
        let (mut supervisor, host) = supervisor(1);
        host.insert(row(1, "127.0.0.1:0")).unwrap();
        host.insert(row(2, "127.0.0.1:0")).unwrap();

        assert_eq!(supervisor.reload(ReloadEdge::Notification).await, ReloadOutcome::Applied);
        assert_eq!(supervisor.coalesce_edges(), 0);
        assert_eq!(supervisor.reload_cycles, 1);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn retired_address_is_closed_after_drain() {
        let dir = tempfile::tempdir().unwrap();
        let old = format!("unix:{}", dir.path().join("old.sock").display());
        let new = format!("unix:{}", dir.path().join("new.sock").display());
        let (mut supervisor, host) = supervisor(2);

        host.insert(row(1, &old)).unwrap();
        supervisor.reload(ReloadEdge::Startup).await;
        let old_address: ListenAddress = old.parse().unwrap();
        assert_eq!(supervisor.registry.refcount(&old_address), Some(3));

        host.update(row(1, &new)).unwrap();
        assert_eq!(supervisor.reload(ReloadEdge::Notification).await, ReloadOutcome::Applied);

        let new_address: ListenAddress = new.parse().unwrap();
        assert_eq!(supervisor.registry.refcount(&old_address), None);
        assert_eq!(supervisor.registry.refcount(&new_address), Some(3));
        assert!(!dir.path().join("old.sock").exists());

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn failed_bind_is_retried_on_the_next_edge() {
        let dir = tempfile::tempdir().unwrap();
        let socket_dir = dir.path().join("later");
        let listen = format!("unix:{}", socket_dir.join("api.sock").display());
        let (mut supervisor, host) = supervisor(2);
        supervisor.registry.set_config(ListenerConfig {
            bind_attempts: 1,
            ..ListenerConfig::default()
        });

        host.insert(row(1, &listen)).unwrap();
        assert_eq!(supervisor.reload(ReloadEdge::Startup).await, ReloadOutcome::Applied);
        let address: ListenAddress = listen.parse().unwrap();
        assert_eq!(supervisor.registry.refcount(&address), None);

        std::fs::create_dir(&socket_dir).unwrap();
        assert_eq!(
            supervisor.reload(ReloadEdge::Semaphore).await,
            ReloadOutcome::Unchanged
        );
        assert_eq!(supervisor.snapshots.version(), 1);
        assert_eq!(supervisor.registry.refcount(&address), Some(3));
        assert!(socket_dir.join("api.sock").exists());

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_table_keeps_previous_snapshot() {
        let (mut supervisor, host) = supervisor(1);
        host.insert(row(1, "127.0.0.1:0")).unwrap();
        supervisor.reload(ReloadEdge::Startup).await;

        // Bypasses the host's pre-commit check the way a stale row would.
        let bad = HandlerRow::new(2, "not-an-address", &["GET"], "/x", "SELECT 1");
        supervisor.store = Arc::new(FixedStore(vec![row(1, "127.0.0.1:0"), bad]));

        assert_eq!(
            supervisor.reload(ReloadEdge::Notification).await,
            ReloadOutcome::Rejected
        );
        assert_eq!(supervisor.snapshots.version(), 1);

        supervisor.shutdown().await;
    }
}
