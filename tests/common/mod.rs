//! Shared utilities for fleet integration tests.

#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use dbhttpd::config::HttpdConfig;
use dbhttpd::coordination::{NotificationChannel, ReloadEdge, ReloadSemaphore};
use dbhttpd::handlers::SnapshotPublisher;
use dbhttpd::host::{ConstantExecutor, MemoryHost, QueryExecutor};
use dbhttpd::net::SocketRegistry;
use dbhttpd::{FleetStatus, Shutdown, Supervisor, SupervisorDeps};

/// A running supervisor plus the handles a test drives it with.
pub struct TestFleet {
    pub host: Arc<MemoryHost>,
    pub status: watch::Receiver<FleetStatus>,
    pub config_tx: mpsc::UnboundedSender<HttpdConfig>,
    pub reload_tx: mpsc::UnboundedSender<ReloadEdge>,
    shutdown: Shutdown,
    task: JoinHandle<()>,
}

/// Defaults with timings short enough for tests.
pub fn quick_config(workers: i64) -> HttpdConfig {
    let mut config = HttpdConfig::default();
    config.fleet.http_workers = workers;
    config.reload.debounce_ms = 10;
    config.reload.semaphore_poll_ms = 50;
    config.reload.drain_grace_secs = 1;
    config.reload.drain_timeout_secs = 2;
    config
}

pub async fn start_fleet(config: HttpdConfig) -> TestFleet {
    start_fleet_with(config, Arc::new(ConstantExecutor)).await
}

pub async fn start_fleet_with(config: HttpdConfig, executor: Arc<dyn QueryExecutor>) -> TestFleet {
    let semaphore = Arc::new(ReloadSemaphore::anonymous().unwrap());
    let channel = NotificationChannel::configuration_reload();
    let host = Arc::new(MemoryHost::new(channel.clone(), semaphore.clone()));
    let deps = SupervisorDeps {
        store: host.clone(),
        executor,
        channel: channel.subscribe(),
        semaphore,
    };

    let (config_tx, config_rx) = mpsc::unbounded_channel();
    let (reload_tx, reload_rx) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new(
        config.clone(),
        SocketRegistry::new(config.listener.clone()),
        SnapshotPublisher::default(),
        deps,
    )
    .with_config_updates(config_rx)
    .with_reload_requests(reload_rx);
    let mut status = supervisor.status();

    let shutdown = Shutdown::new();
    let task = tokio::spawn(supervisor.run(shutdown.subscribe()));

    // Startup cycle done once the first status lands.
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.reload_cycles >= 1))
        .await
        .expect("supervisor did not start")
        .unwrap();

    TestFleet {
        host,
        status,
        config_tx,
        reload_tx,
        shutdown,
        task,
    }
}

impl TestFleet {
    pub async fn wait_for(&mut self, what: &str, predicate: impl FnMut(&FleetStatus) -> bool) -> FleetStatus {
        match tokio::time::timeout(Duration::from_secs(10), self.status.wait_for(predicate)).await {
            Ok(Ok(status)) => status.clone(),
            Ok(Err(_)) => panic!("supervisor stopped while waiting for {what}"),
            Err(_) => panic!("timed out waiting for {what}"),
        }
    }

    pub async fn wait_for_version(&mut self, version: u64) -> FleetStatus {
        self.wait_for("snapshot version", |s| s.snapshot_version >= version).await
    }

    pub async fn wait_for_cycles(&mut self, cycles: u64) -> FleetStatus {
        self.wait_for("reload cycles", |s| s.reload_cycles >= cycles).await
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("supervisor did not stop")
            .unwrap();
    }
}

/// A port that was free a moment ago.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn local(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Client without proxies or pooled connections, so every request connects.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .pool_max_idle_per_host(0)
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}
