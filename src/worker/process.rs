//! Worker threads.
//!
//! # Responsibilities
//! - Run one single-threaded tokio runtime per worker on its own OS thread
//! - Accept on every handed-off listener and serve HTTP/1.1 and HTTP/2
//! - Adopt new listeners and drain retired ones on reconfigure
//! - Report the exit reason to the supervisor, including panics
//!
//! # Data Flow
//! ```text
//! supervisor ──WorkerCommand──▶ worker loop ──▶ accept loop (per listener)
//!                                                  └─▶ connection task
//!                                                        └─▶ dispatch.rs
//! worker thread ends ──WorkerExit──▶ supervisor
//! ```
//!
//! # Design Decisions
//! - Each listener has its own phase channel so retiring one address
//!   never disturbs connections on another
//! - Draining stops accepting, lets connections finish their in-flight
//!   requests, and cuts whatever is left when the grace period ends

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use axum::Router;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tower::Service;

use crate::config::ListenerConfig;
use crate::handlers::{ListenAddress, SnapshotPublisher};
use crate::host::QueryExecutor;
use crate::net::{ConnectionGuard, ConnectionTracker, HandedOffSocket, StdListener};
use crate::worker::dispatch::{build_router, DispatchState};
use crate::worker::state::{SharedState, WorkerId, WorkerState};

/// Instructions from the supervisor.
#[derive(Debug)]
pub enum WorkerCommand {
    /// Start serving `adopt`, drain and release `retire`, then acknowledge.
    Reconfigure {
        adopt: Vec<HandedOffSocket>,
        retire: Vec<ListenAddress>,
        ack: oneshot::Sender<DrainReport>,
    },
    /// Drain every listener and exit.
    Shutdown,
}

/// Outcome of a reconfigure, sent back as the acknowledgement.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub adopted: Vec<ListenAddress>,
    /// Sockets handed over that could not be registered with the runtime.
    pub failed: Vec<ListenAddress>,
    pub released: Vec<ListenAddress>,
    /// Connections still open when the grace period ended.
    pub cut_connections: u64,
}

/// Why a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Shutdown,
    Terminated,
    Panicked(String),
    Failed(String),
}

impl ExitReason {
    pub fn label(&self) -> &'static str {
        match self {
            ExitReason::Shutdown => "shutdown",
            ExitReason::Terminated => "terminated",
            ExitReason::Panicked(_) => "panicked",
            ExitReason::Failed(_) => "failed",
        }
    }

    /// Whether the supervisor asked for this exit.
    pub fn is_requested(&self) -> bool {
        matches!(self, ExitReason::Shutdown | ExitReason::Terminated)
    }
}

/// Exit notification delivered to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub worker: WorkerId,
    pub reason: ExitReason,
}

/// Shared inputs for every worker the supervisor spawns.
#[derive(Clone)]
pub struct WorkerContext {
    pub snapshots: SnapshotPublisher,
    pub executor: Arc<dyn QueryExecutor>,
    pub listener: ListenerConfig,
    pub drain_grace: Duration,
    pub events: mpsc::UnboundedSender<WorkerExit>,
}

/// Supervisor-side handle to a worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    terminate: watch::Sender<bool>,
    state: SharedState,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    /// Send a reconfigure. `None` if the worker is already gone.
    pub fn reconfigure(
        &self,
        adopt: Vec<HandedOffSocket>,
        retire: Vec<ListenAddress>,
    ) -> Option<oneshot::Receiver<DrainReport>> {
        let (ack, rx) = oneshot::channel();
        self.commands
            .send(WorkerCommand::Reconfigure { adopt, retire, ack })
            .ok()
            .map(|_| rx)
    }

    /// Ask for a graceful exit.
    pub fn shutdown(&self) {
        let _ = self.commands.send(WorkerCommand::Shutdown);
    }

    /// Force an exit: stop accepting and drop connections immediately.
    pub fn terminate(&self) {
        let _ = self.terminate.send(true);
    }

    /// Wait for the thread to finish. Blocks; call from a blocking context.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Start a worker thread serving `sockets`.
pub fn spawn_worker(
    id: WorkerId,
    context: WorkerContext,
    sockets: Vec<HandedOffSocket>,
) -> io::Result<WorkerHandle> {
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let (terminate, terminate_rx) = watch::channel(false);
    let state = SharedState::new();

    let thread_state = state.clone();
    let thread = thread::Builder::new()
        .name(format!("dbhttpd-{id}"))
        .spawn(move || run_thread(id, context, sockets, commands_rx, terminate_rx, thread_state))?;

    Ok(WorkerHandle {
        id,
        commands,
        terminate,
        state,
        thread: Some(thread),
    })
}

/// Reports the exit when the thread ends, however it ends.
struct ExitGuard {
    id: WorkerId,
    events: mpsc::UnboundedSender<WorkerExit>,
    state: SharedState,
    reason: Option<ExitReason>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let reason = self.reason.take().unwrap_or_else(|| {
            if thread::panicking() {
                ExitReason::Panicked("worker thread panicked".to_string())
            } else {
                ExitReason::Failed("worker exited without a reason".to_string())
            }
        });
        self.state.transition(WorkerState::Exited);
        tracing::info!(worker = %self.id, reason = reason.label(), "Worker exited");
        let _ = self.events.send(WorkerExit {
            worker: self.id,
            reason,
        });
    }
}

fn run_thread(
    id: WorkerId,
    context: WorkerContext,
    sockets: Vec<HandedOffSocket>,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    terminate: watch::Receiver<bool>,
    state: SharedState,
) {
    let mut guard = ExitGuard {
        id,
        events: context.events.clone(),
        state: state.clone(),
        reason: None,
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            guard.reason = Some(ExitReason::Failed(format!("runtime: {e}")));
            return;
        }
    };

    let worker = Worker::new(id, context, state);
    let reason = runtime.block_on(worker.run(sockets, commands, terminate));
    // Queries stuck on the blocking pool were interrupted; do not wait on them.
    runtime.shutdown_background();
    guard.reason = Some(reason);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerPhase {
    Serving,
    Draining,
    Closed,
}

struct ListenerTask {
    generation: u64,
    phase: watch::Sender<ListenerPhase>,
    tracker: ConnectionTracker,
    accept: tokio::task::JoinHandle<()>,
}

struct Worker {
    id: WorkerId,
    context: WorkerContext,
    state: SharedState,
    listeners: BTreeMap<ListenAddress, ListenerTask>,
    fatal_tx: mpsc::UnboundedSender<String>,
    fatal_rx: mpsc::UnboundedReceiver<String>,
}

/// Result of waiting for connections to finish.
struct Drained {
    cut: u64,
    terminated: bool,
}

impl Worker {
    fn new(id: WorkerId, context: WorkerContext, state: SharedState) -> Self {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        Self {
            id,
            context,
            state,
            listeners: BTreeMap::new(),
            fatal_tx,
            fatal_rx,
        }
    }

    async fn run(
        mut self,
        sockets: Vec<HandedOffSocket>,
        mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
        mut terminate: watch::Receiver<bool>,
    ) -> ExitReason {
        let mut failed = 0;
        for socket in sockets {
            if self.adopt(socket).is_err() {
                failed += 1;
            }
        }
        self.state.transition(WorkerState::Armed);
        self.state.transition(WorkerState::Serving);
        tracing::info!(
            worker = %self.id,
            listeners = self.listeners.len(),
            failed,
            "Worker serving"
        );

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(WorkerCommand::Reconfigure { adopt, retire, ack }) => {
                        let (report, terminated) = self.reconfigure(adopt, retire, &mut terminate).await;
                        let _ = ack.send(report);
                        if terminated {
                            self.close_all().await;
                            return ExitReason::Terminated;
                        }
                    }
                    Some(WorkerCommand::Shutdown) | None => {
                        let addresses: Vec<ListenAddress> = self.listeners.keys().cloned().collect();
                        self.state.transition(WorkerState::Draining);
                        let drained = self.drain(&addresses, &mut terminate).await;
                        return if drained.terminated {
                            ExitReason::Terminated
                        } else {
                            ExitReason::Shutdown
                        };
                    }
                },
                changed = terminate.changed() => {
                    if changed.is_err() || *terminate.borrow() {
                        self.close_all().await;
                        return ExitReason::Terminated;
                    }
                }
                Some(message) = self.fatal_rx.recv() => {
                    // Let in-flight responses, including the failed one, go out first.
                    let addresses: Vec<ListenAddress> = self.listeners.keys().cloned().collect();
                    self.state.transition(WorkerState::Draining);
                    self.drain(&addresses, &mut terminate).await;
                    return ExitReason::Panicked(message);
                }
            }
        }
    }

    fn adopt(&mut self, socket: HandedOffSocket) -> io::Result<()> {
        let HandedOffSocket {
            address,
            generation,
            listener,
        } = socket;

        if let Some(existing) = self.listeners.get(&address) {
            if existing.generation == generation {
                return Ok(());
            }
        }

        let listener = match AsyncListener::from_std(listener) {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(worker = %self.id, address = %address, error = %e, "Failed to adopt listener");
                return Err(e);
            }
        };

        let state = DispatchState {
            worker: self.id,
            listen: address.clone(),
            snapshots: self.context.snapshots.clone(),
            executor: self.context.executor.clone(),
            max_body_size: self.context.listener.max_body_size,
            fatal: self.fatal_tx.clone(),
        };
        let app = build_router(state, self.context.listener.request_timeout());
        let (phase, phase_rx) = watch::channel(ListenerPhase::Serving);
        let tracker = ConnectionTracker::new();
        let accept = tokio::spawn(accept_loop(
            self.id,
            address.clone(),
            listener,
            app,
            tracker.clone(),
            phase_rx,
        ));

        tracing::debug!(worker = %self.id, address = %address, generation, "Listener adopted");
        if let Some(previous) = self.listeners.insert(
            address,
            ListenerTask {
                generation,
                phase,
                tracker,
                accept,
            },
        ) {
            let _ = previous.phase.send(ListenerPhase::Closed);
        }
        Ok(())
    }

    async fn reconfigure(
        &mut self,
        adopt: Vec<HandedOffSocket>,
        retire: Vec<ListenAddress>,
        terminate: &mut watch::Receiver<bool>,
    ) -> (DrainReport, bool) {
        let mut report = DrainReport::default();
        for socket in adopt {
            let address = socket.address.clone();
            match self.adopt(socket) {
                Ok(()) => report.adopted.push(address),
                Err(_) => report.failed.push(address),
            }
        }

        let retire: Vec<ListenAddress> = retire
            .into_iter()
            .filter(|address| self.listeners.contains_key(address))
            .collect();
        if retire.is_empty() {
            return (report, false);
        }

        self.state.transition(WorkerState::Draining);
        let drained = self.drain(&retire, terminate).await;
        self.state.transition(WorkerState::Serving);

        tracing::info!(
            worker = %self.id,
            released = retire.len(),
            cut = drained.cut,
            "Retired listeners drained"
        );
        report.released = retire;
        report.cut_connections = drained.cut;
        (report, drained.terminated)
    }

    /// Stop accepting on `addresses`, wait out the grace period, then close them.
    async fn drain(
        &mut self,
        addresses: &[ListenAddress],
        terminate: &mut watch::Receiver<bool>,
    ) -> Drained {
        let tasks: Vec<ListenerTask> = addresses
            .iter()
            .filter_map(|address| self.listeners.remove(address))
            .collect();

        for task in &tasks {
            let _ = task.phase.send(ListenerPhase::Draining);
        }

        let mut idle = JoinSet::new();
        for task in &tasks {
            let tracker = task.tracker.clone();
            idle.spawn(async move { tracker.wait_idle().await });
        }

        let mut terminated = false;
        let grace = tokio::time::sleep(self.context.drain_grace);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                joined = idle.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
                _ = &mut grace => break,
                changed = terminate.changed() => {
                    if changed.is_err() || *terminate.borrow() {
                        terminated = true;
                        break;
                    }
                }
            }
        }
        idle.abort_all();

        let cut = tasks.iter().map(|task| task.tracker.active_count()).sum();
        for task in tasks {
            let _ = task.phase.send(ListenerPhase::Closed);
            let _ = task.accept.await;
        }
        Drained { cut, terminated }
    }

    async fn close_all(&mut self) {
        for (_, task) in std::mem::take(&mut self.listeners) {
            let _ = task.phase.send(ListenerPhase::Closed);
            let _ = task.accept.await;
        }
    }
}

enum AsyncListener {
    Tcp(tokio::net::TcpListener),
    Unix(tokio::net::UnixListener),
}

impl AsyncListener {
    fn from_std(listener: StdListener) -> io::Result<Self> {
        Ok(match listener {
            StdListener::Tcp(listener) => {
                listener.set_nonblocking(true)?;
                AsyncListener::Tcp(tokio::net::TcpListener::from_std(listener)?)
            }
            StdListener::Unix(listener) => {
                listener.set_nonblocking(true)?;
                AsyncListener::Unix(tokio::net::UnixListener::from_std(listener)?)
            }
        })
    }
}

async fn accept_loop(
    worker: WorkerId,
    address: ListenAddress,
    listener: AsyncListener,
    app: Router,
    tracker: ConnectionTracker,
    mut phase: watch::Receiver<ListenerPhase>,
) {
    loop {
        tokio::select! {
            biased;
            changed = phase.changed() => {
                if changed.is_err() || *phase.borrow() != ListenerPhase::Serving {
                    break;
                }
            }
            accepted = accept(&listener) => match accepted {
                Ok(Accepted::Tcp(stream)) => {
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(serve_connection(stream, app.clone(), phase.clone(), tracker.track()));
                }
                Ok(Accepted::Unix(stream)) => {
                    tokio::spawn(serve_connection(stream, app.clone(), phase.clone(), tracker.track()));
                }
                Err(e) => {
                    tracing::warn!(worker = %worker, address = %address, error = %e, "Accept failed");
                    // EMFILE and friends: back off instead of spinning.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    tracing::debug!(worker = %worker, address = %address, "Stopped accepting");
}

enum Accepted {
    Tcp(tokio::net::TcpStream),
    Unix(tokio::net::UnixStream),
}

async fn accept(listener: &AsyncListener) -> io::Result<Accepted> {
    match listener {
        AsyncListener::Tcp(listener) => listener.accept().await.map(|(s, _)| Accepted::Tcp(s)),
        AsyncListener::Unix(listener) => listener.accept().await.map(|(s, _)| Accepted::Unix(s)),
    }
}

async fn serve_connection<I>(
    io: I,
    app: Router,
    mut phase: watch::Receiver<ListenerPhase>,
    guard: ConnectionGuard,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |request: Request<Incoming>| {
        app.clone().call(request)
    });
    let builder = auto::Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(connection);

    let mut draining = false;
    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(connection_id = %guard.id(), error = %e, "Connection error");
                }
                break;
            }
            changed = phase.changed() => {
                let next = if changed.is_err() { ListenerPhase::Closed } else { *phase.borrow() };
                match next {
                    ListenerPhase::Draining if !draining => {
                        draining = true;
                        connection.as_mut().graceful_shutdown();
                    }
                    ListenerPhase::Closed => {
                        tracing::debug!(connection_id = %guard.id(), "Connection cut");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
    drop(guard);
}
