//! HTTP worker fleet members.
//!
//! # Data Flow
//! ```text
//! spawn_worker (process.rs)
//!     → own OS thread + current-thread tokio runtime
//!     → accept loops on handed-off sockets
//!     → hyper-util auto connection per client
//!     → dispatch.rs (snapshot lookup, query, response)
//! ```
//!
//! # Design Decisions
//! - A worker failure is contained to its thread; the supervisor respawns
//! - Workers never read the handler table; they only see published snapshots

pub mod dispatch;
pub mod process;
pub mod state;

pub use process::{
    spawn_worker, DrainReport, ExitReason, WorkerCommand, WorkerContext, WorkerExit, WorkerHandle,
};
pub use state::{WorkerId, WorkerState};
