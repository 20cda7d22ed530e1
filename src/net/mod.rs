//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! snapshot addresses
//!     → registry.rs (reconcile: open missing, retire unwanted)
//!     → listener.rs (socket2 bind with reuseport, retry on transient errors)
//!     → registry.rs handoff_to(worker) (dup per worker)
//!     → worker accept loops
//!     → connection.rs (per-listener connection tracking for drain)
//!
//! Socket States:
//!     Live → Retired (no longer desired) → Closed (last holder released)
//! ```

pub mod connection;
pub mod listener;
pub mod registry;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::StdListener;
pub use registry::{HandedOffSocket, Reconciled, SocketError, SocketRegistry};
