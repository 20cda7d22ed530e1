//! Database-driven HTTP worker fleet.
//!
//! A supervisor owns the listening sockets and a fleet of worker threads.
//! Handlers live in a table on the host; every committed change raises a
//! reload edge, and the supervisor publishes a new immutable handler
//! snapshot that workers pick up without dropping connections.

// Core subsystems
pub mod handlers;
pub mod response;
pub mod supervisor;
pub mod worker;

// Host seams and coordination
pub mod coordination;
pub mod host;
pub mod net;

// Cross-cutting concerns
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::HttpdConfig;
pub use error::{Error, Result};
pub use lifecycle::Shutdown;
pub use supervisor::{FleetStatus, Supervisor, SupervisorDeps};
