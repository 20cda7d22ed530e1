//! Seams to the database host.
//!
//! # Responsibilities
//! - Define what the fleet needs from the host: the handler table
//!   (`HandlerStore`), SQL execution (`QueryExecutor`) and name resolution
//!   (`handlers::Catalog`)
//! - Describe the request as seen by handler SQL (`RequestBinding`)
//! - Provide an in-process reference host used by the binary and tests
//!
//! # Design Decisions
//! - Executors are synchronous and run on the blocking pool; cancellation
//!   is cooperative through `Interrupt`
//! - Handler runtime errors are never retried

pub mod constant;
pub mod datum;
pub mod memory;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::http::Method;
use bytes::Bytes;

use crate::handlers::HandlerRow;
use crate::response::{Headers, ResponseParts};

pub use constant::ConstantExecutor;
pub use datum::Datum;
pub use memory::{HostError, MemoryHost};

/// Errors reading the handler table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("handler table unavailable: {0}")]
    Unavailable(String),
}

/// Source of handler rows for reload cycles.
pub trait HandlerStore: Send + Sync {
    /// Read the whole handler table in one consistent view.
    fn load_handlers(&self) -> Result<Vec<HandlerRow>, StoreError>;
}

/// Errors raised while running handler SQL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("query canceled")]
    Canceled,
    #[error("query failed: {0}")]
    Query(String),
    #[error("unsupported query: {0}")]
    Unsupported(String),
}

/// Runs handler SQL against the host with the request bound.
pub trait QueryExecutor: Send + Sync {
    fn execute(
        &self,
        query: &str,
        request: &RequestBinding,
        interrupt: &Interrupt,
    ) -> Result<ResponseParts, ExecutionError>;
}

/// The `request` row visible to handler SQL.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestBinding {
    pub method: Method,
    pub path: String,
    pub query_string: Option<String>,
    pub body: Bytes,
    /// Request headers in arrival order, all with `append=true`.
    pub headers: Headers,
}

impl RequestBinding {
    /// Column value by `request` column name.
    pub fn column(&self, name: &str) -> Option<Datum> {
        match name {
            "method" => Some(Datum::Text(self.method.as_str().to_string())),
            "path" => Some(Datum::Text(self.path.clone())),
            "query_string" => Some(
                self.query_string
                    .clone()
                    .map(Datum::Text)
                    .unwrap_or(Datum::Null),
            ),
            "body" => Some(Datum::Bytes(self.body.clone())),
            "headers" => Some(Datum::Headers(self.headers.clone())),
            _ => None,
        }
    }
}

/// Cooperative cancellation flag for a running query.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// A guard that triggers the interrupt when dropped unless disarmed.
    pub fn on_drop(&self) -> InterruptOnDrop {
        InterruptOnDrop {
            interrupt: Some(self.clone()),
        }
    }
}

/// Triggers its interrupt when the owning request future is dropped.
#[derive(Debug)]
pub struct InterruptOnDrop {
    interrupt: Option<Interrupt>,
}

impl InterruptOnDrop {
    pub fn disarm(mut self) {
        self.interrupt = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(interrupt) = self.interrupt.take() {
            interrupt.trigger();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_guard_triggers_unless_disarmed() {
        let interrupt = Interrupt::new();
        interrupt.on_drop().disarm();
        assert!(!interrupt.is_triggered());

        drop(interrupt.on_drop());
        assert!(interrupt.is_triggered());
    }

    #[test]
    fn request_columns() {
        let request = RequestBinding {
            method: Method::POST,
            path: "/a".to_string(),
            query_string: None,
            body: Bytes::from_static(b"x"),
            headers: Headers::new(),
        };
        assert_eq!(request.column("method"), Some(Datum::Text("POST".into())));
        assert_eq!(request.column("query_string"), Some(Datum::Null));
        assert_eq!(request.column("nope"), None);
    }
}
