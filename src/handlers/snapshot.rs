//! Immutable, versioned handler snapshots and their publication.
//!
//! # Responsibilities
//! - Group compiled handlers by listen address
//! - Order each group by (priority desc, id asc)
//! - Resolve (listen address, method, path) to a handler
//! - Publish new snapshots to workers with a single pointer swap
//!
//! # Design Decisions
//! - Snapshots are never mutated after construction
//! - Readers load the current `Arc` once per request and keep it for the
//!   request's lifetime, so in-flight requests finish on the old version

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::http::Method;

use crate::config::validation::ConfigurationError;
use crate::handlers::model::{Handler, HandlerRow, ListenAddress};

/// An immutable view of the handler table.
#[derive(Debug, Clone, Default)]
pub struct HandlerSnapshot {
    version: u64,
    groups: BTreeMap<ListenAddress, Vec<Handler>>,
}

impl HandlerSnapshot {
    /// The empty snapshot workers start from (version 0).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile rows into a snapshot. Any malformed row rejects the whole set.
    pub fn build(version: u64, rows: &[HandlerRow]) -> Result<Self, Vec<ConfigurationError>> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();
        let mut groups: BTreeMap<ListenAddress, Vec<Handler>> = BTreeMap::new();

        for row in rows {
            if !seen.insert(row.id) {
                errors.push(ConfigurationError::DuplicateHandler(row.id.0));
                continue;
            }
            match Handler::compile(row) {
                Ok(handler) => groups.entry(handler.listen.clone()).or_default().push(handler),
                Err(row_errors) => errors.extend(row_errors),
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        for handlers in groups.values_mut() {
            handlers.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        }

        Ok(Self { version, groups })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Bind addresses this snapshot needs.
    pub fn addresses(&self) -> BTreeSet<ListenAddress> {
        self.groups.keys().cloned().collect()
    }

    /// Handlers for one address, in match order.
    pub fn handlers_for(&self, listen: &ListenAddress) -> &[Handler] {
        self.groups.get(listen).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First handler on `listen` accepting `method` and `path`.
    pub fn resolve(&self, listen: &ListenAddress, method: &Method, path: &str) -> Option<&Handler> {
        self.handlers_for(listen)
            .iter()
            .find(|handler| handler.matches(method, path))
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Whether both snapshots hold the same handlers, ignoring versions.
    pub fn same_handlers(&self, other: &HandlerSnapshot) -> bool {
        self.groups == other.groups
    }
}

/// Shared slot holding the current snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotPublisher {
    current: Arc<ArcSwap<HandlerSnapshot>>,
}

impl SnapshotPublisher {
    pub fn new(initial: HandlerSnapshot) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    /// Current snapshot. Callers hold the returned `Arc` for a whole request.
    pub fn load(&self) -> Arc<HandlerSnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version()
    }

    /// Atomically replace the current snapshot.
    pub fn publish(&self, snapshot: HandlerSnapshot) {
        tracing::debug!(version = snapshot.version(), handlers = snapshot.len(), "Publishing handler snapshot");
        self.current.store(Arc::new(snapshot));
    }
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new(HandlerSnapshot::empty())
    }
}
