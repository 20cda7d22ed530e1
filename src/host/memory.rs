//! In-process reference control plane.
//!
//! Owns the handler table and runs the same write protocol a database host
//! would: validate before commit, then notify the reload channel and bump
//! the reload semaphore after commit.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use crate::coordination::{NotificationChannel, ReloadSemaphore};
use crate::handlers::{validate, BuiltinCatalog, Catalog, HandlerId, HandlerRow, ValidationError};
use crate::host::{HandlerStore, StoreError};

/// Rejected control-plane writes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("handler {id}: {source}")]
    Validation {
        id: HandlerId,
        source: ValidationError,
    },
    #[error("handler {0} already exists")]
    DuplicateId(HandlerId),
    #[error("handler {0} does not exist")]
    NotFound(HandlerId),
}

/// Handler table plus reload signalling.
#[derive(Debug)]
pub struct MemoryHost {
    rows: RwLock<BTreeMap<HandlerId, HandlerRow>>,
    catalog: RwLock<BuiltinCatalog>,
    channel: NotificationChannel,
    semaphore: Arc<ReloadSemaphore>,
}

impl MemoryHost {
    pub fn new(channel: NotificationChannel, semaphore: Arc<ReloadSemaphore>) -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            catalog: RwLock::new(BuiltinCatalog::new()),
            channel,
            semaphore,
        }
    }

    pub fn channel(&self) -> &NotificationChannel {
        &self.channel
    }

    pub fn semaphore(&self) -> &Arc<ReloadSemaphore> {
        &self.semaphore
    }

    /// Make a relation resolvable by handler queries.
    pub fn register_relation(&self, name: &str) {
        self.catalog
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_relation(name);
    }

    fn check(&self, row: &HandlerRow) -> Result<(), HostError> {
        validate(&row.query, self).map_err(|source| HostError::Validation { id: row.id, source })
    }

    pub fn insert(&self, row: HandlerRow) -> Result<(), HostError> {
        self.check(&row)?;
        {
            let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
            if rows.contains_key(&row.id) {
                return Err(HostError::DuplicateId(row.id));
            }
            rows.insert(row.id, row);
        }
        self.committed("insert");
        Ok(())
    }

    pub fn update(&self, row: HandlerRow) -> Result<(), HostError> {
        self.check(&row)?;
        {
            let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
            match rows.get_mut(&row.id) {
                Some(existing) => *existing = row,
                None => return Err(HostError::NotFound(row.id)),
            }
        }
        self.committed("update");
        Ok(())
    }

    pub fn delete(&self, id: HandlerId) -> Result<HandlerRow, HostError> {
        let removed = self
            .rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .ok_or(HostError::NotFound(id))?;
        self.committed("delete");
        Ok(removed)
    }

    /// Replace the whole table in one transaction.
    pub fn replace_all(&self, rows: Vec<HandlerRow>) -> Result<(), HostError> {
        let mut seen = HashSet::new();
        for row in &rows {
            self.check(row)?;
            if !seen.insert(row.id) {
                return Err(HostError::DuplicateId(row.id));
            }
        }
        *self.rows.write().unwrap_or_else(PoisonError::into_inner) =
            rows.into_iter().map(|row| (row.id, row)).collect();
        self.committed("replace_all");
        Ok(())
    }

    /// Rows ordered by id.
    pub fn rows(&self) -> Vec<HandlerRow> {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn committed(&self, operation: &'static str) {
        let listeners = self.channel.notify();
        let previous = self.semaphore.bump();
        tracing::debug!(
            operation,
            listeners,
            semaphore = previous.wrapping_add(1),
            "Handler table changed"
        );
    }
}

impl HandlerStore for MemoryHost {
    fn load_handlers(&self) -> Result<Vec<HandlerRow>, StoreError> {
        Ok(self.rows())
    }
}

impl Catalog for MemoryHost {
    fn has_relation(&self, name: &str) -> bool {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .has_relation(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> MemoryHost {
        MemoryHost::new(
            NotificationChannel::configuration_reload(),
            Arc::new(ReloadSemaphore::anonymous().unwrap()),
        )
    }

    fn row(id: i64, query: &str) -> HandlerRow {
        HandlerRow::new(id, "127.0.0.1:8080", &[], "/", query)
    }

    #[tokio::test]
    async fn commits_notify_and_bump() {
        let host = host();
        let mut listener = host.channel().subscribe();

        host.insert(row(1, "SELECT 200")).unwrap();
        assert_eq!(host.semaphore().load(), 1);
        assert_eq!(listener.recv().await, Some(()));

        host.update(row(1, "SELECT 201")).unwrap();
        host.delete(HandlerId(1)).unwrap();
        assert_eq!(host.semaphore().load(), 3);
        assert!(host.load_handlers().unwrap().is_empty());
    }

    #[test]
    fn invalid_queries_are_rejected_before_commit() {
        let host = host();
        let err = host.insert(row(1, "SELECT 1; SELECT 2")).unwrap_err();
        assert!(matches!(
            err,
            HostError::Validation {
                source: ValidationError::NotASingleStatement(2),
                ..
            }
        ));
        assert_eq!(host.semaphore().load(), 0);
        assert!(host.rows().is_empty());
    }

    #[test]
    fn relations_become_resolvable_once_registered() {
        let host = host();
        assert!(host.insert(row(1, "SELECT 200 FROM users")).is_err());
        host.register_relation("users");
        assert!(host.insert(row(1, "SELECT 200 FROM users")).is_ok());
    }

    #[test]
    fn duplicate_and_missing_ids() {
        let host = host();
        host.insert(row(1, "SELECT 1")).unwrap();
        assert_eq!(host.insert(row(1, "SELECT 1")), Err(HostError::DuplicateId(HandlerId(1))));
        assert_eq!(host.update(row(2, "SELECT 1")), Err(HostError::NotFound(HandlerId(2))));
        assert!(matches!(host.delete(HandlerId(2)), Err(HostError::NotFound(_))));
    }

    #[test]
    fn replace_all_is_atomic() {
        let host = host();
        host.insert(row(1, "SELECT 1")).unwrap();

        let err = host.replace_all(vec![row(2, "SELECT 2"), row(3, "SELEC")]);
        assert!(err.is_err());
        assert_eq!(host.rows().len(), 1);

        host.replace_all(vec![row(2, "SELECT 2"), row(3, "SELECT 3")]).unwrap();
        let ids: Vec<i64> = host.rows().iter().map(|r| r.id.0).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(host.semaphore().load(), 2);
    }
}
