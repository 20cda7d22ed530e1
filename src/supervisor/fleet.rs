//! Bookkeeping for the live worker set.

use std::collections::BTreeMap;

use crate::worker::{WorkerHandle, WorkerId};

struct Member {
    handle: WorkerHandle,
    /// Asked to shut down; no longer counted toward `http_workers`.
    retiring: bool,
}

/// Workers owned by the supervisor, keyed by id.
#[derive(Default)]
pub struct Fleet {
    members: BTreeMap<WorkerId, Member>,
    next_id: u64,
}

impl Fleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh worker id. Ids are never reused.
    pub fn next_id(&mut self) -> WorkerId {
        self.next_id += 1;
        WorkerId(self.next_id)
    }

    pub fn insert(&mut self, handle: WorkerHandle) {
        self.members.insert(
            handle.id(),
            Member {
                handle,
                retiring: false,
            },
        );
    }

    /// Workers that still count toward the target size.
    pub fn active(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.members
            .values()
            .filter(|member| !member.retiring)
            .map(|member| &member.handle)
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerHandle> {
        self.members.get(&id).map(|member| &member.handle)
    }

    pub fn all(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.members.values().map(|member| &member.handle)
    }

    /// Mark `id` as leaving. Returns whether it was active.
    pub fn retire(&mut self, id: WorkerId) -> bool {
        match self.members.get_mut(&id) {
            Some(member) if !member.retiring => {
                member.retiring = true;
                true
            }
            _ => false,
        }
    }

    /// Newest active worker, the first one to go when trimming.
    pub fn newest_active(&self) -> Option<WorkerId> {
        self.members
            .iter()
            .rev()
            .find(|(_, member)| !member.retiring)
            .map(|(id, _)| *id)
    }

    pub fn remove(&mut self, id: WorkerId) -> Option<WorkerHandle> {
        self.members.remove(&id).map(|member| member.handle)
    }

    pub fn drain(&mut self) -> Vec<WorkerHandle> {
        std::mem::take(&mut self.members)
            .into_values()
            .map(|member| member.handle)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerConfig;
    use crate::handlers::SnapshotPublisher;
    use crate::host::ConstantExecutor;
    use crate::worker::{spawn_worker, WorkerContext};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn spawn(fleet: &mut Fleet, events: &mpsc::UnboundedSender<crate::worker::WorkerExit>) -> WorkerId {
        let id = fleet.next_id();
        let context = WorkerContext {
            snapshots: SnapshotPublisher::default(),
            executor: Arc::new(ConstantExecutor),
            listener: ListenerConfig::default(),
            drain_grace: Duration::from_millis(100),
            events: events.clone(),
        };
        fleet.insert(spawn_worker(id, context, Vec::new()).unwrap());
        id
    }

    #[test]
    fn retiring_workers_stop_counting() {
        let (events, _exits) = mpsc::unbounded_channel();
        let mut fleet = Fleet::new();
        let first = spawn(&mut fleet, &events);
        let second = spawn(&mut fleet, &events);
        assert_eq!(fleet.active_count(), 2);
        assert_eq!(fleet.newest_active(), Some(second));

        assert!(fleet.retire(second));
        assert!(!fleet.retire(second));
        assert_eq!(fleet.active_count(), 1);
        assert_eq!(fleet.len(), 2);
        assert_eq!(fleet.newest_active(), Some(first));

        for handle in fleet.drain() {
            handle.terminate();
            handle.join();
        }
        assert!(fleet.is_empty());
    }

    #[test]
    fn ids_are_never_reused() {
        let mut fleet = Fleet::new();
        let a = fleet.next_id();
        let b = fleet.next_id();
        assert_ne!(a, b);
    }
}
