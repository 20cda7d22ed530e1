//! Worker identity and lifecycle state.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Supervisor-assigned worker identity. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Lifecycle of a worker.
///
/// ```text
/// Starting → Armed → Serving ⇄ Draining → Exited
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Thread and runtime are being created.
    Starting = 0,
    /// Listeners adopted, accept loops not yet running.
    Armed = 1,
    Serving = 2,
    /// Finishing in-flight connections on retired listeners or before exit.
    Draining = 3,
    Exited = 4,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => WorkerState::Starting,
            1 => WorkerState::Armed,
            2 => WorkerState::Serving,
            3 => WorkerState::Draining,
            _ => WorkerState::Exited,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Armed => "armed",
            WorkerState::Serving => "serving",
            WorkerState::Draining => "draining",
            WorkerState::Exited => "exited",
        }
    }

    fn can_become(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Starting, Armed)
                | (Armed, Serving)
                | (Serving, Draining)
                | (Draining, Serving)
                | (_, Exited)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State shared between a worker thread and its supervisor handle.
#[derive(Debug, Clone)]
pub struct SharedState(Arc<AtomicU8>);

impl SharedState {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(WorkerState::Starting as u8)))
    }

    pub fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next` if the transition is legal. Returns whether it happened.
    pub fn transition(&self, next: WorkerState) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current == next as u8 {
                return true;
            }
            if !WorkerState::from_u8(current).can_become(next) {
                return false;
            }
            match self.0.compare_exchange(current, next as u8, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
