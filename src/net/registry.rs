//! Listening socket registry.
//!
//! # Responsibilities
//! - Own one listening socket per address the current snapshot needs
//! - Open missing sockets and retire unwanted ones on reconcile
//! - Hand duplicated descriptors to workers and track who holds them
//! - Close a retired socket once the last holder releases it
//!
//! # Design Decisions
//! - Reference count is holders + 1 while the address is still desired
//! - Retirement is lazy: the registry stops wanting the socket, workers
//!   finish with their copies, the last release closes it
//! - An address that becomes desired again while retired is revived in
//!   place instead of being rebound
//! - Owned exclusively by the supervisor; no internal locking

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::net::SocketAddr;

use socket2::Socket;

use crate::config::ListenerConfig;
use crate::handlers::ListenAddress;
use crate::net::listener::{bind_with_retry, tcp_local_addr, StdListener};
use crate::observability::metrics;
use crate::worker::WorkerId;

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: ListenAddress,
        source: io::Error,
    },
    #[error("failed to duplicate socket for {address}: {source}")]
    Handoff {
        address: ListenAddress,
        source: io::Error,
    },
}

struct SocketEntry {
    socket: Socket,
    local_addr: Option<SocketAddr>,
    holders: BTreeSet<WorkerId>,
    generation: u64,
    retired: bool,
}

impl SocketEntry {
    fn refcount(&self) -> usize {
        self.holders.len() + usize::from(!self.retired)
    }
}

/// A descriptor copy handed to one worker.
#[derive(Debug)]
pub struct HandedOffSocket {
    pub address: ListenAddress,
    pub generation: u64,
    pub listener: StdListener,
}

/// Outcome of a reconcile pass.
#[derive(Debug, Default)]
pub struct Reconciled {
    pub opened: Vec<ListenAddress>,
    pub retired: Vec<ListenAddress>,
    pub failed: Vec<(ListenAddress, SocketError)>,
}

impl Reconciled {
    /// Whether nothing changed.
    pub fn is_noop(&self) -> bool {
        self.opened.is_empty() && self.retired.is_empty() && self.failed.is_empty()
    }
}

/// Sockets owned on behalf of the worker fleet.
pub struct SocketRegistry {
    entries: BTreeMap<ListenAddress, SocketEntry>,
    generation: u64,
    config: ListenerConfig,
}

impl SocketRegistry {
    pub fn new(config: ListenerConfig) -> Self {
        Self {
            entries: BTreeMap::new(),
            generation: 0,
            config,
        }
    }

    /// Apply new listener settings to sockets opened from now on.
    pub fn set_config(&mut self, config: ListenerConfig) {
        self.config = config;
    }

    /// Make the live socket set equal `desired`.
    pub async fn reconcile(&mut self, desired: &BTreeSet<ListenAddress>) -> Reconciled {
        let mut outcome = Reconciled::default();

        let unwanted: Vec<ListenAddress> = self
            .entries
            .iter()
            .filter(|(address, entry)| !entry.retired && !desired.contains(*address))
            .map(|(address, _)| address.clone())
            .collect();
        for address in unwanted {
            if let Some(entry) = self.entries.get_mut(&address) {
                entry.retired = true;
                tracing::info!(address = %address, holders = entry.holders.len(), "Retiring listener");
            }
            self.close_if_unused(&address);
            outcome.retired.push(address);
        }

        for address in desired {
            if let Some(entry) = self.entries.get_mut(address) {
                if entry.retired {
                    entry.retired = false;
                    tracing::info!(address = %address, "Reviving retired listener");
                }
                continue;
            }

            match bind_with_retry(address, &self.config).await {
                Ok(socket) => {
                    self.generation += 1;
                    let local_addr = tcp_local_addr(&socket);
                    self.entries.insert(
                        address.clone(),
                        SocketEntry {
                            socket,
                            local_addr,
                            holders: BTreeSet::new(),
                            generation: self.generation,
                            retired: false,
                        },
                    );
                    outcome.opened.push(address.clone());
                }
                Err(source) => {
                    tracing::error!(address = %address, error = %source, "Failed to bind listener");
                    outcome.failed.push((
                        address.clone(),
                        SocketError::Bind {
                            address: address.clone(),
                            source,
                        },
                    ));
                }
            }
        }

        metrics::record_listeners(self.entries.len());
        outcome
    }

    /// Duplicate every live socket `worker` does not hold yet.
    pub fn handoff_to(&mut self, worker: WorkerId) -> Result<Vec<HandedOffSocket>, SocketError> {
        let mut handed = Vec::new();
        for (address, entry) in &self.entries {
            if entry.retired || entry.holders.contains(&worker) {
                continue;
            }
            let copy = entry.socket.try_clone().map_err(|source| SocketError::Handoff {
                address: address.clone(),
                source,
            })?;
            handed.push(HandedOffSocket {
                address: address.clone(),
                generation: entry.generation,
                listener: StdListener::from_socket(address, copy),
            });
        }

        for socket in &handed {
            if let Some(entry) = self.entries.get_mut(&socket.address) {
                entry.holders.insert(worker);
            }
        }
        if !handed.is_empty() {
            tracing::debug!(worker = %worker, sockets = handed.len(), "Handed off listeners");
        }
        Ok(handed)
    }

    /// `worker` no longer holds `address`.
    pub fn release(&mut self, address: &ListenAddress, worker: WorkerId) {
        if let Some(entry) = self.entries.get_mut(address) {
            entry.holders.remove(&worker);
        }
        self.close_if_unused(address);
    }

    /// Drop every hold `worker` has, e.g. after it exited.
    pub fn release_all(&mut self, worker: WorkerId) {
        let held: Vec<ListenAddress> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.holders.contains(&worker))
            .map(|(address, _)| address.clone())
            .collect();
        for address in held {
            self.release(&address, worker);
        }
    }

    /// Retired addresses `worker` still holds.
    pub fn retired_held_by(&self, worker: WorkerId) -> Vec<ListenAddress> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.retired && entry.holders.contains(&worker))
            .map(|(address, _)| address.clone())
            .collect()
    }

    fn close_if_unused(&mut self, address: &ListenAddress) {
        let unused = self
            .entries
            .get(address)
            .map(|entry| entry.refcount() == 0)
            .unwrap_or(false);
        if unused {
            if let Some(entry) = self.entries.remove(address) {
                close_entry(address, entry);
            }
            metrics::record_listeners(self.entries.len());
        }
    }

    /// Current reference count, `None` once closed.
    pub fn refcount(&self, address: &ListenAddress) -> Option<usize> {
        self.entries.get(address).map(SocketEntry::refcount)
    }

    pub fn is_retired(&self, address: &ListenAddress) -> Option<bool> {
        self.entries.get(address).map(|entry| entry.retired)
    }

    pub fn generation(&self, address: &ListenAddress) -> Option<u64> {
        self.entries.get(address).map(|entry| entry.generation)
    }

    /// The bound TCP address, resolving port 0 binds.
    pub fn local_addr(&self, address: &ListenAddress) -> Option<SocketAddr> {
        self.entries.get(address).and_then(|entry| entry.local_addr)
    }

    /// Addresses still desired.
    pub fn active_addresses(&self) -> BTreeSet<ListenAddress> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.retired)
            .map(|(address, _)| address.clone())
            .collect()
    }

    /// Open sockets, retired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Close everything regardless of holders.
    pub fn close_all(&mut self) {
        for (address, entry) in std::mem::take(&mut self.entries) {
            close_entry(&address, entry);
        }
        metrics::record_listeners(0);
    }
}

impl Drop for SocketRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}

fn close_entry(address: &ListenAddress, entry: SocketEntry) {
    drop(entry.socket);
    if let ListenAddress::Unix(path) = address {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(address = %address, error = %e, "Failed to remove socket file");
            }
        }
    }
    tracing::info!(address = %address, generation = entry.generation, "Listener closed");
}
