//! Shared reload semaphore.
//!
//! A single `AtomicU32` living in a POSIX shared-memory region scoped to one
//! database. Control-plane writers bump it after every committed change to
//! the handler table; the supervisor samples it and treats any difference
//! from the last observed value as a reload request.
//!
//! # Design Decisions
//! - The counter wraps; only inequality between samples is meaningful
//! - The region is created zero-filled by `ftruncate` and reopened as-is by
//!   later processes
//! - An anonymous shared mapping serves single-process hosts and tests

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, mmap_anonymous, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

const REGION_LEN: usize = std::mem::size_of::<AtomicU32>();

/// Errors creating or mapping the semaphore region.
///
/// Any of these is fatal to the fleet: without the semaphore no reload
/// can be observed reliably.
#[derive(Debug, thiserror::Error)]
pub enum SemaphoreError {
    #[error("failed to open shared memory region {name}: {source}")]
    Open { name: String, source: nix::Error },
    #[error("failed to size shared memory region {name}: {source}")]
    Size { name: String, source: nix::Error },
    #[error("failed to map shared memory region: {0}")]
    Map(nix::Error),
}

struct SharedRegion {
    ptr: NonNull<c_void>,
    len: usize,
}

// The mapping is only accessed through `AtomicU32`.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` come from a successful mmap and are unmapped once.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            tracing::warn!(error = %e, "Failed to unmap reload semaphore");
        }
    }
}

/// The shared reload counter.
pub struct ReloadSemaphore {
    region: SharedRegion,
}

impl ReloadSemaphore {
    /// Open (creating if needed) the semaphore for `database`.
    pub fn open(database: &str) -> Result<Self, SemaphoreError> {
        let name = region_name(database);
        let fd = shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|source| SemaphoreError::Open {
            name: name.clone(),
            source,
        })?;

        // A fresh object has length 0; extending zero-fills it.
        ftruncate(&fd, REGION_LEN as i64).map_err(|source| SemaphoreError::Size {
            name: name.clone(),
            source,
        })?;

        let len = NonZeroUsize::new(REGION_LEN).ok_or(SemaphoreError::Map(nix::Error::EINVAL))?;
        // SAFETY: fresh mapping of a descriptor we own; no existing memory is aliased.
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }
        .map_err(SemaphoreError::Map)?;

        tracing::debug!(region = %name, "Reload semaphore mapped");
        Ok(Self {
            region: SharedRegion { ptr, len: REGION_LEN },
        })
    }

    /// A process-local semaphore backed by an anonymous shared mapping.
    pub fn anonymous() -> Result<Self, SemaphoreError> {
        let len = NonZeroUsize::new(REGION_LEN).ok_or(SemaphoreError::Map(nix::Error::EINVAL))?;
        // SAFETY: fresh anonymous mapping, zero-filled by the kernel.
        let ptr = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(SemaphoreError::Map)?;

        Ok(Self {
            region: SharedRegion { ptr, len: REGION_LEN },
        })
    }

    /// Remove the named region. Mappings already open stay valid.
    pub fn unlink(database: &str) -> Result<(), SemaphoreError> {
        let name = region_name(database);
        shm_unlink(name.as_str()).map_err(|source| SemaphoreError::Open { name, source })
    }

    fn counter(&self) -> &AtomicU32 {
        // SAFETY: the region is page aligned, at least 4 bytes long and lives as
        // long as `self`.
        unsafe { &*(self.region.ptr.as_ptr() as *const AtomicU32) }
    }

    /// Signal a reload. Returns the previous value.
    pub fn bump(&self) -> u32 {
        self.counter().fetch_add(1, Ordering::AcqRel)
    }

    pub fn load(&self) -> u32 {
        self.counter().load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ReloadSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadSemaphore")
            .field("value", &self.load())
            .finish()
    }
}

/// Region name for a database: `/dbhttpd.<database>.reload`.
pub fn region_name(database: &str) -> String {
    let scoped: String = database
        .chars()
        .take(200)
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    format!("/dbhttpd.{scoped}.reload")
}

/// Tracks the last observed semaphore value on behalf of the supervisor.
#[derive(Debug)]
pub struct SemaphoreSampler {
    semaphore: Arc<ReloadSemaphore>,
    last: u32,
}

impl SemaphoreSampler {
    /// Start sampling from the current value, so earlier bumps are not replayed.
    pub fn new(semaphore: Arc<ReloadSemaphore>) -> Self {
        let last = semaphore.load();
        Self { semaphore, last }
    }

    /// Whether the value moved since the previous sample.
    pub fn sample(&mut self) -> bool {
        let current = self.semaphore.load();
        if current != self.last {
            self.last = current;
            true
        } else {
            false
        }
    }
}
