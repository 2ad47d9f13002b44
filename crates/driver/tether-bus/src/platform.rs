//! Injected platform services.
//!
//! The registry never allocates driver memory itself. It asks an
//! [`Allocator`] for an accounting record and hands the matching release to
//! the device's resource scope.

use parking_lot::Mutex;
use thiserror::Error;

/// A granted allocation. Must be handed back to the allocator that issued it.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an allocation must be released"]
pub struct Allocation {
    id: u64,
    bytes: usize,
}

impl Allocation {
    /// Creates an allocation record. For use by [`Allocator`] implementations.
    pub const fn new(id: u64, bytes: usize) -> Self {
        Self { id, bytes }
    }

    /// Allocator-specific identifier.
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Size in bytes.
    pub const fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Allocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The request does not fit in what remains under the limit.
    #[error("allocation of {requested} bytes exceeds the {available} bytes available")]
    LimitExceeded {
        /// Bytes requested.
        requested: usize,
        /// Bytes still available.
        available: usize,
    },
}

/// Memory accounting for driver data.
pub trait Allocator: Send + Sync {
    /// Grants `bytes` bytes.
    fn allocate(&self, bytes: usize) -> Result<Allocation, AllocError>;

    /// Returns a previously granted allocation.
    fn release(&self, allocation: Allocation);
}

#[derive(Debug, Default)]
struct HeapState {
    next_id: u64,
    outstanding: usize,
    live: usize,
    peak: usize,
}

/// Default allocator: accounts outstanding bytes against an optional limit.
#[derive(Debug)]
pub struct HeapAllocator {
    limit: Option<usize>,
    state: Mutex<HeapState>,
}

impl HeapAllocator {
    /// An allocator that never refuses.
    pub fn unlimited() -> Self {
        Self {
            limit: None,
            state: Mutex::new(HeapState::default()),
        }
    }

    /// An allocator that refuses once `limit` bytes are outstanding.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            state: Mutex::new(HeapState::default()),
        }
    }

    /// Bytes granted and not yet released.
    pub fn outstanding_bytes(&self) -> usize {
        self.state.lock().outstanding
    }

    /// Number of allocations not yet released.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().live
    }

    /// Highest number of outstanding bytes seen.
    pub fn peak_bytes(&self) -> usize {
        self.state.lock().peak
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl Allocator for HeapAllocator {
    fn allocate(&self, bytes: usize) -> Result<Allocation, AllocError> {
        let mut state = self.state.lock();
        if let Some(limit) = self.limit {
            let available = limit.saturating_sub(state.outstanding);
            if bytes > available {
                return Err(AllocError::LimitExceeded {
                    requested: bytes,
                    available,
                });
            }
        }
        state.next_id += 1;
        state.outstanding += bytes;
        state.live += 1;
        state.peak = state.peak.max(state.outstanding);
        log::trace!(target: "tether::alloc", "granted {bytes} bytes (#{})", state.next_id);
        Ok(Allocation::new(state.next_id, bytes))
    }

    fn release(&self, allocation: Allocation) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(allocation.bytes);
        state.live = state.live.saturating_sub(1);
        log::trace!(
            target: "tether::alloc",
            "released {} bytes (#{})",
            allocation.bytes,
            allocation.id
        );
    }
}
