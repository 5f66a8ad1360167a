//! Physical memory pools and the per-pool range allocator.

pub mod allocator;
mod range;

pub use allocator::{RangeAllocator, ReclaimCandidate};
pub use range::{GrantedRange, Handle, PoolId, RangeState};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, MutexGuard};

/// One contiguous physical memory region owned by the broker.
///
/// All mutation goes through the per-pool mutex; `tokio::sync::Mutex`
/// grants the lock in FIFO order, which is the per-pool fairness queue the
/// broker relies on, and its guard may be held across the reclaimer's
/// bounded wait. Independent pools never coordinate. The atomic byte
/// counters mirror the allocator so utilization queries skip the lock.
pub struct Pool {
    id: PoolId,
    base_address: u64,
    capacity: u64,
    allocator: Mutex<RangeAllocator>,
    allocated_bytes: AtomicU64,
    reserved_bytes: AtomicU64,
    faulted: AtomicBool,
}

impl Pool {
    pub fn new(id: PoolId, base_address: u64, capacity: u64) -> Self {
        Self {
            id,
            base_address,
            capacity,
            allocator: Mutex::new(RangeAllocator::new(capacity)),
            allocated_bytes: AtomicU64::new(0),
            reserved_bytes: AtomicU64::new(0),
            faulted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Exclusive access to the allocator. Hold this for the whole of any
    /// mutating operation on the pool.
    pub async fn lock(&self) -> MutexGuard<'_, RangeAllocator> {
        self.allocator.lock().await
    }

    /// Refresh the lock-free counters from the allocator. Call after every
    /// mutation, while still holding the pool lock.
    pub fn refresh_counters(&self, alloc: &RangeAllocator) {
        self.allocated_bytes
            .store(alloc.allocated_bytes(), Ordering::Relaxed);
        self.reserved_bytes
            .store(alloc.reserved_bytes(), Ordering::Relaxed);
        crate::metrics::record_pool(self);
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.reserved_bytes.load(Ordering::Relaxed)
    }

    /// The two counters are stored one after the other, so a lock-free
    /// reader racing a Reserved/Allocated transition can briefly see a sum
    /// above capacity. Saturate instead of underflowing.
    pub fn free_bytes(&self) -> u64 {
        self.capacity
            .saturating_sub(self.allocated_bytes())
            .saturating_sub(self.reserved_bytes())
    }

    /// Fraction of the pool that is not Free.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        let used = self.allocated_bytes().saturating_add(self.reserved_bytes());
        (used.min(self.capacity)) as f64 / self.capacity as f64
    }

    /// Latch the pool as faulted after an invariant violation. Operations
    /// on a faulted pool fail; other pools keep serving.
    pub fn fault(&self) {
        self.faulted.store(true, Ordering::SeqCst);
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }
}
