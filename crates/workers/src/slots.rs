// SPDX-License-Identifier: Apache-2.0

//! Per-activity slot pools and the memory-resource state.

use std::sync::atomic::{AtomicU32, Ordering};

bitflags::bitflags! {
    /// Memory pressure flags of a worker. Empty means memory is available.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryResource: u8 {
        /// Physical RAM is low.
        const LOW_RAM = 0b01;
        /// Commit is low.
        const LOW_COMMIT = 0b10;
    }
}

impl MemoryResource {
    /// Whether memory is available (no pressure flag set).
    #[must_use]
    pub const fn is_available(self) -> bool {
        self.is_empty()
    }
}

/// Worker activity kinds, each with an independent slot pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// Cache lookups.
    CacheLookup,
    /// Input materialization.
    MaterializeInput,
    /// Process execution.
    Process,
    /// Post-processing of execution results.
    PostProcess,
    /// IPC call execution.
    Ipc,
}

impl SlotKind {
    /// Every slot kind, in dense index order.
    pub const ALL: [SlotKind; 5] = [
        SlotKind::CacheLookup,
        SlotKind::MaterializeInput,
        SlotKind::Process,
        SlotKind::PostProcess,
        SlotKind::Ipc,
    ];

    /// Dense index of this kind within [`SlotKind::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            SlotKind::CacheLookup => 0,
            SlotKind::MaterializeInput => 1,
            SlotKind::Process => 2,
            SlotKind::PostProcess => 3,
            SlotKind::Ipc => 4,
        }
    }
}

/// A counted slot pool for one activity kind.
///
/// `acquired` never exceeds `total` and never goes below zero; acquisition
/// is a compare-exchange loop so concurrent acquires cannot overshoot.
#[derive(Debug)]
pub struct SlotPool {
    total: AtomicU32,
    acquired: AtomicU32,
}

impl SlotPool {
    /// Creates a pool with `total` slots, none acquired.
    #[must_use]
    pub fn new(total: u32) -> Self {
        Self {
            total: AtomicU32::new(total),
            acquired: AtomicU32::new(0),
        }
    }

    /// Acquires one slot. Returns false when the pool is exhausted.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.acquired.load(Ordering::Acquire);
        loop {
            if current >= self.total.load(Ordering::Acquire) {
                return false;
            }
            match self.acquired.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Releases one slot.
    pub fn release(&self) {
        let previous = self.acquired.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "slot released without acquisition");
    }

    /// Total slots.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.total.load(Ordering::Acquire)
    }

    /// Currently acquired slots.
    #[must_use]
    pub fn acquired(&self) -> u32 {
        self.acquired.load(Ordering::Acquire)
    }

    /// Free slots.
    #[must_use]
    pub fn available(&self) -> u32 {
        self.total().saturating_sub(self.acquired())
    }

    /// Replaces the total, e.g. when a remote worker attaches.
    pub fn set_total(&self, total: u32) {
        self.total.store(total, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn acquire_respects_the_total() {
        let pool = SlotPool::new(2);
        assert!(pool.try_acquire());
        assert!(pool.try_acquire());
        assert!(!pool.try_acquire());
        pool.release();
        assert!(pool.try_acquire());
        assert_eq!(pool.acquired(), 2);
    }

    #[test]
    fn concurrent_acquires_never_overshoot() {
        let pool = Arc::new(SlotPool::new(8));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                let mut acquired = 0u32;
                for _ in 0..64 {
                    if pool.try_acquire() {
                        acquired += 1;
                        std::thread::yield_now();
                        pool.release();
                    }
                }
                acquired
            }));
        }
        for handle in handles {
            let _ = handle.join().expect("thread panicked");
        }
        assert_eq!(pool.acquired(), 0);
        assert_eq!(pool.total(), 8);
    }

    #[test]
    fn memory_resource_availability() {
        assert!(MemoryResource::empty().is_available());
        assert!(!MemoryResource::LOW_RAM.is_available());
        assert!(!(MemoryResource::LOW_RAM | MemoryResource::LOW_COMMIT).is_available());
    }
}
