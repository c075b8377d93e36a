//! Per-processor magazine cache tier.
//!
//! One slot per processor (threads map onto slots round-robin). Each slot
//! holds two active magazines, one serving allocations and one absorbing
//! frees, plus a local depot of full magazines. The slot mutex stands in for the
//! disabled-preemption window of a kernel per-CPU cache: held for a handful
//! of instructions, effectively uncontended.
//!
//! Lock ordering: a slot lock is always released before the zone lock is
//! taken, never the other way around.

use super::magazine::{Magazine, MagazinePool};
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{Mutex, MutexGuard, PoisonError};

crate::sync::static_atomic! {
    static NEXT_THREAD_ORDINAL: AtomicUsize = AtomicUsize::new(0);
}

/// Stable per-thread ordinal used to spread threads across cache slots.
#[cfg(not(loom))]
fn thread_ordinal() -> usize {
    std::thread_local! {
        static ORDINAL: std::cell::Cell<usize> = const { std::cell::Cell::new(usize::MAX) };
    }
    ORDINAL.with(|cell| {
        let mut ord = cell.get();
        if ord == usize::MAX {
            ord = NEXT_THREAD_ORDINAL.fetch_add(1, Ordering::Relaxed);
            cell.set(ord);
        }
        ord
    })
}

// Under loom every thread shares slot 0; the model explores the slot-lock /
// zone-lock interleavings rather than slot placement.
#[cfg(loom)]
fn thread_ordinal() -> usize {
    0
}

/// Mutable state of one cache slot, behind the slot mutex.
pub(crate) struct SlotState {
    /// Magazine serving allocations.
    pub(crate) alloc: Box<Magazine>,
    /// Magazine absorbing frees.
    pub(crate) free: Box<Magazine>,
    /// Local depot: full magazines only.
    pub(crate) depot: Vec<Box<Magazine>>,
    /// Empty spares awaiting reuse.
    pub(crate) spares: Vec<Box<Magazine>>,
}

/// Empty spares kept per slot before overflowing to the shared pool.
const SPARES_MAX: usize = 2;

impl SlotState {
    pub(crate) fn swap_magazines(&mut self) {
        std::mem::swap(&mut self.alloc, &mut self.free);
    }

    /// Whether `e` currently sits in one of the two active magazines.
    ///
    /// This is the cache tier's immediate double-free check; references that
    /// already left this tier are caught at the bitmap transition instead.
    pub(crate) fn contains(&self, e: super::chunk::ElementRef) -> bool {
        self.alloc.contains(e) || self.free.contains(e)
    }

    pub(crate) fn stash_spare(&mut self, mag: Box<Magazine>, pool: &MagazinePool) {
        debug_assert!(mag.is_empty());
        if self.spares.len() < SPARES_MAX {
            self.spares.push(mag);
        } else {
            pool.free(mag);
        }
    }

    pub(crate) fn take_spare(&mut self, capacity: u16, pool: &MagazinePool) -> Box<Magazine> {
        match self.spares.pop() {
            Some(mag) => mag,
            None => pool.alloc(capacity),
        }
    }

    /// Elements cached in this slot across both magazines and the depot.
    pub(crate) fn cached(&self) -> usize {
        let in_depot: usize = self.depot.iter().map(|m| usize::from(m.len())).sum();
        usize::from(self.alloc.len()) + usize::from(self.free.len()) + in_depot
    }
}

pub(crate) struct CacheSlot {
    pub(crate) state: Mutex<SlotState>,
    /// Local depot target size, in magazines. Grown on zone-lock contention,
    /// shrunk by the working-set sampler when contention subsides. Read and
    /// written racily on purpose: a briefly stale target is harmless.
    pub(crate) depot_target: AtomicUsize,
}

impl CacheSlot {
    pub(crate) fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The per-processor cache tier of one zone.
pub(crate) struct PcpuCache {
    slots: Box<[CacheSlot]>,
}

impl PcpuCache {
    pub(crate) fn new(
        nslots: usize,
        magazine_capacity: u16,
        depot_target: usize,
        pool: &MagazinePool,
    ) -> Self {
        let slots = (0..nslots.max(1))
            .map(|_| CacheSlot {
                state: Mutex::new(SlotState {
                    alloc: pool.alloc(magazine_capacity),
                    free: pool.alloc(magazine_capacity),
                    depot: Vec::new(),
                    spares: Vec::new(),
                }),
                depot_target: AtomicUsize::new(depot_target),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots }
    }

    /// The slot serving the calling thread.
    pub(crate) fn slot(&self) -> &CacheSlot {
        &self.slots[thread_ordinal() % self.slots.len()]
    }

    pub(crate) fn slots(&self) -> &[CacheSlot] {
        &self.slots
    }

    /// Total elements cached across every slot. Slots are sampled one at a
    /// time, so concurrent traffic makes this an approximation.
    pub(crate) fn cached_elements(&self) -> usize {
        self.slots.iter().map(|s| s.lock().cached()).sum()
    }
}
