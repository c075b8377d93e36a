//! Reclaim: returning cached elements to chunks and chunk pages to the
//! system.
//!
//! Three strengths. Trim keeps the working set and releases the slack above
//! it. Drain flushes every tier, including the per-processor caches, and
//! releases everything free. Destroy is a drain that then tears the zone
//! down; outstanding allocations at that point are fatal.
//!
//! Reclaim competes with regular traffic, so it works in batches and drops
//! the zone lock between them.

use super::bitmap::BitmapAllocator;
use super::chunk::{QueueId, chunk_mut, chunk_ref};
use super::provider::ZoneError;
use super::stats;
use super::zone::{Zone, ZoneCore};
use crate::sync::atomic::Ordering;
use crate::sync::thread;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ReclaimMode {
    Trim,
    Drain,
    Destroy,
}

impl ZoneCore {
    /// Detach a fully free chunk and strip its occupancy bitmap, adjusting
    /// element accounting. Returns what the caller needs to give the pages
    /// back.
    fn detach_empty(
        &mut self,
        slot: u32,
        bitmaps: &dyn BitmapAllocator,
    ) -> (std::ptr::NonNull<u8>, u32, u32) {
        self.queues.remove(&mut self.chunks, slot);
        let meta = chunk_mut(&mut self.chunks, slot);
        debug_assert_eq!(meta.bytes_used, 0);
        if meta.free_bits() != meta.capacity {
            panic!(
                "zone accounting: empty chunk {slot} has {}/{} free bits",
                meta.free_bits(),
                meta.capacity
            );
        }
        let capacity = meta.capacity;
        let populated = meta.populated_pages;
        let base = meta.base;
        meta.retire_occupancy(bitmaps);
        meta.populated_pages = 0;
        self.free_sub(capacity);
        self.avail_count -= capacity;
        self.wired_pages -= populated;
        (base, populated, capacity)
    }

    /// Drop a chunk's slot entirely (after its reservation is released).
    fn forget_chunk(&mut self, slot: u32) {
        self.chunks[slot as usize] = None;
        self.free_slots.push(slot);
    }
}

impl Zone {
    /// Release free memory above the working set.
    pub fn trim(&self) {
        self.reclaim(ReclaimMode::Trim);
    }

    /// Flush every cache tier and release all free memory.
    pub fn drain(&self) {
        self.reclaim(ReclaimMode::Drain);
    }

    /// Tear the zone down. The caller must have quiesced all users first;
    /// outstanding allocations are fatal.
    pub(crate) fn destroy(&self) -> Result<(), ZoneError> {
        if !self.flags.destructible {
            return Err(ZoneError::NotDestructible);
        }
        self.reclaim(ReclaimMode::Destroy);
        Ok(())
    }

    pub(crate) fn reclaim(&self, mode: ReclaimMode) {
        if mode == ReclaimMode::Trim {
            self.shrink_cache_depots();
        } else {
            self.flush_cache_tier();
        }
        self.drain_recirc(mode);
        self.release_empty_chunks(mode);
        if mode == ReclaimMode::Destroy {
            self.teardown();
        }
    }

    /// Trim's cache-tier step: full magazines above each slot's depot target
    /// spill into the recirculation depot. Active magazines stay put; trim
    /// never takes elements a processor is actively cycling.
    fn shrink_cache_depots(&self) {
        let Some(cache) = self.cache.get() else {
            return;
        };
        for slot in cache.slots() {
            let mut st = slot.lock();
            let target = slot.depot_target.load(Ordering::Relaxed);
            if st.depot.len() <= target {
                continue;
            }
            let excess: Vec<_> = st.depot.drain(target..).collect();
            drop(st);

            let mut core = self.lock_core_contended(Some(slot));
            core.assert_live();
            let mut parked = 0u32;
            for mag in &excess {
                for &e in mag.entries() {
                    core.park_element(self.id, e);
                    parked += 1;
                }
            }
            core.recirc.extend(excess);
            core.free_add(parked);
        }
    }

    /// Move every element out of the per-processor caches back to the chunk
    /// bitmaps. Magazines go back to the shared pool.
    fn flush_cache_tier(&self) {
        let Some(cache) = self.cache.get() else {
            return;
        };
        for slot in cache.slots() {
            let mut st = slot.lock();
            let cap = self.tuning.magazine_capacity;
            let mut mags: Vec<_> = st.depot.drain(..).collect();
            mags.push(std::mem::replace(&mut st.alloc, self.magpool.alloc(cap)));
            mags.push(std::mem::replace(&mut st.free, self.magpool.alloc(cap)));
            drop(st);

            let mut core = self.lock_core_contended(Some(slot));
            for mag in &mut mags {
                for &e in mag.entries() {
                    core.drop_element(self.id, self.elem_size, e, false);
                    core.free_add(1);
                }
                mag.clear();
            }
            drop(core);
            for mag in mags {
                self.magpool.free(mag);
            }
        }
    }

    /// Drain magazines out of the recirculation depot, returning their
    /// elements to chunk bitmaps. For trim, keeps roughly a working set's
    /// worth of magazines parked.
    fn drain_recirc(&self, mode: ReclaimMode) {
        let cap = u32::from(self.tuning.magazine_capacity);
        let mut core = self.lock_core();
        let keep_mags = match mode {
            ReclaimMode::Trim => (core.free_wss / cap.max(1)) as usize,
            _ => 0,
        };
        let mut drained_since_yield = 0u32;
        while core.recirc.len() > keep_mags {
            let mut mag = match core.recirc.pop() {
                Some(mag) => mag,
                None => break,
            };
            for &e in mag.entries() {
                // Bits are already set for parked elements; this transition
                // only updates bytes-in-use and queue membership.
                core.drop_element(self.id, self.elem_size, e, true);
            }
            mag.clear();
            drained_since_yield += cap;
            if drained_since_yield >= self.tuning.free_batch {
                drained_since_yield = 0;
                drop(core);
                self.magpool.free(mag);
                thread::yield_now();
                core = self.lock_core();
            } else {
                drop(core);
                self.magpool.free(mag);
                core = self.lock_core();
            }
        }
    }

    /// Give the pages of empty chunks back to the provider. Address space is
    /// kept (sequestered) or released per zone policy; destroy always
    /// releases.
    fn release_empty_chunks(&self, mode: ReclaimMode) {
        let page_size = self.provider.page_size();
        let keep_elems = match mode {
            ReclaimMode::Trim => self.tuning.reserve + {
                let core = self.lock_core();
                core.free_wss
            },
            _ => 0,
        };

        let mut core = self.lock_core();
        while let Some(slot) = core.queues.head(QueueId::Empty) {
            if mode == ReclaimMode::Trim {
                let capacity = chunk_ref(&core.chunks, slot).capacity;
                if core.free_count < keep_elems + capacity {
                    break;
                }
            }
            let (base, populated, _capacity) = core.detach_empty(slot, &*self.bitmaps);
            drop(core);
            if populated > 0 {
                // Safety: the chunk is off-queue with zero elements
                // outstanding; nothing can touch these pages.
                if let Err(err) = unsafe {
                    self.provider
                        .depopulate(base, populated as usize * page_size)
                } {
                    log::warn!("zone {}: depopulate failed during reclaim: {err}", self.id);
                }
                stats::TOTAL_POPULATED.sub(populated as usize * page_size);
            }
            core = self.lock_core();

            if self.flags.sequester && mode != ReclaimMode::Destroy {
                core.sequester_slot(slot);
            } else {
                let va_pages = chunk_ref(&core.chunks, slot).va_pages;
                core.forget_chunk(slot);
                drop(core);
                self.release_va(base, va_pages as usize * page_size);
                core = self.lock_core();
            }
        }
    }

    /// Final destroy step: every element must be back; all remaining address
    /// space is released and the zone marked dead.
    fn teardown(&self) {
        let mut core = self.lock_core();
        if core.avail_count != 0 {
            panic!(
                "zone {}: destroyed with {} outstanding allocations",
                self.id,
                core.avail_count - core.free_count
            );
        }
        while let Some(slot) = core.take_unpopulated() {
            let meta = chunk_ref(&core.chunks, slot);
            let (base, bytes) = (meta.base, meta.va_pages as usize * self.provider.page_size());
            core.forget_chunk(slot);
            drop(core);
            self.release_va(base, bytes);
            core = self.lock_core();
        }
        core.destroyed = true;
        debug_assert!(core.chunks.iter().all(Option::is_none));
        log::info!("zone {}: destroyed", self.id);
    }

    fn release_va(&self, base: std::ptr::NonNull<u8>, bytes: usize) {
        // Safety: the reservation is exactly [base, base + bytes) and no
        // element references remain into it.
        if let Err(err) = unsafe { self.provider.release(base, bytes) } {
            log::warn!("zone {}: address space release failed: {err}", self.id);
        }
        stats::TOTAL_RESERVED.sub(bytes);
        stats::CHUNKS_LIVE.sub(1);
    }
}

impl ZoneCore {
    /// Park a retired chunk's reservation on the unpopulated queue.
    fn sequester_slot(&mut self, slot: u32) {
        self.queues.push(&mut self.chunks, QueueId::Unpopulated, slot);
    }
}
