//! Chunk growth: reserving address space and populating backing pages.
//!
//! Growth is serialized through two expander slots, one ordinary and one
//! privileged (memory-pressure rescue), so concurrent allocators never race
//! to populate the same chunk. Everyone else sleeps on the expansion condvar
//! and rechecks the free count when woken.
//!
//! Provider calls (reserve/populate/depopulate) are syscalls; the zone lock
//! is dropped around every one of them. The chunk being grown sits off-queue
//! the whole time, so no other path can observe it half-built.

use std::ptr::NonNull;
use std::time::{Duration, Instant};

use super::bitmap::BitmapAllocator;
use super::chunk::{ChunkMeta, QueueId, chunk_ref};
use super::provider::ZoneError;
use super::stats;
use super::zone::{AllocError, AllocFlags, Zone, ZoneCore};
use crate::sync::MutexGuard;
use crate::sync::atomic::Ordering;

impl ZoneCore {
    /// Take a sequestered chunk's slot off the unpopulated queue, if any.
    pub(super) fn take_unpopulated(&mut self) -> Option<u32> {
        let slot = self.queues.head(QueueId::Unpopulated)?;
        self.queues.remove(&mut self.chunks, slot);
        Some(slot)
    }

    /// Record a freshly reserved chunk, reusing a retired slot when possible.
    fn adopt_chunk(&mut self, meta: ChunkMeta) -> u32 {
        match self.free_slots.pop() {
            Some(slot) => {
                debug_assert!(self.chunks[slot as usize].is_none());
                self.chunks[slot as usize] = Some(meta);
                slot
            }
            None => {
                let slot = self.chunks.len() as u32;
                self.chunks.push(Some(meta));
                slot
            }
        }
    }

    /// Make a populated chunk visible to allocations.
    fn commit_chunk(
        &mut self,
        slot: u32,
        populated: u32,
        capacity: u32,
        order: Option<u32>,
        bitmaps: &dyn BitmapAllocator,
    ) -> Result<(), ZoneError> {
        let entropy = self.entropy.next_u64();
        let meta = super::chunk::chunk_mut(&mut self.chunks, slot);
        meta.populated_pages = populated;
        meta.init_occupancy(capacity, order, bitmaps)?;
        meta.scramble_cursor(entropy);
        self.queues.push(&mut self.chunks, QueueId::Empty, slot);
        self.avail_count += capacity;
        self.free_add(capacity);
        Ok(())
    }

    /// Park a chunk's address space back on the unpopulated queue.
    fn sequester_chunk(&mut self, slot: u32) {
        let meta = super::chunk::chunk_mut(&mut self.chunks, slot);
        meta.populated_pages = 0;
        self.queues.push(&mut self.chunks, QueueId::Unpopulated, slot);
    }
}

impl Zone {
    /// Grow the zone by (at most) one chunk, entered and left with the zone
    /// lock held.
    ///
    /// Returns without error when no growth was possible (wired ceiling,
    /// page shortage on an exhaustible zone); the caller judges whether the
    /// resulting free count is a failure.
    pub(crate) fn expand_locked<'a>(
        &'a self,
        mut core: MutexGuard<'a, ZoneCore>,
        flags: AllocFlags,
    ) -> Result<MutexGuard<'a, ZoneCore>, AllocError> {
        loop {
            core.assert_live();
            if core.wired_pages >= self.tuning.wired_max_pages {
                return Ok(core);
            }
            let claimed = if flags.privileged {
                !core.expander.privileged && {
                    core.expander.privileged = true;
                    true
                }
            } else {
                !core.expander.ordinary && {
                    core.expander.ordinary = true;
                    true
                }
            };
            if claimed {
                break;
            }
            if flags.no_wait {
                return Err(AllocError::WouldBlock);
            }
            core.expander.waiters += 1;
            let (guard, timed_out) =
                self.expand_cv.wait_timeout(core, self.tuning.page_wait_timeout);
            core = guard;
            core.expander.waiters -= 1;
            core.assert_live();
            if core.free_count > 0 || !core.recirc.is_empty() {
                // The running grower made progress on our behalf.
                return Ok(core);
            }
            if timed_out {
                if self.flags.exhaustible {
                    return Ok(core);
                }
                panic!(
                    "zone {}: stuck waiting {:?} for the grower (page shortage?)",
                    self.id, self.tuning.page_wait_timeout
                );
            }
        }

        let (mut core, outcome) = self.grow_one_chunk(core, flags);
        if flags.privileged {
            core.expander.privileged = false;
        } else {
            core.expander.ordinary = false;
        }
        if core.expander.waiters > 0 {
            self.expand_cv.notify_all();
        }
        outcome.map(|()| core)
    }

    /// The actual growth: pick address space, populate pages one at a time,
    /// then commit the chunk. Runs with the expander slot claimed.
    fn grow_one_chunk<'a>(
        &'a self,
        mut core: MutexGuard<'a, ZoneCore>,
        flags: AllocFlags,
    ) -> (MutexGuard<'a, ZoneCore>, Result<(), AllocError>) {
        let page_size = self.provider.page_size();
        let chunk_bytes = self.chunk_pages * page_size;

        // Sequestered address space first, fresh reservation second.
        let slot = match core.take_unpopulated() {
            Some(slot) => slot,
            None => {
                drop(core);
                // Safety: fresh reservation of exactly chunk_bytes, released
                // only when the chunk (or the zone) is torn down.
                let base = match unsafe { self.provider.reserve(chunk_bytes) } {
                    Ok(base) => base,
                    Err(err) => {
                        log::error!("zone {}: chunk reservation failed: {err}", self.id);
                        return (self.lock_core(), Ok(()));
                    }
                };
                stats::TOTAL_RESERVED.add(chunk_bytes);
                stats::CHUNKS_LIVE.add(1);
                core = self.lock_core();
                let slot = core.adopt_chunk(ChunkMeta::new(self.id, base, self.chunk_pages as u32));
                self.chunk_slots
                    .store(core.chunks.len() as u32, Ordering::Relaxed);
                slot
            }
        };

        let (base, va_pages) = {
            let meta = chunk_ref(&core.chunks, slot);
            (meta.base, meta.va_pages)
        };
        let deadline = Instant::now() + self.tuning.page_wait_timeout;
        let mut populated = 0u32;
        while populated < va_pages {
            if core.wired_pages >= self.tuning.wired_max_pages {
                break;
            }
            drop(core);
            // Safety: the offset stays inside this chunk's reservation.
            let at = unsafe {
                NonNull::new_unchecked(base.as_ptr().add(populated as usize * page_size))
            };
            // Safety: populating one page of a live reservation.
            let res = unsafe { self.provider.populate(at, page_size) };
            core = self.lock_core();
            match res {
                Ok(()) => {
                    populated += 1;
                    core.wired_pages += 1;
                    if core.wired_pages > core.wired_hwm {
                        core.wired_hwm = core.wired_pages;
                    }
                    stats::TOTAL_POPULATED.add(page_size);
                }
                Err(err) => {
                    if populated >= self.min_grow_pages {
                        // Enough for at least one element; take what we got.
                        log::warn!(
                            "zone {}: short growth, {populated}/{va_pages} pages: {err}",
                            self.id
                        );
                        break;
                    }
                    if flags.no_wait {
                        let core = self.abandon_growth(core, slot, populated, page_size);
                        return (core, Err(AllocError::WouldBlock));
                    }
                    if Instant::now() >= deadline {
                        if self.flags.exhaustible {
                            let core = self.abandon_growth(core, slot, populated, page_size);
                            return (core, Ok(()));
                        }
                        panic!(
                            "zone {}: no backing pages within {:?}: {err}",
                            self.id, self.tuning.page_wait_timeout
                        );
                    }
                    drop(core);
                    if let Some(pressure) = &self.pressure {
                        pressure.relieve();
                    }
                    crate::sync::pause(Duration::from_millis(10));
                    core = self.lock_core();
                }
            }
        }

        let capacity = ((populated as usize * page_size) / self.elem_size) as u32;
        if capacity == 0 {
            let core = self.abandon_growth(core, slot, populated, page_size);
            return (core, Ok(()));
        }
        if let Err(err) = core.commit_chunk(slot, populated, capacity, self.bitmap_order, &*self.bitmaps)
        {
            log::error!("zone {}: occupancy bitmap allocation failed: {err}", self.id);
            let core = self.abandon_growth(core, slot, populated, page_size);
            return (core, Ok(()));
        }
        log::debug!(
            "zone {}: grew by {populated} pages ({capacity} elements, chunk {slot})",
            self.id
        );
        (core, Ok(()))
    }

    /// Undo a failed growth: return populated pages and park the address
    /// space on the unpopulated queue.
    fn abandon_growth<'a>(
        &'a self,
        mut core: MutexGuard<'a, ZoneCore>,
        slot: u32,
        populated: u32,
        page_size: usize,
    ) -> MutexGuard<'a, ZoneCore> {
        if populated > 0 {
            let base = chunk_ref(&core.chunks, slot).base;
            drop(core);
            // Safety: only the pages this growth populated; the chunk is
            // still off-queue and invisible to allocations.
            if let Err(err) =
                unsafe { self.provider.depopulate(base, populated as usize * page_size) }
            {
                log::warn!("zone {}: depopulate during growth undo failed: {err}", self.id);
            }
            core = self.lock_core();
            core.wired_pages -= populated;
            stats::TOTAL_POPULATED.sub(populated as usize * page_size);
        }
        core.sequester_chunk(slot);
        core
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::Arc;
    use crate::sync::atomic::{AtomicU32, Ordering};
    use crate::zone::bitmap::BitmapPool;
    use crate::zone::magazine::MagazinePool;
    use crate::zone::provider::{PageProvider, PlatformProvider};
    use crate::zone::zone::{ZoneConfig, ZoneFlags};

    /// Delegates to the platform but fails `populate` after a page budget.
    struct RationedProvider {
        inner: PlatformProvider,
        pages_left: AtomicU32,
    }

    impl RationedProvider {
        fn new(pages: u32) -> Self {
            Self {
                inner: PlatformProvider,
                pages_left: AtomicU32::new(pages),
            }
        }
    }

    impl PageProvider for RationedProvider {
        unsafe fn reserve(&self, bytes: usize) -> Result<NonNull<u8>, ZoneError> {
            // Safety: forwarded as-is.
            unsafe { self.inner.reserve(bytes) }
        }

        unsafe fn populate(&self, ptr: NonNull<u8>, bytes: usize) -> Result<(), ZoneError> {
            let pages = (bytes / self.inner.page_size()) as u32;
            let left = self.pages_left.load(Ordering::Relaxed);
            if left < pages {
                return Err(ZoneError::PopulateFailed(std::io::Error::new(
                    std::io::ErrorKind::OutOfMemory,
                    "page budget exhausted",
                )));
            }
            self.pages_left.fetch_sub(pages, Ordering::Relaxed);
            // Safety: forwarded as-is.
            unsafe { self.inner.populate(ptr, bytes) }
        }

        unsafe fn depopulate(&self, ptr: NonNull<u8>, bytes: usize) -> Result<(), ZoneError> {
            self.pages_left
                .fetch_add((bytes / self.inner.page_size()) as u32, Ordering::Relaxed);
            // Safety: forwarded as-is.
            unsafe { self.inner.depopulate(ptr, bytes) }
        }

        unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize) -> Result<(), ZoneError> {
            // Safety: forwarded as-is.
            unsafe { self.inner.release(ptr, bytes) }
        }

        fn page_size(&self) -> usize {
            self.inner.page_size()
        }
    }

    fn zone_with_provider(config: ZoneConfig, provider: Arc<dyn PageProvider>) -> Zone {
        Zone::new(
            1,
            config,
            provider,
            Arc::new(BitmapPool::new()),
            Arc::new(MagazinePool::new()),
            None,
        )
        .expect("zone creation failed")
    }

    fn uncached_config(elem_size: usize) -> ZoneConfig {
        let mut flags = ZoneFlags::default();
        flags.no_caching = true;
        ZoneConfig::new(elem_size).chunk_pages(1).flags(flags)
    }

    #[test]
    fn test_first_allocation_grows_one_chunk() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let zone = zone_with_provider(uncached_config(64), Arc::new(PlatformProvider));
        let before = zone.snapshot();
        assert_eq!(before.avail, 0);
        assert_eq!(before.wired_pages, 0);

        let e = zone.allocate(AllocFlags::new()).unwrap();
        let snap = zone.snapshot();
        assert_eq!(snap.avail, zone.elems_per_chunk);
        assert_eq!(snap.free, zone.elems_per_chunk - 1);
        assert_eq!(snap.wired_pages, 1);
        assert_eq!(snap.wired_hwm, 1);
        zone.free(e);
    }

    #[test]
    fn test_exhaustible_zone_reports_exhausted_at_wired_ceiling() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let mut config = uncached_config(512);
        config.flags.exhaustible = true;
        config.flags.expandable = false;
        config.tuning.wired_max_pages = 1;
        let zone = zone_with_provider(config, Arc::new(PlatformProvider));

        let n = zone.elems_per_chunk;
        let mut held = Vec::new();
        for _ in 0..n {
            held.push(zone.allocate(AllocFlags::new()).unwrap());
        }
        assert_eq!(zone.allocate(AllocFlags::new()), Err(AllocError::Exhausted));

        // Freeing one element makes the zone allocatable again.
        zone.free(held.pop().unwrap());
        let e = zone.allocate(AllocFlags::new()).unwrap();
        held.push(e);
        for e in held {
            zone.free(e);
        }
    }

    #[test]
    fn test_short_growth_is_accepted() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let provider = Arc::new(RationedProvider::new(2));
        let page = provider.page_size();
        let mut config = uncached_config(page / 4);
        config.chunk_pages = 4;
        config.flags.exhaustible = true;
        config.tuning.page_wait_timeout = Duration::from_millis(50);
        let zone = zone_with_provider(config, provider);

        let e = zone.allocate(AllocFlags::new()).unwrap();
        let snap = zone.snapshot();
        // Only 2 of 4 pages could be populated: capacity reflects that.
        assert_eq!(snap.wired_pages, 2);
        assert_eq!(snap.avail, 8, "2 pages x 4 elements per page");
        zone.free(e);
    }

    #[test]
    fn test_exhaustible_zone_survives_total_page_shortage() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let provider = Arc::new(RationedProvider::new(0));
        let mut config = uncached_config(64);
        config.flags.exhaustible = true;
        config.tuning.page_wait_timeout = Duration::from_millis(20);
        let zone = zone_with_provider(config, provider);

        assert_eq!(zone.allocate(AllocFlags::new()), Err(AllocError::Exhausted));
        // The undone growth parks its address space for reuse.
        let snap = zone.snapshot();
        assert_eq!(snap.wired_pages, 0);
        assert_eq!(snap.avail, 0);
    }

    #[test]
    fn test_non_blocking_shortage_would_block() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let provider = Arc::new(RationedProvider::new(0));
        let mut config = uncached_config(64);
        config.tuning.page_wait_timeout = Duration::from_millis(20);
        let zone = zone_with_provider(config, provider);

        assert_eq!(
            zone.allocate(AllocFlags::new().non_blocking()),
            Err(AllocError::WouldBlock)
        );
    }

    #[test]
    fn test_growth_reuses_sequestered_va() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let provider = Arc::new(RationedProvider::new(0));
        let mut config = uncached_config(64);
        config.flags.exhaustible = true;
        config.tuning.page_wait_timeout = Duration::from_millis(20);
        let zone = zone_with_provider(config, provider.clone());

        assert_eq!(zone.allocate(AllocFlags::new()), Err(AllocError::Exhausted));

        // Pages appear; the retry must reuse the parked reservation rather
        // than reserving more address space.
        provider.pages_left.store(1, Ordering::Relaxed);
        let e = zone.allocate(AllocFlags::new()).unwrap();
        let core = zone.lock_core();
        assert_eq!(core.chunks.iter().filter(|c| c.is_some()).count(), 1);
        drop(core);
        zone.free(e);
    }
}
