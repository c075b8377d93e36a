//! Zone descriptors and the allocate/free state machines.
//!
//! A zone is a pool dedicated to one fixed element size. Allocation walks the
//! tiers from cheapest to dearest: per-processor magazine, local depot,
//! zone-wide recirculation depot, chunk bitmaps, and finally the chunk grower.
//! Free is the mirror path, feeding magazines before ever touching a bitmap.
//!
//! Locking discipline: per-slot cache locks are always released before the
//! zone lock is acquired, never nested the other way.

use std::num::NonZeroUsize;
use std::ptr::NonNull;

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use thiserror::Error;

use super::bitmap::BitmapAllocator;
use super::cache::{CacheSlot, PcpuCache};
use super::chunk::{ChunkMeta, ChunkQueues, ElementRef, INLINE_BITS, QueueId, chunk_mut, chunk_ref};
use super::magazine::{Magazine, MagazinePool};
use super::provider::{PageProvider, ZoneError};
use super::stats;
use crate::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use crate::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};

/// Allocation failure. Only ever returned for conditions the caller opted
/// into (exhaustible zones, non-blocking mode); everything else is fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    /// The zone reached its configured wired maximum and is exhaustible.
    #[error("zone exhausted")]
    Exhausted,
    /// The caller requested non-blocking mode and progress required waiting.
    #[error("allocation would block")]
    WouldBlock,
}

/// Per-call allocation flags. Blocking is the default.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocFlags {
    pub(crate) no_wait: bool,
    pub(crate) zero: bool,
    pub(crate) privileged: bool,
}

impl AllocFlags {
    pub const fn new() -> Self {
        Self {
            no_wait: false,
            zero: false,
            privileged: false,
        }
    }

    /// Fail fast instead of waiting for the grower or backing pages.
    pub const fn non_blocking(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Zero the element before returning it.
    pub const fn zeroed(mut self) -> Self {
        self.zero = true;
        self
    }

    /// Memory-pressure rescue path: may claim the privileged grower slot.
    pub const fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }
}

/// Zone configuration flags.
#[derive(Clone, Copy, Debug)]
pub struct ZoneFlags {
    /// Elements are per-processor replicas; implies no caching tier.
    pub percpu: bool,
    /// The zone may be destroyed and its slot recycled.
    pub destructible: bool,
    /// Running out of capacity is a normal, reportable failure instead of a
    /// fatal leak indicator.
    pub exhaustible: bool,
    /// The zone may grow its wired footprint without a configured maximum.
    pub expandable: bool,
    /// Start with the per-processor cache tier enabled.
    pub caching_enabled: bool,
    /// Never enable the cache tier, not even automatically.
    pub no_caching: bool,
    /// Keep chunk address ranges reserved forever; reclaim only releases
    /// physical pages.
    pub sequester: bool,
}

impl Default for ZoneFlags {
    fn default() -> Self {
        Self {
            percpu: false,
            destructible: false,
            exhaustible: false,
            expandable: true,
            caching_enabled: false,
            no_caching: false,
            sequester: false,
        }
    }
}

/// Tuning knobs. The defaults are carried-over production heuristics, not
/// correctness requirements; every ratio here is safe to change.
#[derive(Clone, Copy, Debug)]
pub struct ZoneTuning {
    /// Elements per magazine.
    pub magazine_capacity: u16,
    /// On depot overflow/refill, move roughly 1/denom of the depot at once.
    pub recirc_denom: u32,
    /// Trigger defrag when recirc elements exceed wss by this ratio (percent).
    pub defrag_ratio: u32,
    /// Trigger background trim when free slack exceeds wss by this ratio.
    pub autotrim_ratio: u32,
    /// Elements drained per reclaim batch between cooperative yields.
    pub free_batch: u32,
    /// Fixed-point unit for the contention moving average.
    pub contention_unit: u32,
    /// Local depot target floor/ceiling, in magazines.
    pub depot_floor: usize,
    pub depot_ceiling: usize,
    /// Contention average (in units) that auto-enables caching after two
    /// consecutive sample periods.
    pub cache_enable_threshold: u32,
    /// Elements kept back for refill-time headroom; growth triggers when the
    /// free count sinks to this level.
    pub reserve: u32,
    /// Hard limit on wired pages. Must be set for non-expandable zones.
    pub wired_max_pages: u32,
    /// Minimum pages a partially satisfied growth may accept.
    pub min_grow_pages: u32,
    /// Safety valve: prolonged page shortage becomes fatal after this long.
    pub page_wait_timeout: std::time::Duration,
    /// Cache slots (0 = one per available processor).
    pub cache_slots: usize,
}

impl Default for ZoneTuning {
    fn default() -> Self {
        Self {
            magazine_capacity: 8,
            recirc_denom: 3,
            defrag_ratio: 66,
            autotrim_ratio: 20,
            free_batch: 256,
            contention_unit: 256,
            depot_floor: 1,
            depot_ceiling: 16,
            cache_enable_threshold: 10,
            reserve: 0,
            wired_max_pages: u32::MAX,
            min_grow_pages: 1,
            page_wait_timeout: std::time::Duration::from_secs(5),
            cache_slots: 0,
        }
    }
}

/// Pluggable randomness for scan-position scrambling, so tests can force
/// deterministic orderings.
pub trait EntropySource: Send {
    fn next_u64(&mut self) -> u64;
}

impl EntropySource for SmallRng {
    fn next_u64(&mut self) -> u64 {
        RngCore::next_u64(self)
    }
}

/// Zone creation parameters.
pub struct ZoneConfig {
    pub elem_size: usize,
    /// Pages per chunk; 0 picks a geometry that keeps per-chunk element
    /// counts reasonable.
    pub chunk_pages: usize,
    pub flags: ZoneFlags,
    pub tuning: ZoneTuning,
    /// Override the default OS-seeded entropy source.
    pub entropy: Option<Box<dyn EntropySource>>,
}

impl ZoneConfig {
    pub fn new(elem_size: usize) -> Self {
        Self {
            elem_size,
            chunk_pages: 0,
            flags: ZoneFlags::default(),
            tuning: ZoneTuning::default(),
            entropy: None,
        }
    }

    pub fn chunk_pages(mut self, pages: usize) -> Self {
        self.chunk_pages = pages;
        self
    }

    pub fn flags(mut self, flags: ZoneFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn tuning(mut self, tuning: ZoneTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn entropy(mut self, entropy: Box<dyn EntropySource>) -> Self {
        self.entropy = Some(entropy);
        self
    }
}

/// Escalation hook invoked when the grower cannot obtain backing pages:
/// gives the embedder a chance to reclaim memory elsewhere before the
/// grower retries.
pub trait PressureRelief: Send + Sync {
    fn relieve(&self);
}

/// Point-in-time counters for external statistics reporting.
///
/// Assembled from the cache tier and the zone lock in turn, so concurrent
/// traffic can make cross-field sums transiently inconsistent.
#[derive(Clone, Copy, Debug)]
pub struct ZoneSnapshot {
    pub elem_size: usize,
    pub chunk_pages: usize,
    pub elems_per_chunk: u32,
    /// Free elements tracked at the bitmap level (includes recirc-parked).
    pub free: u32,
    /// Total usable elements across populated chunks.
    pub avail: u32,
    /// Elements held in per-processor magazines and local depots.
    pub cached: usize,
    pub recirc_magazines: usize,
    pub wired_pages: u32,
    pub wired_hwm: u32,
    pub free_wss: u32,
    pub contention_wma: u32,
    pub caching_enabled: bool,
}

impl ZoneSnapshot {
    /// Free elements across every tier.
    pub fn free_total(&self) -> u32 {
        self.free + self.cached as u32
    }

    /// Elements currently handed out to callers.
    pub fn live(&self) -> u32 {
        self.avail - self.free_total()
    }
}

pub(crate) struct ExpanderState {
    /// An ordinary-priority grower is running.
    pub(crate) ordinary: bool,
    /// The privileged (memory-pressure rescue) grower slot is taken.
    pub(crate) privileged: bool,
    pub(crate) waiters: u32,
}

/// Zone state behind the zone lock.
pub(crate) struct ZoneCore {
    pub(crate) chunks: Vec<Option<ChunkMeta>>,
    pub(crate) free_slots: Vec<u32>,
    pub(crate) queues: ChunkQueues,
    /// Zone-wide recirculation depot: full magazines whose elements are
    /// marked free in the bitmaps but still administratively parked.
    pub(crate) recirc: Vec<Box<Magazine>>,
    /// Set occupancy bits across all chunks (includes recirc-parked).
    pub(crate) free_count: u32,
    /// Usable elements across populated chunks.
    pub(crate) avail_count: u32,
    pub(crate) wired_pages: u32,
    pub(crate) wired_hwm: u32,
    /// Working-set sampling window.
    pub(crate) free_min: u32,
    pub(crate) free_max: u32,
    pub(crate) free_wss: u32,
    pub(crate) contention_wma: u32,
    pub(crate) cache_enable_streak: u8,
    pub(crate) expander: ExpanderState,
    pub(crate) destroyed: bool,
    pub(crate) entropy: Box<dyn EntropySource>,
}

impl ZoneCore {
    pub(crate) fn assert_live(&self) {
        if self.destroyed {
            panic!("zone used after destroy");
        }
    }

    pub(crate) fn free_add(&mut self, n: u32) {
        self.free_count += n;
        if self.free_count > self.free_max {
            self.free_max = self.free_count;
        }
    }

    pub(crate) fn free_sub(&mut self, n: u32) {
        self.free_count = match self.free_count.checked_sub(n) {
            Some(v) => v,
            None => panic!(
                "zone accounting: free count underflow ({} - {n})",
                self.free_count
            ),
        };
        if self.free_count < self.free_min {
            self.free_min = self.free_count;
        }
    }

    /// Park one element for the recirculation depot: sets its free bit but
    /// leaves bytes-in-use and queue membership alone, so the chunk cannot
    /// go empty while the magazine still references it.
    pub(crate) fn park_element(&mut self, zone_id: u32, e: ElementRef) {
        let meta = chunk_mut(&mut self.chunks, e.chunk());
        if meta.zone_id != zone_id {
            panic!("zone confusion: {e:?} belongs to zone {}", meta.zone_id);
        }
        if !meta.mark_free(e.index()) {
            panic!("double free of {e:?}");
        }
    }

    /// Reclaim one parked element for the cache tier, opposite of
    /// [`park_element`](Self::park_element).
    pub(crate) fn unpark_element(&mut self, zone_id: u32, e: ElementRef) {
        let meta = chunk_mut(&mut self.chunks, e.chunk());
        if meta.zone_id != zone_id {
            panic!("zone confusion: {e:?} belongs to zone {}", meta.zone_id);
        }
        if !meta.mark_used(e.index()) {
            panic!("double allocation of parked element {e:?}");
        }
    }

    /// Return one element to its chunk's bitmap, updating bytes-in-use and
    /// queue membership.
    ///
    /// `from_recirc` flips the expected prior bit state: a recirc drain
    /// expects the bit already set (parked), a direct free expects it clear.
    pub(crate) fn drop_element(
        &mut self,
        zone_id: u32,
        esize: usize,
        e: ElementRef,
        from_recirc: bool,
    ) {
        let slot = e.chunk();
        let meta = chunk_mut(&mut self.chunks, slot);
        if meta.zone_id != zone_id {
            panic!("zone confusion: {e:?} belongs to zone {}", meta.zone_id);
        }
        let was_clear = meta.mark_free(e.index());
        if was_clear == from_recirc {
            if from_recirc {
                panic!("recirc drain: {e:?} was not parked");
            }
            panic!("double free of {e:?}");
        }
        let cap_bytes = meta.capacity as usize * esize;
        let was_full = meta.bytes_used == cap_bytes;
        meta.bytes_used = match meta.bytes_used.checked_sub(esize) {
            Some(v) => v,
            None => panic!("zone accounting: bytes-in-use underflow on chunk {slot}"),
        };
        let now_empty = meta.bytes_used == 0;
        if now_empty {
            self.queues.requeue(&mut self.chunks, slot, QueueId::Empty);
        } else if was_full {
            self.queues.requeue(&mut self.chunks, slot, QueueId::Partial);
        }
    }

    /// Import `n` elements straight from chunk bitmaps, partial chunks first.
    /// The caller adjusts the free count.
    pub(crate) fn import_elements(
        &mut self,
        zone_id: u32,
        esize: usize,
        n: u32,
        out: &mut Vec<ElementRef>,
    ) {
        assert!(
            self.recirc.is_empty(),
            "bitmap import with a non-empty recirculation depot"
        );
        let mut remaining = n;
        while remaining > 0 {
            let slot = match self
                .queues
                .head(QueueId::Partial)
                .or_else(|| self.queues.head(QueueId::Empty))
            {
                Some(slot) => slot,
                None => panic!(
                    "zone accounting: free count {} but no chunk has free elements",
                    self.free_count
                ),
            };
            let meta = chunk_mut(&mut self.chunks, slot);
            debug_assert_eq!(meta.zone_id, zone_id);
            let cap_bytes = meta.capacity as usize * esize;
            while remaining > 0 && meta.bytes_used < cap_bytes {
                match meta.take_free() {
                    Some(idx) => {
                        out.push(ElementRef::new(slot, idx));
                        meta.bytes_used += esize;
                        remaining -= 1;
                    }
                    None => panic!("zone accounting: chunk {slot} bitmap/bytes-in-use mismatch"),
                }
            }
            let now_full = meta.bytes_used == cap_bytes;
            let target = if now_full {
                QueueId::Full
            } else {
                QueueId::Partial
            };
            self.queues.requeue(&mut self.chunks, slot, target);
        }
    }
}

/// A pool dedicated to one fixed element size.
pub struct Zone {
    pub(crate) id: u32,
    pub(crate) elem_size: usize,
    pub(crate) chunk_pages: usize,
    pub(crate) elems_per_chunk: u32,
    /// `None` = inline occupancy words; `Some(order)` = external bitmap.
    pub(crate) bitmap_order: Option<u32>,
    /// Minimum pages a growth must populate to yield at least one element.
    pub(crate) min_grow_pages: u32,
    pub(crate) flags: ZoneFlags,
    pub(crate) tuning: ZoneTuning,
    pub(crate) core: Mutex<ZoneCore>,
    pub(crate) expand_cv: Condvar,
    /// Zone-lock contention tally for the current sample period.
    pub(crate) contention: AtomicU32,
    /// Trim request queued by the working-set sampler, consumed by
    /// [`run_pending_defrag`](Zone::run_pending_defrag).
    pub(crate) defrag_requested: AtomicBool,
    /// Number of chunk slots ever created, mirrored outside the zone lock so
    /// `free` can bounds-check references without taking it. Only grows.
    pub(crate) chunk_slots: AtomicU32,
    pub(crate) cache: OnceLock<PcpuCache>,
    pub(crate) provider: Arc<dyn PageProvider>,
    pub(crate) bitmaps: Arc<dyn BitmapAllocator>,
    pub(crate) magpool: Arc<MagazinePool>,
    pub(crate) pressure: Option<Arc<dyn PressureRelief>>,
}

impl Zone {
    pub(crate) fn new(
        id: u32,
        mut config: ZoneConfig,
        provider: Arc<dyn PageProvider>,
        bitmaps: Arc<dyn BitmapAllocator>,
        magpool: Arc<MagazinePool>,
        pressure: Option<Arc<dyn PressureRelief>>,
    ) -> Result<Self, ZoneError> {
        let page_size = provider.page_size();
        if config.elem_size == 0 {
            return Err(ZoneError::BadConfig("element size must be non-zero".into()));
        }
        let tuning = config.tuning;
        if tuning.magazine_capacity == 0 {
            return Err(ZoneError::BadConfig(
                "magazine capacity must be non-zero".into(),
            ));
        }
        if tuning.recirc_denom == 0 {
            return Err(ZoneError::BadConfig(
                "recirculation denominator must be non-zero".into(),
            ));
        }
        if !config.flags.expandable && tuning.wired_max_pages == u32::MAX {
            return Err(ZoneError::BadConfig(
                "non-expandable zone requires a wired page maximum".into(),
            ));
        }

        let chunk_pages = if config.chunk_pages == 0 {
            suggest_chunk_pages(config.elem_size, page_size)
        } else {
            config.chunk_pages
        };
        let chunk_bytes = chunk_pages * page_size;
        if config.elem_size > chunk_bytes {
            return Err(ZoneError::ElementTooLarge {
                elem_size: config.elem_size,
                chunk_bytes,
            });
        }
        let elems_per_chunk = (chunk_bytes / config.elem_size) as u32;
        let bitmap_order = if elems_per_chunk <= INLINE_BITS {
            None
        } else {
            let words = elems_per_chunk.div_ceil(64);
            Some(words.next_power_of_two().trailing_zeros())
        };
        let min_grow_pages = tuning
            .min_grow_pages
            .max(config.elem_size.div_ceil(page_size) as u32)
            .min(chunk_pages as u32);

        let entropy: Box<dyn EntropySource> = match config.entropy.take() {
            Some(src) => src,
            None => Box::new(SmallRng::from_os_rng()),
        };

        let zone = Self {
            id,
            elem_size: config.elem_size,
            chunk_pages,
            elems_per_chunk,
            bitmap_order,
            min_grow_pages,
            flags: config.flags,
            tuning,
            core: Mutex::new(ZoneCore {
                chunks: Vec::new(),
                free_slots: Vec::new(),
                queues: ChunkQueues::default(),
                recirc: Vec::new(),
                free_count: 0,
                avail_count: 0,
                wired_pages: 0,
                wired_hwm: 0,
                free_min: 0,
                free_max: 0,
                free_wss: 0,
                contention_wma: 0,
                cache_enable_streak: 0,
                expander: ExpanderState {
                    ordinary: false,
                    privileged: false,
                    waiters: 0,
                },
                destroyed: false,
                entropy,
            }),
            expand_cv: Condvar::new(),
            contention: AtomicU32::new(0),
            defrag_requested: AtomicBool::new(false),
            chunk_slots: AtomicU32::new(0),
            cache: OnceLock::new(),
            provider,
            bitmaps,
            magpool,
            pressure,
        };
        if zone.flags.caching_enabled {
            zone.enable_caching();
        }
        stats::ZONES_LIVE.add(1);
        Ok(zone)
    }

    /// Allocate one element.
    pub fn allocate(&self, flags: AllocFlags) -> Result<ElementRef, AllocError> {
        let e = match self.cache.get() {
            Some(cache) => self.alloc_cached(cache, flags)?,
            None => self.alloc_uncached(flags)?,
        };
        if flags.zero {
            self.zero_element(e);
        }
        Ok(e)
    }

    /// Free one element. Invariant violations (double free, foreign element)
    /// are fatal, not reported.
    pub fn free(&self, e: ElementRef) {
        // A forged or foreign reference must die here, before it can enter a
        // magazine and surface from an innocent allocation.
        if e.index() >= self.elems_per_chunk
            || e.chunk() >= self.chunk_slots.load(Ordering::Relaxed)
        {
            panic!(
                "{e:?} out of range for zone {} ({} chunk slots, {} elements per chunk)",
                self.id,
                self.chunk_slots.load(Ordering::Relaxed),
                self.elems_per_chunk
            );
        }
        match self.cache.get() {
            Some(cache) => self.free_cached(cache, e),
            None => self.free_uncached(e),
        }
    }

    /// Resolve an allocated element to its memory.
    ///
    /// The pointer is valid until the element is freed. Consuming a stale or
    /// foreign reference is fatal.
    pub fn element_ptr(&self, e: ElementRef) -> NonNull<u8> {
        let core = self.lock_core();
        core.assert_live();
        let meta = chunk_ref(&core.chunks, e.chunk());
        if meta.zone_id != self.id {
            panic!("zone confusion: {e:?} belongs to zone {}", meta.zone_id);
        }
        if e.index() >= meta.capacity {
            panic!("{e:?} out of range for its chunk ({} elements)", meta.capacity);
        }
        if meta.is_free(e.index()) {
            panic!("{e:?} is not allocated");
        }
        // Safety: in-bounds offset within the chunk's populated span.
        unsafe {
            NonNull::new_unchecked(
                meta.base.as_ptr().add(e.index() as usize * self.elem_size),
            )
        }
    }

    /// Current counters for external statistics reporting.
    pub fn snapshot(&self) -> ZoneSnapshot {
        // Cache tier first, zone lock second: slot locks and the zone lock
        // are never held together.
        let cached = self.cache.get().map_or(0, PcpuCache::cached_elements);
        let core = self.lock_core();
        ZoneSnapshot {
            elem_size: self.elem_size,
            chunk_pages: self.chunk_pages,
            elems_per_chunk: self.elems_per_chunk,
            free: core.free_count,
            avail: core.avail_count,
            cached,
            recirc_magazines: core.recirc.len(),
            wired_pages: core.wired_pages,
            wired_hwm: core.wired_hwm,
            free_wss: core.free_wss,
            contention_wma: core.contention_wma,
            caching_enabled: self.cache.get().is_some(),
        }
    }

    // ------------------------------------------------------------------
    // cached allocation path
    // ------------------------------------------------------------------

    fn alloc_cached(
        &self,
        cache: &PcpuCache,
        flags: AllocFlags,
    ) -> Result<ElementRef, AllocError> {
        let slot = cache.slot();
        loop {
            let mut st = slot.lock();
            if let Some(e) = st.alloc.pop() {
                return Ok(e);
            }
            if !st.free.is_empty() {
                // A magazine filled by frees serves allocations just as well.
                st.swap_magazines();
                if let Some(e) = st.alloc.pop() {
                    return Ok(e);
                }
            }
            if let Some(full) = st.depot.pop() {
                if !full.is_full() {
                    panic!("partial magazine in per-processor depot");
                }
                let old = std::mem::replace(&mut st.alloc, full);
                st.stash_spare(old, &self.magpool);
                if let Some(e) = st.alloc.pop() {
                    return Ok(e);
                }
            }
            drop(st);
            self.alloc_cached_slow(slot, flags)?;
        }
    }

    /// Refill the slot from the recirculation depot, the chunk bitmaps, or
    /// the grower. Returns `Ok(())` when progress was made and the fast path
    /// should retry.
    fn alloc_cached_slow(&self, slot: &CacheSlot, flags: AllocFlags) -> Result<(), AllocError> {
        let mut core = self.lock_core_contended(Some(slot));
        loop {
            core.assert_live();
            if !core.recirc.is_empty() {
                return self.refill_from_recirc(slot, core);
            }
            let cap = u32::from(self.tuning.magazine_capacity);
            // Keep half the reserve out of reach of bulk refills.
            let n = cap.min(core.free_count.saturating_sub(self.tuning.reserve / 2));
            if n == 0 {
                core = self.expand_locked(core, flags)?;
                if !core.recirc.is_empty() {
                    continue;
                }
                // Growth may be capped; dip into the reserve rather than
                // spin against the wired ceiling.
                let n = cap.min(core.free_count);
                if n == 0 {
                    drop(core);
                    return Err(self.exhaustion_failure(flags));
                }
                return self.refill_from_bitmaps(slot, core, n);
            }
            return self.refill_from_bitmaps(slot, core, n);
        }
    }

    /// Move magazines from the recirculation depot into this slot, clearing
    /// their elements' free bits on the way (they were logically free but
    /// administratively parked).
    fn refill_from_recirc(
        &self,
        slot: &CacheSlot,
        mut core: MutexGuard<'_, ZoneCore>,
    ) -> Result<(), AllocError> {
        let cap = u32::from(self.tuning.magazine_capacity);
        let target = slot.depot_target.load(Ordering::Relaxed).max(1);
        let denom = self.tuning.recirc_denom as usize;

        let mut mags: Vec<Box<Magazine>> = Vec::new();
        loop {
            let mag = match core.recirc.pop() {
                Some(mag) => mag,
                None => break,
            };
            if !mag.is_full() {
                panic!("partial magazine in recirculation depot");
            }
            for &el in mag.entries() {
                core.unpark_element(self.id, el);
            }
            mags.push(mag);
            // Fill the local depot to roughly target / denom.
            if mags.len() * denom >= target {
                break;
            }
        }
        core.free_sub(mags.len() as u32 * cap);
        drop(core);

        let mut st = slot.lock();
        for mag in mags {
            if st.alloc.is_empty() {
                let old = std::mem::replace(&mut st.alloc, mag);
                st.stash_spare(old, &self.magpool);
            } else {
                st.depot.push(mag);
            }
        }
        Ok(())
    }

    /// Batch-import `n` elements from chunk bitmaps into this slot's
    /// magazines in a single zone-lock hold.
    fn refill_from_bitmaps(
        &self,
        slot: &CacheSlot,
        mut core: MutexGuard<'_, ZoneCore>,
        n: u32,
    ) -> Result<(), AllocError> {
        let mut elems = Vec::with_capacity(n as usize);
        core.import_elements(self.id, self.elem_size, n, &mut elems);
        core.free_sub(n);
        drop(core);

        let mut st = slot.lock();
        let mut leftovers = Vec::new();
        for el in elems {
            if !st.alloc.is_full() {
                st.alloc.push(el);
            } else if !st.free.is_full() {
                st.free.push(el);
            } else {
                // Another thread refilled the slot while we imported.
                leftovers.push(el);
            }
        }
        drop(st);

        if !leftovers.is_empty() {
            let mut core = self.lock_core_contended(Some(slot));
            for el in leftovers {
                core.drop_element(self.id, self.elem_size, el, false);
                core.free_add(1);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // uncached allocation path
    // ------------------------------------------------------------------

    fn alloc_uncached(&self, flags: AllocFlags) -> Result<ElementRef, AllocError> {
        let mut core = self.lock_core_contended(None);
        loop {
            core.assert_live();
            if !core.recirc.is_empty() {
                // Caching was enabled concurrently; parked elements must be
                // consumed through the cache tier.
                drop(core);
                match self.cache.get() {
                    Some(cache) => return self.alloc_cached(cache, flags),
                    None => panic!(
                        "zone accounting: recirculation depot populated without a cache"
                    ),
                }
            }
            if core.free_count <= self.tuning.reserve {
                core = self.expand_locked(core, flags)?;
                if !core.recirc.is_empty() {
                    continue;
                }
                if core.free_count == 0 {
                    drop(core);
                    return Err(self.exhaustion_failure(flags));
                }
            }
            let mut out = Vec::with_capacity(1);
            core.import_elements(self.id, self.elem_size, 1, &mut out);
            core.free_sub(1);
            return Ok(out[0]);
        }
    }

    // ------------------------------------------------------------------
    // free paths
    // ------------------------------------------------------------------

    fn free_cached(&self, cache: &PcpuCache, e: ElementRef) {
        let slot = cache.slot();
        let mut st = slot.lock();
        if st.contains(e) {
            panic!("double free of {e:?} (still in per-processor cache)");
        }
        if st.free.is_full() {
            if !st.alloc.is_full() {
                st.swap_magazines();
            } else {
                return self.free_cached_slow(slot, st, e);
            }
        }
        st.free.push(e);
    }

    /// Both active magazines are full: detach the free magazine and route it
    /// to the local depot, overflowing a batch into the recirculation depot.
    fn free_cached_slow(
        &self,
        slot: &CacheSlot,
        mut st: MutexGuard<'_, super::cache::SlotState>,
        e: ElementRef,
    ) {
        let fresh = st.take_spare(self.tuning.magazine_capacity, &self.magpool);
        let full = std::mem::replace(&mut st.free, fresh);
        st.free.push(e);

        let target = slot.depot_target.load(Ordering::Relaxed);
        let mut outbound: Vec<Box<Magazine>> = Vec::new();
        if target >= 2 {
            st.depot.push(full);
            if st.depot.len() <= target {
                return;
            }
            // Overflow: move ~1/denom of the depot in one batch, always
            // leaving at least one magazine behind.
            let max_take = st.depot.len() - 1;
            let take = (target / self.tuning.recirc_denom as usize).clamp(1, max_take);
            outbound.extend(st.depot.drain(..take));
        } else {
            // Depot too small to bother; straight to recirculation.
            outbound.push(full);
        }
        drop(st);

        // Slot lock released before the zone lock, per lock ordering.
        let mut core = self.lock_core_contended(Some(slot));
        core.assert_live();
        let mut parked = 0u32;
        for mag in &outbound {
            for &el in mag.entries() {
                core.park_element(self.id, el);
                parked += 1;
            }
        }
        core.recirc.extend(outbound);
        core.free_add(parked);
    }

    fn free_uncached(&self, e: ElementRef) {
        let mut core = self.lock_core_contended(None);
        core.assert_live();
        core.drop_element(self.id, self.elem_size, e, false);
        core.free_add(1);
    }

    // ------------------------------------------------------------------
    // shared plumbing
    // ------------------------------------------------------------------

    pub(crate) fn lock_core(&self) -> MutexGuard<'_, ZoneCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Zone lock acquisition that samples contention: a failed try-lock
    /// counts one contention event and lets the caller's local depot grow so
    /// future bursts stay out of this lock.
    pub(crate) fn lock_core_contended(&self, slot: Option<&CacheSlot>) -> MutexGuard<'_, ZoneCore> {
        if let Ok(guard) = self.core.try_lock() {
            return guard;
        }
        self.contention.fetch_add(1, Ordering::Relaxed);
        if let Some(slot) = slot {
            let target = slot.depot_target.load(Ordering::Relaxed);
            if target < self.tuning.depot_ceiling {
                slot.depot_target.store(target + 1, Ordering::Relaxed);
            }
        }
        self.lock_core()
    }

    /// Late (or automatic) enablement of the per-processor cache tier.
    pub(crate) fn enable_caching(&self) {
        if self.flags.no_caching || self.flags.percpu {
            return;
        }
        self.cache.get_or_init(|| {
            let nslots = if self.tuning.cache_slots > 0 {
                self.tuning.cache_slots
            } else {
                std::thread::available_parallelism()
                    .map(NonZeroUsize::get)
                    .unwrap_or(1)
            };
            log::info!(
                "zone {}: enabling per-processor caching ({nslots} slots)",
                self.id
            );
            PcpuCache::new(
                nslots,
                self.tuning.magazine_capacity,
                self.tuning.depot_floor,
                &self.magpool,
            )
        });
    }

    fn exhaustion_failure(&self, flags: AllocFlags) -> AllocError {
        if self.flags.exhaustible {
            return AllocError::Exhausted;
        }
        if flags.no_wait {
            return AllocError::WouldBlock;
        }
        // Callers drop the zone lock before erroring out, so a state dump
        // can be assembled here.
        let snap = self.snapshot();
        panic!(
            "zone {} exhausted (free={} avail={} cached={} wired={}/{}): \
             a non-exhaustible zone running dry indicates a leak elsewhere",
            self.id,
            snap.free,
            snap.avail,
            snap.cached,
            snap.wired_pages,
            self.tuning.wired_max_pages,
        );
    }

    fn zero_element(&self, e: ElementRef) {
        let core = self.lock_core();
        let meta = chunk_ref(&core.chunks, e.chunk());
        debug_assert!(!meta.is_free(e.index()));
        // Safety: the element is allocated to the caller; its chunk stays
        // mapped and populated while any element is outstanding.
        unsafe {
            let ptr = meta.base.as_ptr().add(e.index() as usize * self.elem_size);
            std::ptr::write_bytes(ptr, 0, self.elem_size);
        }
    }
}

impl Drop for Zone {
    fn drop(&mut self) {
        let mut core = self.lock_core();
        let page_size = self.provider.page_size();
        for slot in 0..core.chunks.len() {
            if let Some(mut meta) = core.chunks[slot].take() {
                meta.retire_occupancy(&*self.bitmaps);
                stats::TOTAL_POPULATED.sub(meta.populated_pages as usize * page_size);
                stats::TOTAL_RESERVED.sub(meta.va_pages as usize * page_size);
                stats::CHUNKS_LIVE.sub(1);
                // Safety: the chunk's reservation is exclusively ours and no
                // element references remain once the zone itself goes away.
                if let Err(err) =
                    unsafe { self.provider.release(meta.base, meta.va_pages as usize * page_size) }
                {
                    log::warn!("zone {}: failed to release chunk VA: {err}", self.id);
                }
            }
        }
        stats::ZONES_LIVE.sub(1);
    }
}

fn suggest_chunk_pages(elem_size: usize, page_size: usize) -> usize {
    // Grow the chunk until it holds a reasonable element count, capped so a
    // single growth stays cheap.
    let mut pages = 1usize;
    while pages < 8 && (pages * page_size) / elem_size < 8 {
        pages *= 2;
    }
    pages
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::zone::bitmap::BitmapPool;
    use crate::zone::provider::{PageProvider, PlatformProvider};

    pub(crate) struct FixedEntropy(pub u64);

    impl EntropySource for FixedEntropy {
        fn next_u64(&mut self) -> u64 {
            self.0
        }
    }

    fn test_zone(config: ZoneConfig) -> Zone {
        Zone::new(
            1,
            config,
            Arc::new(PlatformProvider),
            Arc::new(BitmapPool::new()),
            Arc::new(MagazinePool::new()),
            None,
        )
        .expect("zone creation failed")
    }

    #[test]
    fn test_geometry_inline_bitmap() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let zone = test_zone(ZoneConfig::new(64).chunk_pages(1).entropy(Box::new(FixedEntropy(0))));
        let page = PlatformProvider.page_size();
        assert_eq!(zone.elems_per_chunk as usize, page / 64);
        assert!(zone.bitmap_order.is_none(), "64 elems fit inline");
    }

    #[test]
    fn test_geometry_external_bitmap() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let zone = test_zone(ZoneConfig::new(8).chunk_pages(1).entropy(Box::new(FixedEntropy(0))));
        assert!(zone.elems_per_chunk > INLINE_BITS);
        assert!(zone.bitmap_order.is_some());
    }

    #[test]
    fn test_bad_config_rejected() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let provider: Arc<dyn PageProvider> = Arc::new(PlatformProvider);
        let res = Zone::new(
            1,
            ZoneConfig::new(0),
            provider.clone(),
            Arc::new(BitmapPool::new()),
            Arc::new(MagazinePool::new()),
            None,
        );
        assert!(matches!(res, Err(ZoneError::BadConfig(_))));

        let mut flags = ZoneFlags::default();
        flags.expandable = false;
        let res = Zone::new(
            1,
            ZoneConfig::new(64).flags(flags),
            provider,
            Arc::new(BitmapPool::new()),
            Arc::new(MagazinePool::new()),
            None,
        );
        assert!(matches!(res, Err(ZoneError::BadConfig(_))));
    }

    #[test]
    fn test_element_too_large_rejected() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let provider: Arc<dyn PageProvider> = Arc::new(PlatformProvider);
        let page = provider.page_size();
        let res = Zone::new(
            1,
            ZoneConfig::new(page * 2).chunk_pages(1),
            provider,
            Arc::new(BitmapPool::new()),
            Arc::new(MagazinePool::new()),
            None,
        );
        assert!(matches!(res, Err(ZoneError::ElementTooLarge { .. })));
    }

    #[test]
    fn test_alloc_flags_builder() {
        let flags = AllocFlags::new().non_blocking().zeroed();
        assert!(flags.no_wait);
        assert!(flags.zero);
        assert!(!flags.privileged);
    }
}
