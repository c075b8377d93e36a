//! Working-set estimation and the periodic maintenance pass.
//!
//! Each sample period closes a min/max window over the zone's free count and
//! folds the window span into a weighted moving average, the free working
//! set. The same pass averages zone-lock contention, auto-enables the cache
//! tier for hot zones, decays per-slot depot targets when contention
//! subsides, and queues a trim request (consumed by
//! [`run_pending_defrag`](Zone::run_pending_defrag)) when free slack or
//! parked recirculation memory outgrows the working set.

use super::zone::Zone;
use crate::sync::atomic::Ordering;

impl Zone {
    /// One maintenance sample. Intended to be called every few seconds from
    /// the embedder's housekeeping thread; never from an allocation path.
    pub fn sample_working_set(&self) {
        let tally = self.contention.swap(0, Ordering::Relaxed);
        let mut enable_cache = false;
        let mut want_trim = false;
        {
            let mut core = self.lock_core();
            if core.destroyed {
                return;
            }

            // Close the free-count window and fold it into the average.
            // Averages are folded in u64: the 3x term overflows u32 once the
            // average climbs past a quarter of the range.
            let window = core.free_max.saturating_sub(core.free_min);
            core.free_wss = ((3 * u64::from(core.free_wss) + u64::from(window)) / 4) as u32;
            core.free_min = core.free_count;
            core.free_max = core.free_count;

            // Contention average, fixed point in contention units.
            let unit = self.tuning.contention_unit;
            let wma = (3 * u64::from(core.contention_wma)
                + u64::from(tally) * u64::from(unit))
                / 4;
            core.contention_wma = wma.min(u64::from(u32::MAX)) as u32;
            if self.cache.get().is_none()
                && core.contention_wma >= self.tuning.cache_enable_threshold.saturating_mul(unit)
            {
                core.cache_enable_streak = core.cache_enable_streak.saturating_add(1);
                // Two consecutive hot periods, not one spike.
                if core.cache_enable_streak >= 2 {
                    enable_cache = true;
                }
            } else {
                core.cache_enable_streak = 0;
            }

            // Free slack above working set and reserve: trim when at least a
            // chunk's worth could come back.
            let keep = core.free_wss + self.tuning.reserve;
            let slack = core.free_count.saturating_sub(keep);
            if slack >= self.elems_per_chunk
                && u64::from(slack) * 100
                    >= u64::from(core.free_wss) * u64::from(self.tuning.autotrim_ratio)
            {
                want_trim = true;
            }

            // Parked recirculation memory outgrowing the working set means
            // the depot is hoarding chunks that could be released.
            let parked =
                core.recirc.len() as u32 * u32::from(self.tuning.magazine_capacity);
            if parked > 0
                && u64::from(parked) * 100
                    > u64::from(core.free_wss) * u64::from(self.tuning.defrag_ratio)
            {
                want_trim = true;
            }
        }

        if enable_cache {
            self.enable_caching();
        }

        // A quiet period lets depot targets drift back toward the floor.
        if tally == 0 {
            if let Some(cache) = self.cache.get() {
                for slot in cache.slots() {
                    let target = slot.depot_target.load(Ordering::Relaxed);
                    if target > self.tuning.depot_floor {
                        slot.depot_target.store(target - 1, Ordering::Relaxed);
                    }
                }
            }
        }

        if want_trim {
            self.defrag_requested.store(true, Ordering::Relaxed);
        }
    }

    /// Execute a trim queued by [`sample_working_set`](Self::sample_working_set).
    ///
    /// Meant for the embedder's housekeeping thread, off the sampling path.
    /// The request flag is consumed atomically, so concurrent callers run at
    /// most one trim per queued request.
    pub fn run_pending_defrag(&self) {
        if self.defrag_requested.swap(false, Ordering::Relaxed) {
            self.trim();
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::Arc;
    use crate::zone::bitmap::BitmapPool;
    use crate::zone::magazine::MagazinePool;
    use crate::zone::provider::PlatformProvider;
    use crate::zone::zone::{AllocFlags, ZoneConfig, ZoneFlags};

    fn build(config: ZoneConfig) -> Zone {
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

    fn uncached(elem_size: usize) -> ZoneConfig {
        let mut flags = ZoneFlags::default();
        flags.no_caching = true;
        ZoneConfig::new(elem_size).chunk_pages(1).flags(flags)
    }

    #[test]
    fn test_wss_tracks_free_window() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let zone = build(uncached(256));
        let n = zone.elems_per_chunk;
        let held: Vec<_> = (0..n)
            .map(|_| zone.allocate(AllocFlags::new()).unwrap())
            .collect();
        for e in held {
            zone.free(e);
        }

        zone.sample_working_set();
        let wss1 = zone.snapshot().free_wss;
        assert!(wss1 > 0, "window spanned the whole chunk");

        // Idle periods decay the average toward zero.
        zone.sample_working_set();
        let wss2 = zone.snapshot().free_wss;
        assert!(wss2 < wss1);
    }

    #[test]
    fn test_idle_samples_eventually_trim() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let zone = build(uncached(256));
        let held: Vec<_> = (0..zone.elems_per_chunk)
            .map(|_| zone.allocate(AllocFlags::new()).unwrap())
            .collect();
        for e in held {
            zone.free(e);
        }

        for _ in 0..12 {
            zone.sample_working_set();
            zone.run_pending_defrag();
        }
        let snap = zone.snapshot();
        assert_eq!(snap.wired_pages, 0, "idle chunk released by autotrim");
        assert_eq!(snap.free_wss, 0);
    }

    #[test]
    fn test_trim_request_is_deferred_to_defrag_pass() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let zone = build(uncached(256));
        let held: Vec<_> = (0..zone.elems_per_chunk)
            .map(|_| zone.allocate(AllocFlags::new()).unwrap())
            .collect();
        for e in held {
            zone.free(e);
        }

        // Samples only queue the request; nothing is released until the
        // housekeeping pass runs it.
        for _ in 0..12 {
            zone.sample_working_set();
        }
        assert_eq!(zone.snapshot().wired_pages, 1);

        zone.run_pending_defrag();
        assert_eq!(zone.snapshot().wired_pages, 0);

        // The request was consumed; a second pass has nothing to do.
        zone.run_pending_defrag();
        assert_eq!(zone.snapshot().wired_pages, 0);
    }

    #[test]
    fn test_sustained_contention_enables_caching() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let zone = build(ZoneConfig::new(128).chunk_pages(1));
        assert!(!zone.snapshot().caching_enabled);

        zone.contention.store(5000, Ordering::Relaxed);
        zone.sample_working_set();
        assert!(
            !zone.snapshot().caching_enabled,
            "one hot period is not enough"
        );

        zone.contention.store(5000, Ordering::Relaxed);
        zone.sample_working_set();
        assert!(zone.snapshot().caching_enabled);
    }

    #[test]
    fn test_contention_average_survives_saturated_tally() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let zone = build(uncached(128));
        // A pathological tally converges the average toward tally * unit,
        // far past u32; the fold must clamp instead of wrapping.
        for _ in 0..8 {
            zone.contention.store(u32::MAX, Ordering::Relaxed);
            zone.sample_working_set();
        }
        let snap = zone.snapshot();
        assert_eq!(snap.contention_wma, u32::MAX);
    }

    #[test]
    fn test_no_caching_zone_never_gets_a_cache() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let zone = build(uncached(128));
        // Far past any u8 streak counter; hot periods must not wrap it.
        for _ in 0..300 {
            zone.contention.store(5000, Ordering::Relaxed);
            zone.sample_working_set();
        }
        assert!(!zone.snapshot().caching_enabled);
    }

    #[test]
    fn test_quiet_periods_decay_depot_targets() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let mut config = ZoneConfig::new(128).chunk_pages(1);
        config.flags.caching_enabled = true;
        config.tuning.cache_slots = 1;
        let zone = build(config);

        let cache = zone.cache.get().unwrap();
        cache.slots()[0].depot_target.store(5, Ordering::Relaxed);
        zone.sample_working_set();
        assert_eq!(cache.slots()[0].depot_target.load(Ordering::Relaxed), 4);

        // Contended periods must not decay the target.
        zone.contention.store(50, Ordering::Relaxed);
        zone.sample_working_set();
        assert_eq!(cache.slots()[0].depot_target.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_parked_recirc_triggers_trim() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let mut config = ZoneConfig::new(64).chunk_pages(1);
        config.flags.caching_enabled = true;
        config.tuning.cache_slots = 1;
        let zone = build(config);

        // Cycle enough elements that overflow magazines park in recirc.
        let held: Vec<_> = (0..48)
            .map(|_| zone.allocate(AllocFlags::new()).unwrap())
            .collect();
        for e in held {
            zone.free(e);
        }
        assert!(zone.snapshot().recirc_magazines > 0);

        for _ in 0..12 {
            zone.sample_working_set();
            zone.run_pending_defrag();
        }
        assert_eq!(zone.snapshot().recirc_magazines, 0, "defrag drained recirc");
    }
}
