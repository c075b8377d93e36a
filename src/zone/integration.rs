//! End-to-end allocator behavior: growth, tier routing, reclaim, and the
//! conservation law tying every counter together.
#![cfg(all(test, not(loom)))]

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::bitmap::BitmapPool;
use super::chunk::ElementRef;
use super::magazine::MagazinePool;
use super::provider::PlatformProvider;
use super::zone::{AllocFlags, EntropySource, Zone, ZoneConfig, ZoneFlags, ZoneSnapshot};
use crate::sync::Arc;

struct FixedEntropy(u64);

impl EntropySource for FixedEntropy {
    fn next_u64(&mut self) -> u64 {
        self.0
    }
}

fn build(config: ZoneConfig) -> Arc<Zone> {
    Arc::new(
        Zone::new(
            1,
            config,
            Arc::new(PlatformProvider),
            Arc::new(BitmapPool::new()),
            Arc::new(MagazinePool::new()),
            None,
        )
        .expect("zone creation failed"),
    )
}

fn uncached(elem_size: usize) -> ZoneConfig {
    let mut flags = ZoneFlags::default();
    flags.no_caching = true;
    ZoneConfig::new(elem_size)
        .chunk_pages(1)
        .flags(flags)
        .entropy(Box::new(FixedEntropy(0)))
}

fn cached(elem_size: usize) -> ZoneConfig {
    let mut config = uncached(elem_size);
    config.flags.no_caching = false;
    config.flags.caching_enabled = true;
    config.tuning.cache_slots = 1;
    config
}

/// free + cached + live must always equal avail.
fn assert_conserved(snap: &ZoneSnapshot, live: usize) {
    assert_eq!(
        snap.live() as usize,
        live,
        "live count diverged: {snap:?}"
    );
    assert_eq!(snap.free_total() + snap.live(), snap.avail, "{snap:?}");
}

#[test]
fn test_single_chunk_growth_accounting() {
    let _guard = crate::zone::TEST_MUTEX.read().unwrap();
    let zone = build(uncached(64));
    assert_eq!(zone.elems_per_chunk, 64, "4 KiB page / 64 B elements");

    let first = zone.allocate(AllocFlags::new()).unwrap();
    let snap = zone.snapshot();
    assert_eq!(snap.avail, 64);
    assert_eq!(snap.free, 63);
    assert_eq!(snap.wired_pages, 1);
    assert_conserved(&snap, 1);

    let mut held = vec![first];
    for _ in 0..63 {
        held.push(zone.allocate(AllocFlags::new()).unwrap());
    }
    let snap = zone.snapshot();
    assert_eq!(snap.free, 0);
    assert_eq!(snap.wired_pages, 1, "still a single chunk");
    assert_conserved(&snap, 64);

    // All 64 references are distinct.
    let mut seen: Vec<_> = held.iter().map(|e| format!("{e:?}")).collect();
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 64);

    for e in held {
        zone.free(e);
    }
    assert_conserved(&zone.snapshot(), 0);
}

#[test]
fn test_freed_element_is_not_immediately_reused() {
    let _guard = crate::zone::TEST_MUTEX.read().unwrap();
    let zone = build(uncached(64));
    let a = zone.allocate(AllocFlags::new()).unwrap();
    let b = zone.allocate(AllocFlags::new()).unwrap();
    let c = zone.allocate(AllocFlags::new()).unwrap();

    zone.free(a);
    let snap = zone.snapshot();
    assert_conserved(&snap, 2);

    // Round-robin scan: the next allocation continues past the freed slot
    // instead of handing `a` straight back.
    let d = zone.allocate(AllocFlags::new()).unwrap();
    assert_ne!(d, a);

    for e in [b, c, d] {
        zone.free(e);
    }
}

#[test]
fn test_cached_refill_imports_a_batch() {
    let _guard = crate::zone::TEST_MUTEX.read().unwrap();
    let zone = build(cached(64));
    let e = zone.allocate(AllocFlags::new()).unwrap();

    let snap = zone.snapshot();
    let cap = u32::from(zone.tuning.magazine_capacity);
    // One zone-lock hold imported a whole magazine's worth.
    assert_eq!(snap.free, zone.elems_per_chunk - cap);
    assert_eq!(snap.cached as u32, cap - 1);
    assert_conserved(&snap, 1);
    zone.free(e);
}

#[test]
fn test_trim_drains_recirc_and_releases_emptied_chunk() {
    let _guard = crate::zone::TEST_MUTEX.read().unwrap();
    let zone = build(cached(64));

    // Two chunks' worth, allocated in chunk order.
    let mut held: Vec<_> = (0..128)
        .map(|_| zone.allocate(AllocFlags::new()).unwrap())
        .collect();
    assert_eq!(zone.snapshot().wired_pages, 2);

    // The first and last magazine's worth of frees end up pinned in the
    // slot's two active magazines. Route those through the second chunk so
    // every first-chunk element lands in the recirculation depot.
    let tail = held.split_off(64);
    for &e in &tail[..8] {
        zone.free(e);
    }
    for e in held {
        zone.free(e);
    }
    for &e in &tail[8..] {
        zone.free(e);
    }
    let before = zone.snapshot();
    assert!(before.recirc_magazines > 0);
    assert_conserved(&before, 0);

    zone.trim();
    let after = zone.snapshot();
    assert_eq!(after.recirc_magazines, 0);
    assert!(
        after.wired_pages < before.wired_pages,
        "emptied chunk returned its pages"
    );
    assert_conserved(&after, 0);

    // A drain flushes the remaining cached elements too.
    zone.drain();
    let end = zone.snapshot();
    assert_eq!(end.wired_pages, 0);
    assert_eq!(end.avail, 0);
}

#[test]
fn test_zeroed_allocation_scrubs_stale_bytes() {
    let _guard = crate::zone::TEST_MUTEX.read().unwrap();
    let zone = build(uncached(64));
    let n = zone.elems_per_chunk as usize;

    let held: Vec<_> = (0..n)
        .map(|_| zone.allocate(AllocFlags::new()).unwrap())
        .collect();
    for &e in &held {
        let ptr = zone.element_ptr(e);
        // Safety: element is allocated to us and 64 bytes long.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0xFF, 64) };
    }
    for e in held {
        zone.free(e);
    }

    let held: Vec<_> = (0..n)
        .map(|_| zone.allocate(AllocFlags::new().zeroed()).unwrap())
        .collect();
    for &e in &held {
        let ptr = zone.element_ptr(e);
        // Safety: element is allocated to us and 64 bytes long.
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0), "stale bytes survived");
    }
    for e in held {
        zone.free(e);
    }
}

#[test]
#[should_panic(expected = "double free")]
fn test_uncached_double_free_is_fatal() {
    let _guard = crate::zone::TEST_MUTEX.read().unwrap();
    let zone = build(uncached(64));
    let e = zone.allocate(AllocFlags::new()).unwrap();
    zone.free(e);
    zone.free(e);
}

#[test]
#[should_panic(expected = "out of range")]
fn test_free_of_forged_reference_is_fatal() {
    let _guard = crate::zone::TEST_MUTEX.read().unwrap();
    let zone = build(cached(64));
    let _live = zone.allocate(AllocFlags::new()).unwrap();
    // A reference naming a chunk slot this zone never created must die at
    // the free() boundary, not surface from a later allocation.
    zone.free(ElementRef::new(9, 0));
}

#[test]
#[should_panic(expected = "double free")]
fn test_cached_double_free_is_fatal() {
    let _guard = crate::zone::TEST_MUTEX.read().unwrap();
    let zone = build(cached(64));
    let e = zone.allocate(AllocFlags::new()).unwrap();
    zone.free(e);
    zone.free(e);
}

#[test]
fn test_conservation_under_random_traffic() {
    let _guard = crate::zone::TEST_MUTEX.read().unwrap();
    for config in [uncached(96), cached(96)] {
        let zone = build(config);
        let mut rng = SmallRng::seed_from_u64(42);
        let mut held = Vec::new();

        for step in 0..4000 {
            if held.is_empty() || rng.random_bool(0.55) {
                held.push(zone.allocate(AllocFlags::new()).unwrap());
            } else {
                let i = rng.random_range(0..held.len());
                zone.free(held.swap_remove(i));
            }
            match step % 500 {
                250 => zone.sample_working_set(),
                499 => zone.trim(),
                _ => {}
            }
            if step % 97 == 0 {
                assert_conserved(&zone.snapshot(), held.len());
            }
        }

        for e in held {
            zone.free(e);
        }
        zone.drain();
        let snap = zone.snapshot();
        assert_eq!(snap.avail, 0);
        assert_eq!(snap.wired_pages, 0);
    }
}

#[test]
fn test_concurrent_traffic_conserves_elements() {
    let _guard = crate::zone::TEST_MUTEX.read().unwrap();
    let mut config = cached(128);
    config.tuning.cache_slots = 4;
    let zone = build(config);

    let mut workers = Vec::new();
    for seed in 0..4u64 {
        let zone = zone.clone();
        workers.push(std::thread::spawn(move || {
            let mut rng = SmallRng::seed_from_u64(seed);
            let mut held = Vec::new();
            for _ in 0..2000 {
                if held.is_empty() || rng.random_bool(0.5) {
                    held.push(zone.allocate(AllocFlags::new()).unwrap());
                } else {
                    let i = rng.random_range(0..held.len());
                    zone.free(held.swap_remove(i));
                }
            }
            held
        }));
    }
    for worker in workers {
        for e in worker.join().expect("worker panicked") {
            zone.free(e);
        }
    }

    zone.drain();
    let snap = zone.snapshot();
    assert_eq!(snap.cached, 0);
    assert_conserved(&snap, 0);
    assert_eq!(snap.avail, 0, "every chunk returned after the drain");
}
