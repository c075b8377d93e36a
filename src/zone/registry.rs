//! Zone registry: stable handles over a recycling zone table.
//!
//! Handles pair a slot index with a generation; destroying a zone bumps the
//! slot's generation, so handles to dead zones fail with a stale-handle
//! error instead of reaching a recycled zone.
//!
//! The registry also owns the collaborators shared by every zone (page
//! provider, bitmap service, magazine pool) and fans maintenance operations
//! out across the table.

use super::bitmap::{BitmapAllocator, BitmapPool};
use super::chunk::ElementRef;
use super::magazine::MagazinePool;
use super::provider::{PageProvider, PlatformProvider, ZoneError};
use super::zone::{
    AllocError, AllocFlags, PressureRelief, Zone, ZoneConfig, ZoneSnapshot,
};
use crate::sync::atomic::{AtomicU32, Ordering};
use crate::sync::{Arc, PoisonError, RwLock};

crate::sync::static_atomic! {
    static NEXT_ZONE_ID: AtomicU32 = AtomicU32::new(1);
}

/// A generation-checked reference to a registered zone.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ZoneHandle {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    zone: Option<Arc<Zone>>,
}

pub struct ZoneRegistry {
    provider: Arc<dyn PageProvider>,
    bitmaps: Arc<dyn BitmapAllocator>,
    magpool: Arc<MagazinePool>,
    pressure: Option<Arc<dyn PressureRelief>>,
    slots: RwLock<Vec<Slot>>,
}

impl Default for ZoneRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ZoneRegistry {
    pub fn new() -> Self {
        Self::with_provider(Arc::new(PlatformProvider))
    }

    pub fn with_provider(provider: Arc<dyn PageProvider>) -> Self {
        Self {
            provider,
            bitmaps: Arc::new(BitmapPool::new()),
            magpool: Arc::new(MagazinePool::new()),
            pressure: None,
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Install an escalation hook invoked when a grower cannot obtain pages.
    /// Applies to zones created after this call.
    pub fn set_pressure_relief(&mut self, relief: Arc<dyn PressureRelief>) {
        self.pressure = Some(relief);
    }

    pub fn create(&self, config: ZoneConfig) -> Result<ZoneHandle, ZoneError> {
        let id = NEXT_ZONE_ID.fetch_add(1, Ordering::Relaxed);
        let zone = Arc::new(Zone::new(
            id,
            config,
            self.provider.clone(),
            self.bitmaps.clone(),
            self.magpool.clone(),
            self.pressure.clone(),
        )?);

        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let index = match slots.iter().position(|s| s.zone.is_none()) {
            Some(i) => i,
            None => {
                slots.push(Slot {
                    generation: 0,
                    zone: None,
                });
                slots.len() - 1
            }
        };
        slots[index].zone = Some(zone);
        Ok(ZoneHandle {
            index: index as u32,
            generation: slots[index].generation,
        })
    }

    /// Resolve a handle, failing on anything stale or out of range.
    pub fn get(&self, handle: ZoneHandle) -> Result<Arc<Zone>, ZoneError> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let slot = slots
            .get(handle.index as usize)
            .ok_or(ZoneError::StaleHandle)?;
        if slot.generation != handle.generation {
            return Err(ZoneError::StaleHandle);
        }
        slot.zone.clone().ok_or(ZoneError::StaleHandle)
    }

    /// Destroy a zone and retire its handle. Fails on non-destructible zones
    /// and stale handles; panics (in the zone layer) if elements are still
    /// outstanding.
    pub fn destroy(&self, handle: ZoneHandle) -> Result<(), ZoneError> {
        let zone = self.get(handle)?;
        zone.destroy()?;
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let slot = &mut slots[handle.index as usize];
        slot.zone = None;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(())
    }

    pub fn allocate(
        &self,
        handle: ZoneHandle,
        flags: AllocFlags,
    ) -> Result<ElementRef, AllocError> {
        match self.get(handle) {
            Ok(zone) => zone.allocate(flags),
            Err(err) => panic!("allocation through dead handle {handle:?}: {err}"),
        }
    }

    pub fn free(&self, handle: ZoneHandle, e: ElementRef) {
        match self.get(handle) {
            Ok(zone) => zone.free(e),
            Err(err) => panic!("free through dead handle {handle:?}: {err}"),
        }
    }

    fn live_zones(&self) -> Vec<(ZoneHandle, Arc<Zone>)> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                s.zone.as_ref().map(|z| {
                    (
                        ZoneHandle {
                            index: i as u32,
                            generation: s.generation,
                        },
                        z.clone(),
                    )
                })
            })
            .collect()
    }

    /// Counters for every live zone.
    pub fn snapshots(&self) -> Vec<(ZoneHandle, ZoneSnapshot)> {
        self.live_zones()
            .into_iter()
            .map(|(h, z)| (h, z.snapshot()))
            .collect()
    }

    /// Run one working-set sample on every live zone, then any trims the
    /// samples queued.
    pub fn sample_all(&self) {
        for (_, zone) in self.live_zones() {
            zone.sample_working_set();
            zone.run_pending_defrag();
        }
    }

    /// Trim every live zone.
    pub fn trim_all(&self) {
        for (_, zone) in self.live_zones() {
            zone.trim();
        }
    }

    /// Memory-pressure response: drain every live zone and drop pooled
    /// magazines.
    pub fn drain_all(&self) {
        for (_, zone) in self.live_zones() {
            zone.drain();
        }
        self.magpool.purge();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::zone::zone::ZoneFlags;

    fn destructible(elem_size: usize) -> ZoneConfig {
        let mut flags = ZoneFlags::default();
        flags.destructible = true;
        flags.no_caching = true;
        ZoneConfig::new(elem_size).chunk_pages(1).flags(flags)
    }

    #[test]
    fn test_create_get_destroy_roundtrip() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let registry = ZoneRegistry::new();
        let handle = registry.create(destructible(64)).unwrap();

        let e = registry.allocate(handle, AllocFlags::new()).unwrap();
        registry.free(handle, e);

        registry.destroy(handle).unwrap();
        assert!(matches!(registry.get(handle), Err(ZoneError::StaleHandle)));
    }

    #[test]
    fn test_recycled_slot_invalidates_old_handle() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let registry = ZoneRegistry::new();
        let old = registry.create(destructible(64)).unwrap();
        registry.destroy(old).unwrap();

        let new = registry.create(destructible(64)).unwrap();
        assert_ne!(old, new, "recycled slot carries a new generation");
        assert!(matches!(registry.get(old), Err(ZoneError::StaleHandle)));
        assert!(registry.get(new).is_ok());
        registry.destroy(new).unwrap();
    }

    #[test]
    fn test_destroy_non_destructible_fails_and_keeps_zone() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let registry = ZoneRegistry::new();
        let mut config = destructible(64);
        config.flags.destructible = false;
        let handle = registry.create(config).unwrap();

        assert!(matches!(
            registry.destroy(handle),
            Err(ZoneError::NotDestructible)
        ));
        assert!(registry.get(handle).is_ok());
    }

    #[test]
    fn test_snapshots_cover_live_zones() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let registry = ZoneRegistry::new();
        let a = registry.create(destructible(64)).unwrap();
        let b = registry.create(destructible(128)).unwrap();

        let e = registry.allocate(a, AllocFlags::new()).unwrap();
        let snaps = registry.snapshots();
        assert_eq!(snaps.len(), 2);
        let snap_a = snaps.iter().find(|(h, _)| *h == a).unwrap();
        assert_eq!(snap_a.1.live(), 1);
        let snap_b = snaps.iter().find(|(h, _)| *h == b).unwrap();
        assert_eq!(snap_b.1.elem_size, 128);

        registry.free(a, e);
        registry.destroy(a).unwrap();
        registry.destroy(b).unwrap();
        assert_eq!(registry.snapshots().len(), 0);
    }

    #[test]
    fn test_drain_all_releases_everything() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let registry = ZoneRegistry::new();
        let handle = registry.create(destructible(64)).unwrap();
        let e = registry.allocate(handle, AllocFlags::new()).unwrap();
        registry.free(handle, e);

        registry.drain_all();
        let snaps = registry.snapshots();
        assert_eq!(snaps[0].1.wired_pages, 0);
        registry.destroy(handle).unwrap();
    }

    #[test]
    #[should_panic(expected = "dead handle")]
    fn test_allocate_through_dead_handle_panics() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let registry = ZoneRegistry::new();
        let handle = registry.create(destructible(64)).unwrap();
        registry.destroy(handle).unwrap();
        let _ = registry.allocate(handle, AllocFlags::new());
    }
}
