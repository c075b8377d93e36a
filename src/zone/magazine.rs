//! Magazines: the unit of transfer between cache tiers.

use super::chunk::ElementRef;
use super::stats;
use crate::sync::{Mutex, PoisonError};

/// A fixed-capacity batch of free element references.
///
/// Owned by exactly one per-processor cache slot, one local depot, or the
/// zone recirculation depot at any instant, never shared. Magazines stored
/// in any depot are always either completely full or completely empty.
pub(crate) struct Magazine {
    elems: Box<[ElementRef]>,
    count: u16,
}

impl Magazine {
    pub(crate) fn new(capacity: u16) -> Box<Self> {
        stats::MAGAZINES_LIVE.add(1);
        Box::new(Self {
            elems: vec![ElementRef::default(); usize::from(capacity)].into_boxed_slice(),
            count: 0,
        })
    }

    pub(crate) fn capacity(&self) -> u16 {
        self.elems.len() as u16
    }

    pub(crate) fn len(&self) -> u16 {
        self.count
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub(crate) fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    pub(crate) fn push(&mut self, e: ElementRef) {
        let idx = usize::from(self.count);
        if idx >= self.elems.len() {
            panic!("magazine overflow");
        }
        self.elems[idx] = e;
        self.count += 1;
    }

    pub(crate) fn pop(&mut self) -> Option<ElementRef> {
        if self.count == 0 {
            return None;
        }
        self.count -= 1;
        Some(self.elems[usize::from(self.count)])
    }

    /// The filled prefix.
    pub(crate) fn entries(&self) -> &[ElementRef] {
        &self.elems[..usize::from(self.count)]
    }

    pub(crate) fn clear(&mut self) {
        self.count = 0;
    }

    pub(crate) fn contains(&self, e: ElementRef) -> bool {
        self.entries().contains(&e)
    }
}

impl Drop for Magazine {
    fn drop(&mut self) {
        stats::MAGAZINES_LIVE.sub(1);
    }
}

/// Shared pool of empty magazines.
///
/// Magazines cycle indefinitely between tiers; the pool keeps teardown churn
/// (depot shrink, zone destroy) from hitting the heap allocator every time.
pub(crate) struct MagazinePool {
    shelf: Mutex<Vec<Box<Magazine>>>,
}

/// Empty magazines retained across zones.
const SHELF_MAX: usize = 64;

impl MagazinePool {
    pub(crate) fn new() -> Self {
        Self {
            shelf: Mutex::new(Vec::new()),
        }
    }

    /// Hand out an empty magazine of the given capacity.
    pub(crate) fn alloc(&self, capacity: u16) -> Box<Magazine> {
        let mut shelf = self.shelf.lock().unwrap_or_else(PoisonError::into_inner);
        // Zones may differ in magazine capacity; only reuse a match.
        if let Some(pos) = shelf.iter().position(|m| m.capacity() == capacity) {
            return shelf.swap_remove(pos);
        }
        drop(shelf);
        Magazine::new(capacity)
    }

    /// Return an empty magazine.
    pub(crate) fn free(&self, mag: Box<Magazine>) {
        debug_assert!(mag.is_empty(), "non-empty magazine returned to pool");
        let mut shelf = self.shelf.lock().unwrap_or_else(PoisonError::into_inner);
        if shelf.len() < SHELF_MAX {
            shelf.push(mag);
        }
        // Otherwise drop: emergency pressure keeps the shelf bounded.
    }

    /// Drop every shelved magazine (memory-pressure response).
    pub(crate) fn purge(&self) {
        let mut shelf = self.shelf.lock().unwrap_or_else(PoisonError::into_inner);
        shelf.clear();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_order() {
        let mut mag = Magazine::new(4);
        for i in 0..4u32 {
            mag.push(ElementRef::new(0, i));
        }
        assert!(mag.is_full());
        assert_eq!(mag.pop(), Some(ElementRef::new(0, 3)));
        assert_eq!(mag.len(), 3);
    }

    #[test]
    fn test_pop_empty_is_none() {
        let mut mag = Magazine::new(2);
        assert!(mag.pop().is_none());
    }

    #[test]
    #[should_panic(expected = "magazine overflow")]
    fn test_overflow_panics() {
        let mut mag = Magazine::new(1);
        mag.push(ElementRef::new(0, 0));
        mag.push(ElementRef::new(0, 1));
    }

    #[test]
    fn test_pool_reuses_matching_capacity_only() {
        let _guard = crate::zone::TEST_MUTEX.read().unwrap();
        let pool = MagazinePool::new();
        let mag8 = pool.alloc(8);
        pool.free(mag8);

        // Different capacity: pool must hand out a fresh magazine.
        let mag4 = pool.alloc(4);
        assert_eq!(mag4.capacity(), 4);
        pool.free(mag4);

        let again = pool.alloc(8);
        assert_eq!(again.capacity(), 8);
        pool.free(again);
    }

    #[test]
    fn test_live_gauge_tracks_creation() {
        let _guard = crate::zone::TEST_MUTEX.write().unwrap();
        use crate::sync::atomic::Ordering;
        let before = crate::zone::stats::MAGAZINES_LIVE.load(Ordering::Relaxed);
        {
            let _a = Magazine::new(8);
            let _b = Magazine::new(8);
            assert_eq!(
                crate::zone::stats::MAGAZINES_LIVE.load(Ordering::Relaxed),
                before + 2
            );
        }
        assert_eq!(
            crate::zone::stats::MAGAZINES_LIVE.load(Ordering::Relaxed),
            before
        );
    }

    #[test]
    fn test_purge_empties_shelf() {
        let pool = MagazinePool::new();
        pool.free(Magazine::new(8));
        pool.purge();
        // After a purge the next alloc builds a fresh magazine; this mostly
        // checks that purge doesn't wedge the shelf lock.
        let mag = pool.alloc(8);
        assert!(mag.is_empty());
    }
}
