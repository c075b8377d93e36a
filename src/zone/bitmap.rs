//! External occupancy-bitmap service.
//!
//! Chunks holding more elements than fit the inline bitmap borrow their
//! occupancy words from this service. The zone layer only depends on the
//! [`BitmapAllocator`] trait; [`BitmapPool`] is the default implementation,
//! a power-of-two segregated pool carved out of heap slabs.

use std::ptr::NonNull;

use fixedbitset::FixedBitSet;

use super::provider::ZoneError;
use crate::sync::Mutex;
use crate::sync::PoisonError;

/// Words per slab. 8 KiB of bitmap per slab, enough for 64 Ki element bits.
const SLAB_WORDS: usize = 1024;

/// Largest block order: one whole slab.
pub(crate) const MAX_ORDER: u32 = SLAB_WORDS.trailing_zeros();

/// A borrowed run of `1 << order` occupancy words.
///
/// Exclusively owned by one chunk at a time; the words are only read or
/// written while the owning zone's lock is held.
#[derive(Debug)]
pub struct BitmapRef {
    ptr: NonNull<u64>,
    offset: u32,
    order: u8,
}

// Safety: a BitmapRef is an exclusively-owned handle into pool-owned slabs;
// the pool keeps the slabs alive for its own lifetime.
unsafe impl Send for BitmapRef {}

impl BitmapRef {
    pub(crate) fn words(&self) -> usize {
        1usize << self.order
    }

    /// # Safety
    /// Caller must hold exclusive access to the referenced words (the chunk
    /// owning this ref, under its zone lock).
    pub(crate) unsafe fn as_slice_mut(&mut self) -> &mut [u64] {
        // Safety: upheld by caller; the pool never moves slabs.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.words()) }
    }

    /// # Safety
    /// Same aliasing requirements as [`as_slice_mut`](Self::as_slice_mut).
    pub(crate) unsafe fn as_slice(&self) -> &[u64] {
        // Safety: upheld by caller.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.words()) }
    }
}

/// Allocator for chunk occupancy bitmaps.
pub trait BitmapAllocator: Send + Sync {
    /// Allocate `1 << order` zeroed words.
    fn allocate(&self, order: u32) -> Result<BitmapRef, ZoneError>;

    /// Return a bitmap. Double-frees are fatal.
    fn free(&self, map: BitmapRef);
}

struct PoolState {
    slabs: Vec<Box<[u64]>>,
    /// Free block start offsets, indexed by order.
    free: Vec<Vec<u32>>,
    /// Start offsets of live (handed-out) blocks, for double-free detection.
    live: FixedBitSet,
}

/// Default [`BitmapAllocator`]: segregated free lists over heap slabs.
///
/// Blocks are split down from whole slabs on demand and returned to their
/// order's free list on free; freed blocks are not coalesced (bitmap sizes
/// repeat per zone geometry, so lists stay hot).
pub struct BitmapPool {
    state: Mutex<PoolState>,
}

impl Default for BitmapPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BitmapPool {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState {
                slabs: Vec::new(),
                free: vec![Vec::new(); MAX_ORDER as usize + 1],
                live: FixedBitSet::new(),
            }),
        }
    }

    fn word_ptr(state: &mut PoolState, offset: u32) -> NonNull<u64> {
        let slab = (offset as usize) / SLAB_WORDS;
        let idx = (offset as usize) % SLAB_WORDS;
        // Boxed slices never move; the pointer stays valid for the pool's life.
        let ptr = state.slabs[slab][idx..].as_mut_ptr();
        // Safety: indexing above guarantees a non-null in-bounds pointer.
        unsafe { NonNull::new_unchecked(ptr) }
    }
}

impl BitmapAllocator for BitmapPool {
    fn allocate(&self, order: u32) -> Result<BitmapRef, ZoneError> {
        assert!(
            order <= MAX_ORDER,
            "bitmap order {order} exceeds maximum {MAX_ORDER}"
        );
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        // Find the smallest order with a free block, splitting downward.
        let mut have = None;
        for o in order..=MAX_ORDER {
            if !state.free[o as usize].is_empty() {
                have = Some(o);
                break;
            }
        }
        let have = match have {
            Some(o) => o,
            None => {
                // Grow by one slab, inserted as a single max-order block.
                let slab = vec![0u64; SLAB_WORDS].into_boxed_slice();
                let offset = (state.slabs.len() * SLAB_WORDS) as u32;
                state.slabs.push(slab);
                let total_words = state.slabs.len() * SLAB_WORDS;
                state.live.grow(total_words);
                state.free[MAX_ORDER as usize].push(offset);
                MAX_ORDER
            }
        };

        let offset = match state.free[have as usize].pop() {
            Some(off) => off,
            None => panic!("bitmap pool free list corrupted at order {have}"),
        };
        for o in (order..have).rev() {
            // Split: keep the low half, shelve the high half at order o.
            state.free[o as usize].push(offset + (1u32 << o));
        }

        if state.live.put(offset as usize) {
            panic!("bitmap pool handed out live block at offset {offset}");
        }

        let ptr = Self::word_ptr(&mut state, offset);
        let mut map = BitmapRef {
            ptr,
            offset,
            order: order as u8,
        };
        // Safety: freshly allocated, exclusively ours until returned.
        unsafe { map.as_slice_mut().fill(0) };
        Ok(map)
    }

    fn free(&self, map: BitmapRef) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.live.contains(map.offset as usize) {
            panic!("double free of bitmap block at offset {}", map.offset);
        }
        state.live.set(map.offset as usize, false);
        state.free[map.order as usize].push(map.offset);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_zeroed() {
        let pool = BitmapPool::new();
        let mut map = pool.allocate(2).unwrap();
        assert_eq!(map.words(), 4);
        // Safety: exclusively owned in this test.
        let words = unsafe { map.as_slice_mut() };
        assert!(words.iter().all(|&w| w == 0));
        words[3] = u64::MAX;
        pool.free(map);
    }

    #[test]
    fn test_reuse_is_zeroed_again() {
        let pool = BitmapPool::new();
        let mut map = pool.allocate(0).unwrap();
        // Safety: exclusively owned.
        unsafe { map.as_slice_mut()[0] = 0xDEAD_BEEF };
        pool.free(map);

        let map2 = pool.allocate(0).unwrap();
        // Safety: exclusively owned.
        assert_eq!(unsafe { map2.as_slice()[0] }, 0, "reused block not zeroed");
        pool.free(map2);
    }

    #[test]
    fn test_distinct_blocks_do_not_alias() {
        let pool = BitmapPool::new();
        let mut maps: Vec<_> = (0..16).map(|_| pool.allocate(3).unwrap()).collect();
        for (i, map) in maps.iter_mut().enumerate() {
            // Safety: each block exclusively owned.
            unsafe { map.as_slice_mut().fill(i as u64) };
        }
        for (i, map) in maps.iter().enumerate() {
            // Safety: each block exclusively owned.
            assert!(unsafe { map.as_slice() }.iter().all(|&w| w == i as u64));
        }
        for map in maps {
            pool.free(map);
        }
    }

    #[test]
    fn test_growth_spans_multiple_slabs() {
        let pool = BitmapPool::new();
        // Two max-order blocks force two slab growths; the second block's
        // offset lands past the first slab's words.
        let a = pool.allocate(MAX_ORDER).unwrap();
        let b = pool.allocate(MAX_ORDER).unwrap();
        assert_ne!(a.offset, b.offset);
        assert_eq!(b.offset as usize % SLAB_WORDS, 0);
        pool.free(a);
        pool.free(b);
    }

    #[test]
    fn test_whole_slab_order() {
        let pool = BitmapPool::new();
        let map = pool.allocate(MAX_ORDER).unwrap();
        assert_eq!(map.words(), SLAB_WORDS);
        pool.free(map);
    }

    #[test]
    #[should_panic(expected = "double free of bitmap block")]
    fn test_double_free_panics() {
        let pool = BitmapPool::new();
        let map = pool.allocate(1).unwrap();
        let dup = BitmapRef {
            ptr: map.ptr,
            offset: map.offset,
            order: map.order,
        };
        pool.free(map);
        pool.free(dup);
    }

    #[test]
    fn test_split_then_refill_same_order() {
        let pool = BitmapPool::new();
        // Drain a few small blocks, free them, and check reuse works at the
        // same order without growing another slab.
        let a = pool.allocate(1).unwrap();
        let b = pool.allocate(1).unwrap();
        let (off_a, off_b) = (a.offset, b.offset);
        assert_ne!(off_a, off_b);
        pool.free(a);
        pool.free(b);
        let c = pool.allocate(1).unwrap();
        assert!(c.offset == off_a || c.offset == off_b);
        pool.free(c);
    }
}
