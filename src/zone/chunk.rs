//! Chunk metadata and occupancy tracking.
//!
//! A chunk is a contiguous run of backing pages subdivided into same-sized
//! elements. Each chunk tracks which elements are free in a bitmap: inline
//! words for small chunks, a block borrowed from the external bitmap service
//! for large ones. A set bit means "free".
//!
//! All of this state lives inside the owning zone's lock; nothing here
//! synchronizes on its own.

use std::ptr::NonNull;

use super::bitmap::{BitmapAllocator, BitmapRef};
use super::provider::ZoneError;

/// Bits available in the inline occupancy representation.
pub(crate) const INLINE_BITS: u32 = 256;
const INLINE_WORDS: usize = (INLINE_BITS as usize) / 64;

/// Opaque reference to one element of one zone.
///
/// Encodes (chunk slot, index-in-chunk); never a raw pointer. Consumed
/// references are validated against the owning chunk's recorded zone identity
/// before any bitmap transition.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ElementRef(u64);

impl ElementRef {
    pub(crate) fn new(chunk: u32, index: u32) -> Self {
        Self(u64::from(chunk) << 32 | u64::from(index))
    }

    pub(crate) fn chunk(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub(crate) fn index(self) -> u32 {
        self.0 as u32
    }
}

impl std::fmt::Debug for ElementRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ElementRef({}:{})", self.chunk(), self.index())
    }
}

enum Occupancy {
    Inline([u64; INLINE_WORDS]),
    External(BitmapRef),
}

/// Which chunk queue a chunk currently sits on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum QueueId {
    Empty,
    Partial,
    Full,
    /// Reserved address space with no populated pages (sequestered VA).
    Unpopulated,
    /// Temporarily off-queue (held by the grower or the reclaimer).
    None,
}

pub(crate) struct ChunkMeta {
    pub(crate) zone_id: u32,
    pub(crate) base: NonNull<u8>,
    /// Pages of reserved address space.
    pub(crate) va_pages: u32,
    /// Pages currently backed by physical memory.
    pub(crate) populated_pages: u32,
    /// Usable elements, derived from the populated span at growth time.
    pub(crate) capacity: u32,
    /// Bytes handed out of this chunk (counts recirc-parked elements).
    pub(crate) bytes_used: usize,
    occupancy: Option<Occupancy>,
    /// Round-robin scan position for [`take_free`](Self::take_free).
    cursor: u32,
    pub(crate) queue: QueueId,
    pub(crate) pos: u32,
}

// Safety: ChunkMeta owns its memory region exclusively; it is only ever
// accessed under the owning zone's lock.
unsafe impl Send for ChunkMeta {}

impl ChunkMeta {
    pub(crate) fn new(zone_id: u32, base: NonNull<u8>, va_pages: u32) -> Self {
        Self {
            zone_id,
            base,
            va_pages,
            populated_pages: 0,
            capacity: 0,
            bytes_used: 0,
            occupancy: None,
            cursor: 0,
            queue: QueueId::None,
            pos: 0,
        }
    }

    /// Install a fresh occupancy bitmap with all `capacity` elements free.
    ///
    /// `order` is `None` for the inline representation.
    pub(crate) fn init_occupancy(
        &mut self,
        capacity: u32,
        order: Option<u32>,
        bitmaps: &dyn BitmapAllocator,
    ) -> Result<(), ZoneError> {
        debug_assert!(self.occupancy.is_none(), "occupancy installed twice");
        let occ = match order {
            None => {
                debug_assert!(capacity <= INLINE_BITS);
                Occupancy::Inline([0; INLINE_WORDS])
            }
            Some(o) => Occupancy::External(bitmaps.allocate(o)?),
        };
        self.occupancy = Some(occ);
        self.capacity = capacity;
        self.bytes_used = 0;
        self.cursor = 0;

        let words = self.words_mut();
        let full_words = (capacity / 64) as usize;
        words[..full_words].fill(u64::MAX);
        if capacity % 64 != 0 {
            words[full_words] = (1u64 << (capacity % 64)) - 1;
        }
        Ok(())
    }

    /// Tear down the occupancy bitmap, returning external blocks to the pool.
    pub(crate) fn retire_occupancy(&mut self, bitmaps: &dyn BitmapAllocator) {
        if let Some(Occupancy::External(map)) = self.occupancy.take() {
            bitmaps.free(map);
        }
        self.capacity = 0;
        self.cursor = 0;
    }

    fn words(&self) -> &[u64] {
        match &self.occupancy {
            Some(Occupancy::Inline(ws)) => &ws[..],
            // Safety: exclusive access via &self under the zone lock; the
            // block is owned by this chunk until retired.
            Some(Occupancy::External(map)) => unsafe { map.as_slice() },
            None => panic!("chunk has no occupancy bitmap"),
        }
    }

    fn words_mut(&mut self) -> &mut [u64] {
        match &mut self.occupancy {
            Some(Occupancy::Inline(ws)) => &mut ws[..],
            // Safety: exclusive access via &mut self.
            Some(Occupancy::External(map)) => unsafe { map.as_slice_mut() },
            None => panic!("chunk has no occupancy bitmap"),
        }
    }

    /// Claim a free element, scanning round-robin from the cursor.
    ///
    /// The rotating start position keeps reuse order from being a pure LIFO,
    /// so freed-element addresses are not trivially predictable.
    pub(crate) fn take_free(&mut self) -> Option<u32> {
        let cap = self.capacity;
        if cap == 0 {
            return None;
        }
        let start = if self.cursor >= cap { 0 } else { self.cursor };
        let nwords = ((cap as usize) + 63) / 64;
        let first = (start / 64) as usize;
        let words = self.words_mut();

        // Bits past `capacity` are never set, so no tail masking is needed.
        for step in 0..=nwords {
            let w = (first + step) % nwords;
            let mut bits = words[w];
            if step == 0 {
                bits &= !0u64 << (start % 64);
            }
            if bits != 0 {
                let b = bits.trailing_zeros();
                let idx = (w as u32) * 64 + b;
                words[w] &= !(1u64 << b);
                self.cursor = if idx + 1 >= cap { 0 } else { idx + 1 };
                return Some(idx);
            }
        }
        None
    }

    /// Set the free bit for `idx`. Returns whether the bit was clear before
    /// (i.e. whether this transition actually freed the element).
    pub(crate) fn mark_free(&mut self, idx: u32) -> bool {
        self.check_index(idx);
        let words = self.words_mut();
        let (w, b) = ((idx / 64) as usize, idx % 64);
        let was_clear = words[w] & (1u64 << b) == 0;
        words[w] |= 1u64 << b;
        was_clear
    }

    /// Clear the free bit for `idx`. Returns whether the bit was set before
    /// (i.e. whether the element really was free).
    pub(crate) fn mark_used(&mut self, idx: u32) -> bool {
        self.check_index(idx);
        let words = self.words_mut();
        let (w, b) = ((idx / 64) as usize, idx % 64);
        let was_set = words[w] & (1u64 << b) != 0;
        words[w] &= !(1u64 << b);
        was_set
    }

    pub(crate) fn is_free(&self, idx: u32) -> bool {
        self.check_index(idx);
        let words = self.words();
        words[(idx / 64) as usize] & (1u64 << (idx % 64)) != 0
    }

    pub(crate) fn free_bits(&self) -> u32 {
        if self.occupancy.is_none() {
            return 0;
        }
        self.words().iter().map(|w| w.count_ones()).sum()
    }

    /// Randomize the scan start so early allocation patterns differ per chunk.
    pub(crate) fn scramble_cursor(&mut self, entropy: u64) {
        if self.capacity > 0 {
            self.cursor = (entropy % u64::from(self.capacity)) as u32;
        }
    }

    fn check_index(&self, idx: u32) {
        if idx >= self.capacity {
            panic!(
                "element index {idx} out of range for chunk of {} elements",
                self.capacity
            );
        }
    }
}

/// Fetch a live chunk by slot, panicking on accounting corruption.
pub(crate) fn chunk_ref(chunks: &[Option<ChunkMeta>], slot: u32) -> &ChunkMeta {
    match chunks.get(slot as usize) {
        Some(Some(meta)) => meta,
        _ => panic!("zone accounting: unknown chunk slot {slot}"),
    }
}

pub(crate) fn chunk_mut(chunks: &mut [Option<ChunkMeta>], slot: u32) -> &mut ChunkMeta {
    match chunks.get_mut(slot as usize) {
        Some(Some(meta)) => meta,
        _ => panic!("zone accounting: unknown chunk slot {slot}"),
    }
}

/// The four per-zone chunk queues, with O(1) membership updates.
///
/// Queue membership (empty/partial/full) is kept consistent with
/// `bytes_used` in the same critical section as every mutation.
#[derive(Default)]
pub(crate) struct ChunkQueues {
    empty: Vec<u32>,
    partial: Vec<u32>,
    full: Vec<u32>,
    unpopulated: Vec<u32>,
}

impl ChunkQueues {
    fn list(&self, q: QueueId) -> &Vec<u32> {
        match q {
            QueueId::Empty => &self.empty,
            QueueId::Partial => &self.partial,
            QueueId::Full => &self.full,
            QueueId::Unpopulated => &self.unpopulated,
            QueueId::None => panic!("QueueId::None is not a queue"),
        }
    }

    fn list_mut(&mut self, q: QueueId) -> &mut Vec<u32> {
        match q {
            QueueId::Empty => &mut self.empty,
            QueueId::Partial => &mut self.partial,
            QueueId::Full => &mut self.full,
            QueueId::Unpopulated => &mut self.unpopulated,
            QueueId::None => panic!("QueueId::None is not a queue"),
        }
    }

    pub(crate) fn head(&self, q: QueueId) -> Option<u32> {
        self.list(q).last().copied()
    }

    pub(crate) fn len(&self, q: QueueId) -> usize {
        self.list(q).len()
    }

    pub(crate) fn push(&mut self, chunks: &mut [Option<ChunkMeta>], q: QueueId, slot: u32) {
        let list = self.list_mut(q);
        let pos = list.len() as u32;
        list.push(slot);
        let meta = chunk_mut(chunks, slot);
        debug_assert_eq!(meta.queue, QueueId::None, "chunk pushed while queued");
        meta.queue = q;
        meta.pos = pos;
    }

    /// Detach `slot` from whatever queue it is on (no-op if off-queue).
    pub(crate) fn remove(&mut self, chunks: &mut [Option<ChunkMeta>], slot: u32) {
        let (q, pos) = {
            let meta = chunk_ref(chunks, slot);
            (meta.queue, meta.pos)
        };
        if q == QueueId::None {
            return;
        }
        let list = self.list_mut(q);
        debug_assert_eq!(list.get(pos as usize), Some(&slot), "queue pos corrupted");
        list.swap_remove(pos as usize);
        if let Some(&moved) = list.get(pos as usize) {
            chunk_mut(chunks, moved).pos = pos;
        }
        chunk_mut(chunks, slot).queue = QueueId::None;
    }

    pub(crate) fn requeue(&mut self, chunks: &mut [Option<ChunkMeta>], slot: u32, q: QueueId) {
        if chunk_ref(chunks, slot).queue == q {
            return;
        }
        self.remove(chunks, slot);
        self.push(chunks, q, slot);
    }
}
