//! Size class bookkeeping for the slab pool

use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// Backing memory for `slots_per_chunk` objects of one size class
pub type Chunk = Arc<Mutex<Box<[u8]>>>;

/// A size class manages slots of a specific size
///
/// Memory is carved out of fixed-size chunks that are allocated on demand
/// and dropped again once their last object is freed. Free slots go to a
/// min-heap so the lowest slot is reused first, which keeps live objects
/// packed into the oldest chunks and lets the newer ones drain.
#[derive(Debug)]
pub struct SizeClass {
    /// Size of slots in this class (bytes)
    pub slot_size: usize,
    /// Index of this size class
    pub index: u16,
    slots_per_chunk: usize,
    /// `None` marks a released chunk whose position can be reused
    chunks: Vec<Option<Chunk>>,
    /// Live objects per chunk
    chunk_live: Vec<u32>,
    /// Free slots of present chunks
    free_slots: BinaryHeap<Reverse<u32>>,
    live: Vec<bool>,
    live_count: u64,
}

impl SizeClass {
    /// Create a new, empty size class
    pub fn new(index: u16, slot_size: usize, slots_per_chunk: usize) -> Self {
        Self {
            slot_size,
            index,
            slots_per_chunk,
            chunks: Vec::new(),
            chunk_live: Vec::new(),
            free_slots: BinaryHeap::new(),
            live: Vec::new(),
            live_count: 0,
        }
    }

    /// Bytes of one backing chunk
    pub fn chunk_bytes(&self) -> usize {
        self.slot_size * self.slots_per_chunk
    }

    /// Whether `allocate` can succeed without a new chunk
    pub fn has_capacity(&self) -> bool {
        !self.free_slots.is_empty()
    }

    /// Add one chunk of backing memory, filling the lowest released position
    pub fn grow(&mut self) {
        let chunk = vec![0u8; self.chunk_bytes()].into_boxed_slice();
        let chunk = Some(Arc::new(Mutex::new(chunk)));
        let position = match self.chunks.iter().position(Option::is_none) {
            Some(position) => {
                self.chunks[position] = chunk;
                position
            }
            None => {
                self.chunks.push(chunk);
                self.chunk_live.push(0);
                self.live.resize(self.chunks.len() * self.slots_per_chunk, false);
                self.chunks.len() - 1
            }
        };
        let first = position * self.slots_per_chunk;
        self.free_slots
            .extend((first..first + self.slots_per_chunk).map(|slot| Reverse(slot as u32)));
    }

    /// Allocate a slot from this size class
    ///
    /// Returns None when the class needs to grow first.
    pub fn allocate(&mut self) -> Option<u32> {
        let Reverse(slot) = self.free_slots.pop()?;
        self.live[slot as usize] = true;
        self.chunk_live[slot as usize / self.slots_per_chunk] += 1;
        self.live_count += 1;
        Some(slot)
    }

    /// Return a slot to the free heap
    ///
    /// A chunk left without live objects is released. Returns false if the
    /// slot was not live.
    pub fn free(&mut self, slot: u32) -> bool {
        match self.live.get_mut(slot as usize) {
            Some(live) if *live => {
                *live = false;
                self.live_count -= 1;
                let chunk = slot as usize / self.slots_per_chunk;
                self.chunk_live[chunk] -= 1;
                if self.chunk_live[chunk] == 0 {
                    self.release_chunk(chunk);
                } else {
                    self.free_slots.push(Reverse(slot));
                }
                true
            }
            _ => false,
        }
    }

    fn release_chunk(&mut self, chunk: usize) {
        self.chunks[chunk] = None;
        let range = (chunk * self.slots_per_chunk) as u32..((chunk + 1) * self.slots_per_chunk) as u32;
        self.free_slots.retain(|Reverse(slot)| !range.contains(slot));

        // Trailing holes are dropped entirely
        while matches!(self.chunks.last(), Some(None)) {
            self.chunks.pop();
            self.chunk_live.pop();
        }
        self.live.truncate(self.chunks.len() * self.slots_per_chunk);
    }

    /// Chunk and byte offset holding a live slot
    pub fn locate(&self, slot: u32) -> Option<(Chunk, usize)> {
        if !self.live.get(slot as usize).copied().unwrap_or(false) {
            return None;
        }
        let slot = slot as usize;
        let chunk = self.chunks[slot / self.slots_per_chunk].clone()?;
        Some((chunk, (slot % self.slots_per_chunk) * self.slot_size))
    }

    /// Check if a given size fits in this size class
    pub fn can_fit(&self, size: usize) -> bool {
        size <= self.slot_size
    }

    /// Number of live objects
    pub fn live_count(&self) -> u64 {
        self.live_count
    }

    /// Number of free slots in already allocated chunks
    pub fn free_count(&self) -> usize {
        self.capacity() - self.live_count as usize
    }

    /// Bytes of backing memory held by this class
    pub fn reserved_bytes(&self) -> u64 {
        (self.present_chunks() * self.chunk_bytes()) as u64
    }

    fn present_chunks(&self) -> usize {
        self.chunks.iter().filter(|chunk| chunk.is_some()).count()
    }

    fn capacity(&self) -> usize {
        self.present_chunks() * self.slots_per_chunk
    }
}

/// Calculate size classes with ~20% growth factor
///
/// Always ends with `max_size` so that every size up to it has a class.
pub fn calculate_size_classes(min_size: usize, max_size: usize) -> Vec<usize> {
    let mut classes = Vec::new();
    let mut current = min_size.max(1);

    while current < max_size {
        classes.push(current);
        // Grow by 20%, keeping 8-byte alignment
        let next = ((current as f64 * 1.2).ceil() as usize + 7) & !7;
        current = next.max(current + 8);
    }
    classes.push(max_size);

    classes
}
