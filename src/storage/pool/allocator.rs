//! Slab pool implementation

use super::handle::Handle;
use super::size_class::{calculate_size_classes, SizeClass};
use super::ObjectPool;
use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::storage::PAGE_SIZE;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Size-class object pool backed by in-memory chunks
///
/// Every size class owns a list of chunks; an object occupies one slot of
/// the smallest class that fits it. Chunks are only allocated when a class
/// runs out of free slots and are given back once empty. The total is
/// capped by `max_bytes`.
pub struct SlabPool {
    /// Size classes (sorted by size)
    size_classes: Vec<Mutex<SizeClass>>,
    /// Slot size of each class, for lock-free lookup
    class_sizes: Vec<usize>,
    max_bytes: Option<u64>,
    /// Bytes of chunk memory handed out across all classes
    reserved: AtomicU64,
}

impl SlabPool {
    /// Create a pool whose largest class holds a full page
    pub fn new(config: &PoolConfig) -> Result<Self> {
        if config.min_class_size == 0 || config.min_class_size > PAGE_SIZE {
            return Err(Error::Config(format!(
                "Invalid minimum class size {}",
                config.min_class_size
            )));
        }
        if config.slots_per_chunk == 0 {
            return Err(Error::Config("slots_per_chunk must be non-zero".to_string()));
        }

        let sizes = calculate_size_classes(config.min_class_size, PAGE_SIZE);
        info!(
            classes = sizes.len(),
            max_bytes = ?config.max_bytes,
            "Initializing slab pool"
        );
        debug!(?sizes, "Slab pool size classes");

        let size_classes = sizes
            .iter()
            .enumerate()
            .map(|(index, &size)| {
                Mutex::new(SizeClass::new(index as u16, size, config.slots_per_chunk))
            })
            .collect();

        Ok(Self {
            size_classes,
            class_sizes: sizes,
            max_bytes: config.max_bytes,
            reserved: AtomicU64::new(0),
        })
    }

    /// Number of size classes
    pub fn num_classes(&self) -> usize {
        self.size_classes.len()
    }

    /// Slot size of a size class
    pub fn class_size(&self, index: usize) -> Option<usize> {
        self.class_sizes.get(index).copied()
    }

    /// Per-class statistics
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();

        for sc in &self.size_classes {
            let sc = sc.lock();
            let class_stats = SizeClassStats {
                index: sc.index as usize,
                slot_size: sc.slot_size,
                reserved_bytes: sc.reserved_bytes(),
                free_slots: sc.free_count() as u64,
                live_objects: sc.live_count(),
            };
            stats.total_reserved += class_stats.reserved_bytes;
            stats.live_objects += class_stats.live_objects;
            stats.size_classes.push(class_stats);
        }

        stats
    }

    fn class_for(&self, size: usize) -> Result<usize> {
        let idx = self.class_sizes.partition_point(|&slot_size| slot_size < size);
        if idx == self.class_sizes.len() {
            return Err(Error::Pool(format!(
                "Object size {} exceeds largest size class {}",
                size, PAGE_SIZE
            )));
        }
        Ok(idx)
    }

    /// Account for a new chunk, failing if it would exceed the limit
    fn reserve(&self, bytes: usize) -> bool {
        let bytes = bytes as u64;
        let limit = self.max_bytes.unwrap_or(u64::MAX);
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(bytes).filter(|&total| total <= limit)
            })
            .is_ok()
    }

    fn class(&self, handle: Handle) -> Result<&Mutex<SizeClass>> {
        self.size_classes
            .get(handle.size_class())
            .ok_or_else(|| Error::Pool(format!("Invalid size class in {}", handle)))
    }
}

impl ObjectPool for SlabPool {
    type Mapping = SlabMapping;

    fn alloc(&self, size: usize) -> Result<Handle> {
        if size == 0 {
            return Err(Error::Pool("Zero-sized allocation".to_string()));
        }
        let idx = self.class_for(size)?;

        let mut sc = self.size_classes[idx].lock();
        debug_assert!(sc.can_fit(size));
        if !sc.has_capacity() {
            let chunk_bytes = sc.chunk_bytes();
            if !self.reserve(chunk_bytes) {
                warn!(size, class = idx, "Slab pool limit reached");
                return Err(Error::OutOfMemory { requested: size });
            }
            sc.grow();
            debug!(class = idx, chunk_bytes, "Grew size class");
        }
        let slot = sc
            .allocate()
            .ok_or_else(|| Error::Pool(format!("Size class {} has no free slot", idx)))?;

        Ok(Handle::new(idx as u16, slot))
    }

    fn free(&self, handle: Handle) -> Result<()> {
        let mut sc = self.class(handle)?.lock();
        let before = sc.reserved_bytes();
        if !sc.free(handle.slot()) {
            return Err(Error::Pool(format!("Free of unallocated {}", handle)));
        }
        let released = before - sc.reserved_bytes();
        if released > 0 {
            self.reserved.fetch_sub(released, Ordering::AcqRel);
            debug!(class = handle.size_class(), released, "Released empty chunk");
        }
        Ok(())
    }

    fn map(&self, handle: Handle) -> Result<SlabMapping> {
        let (chunk, start, len) = {
            let sc = self.class(handle)?.lock();
            let (chunk, start) = sc
                .locate(handle.slot())
                .ok_or_else(|| Error::Pool(format!("Map of unallocated {}", handle)))?;
            (chunk, start, sc.slot_size)
        };
        // Class lock is released before blocking on the chunk
        Ok(SlabMapping {
            guard: chunk.lock_arc(),
            start,
            len,
        })
    }

    fn total_bytes(&self) -> u64 {
        self.reserved.load(Ordering::Acquire)
    }

    fn live_objects(&self) -> u64 {
        self.size_classes.iter().map(|sc| sc.lock().live_count()).sum()
    }
}

/// Scoped view of one object; dropping it unmaps the object
pub struct SlabMapping {
    guard: ArcMutexGuard<RawMutex, Box<[u8]>>,
    start: usize,
    len: usize,
}

impl Deref for SlabMapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard[self.start..self.start + self.len]
    }
}

impl DerefMut for SlabMapping {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard[self.start..self.start + self.len]
    }
}

/// Statistics for the slab pool
#[derive(Debug, Default)]
pub struct PoolStats {
    pub size_classes: Vec<SizeClassStats>,
    pub total_reserved: u64,
    pub live_objects: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct SizeClassStats {
    pub index: usize,
    pub slot_size: usize,
    pub reserved_bytes: u64,
    pub free_slots: u64,
    pub live_objects: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(max_bytes: Option<u64>) -> Result<SlabPool> {
        SlabPool::new(&PoolConfig {
            min_class_size: 32,
            slots_per_chunk: 4,
            max_bytes,
        })
    }

    #[test]
    fn test_pool_basic() -> Result<()> {
        let pool = small_pool(None)?;

        let handle = pool.alloc(100)?;
        let class_size = pool.class_size(handle.size_class()).unwrap();
        assert!(class_size >= 100);

        {
            let mut mapping = pool.map(handle)?;
            assert_eq!(mapping.len(), class_size);
            mapping[..12].copy_from_slice(b"Hello, Slab!");
        }

        let mapping = pool.map(handle)?;
        assert_eq!(&mapping[..12], b"Hello, Slab!");
        drop(mapping);

        pool.free(handle)?;
        assert_eq!(pool.live_objects(), 0);
        Ok(())
    }

    #[test]
    fn test_pool_reuse() -> Result<()> {
        let pool = small_pool(None)?;

        let first = pool.alloc(50)?;
        let second = pool.alloc(50)?;
        assert_ne!(first, second);

        pool.free(first)?;
        assert_eq!(pool.alloc(50)?, first);
        Ok(())
    }

    #[test]
    fn test_full_page_fits() -> Result<()> {
        let pool = small_pool(None)?;
        let handle = pool.alloc(PAGE_SIZE)?;
        assert_eq!(pool.map(handle)?.len(), PAGE_SIZE);
        assert!(matches!(pool.alloc(PAGE_SIZE + 1), Err(Error::Pool(_))));
        Ok(())
    }

    #[test]
    fn test_pool_limit() -> Result<()> {
        // Room for exactly one chunk of 4 full pages
        let pool = small_pool(Some(4 * PAGE_SIZE as u64))?;
        for _ in 0..4 {
            pool.alloc(PAGE_SIZE)?;
        }
        assert!(matches!(
            pool.alloc(PAGE_SIZE),
            Err(Error::OutOfMemory { .. })
        ));
        assert_eq!(pool.total_bytes(), 4 * PAGE_SIZE as u64);
        Ok(())
    }

    #[test]
    fn test_freed_chunks_return_to_limit() -> Result<()> {
        let pool = small_pool(Some(4 * PAGE_SIZE as u64))?;
        let handles = (0..4)
            .map(|_| pool.alloc(PAGE_SIZE))
            .collect::<Result<Vec<_>>>()?;
        for handle in handles {
            pool.free(handle)?;
        }
        assert_eq!(pool.total_bytes(), 0);
        assert_eq!(pool.stats().total_reserved, 0);

        // The released budget is available to another class
        pool.alloc(100)?;
        assert!(pool.total_bytes() > 0);
        Ok(())
    }

    #[test]
    fn test_invalid_free_and_map() -> Result<()> {
        let pool = small_pool(None)?;
        let handle = pool.alloc(64)?;
        pool.free(handle)?;

        assert!(matches!(pool.free(handle), Err(Error::Pool(_))));
        assert!(pool.map(handle).is_err());
        assert!(pool.free(Handle::new(999, 0)).is_err());
        Ok(())
    }

    #[test]
    fn test_pool_stats() -> Result<()> {
        let pool = small_pool(None)?;
        pool.alloc(50)?;
        pool.alloc(100)?;
        pool.alloc(2000)?;

        let stats = pool.stats();
        assert_eq!(stats.size_classes.len(), pool.num_classes());
        assert_eq!(stats.live_objects, 3);
        assert_eq!(stats.total_reserved, pool.total_bytes());
        Ok(())
    }
}
