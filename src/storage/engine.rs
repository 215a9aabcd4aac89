//! Page store engine
//!
//! Reads and writes single logical pages: compress on write, decompress on
//! read, zero pages short-circuited, incompressible pages stored raw.
//!
//! # Locking
//!
//! A full-page write compresses, allocates and copies into the new object
//! before taking the entry's exclusive lock; the lock is held only for the
//! swap, and the displaced object is freed after it is released. Reads hold
//! the entry's shared lock while the object is mapped, so an overwrite
//! cannot free it underneath them. Partial writes hold the exclusive lock
//! across their read-modify-write.

use super::compression::Compressor;
use super::pool::ObjectPool;
use super::stats::{DeviceStats, StatsSnapshot};
use super::table::{PageEntry, PageTable};
use super::PAGE_SIZE;
use crate::error::{Error, Result};
use std::cell::RefCell;
use tracing::{debug, error, warn};

thread_local! {
    /// Per-thread compression output buffer
    static SCRATCH: RefCell<Vec<u8>> = RefCell::new(vec![0u8; PAGE_SIZE]);
}

/// True if every byte of the page is zero
pub fn is_zero_page(page: &[u8]) -> bool {
    page.iter().all(|&b| b == 0)
}

/// Compressed page storage over a page table and an object pool
pub struct PageStore<P: ObjectPool> {
    table: PageTable,
    pool: P,
    compressor: Compressor,
    stats: DeviceStats,
    /// Largest compressed size still stored compressed
    max_zpage_size: usize,
    disksize: u64,
}

impl<P: ObjectPool> PageStore<P> {
    /// Create a store for `disksize` bytes (a whole number of pages)
    ///
    /// Fails instead of aborting when the page table cannot be allocated.
    pub fn new(
        disksize: u64,
        pool: P,
        compressor: Compressor,
        max_zpage_size: usize,
    ) -> Result<Self> {
        let num_pages = usize::try_from(disksize / PAGE_SIZE as u64).map_err(|_| {
            Error::InvalidRequest(format!(
                "Disk size {} is not addressable on this platform",
                disksize
            ))
        })?;
        Ok(Self {
            table: PageTable::new(num_pages)?,
            pool,
            compressor,
            stats: DeviceStats::default(),
            max_zpage_size,
            disksize,
        })
    }

    pub fn num_pages(&self) -> u64 {
        self.table.len() as u64
    }

    pub fn disksize(&self) -> u64 {
        self.disksize
    }

    pub fn table(&self) -> &PageTable {
        &self.table
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats
            .snapshot(self.disksize, self.pool.total_bytes())
    }

    /// Validate a page index, counting rejections as invalid I/O
    pub fn check_index(&self, index: u64) -> Result<usize> {
        if index >= self.num_pages() {
            self.stats.inc_invalid_io();
            return Err(Error::InvalidRequest(format!(
                "Page index {} out of range (device has {} pages)",
                index,
                self.num_pages()
            )));
        }
        Ok(index as usize)
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        if len == 0 || offset.checked_add(len).map_or(true, |end| end > PAGE_SIZE) {
            self.stats.inc_invalid_io();
            return Err(Error::InvalidRequest(format!(
                "Range {}+{} does not fit in a {} byte page",
                offset, len, PAGE_SIZE
            )));
        }
        Ok(())
    }

    /// Store a full page
    pub fn write_page(&self, index: u64, page: &[u8]) -> Result<()> {
        let idx = self.check_index(index)?;
        if page.len() != PAGE_SIZE {
            self.stats.inc_invalid_io();
            return Err(Error::InvalidRequest(format!(
                "Write buffer is {} bytes, expected {}",
                page.len(),
                PAGE_SIZE
            )));
        }
        self.stats.inc_writes();

        let new = self.prepare(index, page)?;
        let mut guard = self.table.write(idx);
        let old = guard.replace(new);
        self.account(new);
        drop(guard);
        self.release(index, old);

        debug!(index, entry = %new, "Wrote page");
        Ok(())
    }

    /// Load a full page
    pub fn read_page(&self, index: u64, out: &mut [u8]) -> Result<()> {
        let idx = self.check_index(index)?;
        if out.len() != PAGE_SIZE {
            self.stats.inc_invalid_io();
            return Err(Error::InvalidRequest(format!(
                "Read buffer is {} bytes, expected {}",
                out.len(),
                PAGE_SIZE
            )));
        }
        self.stats.inc_reads();

        let entry = self.table.read(idx);
        let result = self.load(index, &entry, out);
        drop(entry);

        if let Err(e) = &result {
            self.stats.inc_failed_reads();
            warn!(index, error = %e, "Page read failed");
        }
        result
    }

    /// Read `out.len()` bytes starting at `offset` within a page
    pub fn read_partial(&self, index: u64, offset: usize, out: &mut [u8]) -> Result<()> {
        if offset == 0 && out.len() == PAGE_SIZE {
            return self.read_page(index, out);
        }
        let idx = self.check_index(index)?;
        self.check_range(offset, out.len())?;
        self.stats.inc_reads();

        let mut page = vec![0u8; PAGE_SIZE];
        let entry = self.table.read(idx);
        let result = self.load(index, &entry, &mut page);
        drop(entry);

        match result {
            Ok(()) => {
                out.copy_from_slice(&page[offset..offset + out.len()]);
                Ok(())
            }
            Err(e) => {
                self.stats.inc_failed_reads();
                warn!(index, offset, error = %e, "Partial page read failed");
                Err(e)
            }
        }
    }

    /// Overwrite `data.len()` bytes starting at `offset` within a page
    pub fn write_partial(&self, index: u64, offset: usize, data: &[u8]) -> Result<()> {
        if offset == 0 && data.len() == PAGE_SIZE {
            return self.write_page(index, data);
        }
        let idx = self.check_index(index)?;
        self.check_range(offset, data.len())?;
        self.stats.inc_writes();

        let mut guard = self.table.write(idx);
        let mut page = vec![0u8; PAGE_SIZE];
        if let Err(e) = self.load(index, &guard.get(), &mut page) {
            self.stats.inc_failed_writes();
            warn!(index, error = %e, "Could not read page for partial write");
            return Err(e);
        }
        page[offset..offset + data.len()].copy_from_slice(data);

        let new = self.prepare(index, &page)?;
        let old = guard.replace(new);
        self.account(new);
        drop(guard);
        self.release(index, old);

        debug!(index, offset, len = data.len(), entry = %new, "Wrote partial page");
        Ok(())
    }

    /// Free a page immediately
    pub fn free_page(&self, index: u64) -> Result<()> {
        let idx = self.check_index(index)?;
        let old = self.table.clear(idx);
        self.release(index, old);
        Ok(())
    }

    /// Free a page only if it is still at `generation`
    ///
    /// Returns true only if a zero or stored page was dropped; false when the
    /// page was rewritten after the free was requested or was already empty.
    pub fn reclaim(&self, index: u64, generation: u64) -> bool {
        let Some(idx) = usize::try_from(index)
            .ok()
            .filter(|&idx| idx < self.table.len())
        else {
            error!(index, "Reclaim of out-of-range page");
            return false;
        };
        match self.table.clear_if(idx, generation) {
            Some(old) => {
                let freed = old.is_stored() || old.is_zero();
                self.release(index, old);
                freed
            }
            None => false,
        }
    }

    /// Free every page; used when the device is torn down
    pub fn release_all(&self) -> u64 {
        let mut freed = 0;
        for idx in 0..self.table.len() {
            let old = self.table.clear(idx);
            if old.is_stored() {
                freed += 1;
            }
            self.release(idx as u64, old);
        }
        let leaked = self.pool.live_objects();
        if leaked != 0 {
            warn!(leaked, "Pool still holds objects after releasing all pages");
        }
        freed
    }

    /// Compress and copy a page into a new pool object (no table lock held)
    fn prepare(&self, index: u64, page: &[u8]) -> Result<PageEntry> {
        if is_zero_page(page) {
            return Ok(PageEntry::zero());
        }

        SCRATCH.with(|scratch| {
            let mut scratch = scratch.borrow_mut();
            let data: &[u8] = match self.compressor.compress(page, &mut scratch) {
                Ok(clen) if clen <= self.max_zpage_size => &scratch[..clen],
                Ok(clen) => {
                    debug!(index, clen, "Page stored uncompressed");
                    page
                }
                Err(e) => {
                    debug!(index, error = %e, "Compression failed, storing page uncompressed");
                    page
                }
            };

            let handle = self.pool.alloc(data.len()).map_err(|e| {
                self.stats.inc_failed_writes();
                warn!(index, size = data.len(), error = %e, "Error allocating memory for compressed page");
                e
            })?;

            match self.pool.map(handle) {
                Ok(mut mapping) => mapping[..data.len()].copy_from_slice(data),
                Err(e) => {
                    self.stats.inc_failed_writes();
                    if let Err(free_err) = self.pool.free(handle) {
                        error!(index, %handle, error = %free_err, "Failed to free unmapped object");
                    }
                    return Err(e);
                }
            }

            Ok(PageEntry::stored(handle, data.len()))
        })
    }

    /// Read an entry's content into `out` (caller holds the entry lock)
    fn load(&self, index: u64, entry: &PageEntry, out: &mut [u8]) -> Result<()> {
        // Zero and unallocated pages have no object
        let Some(handle) = entry.handle else {
            out.fill(0);
            return Ok(());
        };

        let mapping = self.pool.map(handle).map_err(|e| Error::CorruptData {
            index,
            reason: format!("cannot map {}: {}", handle, e),
        })?;
        if entry.size == PAGE_SIZE {
            out.copy_from_slice(&mapping[..PAGE_SIZE]);
            return Ok(());
        }
        self.compressor
            .decompress(&mapping[..entry.size], out)
            .map_err(|e| Error::CorruptData {
                index,
                reason: e.to_string(),
            })
    }

    fn account(&self, new: PageEntry) {
        if new.is_zero() {
            self.stats.inc_zero_pages();
        } else if new.is_stored() {
            self.stats.page_stored(new.size);
        }
    }

    /// Free a displaced entry's object after the table lock is released
    fn release(&self, index: u64, old: PageEntry) {
        if let Some(handle) = old.handle {
            if let Err(e) = self.pool.free(handle) {
                error!(index, %handle, error = %e, "Failed to free pool object");
            }
            self.stats.page_released(old.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, STRICT_MAX_ZPAGE_SIZE};
    use crate::storage::compression::CompressionAlgorithm;
    use crate::storage::pool::{CountingPool, PoolCounters};
    use std::sync::Arc;

    fn store(pages: u64) -> Result<(PageStore<CountingPool>, Arc<PoolCounters>)> {
        let counters = PoolCounters::new();
        let pool = CountingPool::slab(&PoolConfig::default(), counters.clone())?;
        let store = PageStore::new(
            pages * PAGE_SIZE as u64,
            pool,
            Compressor::new(CompressionAlgorithm::Zstd, 3),
            STRICT_MAX_ZPAGE_SIZE,
        )?;
        Ok((store, counters))
    }

    fn text_page() -> Vec<u8> {
        b"zblock page "
            .iter()
            .copied()
            .cycle()
            .take(PAGE_SIZE)
            .collect()
    }

    fn noise_page(seed: u32) -> Vec<u8> {
        // xorshift: enough entropy to defeat compression
        let mut x = seed.max(1);
        (0..PAGE_SIZE)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect()
    }

    #[test]
    fn test_compressed_round_trip() -> Result<()> {
        let (store, _) = store(4)?;
        let page = text_page();
        store.write_page(1, &page)?;

        let entry = store.table().lookup(1);
        assert!(entry.is_stored());
        assert!(entry.size < PAGE_SIZE / 2);

        let mut out = vec![0u8; PAGE_SIZE];
        store.read_page(1, &mut out)?;
        assert_eq!(out, page);

        let snap = store.snapshot();
        assert_eq!(snap.good_compress, 1);
        assert_eq!(snap.compr_data_size, entry.size as u64);
        Ok(())
    }

    #[test]
    fn test_incompressible_stored_raw() -> Result<()> {
        let (store, _) = store(2)?;
        let page = noise_page(7);
        store.write_page(0, &page)?;

        assert_eq!(store.table().lookup(0).size, PAGE_SIZE);
        let mut out = vec![0u8; PAGE_SIZE];
        store.read_page(0, &mut out)?;
        assert_eq!(out, page);
        assert_eq!(store.snapshot().bad_compress, 1);
        Ok(())
    }

    #[test]
    fn test_zero_page_skips_pool() -> Result<()> {
        let (store, counters) = store(2)?;
        store.write_page(0, &vec![0u8; PAGE_SIZE])?;

        assert!(store.table().lookup(0).is_zero());
        assert_eq!(counters.allocs(), 0);

        let mut out = vec![0xffu8; PAGE_SIZE];
        store.read_page(0, &mut out)?;
        assert!(is_zero_page(&out));
        assert_eq!(counters.maps(), 0);
        assert_eq!(store.snapshot().pages_zero, 1);
        Ok(())
    }

    #[test]
    fn test_overwrite_zero_with_data() -> Result<()> {
        let (store, counters) = store(1)?;
        store.write_page(0, &vec![0u8; PAGE_SIZE])?;
        store.write_page(0, &text_page())?;

        // pages_zero counts zero writes and never goes back down
        let snap = store.snapshot();
        assert_eq!(snap.pages_zero, 1);
        assert_eq!(snap.pages_stored, 1);
        assert_eq!(counters.live(), 1);

        store.write_page(0, &vec![0u8; PAGE_SIZE])?;
        let snap = store.snapshot();
        assert_eq!(snap.pages_zero, 2);
        assert_eq!(snap.pages_stored, 0);
        assert_eq!(counters.live(), 0);
        Ok(())
    }

    #[test]
    fn test_unallocated_reads_zero() -> Result<()> {
        let (store, counters) = store(3)?;
        let mut out = vec![1u8; PAGE_SIZE];
        store.read_page(2, &mut out)?;
        assert!(is_zero_page(&out));
        assert_eq!(counters.maps(), 0);
        Ok(())
    }

    #[test]
    fn test_out_of_range_and_bad_buffers() -> Result<()> {
        let (store, _) = store(2)?;
        let page = text_page();

        assert!(matches!(store.write_page(2, &page), Err(Error::InvalidRequest(_))));
        assert!(matches!(
            store.write_page(0, &page[..100]),
            Err(Error::InvalidRequest(_))
        ));
        let mut short = vec![0u8; 10];
        assert!(matches!(store.read_page(0, &mut short), Err(Error::InvalidRequest(_))));

        let snap = store.snapshot();
        assert_eq!(snap.invalid_io, 3);
        assert_eq!(snap.num_writes, 0);
        assert_eq!(snap.num_reads, 0);
        Ok(())
    }

    #[test]
    fn test_alloc_failure_keeps_old_page() -> Result<()> {
        let (store, counters) = store(1)?;
        let original = text_page();
        store.write_page(0, &original)?;

        counters.fail_allocs(true);
        let result = store.write_page(0, &noise_page(3));
        assert!(matches!(result, Err(Error::OutOfMemory { .. })));
        counters.fail_allocs(false);

        let mut out = vec![0u8; PAGE_SIZE];
        store.read_page(0, &mut out)?;
        assert_eq!(out, original);

        let snap = store.snapshot();
        assert_eq!(snap.failed_writes, 1);
        assert_eq!(snap.pages_stored, 1);
        Ok(())
    }

    #[test]
    fn test_corrupt_object_fails_read_only() -> Result<()> {
        let (store, _) = store(2)?;
        store.write_page(0, &text_page())?;
        store.write_page(1, &text_page())?;

        let handle = store.table().lookup(0).handle.unwrap();
        store.pool().map(handle)?.fill(0xAB);

        let mut out = vec![0u8; PAGE_SIZE];
        assert!(matches!(
            store.read_page(0, &mut out),
            Err(Error::CorruptData { index: 0, .. })
        ));
        store.read_page(1, &mut out)?;
        assert_eq!(out, text_page());
        assert_eq!(store.snapshot().failed_reads, 1);
        Ok(())
    }

    #[test]
    fn test_partial_round_trip() -> Result<()> {
        let (store, _) = store(1)?;
        store.write_partial(0, 512, b"hello")?;
        store.write_partial(0, 4000, b"tail")?;

        let mut out = [0u8; 5];
        store.read_partial(0, 512, &mut out)?;
        assert_eq!(&out, b"hello");

        let mut page = vec![0u8; PAGE_SIZE];
        store.read_page(0, &mut page)?;
        assert_eq!(&page[4000..4004], b"tail");
        assert!(is_zero_page(&page[..512]));

        assert!(store.write_partial(0, 4090, b"too long").is_err());
        Ok(())
    }

    #[test]
    fn test_reclaim_skips_rewritten_page() -> Result<()> {
        let (store, counters) = store(1)?;
        store.write_page(0, &text_page())?;
        let generation = store.table().generation(0);

        store.write_page(0, &noise_page(9))?;
        assert!(!store.reclaim(0, generation));
        assert_eq!(counters.live(), 1);

        let generation = store.table().generation(0);
        assert!(store.reclaim(0, generation));
        assert_eq!(counters.live(), 0);
        assert_eq!(store.snapshot().pages_stored, 0);
        Ok(())
    }

    #[test]
    fn test_release_all() -> Result<()> {
        let (store, counters) = store(8)?;
        for i in 0..8 {
            store.write_page(i, &noise_page(i as u32 + 1))?;
        }
        assert_eq!(store.release_all(), 8);
        assert_eq!(counters.live(), 0);
        assert_eq!(store.snapshot().pages_stored, 0);
        Ok(())
    }

    #[test]
    fn test_reclaim_reports_only_real_frees() -> Result<()> {
        let (store, counters) = store(3)?;
        store.write_page(1, &vec![0u8; PAGE_SIZE])?;
        store.write_page(2, &text_page())?;

        // Never written: clearing it frees nothing
        assert!(!store.reclaim(0, store.table().generation(0)));
        assert!(store.reclaim(1, store.table().generation(1)));
        assert!(store.reclaim(2, store.table().generation(2)));
        assert!(store.table().lookup(1).is_unallocated());
        assert_eq!(counters.live(), 0);

        // Already cleared: a second free is not counted
        assert!(!store.reclaim(2, store.table().generation(2)));
        Ok(())
    }

    #[test]
    fn test_unaddressable_disksize_fails() -> Result<()> {
        let pool = CountingPool::slab(&PoolConfig::default(), PoolCounters::new())?;
        let result = PageStore::new(
            u64::MAX,
            pool,
            Compressor::new(CompressionAlgorithm::Zstd, 3),
            PAGE_SIZE - 1,
        );
        assert!(matches!(
            result,
            Err(Error::OutOfMemory { .. }) | Err(Error::InvalidRequest(_))
        ));
        Ok(())
    }

    #[test]
    fn test_gauges_stay_in_range_under_same_index_writers() -> Result<()> {
        const WRITERS: u64 = 4;
        let (store, counters) = store(1)?;
        let done = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|scope| -> Result<()> {
            let sampler = scope.spawn(|| {
                let mut max_stored = 0;
                let mut max_bytes = 0;
                while !done.load(std::sync::atomic::Ordering::Acquire) {
                    let snap = store.snapshot();
                    max_stored = max_stored.max(snap.pages_stored);
                    max_bytes = max_bytes.max(snap.compr_data_size);
                }
                (max_stored, max_bytes)
            });

            let writers: Vec<_> = (0..WRITERS)
                .map(|t| {
                    let store = &store;
                    scope.spawn(move || -> Result<()> {
                        for round in 0..200 {
                            store.write_page(0, &noise_page((t * 1000 + round) as u32 + 1))?;
                        }
                        Ok(())
                    })
                })
                .collect();
            for writer in writers {
                writer.join().expect("writer panicked")?;
            }
            done.store(true, std::sync::atomic::Ordering::Release);

            // Each writer may hold one displaced page between swap and free
            let (max_stored, max_bytes) = sampler.join().expect("sampler panicked");
            assert!(max_stored <= WRITERS + 1, "pages_stored reached {}", max_stored);
            assert!(max_bytes <= (WRITERS + 1) * PAGE_SIZE as u64);
            Ok(())
        })?;

        assert_eq!(store.snapshot().pages_stored, 1);
        assert_eq!(counters.live(), 1);
        Ok(())
    }
}
