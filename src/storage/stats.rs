//! Device statistics
//!
//! Everything is a counter that only grows, except `pages_stored` and
//! `compr_size`, which follow the pages currently held by the device.

use super::PAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Stored sizes at or below this count as good compression
pub const GOOD_COMPRESS_MAX: usize = PAGE_SIZE / 2;
/// Stored sizes at or above this count as bad compression
pub const BAD_COMPRESS_MIN: usize = PAGE_SIZE / 4 * 3;

/// Live statistics of one initialized device
#[derive(Debug, Default)]
pub struct DeviceStats {
    // counters
    num_reads: AtomicU64,
    num_writes: AtomicU64,
    failed_reads: AtomicU64,
    failed_writes: AtomicU64,
    invalid_io: AtomicU64,
    notify_free: AtomicU64,
    pages_zero: AtomicU64,
    good_compress: AtomicU64,
    bad_compress: AtomicU64,
    // gauges
    compr_size: AtomicU64,
    pages_stored: AtomicU64,
}

impl DeviceStats {
    pub fn inc_reads(&self) {
        self.num_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_writes(&self) {
        self.num_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed_reads(&self) {
        self.failed_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed_writes(&self) {
        self.failed_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_invalid_io(&self) {
        self.invalid_io.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_notify_free(&self) {
        self.notify_free.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_zero_pages(&self) {
        self.pages_zero.fetch_add(1, Ordering::Relaxed);
    }

    /// Account for a page of `size` stored bytes entering the pool
    pub fn page_stored(&self, size: usize) {
        self.pages_stored.fetch_add(1, Ordering::Relaxed);
        self.compr_size.fetch_add(size as u64, Ordering::Relaxed);
        if size <= GOOD_COMPRESS_MAX {
            self.good_compress.fetch_add(1, Ordering::Relaxed);
        } else if size >= BAD_COMPRESS_MIN {
            self.bad_compress.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Account for a stored page of `size` bytes leaving the pool
    pub fn page_released(&self, size: usize) {
        self.pages_stored.fetch_sub(1, Ordering::Relaxed);
        self.compr_size.fetch_sub(size as u64, Ordering::Relaxed);
    }

    pub fn pages_stored(&self) -> u64 {
        self.pages_stored.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self, disksize: u64, mem_used_total: u64) -> StatsSnapshot {
        let pages_stored = self.pages_stored.load(Ordering::Relaxed);
        StatsSnapshot {
            disksize,
            num_reads: self.num_reads.load(Ordering::Relaxed),
            num_writes: self.num_writes.load(Ordering::Relaxed),
            failed_reads: self.failed_reads.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
            invalid_io: self.invalid_io.load(Ordering::Relaxed),
            notify_free: self.notify_free.load(Ordering::Relaxed),
            pages_zero: self.pages_zero.load(Ordering::Relaxed),
            pages_stored,
            good_compress: self.good_compress.load(Ordering::Relaxed),
            bad_compress: self.bad_compress.load(Ordering::Relaxed),
            orig_data_size: pages_stored * PAGE_SIZE as u64,
            compr_data_size: self.compr_size.load(Ordering::Relaxed),
            mem_used_total,
        }
    }
}

/// Read-only copy of the device statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub disksize: u64,
    pub num_reads: u64,
    pub num_writes: u64,
    pub failed_reads: u64,
    pub failed_writes: u64,
    pub invalid_io: u64,
    pub notify_free: u64,
    pub pages_zero: u64,
    pub pages_stored: u64,
    pub good_compress: u64,
    pub bad_compress: u64,
    /// Uncompressed size of the stored pages
    pub orig_data_size: u64,
    /// Bytes held by stored pages
    pub compr_data_size: u64,
    /// Memory held by the object pool, including fragmentation
    pub mem_used_total: u64,
}

impl StatsSnapshot {
    /// orig_data_size / compr_data_size (0 when nothing is stored)
    pub fn compression_ratio(&self) -> f64 {
        if self.compr_data_size == 0 {
            0.0
        } else {
            self.orig_data_size as f64 / self.compr_data_size as f64
        }
    }

    /// Mirror the snapshot into the metrics facade
    pub fn publish(&self, device: &str) {
        let values = [
            ("zblock_disksize_bytes", self.disksize),
            ("zblock_reads_total", self.num_reads),
            ("zblock_writes_total", self.num_writes),
            ("zblock_failed_reads_total", self.failed_reads),
            ("zblock_failed_writes_total", self.failed_writes),
            ("zblock_invalid_io_total", self.invalid_io),
            ("zblock_notify_free_total", self.notify_free),
            ("zblock_zero_pages_total", self.pages_zero),
            ("zblock_pages_stored", self.pages_stored),
            ("zblock_good_compress_total", self.good_compress),
            ("zblock_bad_compress_total", self.bad_compress),
            ("zblock_orig_data_bytes", self.orig_data_size),
            ("zblock_compr_data_bytes", self.compr_data_size),
            ("zblock_mem_used_bytes", self.mem_used_total),
        ];
        for (name, value) in values {
            metrics::gauge!(name, "device" => device.to_string()).set(value as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_buckets() {
        let stats = DeviceStats::default();
        stats.page_stored(1000); // good
        stats.page_stored(3000); // neither
        stats.page_stored(PAGE_SIZE); // bad (raw)

        let snap = stats.snapshot(0, 0);
        assert_eq!(snap.pages_stored, 3);
        assert_eq!(snap.good_compress, 1);
        assert_eq!(snap.bad_compress, 1);
        assert_eq!(snap.compr_data_size, 1000 + 3000 + PAGE_SIZE as u64);
        assert_eq!(snap.orig_data_size, 3 * PAGE_SIZE as u64);

        // Buckets count writes; only the gauges follow frees
        stats.page_released(1000);
        stats.page_released(PAGE_SIZE);
        let snap = stats.snapshot(0, 0);
        assert_eq!(snap.pages_stored, 1);
        assert_eq!(snap.good_compress, 1);
        assert_eq!(snap.bad_compress, 1);
        assert_eq!(snap.compr_data_size, 3000);
    }

    #[test]
    fn test_zero_pages_only_grow() {
        let stats = DeviceStats::default();
        stats.inc_zero_pages();
        stats.page_stored(PAGE_SIZE);
        stats.inc_zero_pages();
        assert_eq!(stats.snapshot(0, 0).pages_zero, 2);
    }

    #[test]
    fn test_compression_ratio() {
        let snap = StatsSnapshot {
            orig_data_size: 8192,
            compr_data_size: 2048,
            ..Default::default()
        };
        assert_eq!(snap.compression_ratio(), 4.0);
        assert_eq!(StatsSnapshot::default().compression_ratio(), 0.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = DeviceStats::default();
        stats.inc_reads();
        stats.inc_invalid_io();
        let json = serde_json::to_value(stats.snapshot(4096, 0)).unwrap();
        assert_eq!(json["num_reads"], 1);
        assert_eq!(json["invalid_io"], 1);
        assert_eq!(json["disksize"], 4096);
    }

    #[test]
    fn test_publish_without_recorder_is_noop() {
        StatsSnapshot::default().publish("zblock0");
    }
}
