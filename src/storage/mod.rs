//! Storage layer
//!
//! # Architecture
//!
//! A device presents a fixed number of 4 KiB logical pages. Each page is
//! compressed and kept in an object pool; the page table maps page indices
//! to pool handles:
//!
//! ```text
//! Device ──init/reset──→ Active
//!                          ├─→ PageStore
//!                          │     ├─→ PageTable   (index → handle, size, flags)
//!                          │     ├─→ ObjectPool  (handle → bytes)
//!                          │     ├─→ Compressor  (zstd | lz4)
//!                          │     └─→ DeviceStats
//!                          └─→ Reclaimer     (pending frees + worker thread)
//! ```
//!
//! ## Write path
//!
//! - All-zero pages are recorded with the ZERO flag and take no pool memory
//! - Pages compressing to more than `max_zpage_size` are stored raw
//! - The new object is filled before the table entry is swapped, and the
//!   displaced object is freed after the entry lock is released
//!
//! ## Read path
//!
//! - Zero and never-written pages read back as zeros without touching the pool
//! - Raw pages are copied, everything else is decompressed

pub mod compression;
pub mod device;
pub mod engine;
pub mod pool;
pub mod reclaim;
pub mod stats;
pub mod table;

/// Logical page size in bytes
pub const PAGE_SIZE: usize = 4096;

/// Addressing unit of byte-range I/O
pub const SECTOR_SIZE: usize = 512;

/// Upper bound on the devices in one `DeviceSet`
pub const MAX_NUM_DEVICES: usize = 32;

pub use compression::{CompressionAlgorithm, Compressor};
pub use device::{Device, DeviceSet};
pub use engine::PageStore;
pub use pool::{Handle, ObjectPool, SlabPool};
pub use reclaim::Reclaimer;
pub use stats::{DeviceStats, StatsSnapshot};
pub use table::{PageEntry, PageFlags, PageTable};
