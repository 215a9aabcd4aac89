//! Device controller
//!
//! Owns the lifecycle of one compressed block device:
//!
//! ```text
//! Uninitialized ──init──→ Initialized ──reset──→ Uninitialized
//! ```
//!
//! I/O holds the shared side of the lifecycle lock for its whole duration;
//! init and reset take the exclusive side, so a reset waits for in-flight
//! requests and no request ever sees a half-built device.

use super::compression::Compressor;
use super::engine::PageStore;
use super::pool::{ObjectPool, PoolBuilder, SlabPool};
use super::reclaim::Reclaimer;
use super::stats::StatsSnapshot;
use super::{MAX_NUM_DEVICES, PAGE_SIZE, SECTOR_SIZE};
use crate::config::{DeviceConfig, DEFAULT_DISKSIZE_PERC_RAM};
use crate::error::{Error, Result};
use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use std::sync::Arc;
use sysinfo::System;
use tracing::{debug, info, instrument, warn};

/// State that exists only while the device is initialized
struct Active<P: ObjectPool> {
    store: Arc<PageStore<P>>,
    reclaimer: Reclaimer<P>,
}

impl<P: ObjectPool> Active<P> {
    fn drain_if(&self, enabled: bool) {
        if enabled {
            let freed = self.reclaimer.drain_now();
            if freed > 0 {
                debug!(freed, "Drained pending frees before I/O");
            }
        }
    }

    /// Validate a sector-aligned byte range, counting rejections
    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        let sector = SECTOR_SIZE as u64;
        let valid = len > 0
            && offset % sector == 0
            && len as u64 % sector == 0
            && offset
                .checked_add(len as u64)
                .map_or(false, |end| end <= self.store.disksize());
        if !valid {
            self.store.stats().inc_invalid_io();
            return Err(Error::InvalidRequest(format!(
                "Range {}+{} is not sector aligned or exceeds the {} byte device",
                offset,
                len,
                self.store.disksize()
            )));
        }
        Ok(())
    }

    fn submit_free(&self, index: u64) -> Result<()> {
        let idx = self.store.check_index(index)?;
        self.store.stats().inc_notify_free();
        let generation = self.store.table().generation(idx);
        self.reclaimer.submit(index, generation);
        Ok(())
    }
}

/// Split `[offset, offset + len)` into per-page `(index, offset_in_page, len)`
fn page_segments(offset: u64, len: usize) -> impl Iterator<Item = (u64, usize, usize)> {
    let page = PAGE_SIZE as u64;
    let end = offset + len as u64;
    let mut pos = offset;
    std::iter::from_fn(move || {
        if pos >= end {
            return None;
        }
        let index = pos / page;
        let in_page = (pos % page) as usize;
        let seg = (PAGE_SIZE - in_page).min((end - pos) as usize);
        pos += seg as u64;
        Some((index, in_page, seg))
    })
}

/// Physical memory of the host in bytes
fn total_ram() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.total_memory()
}

/// A compressed in-memory block device
pub struct Device<P: ObjectPool = SlabPool> {
    name: String,
    config: DeviceConfig,
    /// Size used by the next `init(0)`
    disksize: Mutex<u64>,
    pool_builder: PoolBuilder<P>,
    active: RwLock<Option<Active<P>>>,
}

impl Device<SlabPool> {
    /// Create an uninitialized device backed by a slab pool
    pub fn new(config: DeviceConfig) -> Result<Self> {
        Self::with_pool_builder(config, Box::new(SlabPool::new))
    }
}

impl<P: ObjectPool> Device<P> {
    /// Create an uninitialized device with a custom pool
    pub fn with_pool_builder(config: DeviceConfig, pool_builder: PoolBuilder<P>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: "zblock0".to_string(),
            disksize: Mutex::new(config.disksize),
            config,
            pool_builder,
            active: RwLock::new(None),
        })
    }

    /// Rename the device (used in logs and metric labels)
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.active.read().is_some()
    }

    /// Set the size used by the next `init(0)`
    pub fn set_disksize(&self, bytes: u64) -> Result<()> {
        let active = self.active.write();
        if active.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        let rounded = bytes - bytes % PAGE_SIZE as u64;
        *self.disksize.lock() = rounded;
        info!(device = %self.name, disksize = rounded, "Disk size set");
        Ok(())
    }

    /// Current capacity, or the pending size when uninitialized
    pub fn disksize(&self) -> u64 {
        match self.active.read().as_ref() {
            Some(active) => active.store.disksize(),
            None => *self.disksize.lock(),
        }
    }

    /// Number of logical pages (0 when uninitialized)
    pub fn num_pages(&self) -> u64 {
        self.active
            .read()
            .as_ref()
            .map_or(0, |active| active.store.num_pages())
    }

    /// Bring the device up with `disksize` bytes of capacity
    ///
    /// A size of 0 uses the size set earlier, falling back to a share of
    /// physical RAM.
    #[instrument(skip(self), fields(device = %self.name))]
    pub fn init(&self, disksize: u64) -> Result<()> {
        let mut active = self.active.write();
        if active.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let requested = if disksize != 0 {
            disksize
        } else {
            *self.disksize.lock()
        };
        let disksize = self.resolve_disksize(requested)?;

        let pool = (self.pool_builder)(&self.config.pool)?;
        let compressor = Compressor::new(self.config.compression, self.config.compression_level);
        let algorithm = compressor.algorithm();
        let store = Arc::new(PageStore::new(
            disksize,
            pool,
            compressor,
            self.config.max_zpage_size,
        )?);
        let reclaimer = Reclaimer::start(Arc::clone(&store))?;

        info!(
            disksize,
            num_pages = store.num_pages(),
            compression = algorithm.as_str(),
            "Device initialized"
        );
        *self.disksize.lock() = disksize;
        *active = Some(Active { store, reclaimer });
        Ok(())
    }

    fn resolve_disksize(&self, requested: u64) -> Result<u64> {
        let ram = total_ram();
        let disksize = if requested == 0 {
            let default = ram * DEFAULT_DISKSIZE_PERC_RAM / 100;
            info!(
                disksize = default,
                "Disk size not set, using {}% of RAM", DEFAULT_DISKSIZE_PERC_RAM
            );
            default
        } else {
            requested
        };

        if ram > 0 && disksize > ram.saturating_mul(2) {
            warn!(
                disksize,
                ram,
                "Disk size is more than twice the size of RAM; \
                 memory is wasted if the device is not filled"
            );
        }

        let rounded = disksize - disksize % PAGE_SIZE as u64;
        if rounded == 0 {
            return Err(Error::InvalidRequest(format!(
                "Disk size {} is smaller than one page",
                disksize
            )));
        }
        Ok(rounded)
    }

    /// Tear the device down and free everything it holds
    #[instrument(skip(self), fields(device = %self.name))]
    pub fn reset(&self) -> Result<()> {
        let mut guard = self.active.write();
        let active = guard.take().ok_or(Error::NotInitialized)?;

        let discarded = active.reclaimer.shutdown();
        let freed = active.store.release_all();
        *self.disksize.lock() = self.config.disksize;

        info!(freed, discarded, "Device reset");
        Ok(())
    }

    fn active(&self) -> Result<MappedRwLockReadGuard<'_, Active<P>>> {
        RwLockReadGuard::try_map(self.active.read(), |active| active.as_ref())
            .map_err(|_| Error::NotInitialized)
    }

    /// Read one page into `out` (`PAGE_SIZE` bytes)
    pub fn read_page(&self, index: u64, out: &mut [u8]) -> Result<()> {
        let active = self.active()?;
        active.store.check_index(index)?;
        active.drain_if(self.config.reclaim_on_io);
        active.store.read_page(index, out)
    }

    /// Write one page from `page` (`PAGE_SIZE` bytes)
    pub fn write_page(&self, index: u64, page: &[u8]) -> Result<()> {
        let active = self.active()?;
        active.store.check_index(index)?;
        active.drain_if(self.config.reclaim_on_io);
        active.store.write_page(index, page)
    }

    /// Read a sector-aligned byte range
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let active = self.active()?;
        active.check_range(offset, buf.len())?;
        active.drain_if(self.config.reclaim_on_io);

        let mut done = 0;
        for (index, in_page, len) in page_segments(offset, buf.len()) {
            active
                .store
                .read_partial(index, in_page, &mut buf[done..done + len])?;
            done += len;
        }
        Ok(())
    }

    /// Write a sector-aligned byte range
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let active = self.active()?;
        active.check_range(offset, data.len())?;
        active.drain_if(self.config.reclaim_on_io);

        let mut done = 0;
        for (index, in_page, len) in page_segments(offset, data.len()) {
            active
                .store
                .write_partial(index, in_page, &data[done..done + len])?;
            done += len;
        }
        Ok(())
    }

    /// Drop the pages fully covered by a sector-aligned range
    ///
    /// Frees go through the reclaimer; partial pages at either end keep
    /// their content. Returns the number of pages queued.
    pub fn discard(&self, offset: u64, len: u64) -> Result<u64> {
        let active = self.active()?;
        let len = usize::try_from(len).map_err(|_| {
            active.store.stats().inc_invalid_io();
            Error::InvalidRequest(format!("Discard length {} too large", len))
        })?;
        active.check_range(offset, len)?;

        let page = PAGE_SIZE as u64;
        let first = offset.div_ceil(page);
        let end = (offset + len as u64) / page;
        for index in first..end {
            active.submit_free(index)?;
        }
        let queued = end.saturating_sub(first);
        debug!(device = %self.name, offset, len, queued, "Discard");
        Ok(queued)
    }

    /// Notify that a page's content is no longer needed
    ///
    /// Only queues the free; safe to call from contexts that must not
    /// block on the allocator.
    pub fn submit_free(&self, index: u64) -> Result<()> {
        self.active()?.submit_free(index)
    }

    /// Apply all queued frees now; returns how many pages were freed
    pub fn flush_pending_frees(&self) -> Result<usize> {
        Ok(self.active()?.reclaimer.drain_now())
    }

    /// Statistics snapshot (all zero when uninitialized)
    pub fn stats(&self) -> StatsSnapshot {
        match self.active.read().as_ref() {
            Some(active) => active.store.snapshot(),
            None => StatsSnapshot::default(),
        }
    }

    /// Publish the current statistics to the metrics recorder
    pub fn publish_metrics(&self) {
        self.stats().publish(&self.name);
    }
}

/// A fixed set of devices sharing one configuration
pub struct DeviceSet {
    devices: Vec<Device>,
}

impl DeviceSet {
    /// Create `num_devices` uninitialized devices named `zblock0`, `zblock1`, ...
    pub fn new(num_devices: usize, config: DeviceConfig) -> Result<Self> {
        if num_devices == 0 || num_devices > MAX_NUM_DEVICES {
            return Err(Error::InvalidRequest(format!(
                "Invalid number of devices: {} (must be 1..={})",
                num_devices, MAX_NUM_DEVICES
            )));
        }
        let devices = (0..num_devices)
            .map(|i| Ok(Device::new(config.clone())?.named(format!("zblock{}", i))))
            .collect::<Result<Vec<_>>>()?;
        info!(num_devices, "Created devices");
        Ok(Self { devices })
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Device> {
        self.devices.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    /// Reset every initialized device
    pub fn reset_all(&self) -> Result<()> {
        for device in self.devices.iter().filter(|d| d.is_initialized()) {
            device.reset()?;
        }
        Ok(())
    }
}
