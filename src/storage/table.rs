//! Page table
//!
//! One entry per logical page recording where its data lives. Each entry
//! has its own read/write lock, so operations on different pages never
//! contend, and a generation counter that is bumped whenever the entry is
//! replaced.
//!
//! ```text
//! index │ handle            │ size │ flags │ generation
//! ──────┼───────────────────┼──────┼───────┼───────────
//!   0   │ -                 │ 0    │       │ 0          unallocated
//!   1   │ -                 │ 0    │ ZERO  │ 1          zero page
//!   2   │ Handle(c=12,s=3)  │ 811  │       │ 4          compressed
//!   3   │ Handle(c=31,s=0)  │ 4096 │       │ 1          raw
//! ```

use super::pool::Handle;
use crate::error::{Error, Result};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-page flag bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageFlags(u8);

impl PageFlags {
    /// Page consists entirely of zeros
    pub const ZERO: PageFlags = PageFlags(1 << 0);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn contains(&self, other: PageFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn insert(&mut self, other: PageFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PageFlags) {
        self.0 &= !other.0;
    }
}

/// Snapshot of one page table entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageEntry {
    pub handle: Option<Handle>,
    pub size: usize,
    pub flags: PageFlags,
}

impl PageEntry {
    /// Entry for an all-zero page (no backing object)
    pub fn zero() -> Self {
        let mut flags = PageFlags::empty();
        flags.insert(PageFlags::ZERO);
        Self {
            handle: None,
            size: 0,
            flags,
        }
    }

    /// Entry for a page stored in the pool
    pub fn stored(handle: Handle, size: usize) -> Self {
        Self {
            handle: Some(handle),
            size,
            flags: PageFlags::empty(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.flags.contains(PageFlags::ZERO)
    }

    pub fn is_stored(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_unallocated(&self) -> bool {
        self.handle.is_none() && !self.is_zero()
    }
}

impl fmt::Display for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.handle {
            Some(handle) => write!(f, "{} ({} bytes)", handle, self.size),
            None if self.is_zero() => write!(f, "zero"),
            None => write!(f, "unallocated"),
        }
    }
}

struct Slot {
    entry: RwLock<PageEntry>,
    generation: AtomicU64,
}

/// Exclusive access to one entry
///
/// Every replacement through this guard bumps the entry's generation.
pub struct EntryGuard<'a> {
    entry: RwLockWriteGuard<'a, PageEntry>,
    generation: &'a AtomicU64,
}

impl EntryGuard<'_> {
    /// Current content
    pub fn get(&self) -> PageEntry {
        *self.entry
    }

    /// Install a new entry and return the displaced one
    pub fn replace(&mut self, new: PageEntry) -> PageEntry {
        let old = std::mem::replace(&mut *self.entry, new);
        self.generation.fetch_add(1, Ordering::AcqRel);
        old
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// Page-indexed table of entries
pub struct PageTable {
    slots: Box<[Slot]>,
}

impl PageTable {
    /// Create a table of unallocated entries
    ///
    /// Fails with `OutOfMemory` instead of aborting when the table itself
    /// cannot be allocated.
    pub fn new(num_pages: usize) -> Result<Self> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(num_pages)
            .map_err(|_| Error::OutOfMemory {
                requested: num_pages.saturating_mul(std::mem::size_of::<Slot>()),
            })?;
        slots.extend((0..num_pages).map(|_| Slot {
            entry: RwLock::new(PageEntry::default()),
            generation: AtomicU64::new(0),
        }));
        Ok(Self {
            slots: slots.into_boxed_slice(),
        })
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Read-only snapshot of an entry
    pub fn lookup(&self, index: usize) -> PageEntry {
        *self.slots[index].entry.read()
    }

    /// Replace an entry, returning the previous one for the caller to free
    pub fn install(
        &self,
        index: usize,
        handle: Option<Handle>,
        size: usize,
        flags: PageFlags,
    ) -> PageEntry {
        self.write(index).replace(PageEntry {
            handle,
            size,
            flags,
        })
    }

    /// Reset an entry to unallocated, returning what was there
    pub fn clear(&self, index: usize) -> PageEntry {
        self.write(index).replace(PageEntry::default())
    }

    /// Clear an entry only if it has not been replaced since `generation`
    pub fn clear_if(&self, index: usize, generation: u64) -> Option<PageEntry> {
        let mut guard = self.write(index);
        if guard.generation() != generation {
            return None;
        }
        Some(guard.replace(PageEntry::default()))
    }

    /// Current generation of an entry (lock-free)
    pub fn generation(&self, index: usize) -> u64 {
        self.slots[index].generation.load(Ordering::Acquire)
    }

    /// Shared access to an entry
    pub fn read(&self, index: usize) -> RwLockReadGuard<'_, PageEntry> {
        self.slots[index].entry.read()
    }

    /// Exclusive access to an entry
    pub fn write(&self, index: usize) -> EntryGuard<'_> {
        let slot = &self.slots[index];
        EntryGuard {
            entry: slot.entry.write(),
            generation: &slot.generation,
        }
    }

    /// Number of entries currently holding a pool object
    pub fn count_stored(&self) -> u64 {
        self.slots
            .iter()
            .filter(|slot| slot.entry.read().is_stored())
            .count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_lifecycle() -> Result<()> {
        let table = PageTable::new(4)?;
        assert_eq!(table.len(), 4);
        assert!(table.lookup(0).is_unallocated());

        let old = table.install(0, None, 0, PageFlags::ZERO);
        assert!(old.is_unallocated());
        assert!(table.lookup(0).is_zero());

        let handle = Handle::new(3, 7);
        let old = table.install(0, Some(handle), 811, PageFlags::empty());
        assert!(old.is_zero());
        assert_eq!(table.lookup(0), PageEntry::stored(handle, 811));

        let old = table.clear(0);
        assert_eq!(old.handle, Some(handle));
        assert!(table.lookup(0).is_unallocated());
        Ok(())
    }

    #[test]
    fn test_generation_bumps_on_replace() -> Result<()> {
        let table = PageTable::new(1)?;
        assert_eq!(table.generation(0), 0);

        table.install(0, Some(Handle::new(0, 0)), 10, PageFlags::empty());
        assert_eq!(table.generation(0), 1);

        table.clear(0);
        assert_eq!(table.generation(0), 2);
        Ok(())
    }

    #[test]
    fn test_clear_if_respects_generation() -> Result<()> {
        let table = PageTable::new(1)?;
        let first = Handle::new(1, 1);
        table.install(0, Some(first), 100, PageFlags::empty());
        let seen = table.generation(0);

        // Rewritten after the snapshot: must not be cleared
        let second = Handle::new(1, 2);
        table.install(0, Some(second), 120, PageFlags::empty());
        assert_eq!(table.clear_if(0, seen), None);
        assert_eq!(table.lookup(0).handle, Some(second));

        let current = table.generation(0);
        let cleared = table.clear_if(0, current).expect("generation matches");
        assert_eq!(cleared.handle, Some(second));
        assert!(table.lookup(0).is_unallocated());
        Ok(())
    }

    #[test]
    fn test_count_stored() -> Result<()> {
        let table = PageTable::new(3)?;
        table.install(0, Some(Handle::new(0, 0)), 40, PageFlags::empty());
        table.install(1, None, 0, PageFlags::ZERO);
        assert_eq!(table.count_stored(), 1);
        Ok(())
    }

    #[test]
    fn test_flags() {
        let mut flags = PageFlags::empty();
        assert!(!flags.contains(PageFlags::ZERO));
        flags.insert(PageFlags::ZERO);
        assert!(flags.contains(PageFlags::ZERO));
        flags.remove(PageFlags::ZERO);
        assert_eq!(flags, PageFlags::empty());
    }

    #[test]
    fn test_oversized_table_fails() {
        assert!(matches!(
            PageTable::new(usize::MAX),
            Err(Error::OutOfMemory { .. })
        ));
    }
}
