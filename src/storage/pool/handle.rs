//! Opaque object handles

use std::fmt;

/// Reference to an object in the pool
///
/// Packs the size class index and the slot number within that class.
/// Everything outside the pool treats it as an opaque token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u64);

impl Handle {
    /// Create a new handle
    pub fn new(size_class: u16, slot: u32) -> Self {
        Self(((size_class as u64) << 32) | slot as u64)
    }

    /// Size class index (0 = smallest)
    pub fn size_class(&self) -> usize {
        (self.0 >> 32) as usize
    }

    /// Slot number within the size class
    pub fn slot(&self) -> u32 {
        self.0 as u32
    }

    /// Raw token value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle(class={}, slot={})", self.size_class(), self.slot())
    }
}
