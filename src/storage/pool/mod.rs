//! Object pool
//!
//! Heap of variable-sized objects addressed by opaque handles. The page
//! store only relies on the `ObjectPool` contract; `SlabPool` is the
//! default implementation.
//!
//! # Architecture
//!
//! ```text
//! SlabPool
//!   ├─→ SizeClass(32B)   → chunks: [c0]      free: [3, 7]
//!   ├─→ SizeClass(40B)   → chunks: [c0, c1]  free: []
//!   ├─→ ...
//!   └─→ SizeClass(4096B) → chunks: [c0]      free: [1]
//!
//! Handle = (class index, slot)  →  chunk = slot / slots_per_chunk
//! ```
//!
//! Each size class has its own lock for alloc/free; mappings lock the chunk
//! holding the object, so two mappings of the same handle never overlap.

pub mod allocator;
pub mod handle;
pub mod mock;
pub mod size_class;

pub use allocator::{PoolStats, SizeClassStats, SlabMapping, SlabPool};
pub use handle::Handle;
pub use mock::{CountingPool, PoolCounters};
pub use size_class::SizeClass;

use crate::config::PoolConfig;
use crate::error::Result;
use std::ops::DerefMut;

/// Contract between the page store and its object allocator
///
/// Implementations must be safe to call from many threads for different
/// handles at once.
pub trait ObjectPool: Send + Sync + 'static {
    /// Scoped byte view of one object; dropping it is the unmap
    type Mapping: DerefMut<Target = [u8]>;

    /// Allocate an object of `size` bytes
    fn alloc(&self, size: usize) -> Result<Handle>;

    /// Release an object
    fn free(&self, handle: Handle) -> Result<()>;

    /// Map an object; the view is at least as long as the allocation
    fn map(&self, handle: Handle) -> Result<Self::Mapping>;

    /// Bytes of memory held by the pool
    fn total_bytes(&self) -> u64;

    /// Number of live objects
    fn live_objects(&self) -> u64;
}

/// Creates a fresh pool each time a device is initialized
pub type PoolBuilder<P> = Box<dyn Fn(&PoolConfig) -> Result<P> + Send + Sync>;
