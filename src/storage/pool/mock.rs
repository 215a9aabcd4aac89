//! Instrumented pool for testing
//!
//! Wraps another pool and counts every call made through the contract, so
//! tests can check which paths touch the allocator. Allocation failures can
//! be injected to exercise out-of-memory handling.

use super::{Handle, ObjectPool, SlabPool};
use crate::config::PoolConfig;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Call counters shared between a `CountingPool` and the test holding it
#[derive(Debug, Default)]
pub struct PoolCounters {
    allocs: AtomicU64,
    frees: AtomicU64,
    maps: AtomicU64,
    fail_allocs: AtomicBool,
}

impl PoolCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn allocs(&self) -> u64 {
        self.allocs.load(Ordering::SeqCst)
    }

    pub fn frees(&self) -> u64 {
        self.frees.load(Ordering::SeqCst)
    }

    pub fn maps(&self) -> u64 {
        self.maps.load(Ordering::SeqCst)
    }

    /// Allocations minus frees
    pub fn live(&self) -> u64 {
        self.allocs() - self.frees()
    }

    /// Make every following allocation fail with `OutOfMemory`
    pub fn fail_allocs(&self, fail: bool) {
        self.fail_allocs.store(fail, Ordering::SeqCst);
    }
}

/// Pool wrapper that records allocator traffic
pub struct CountingPool<P: ObjectPool = SlabPool> {
    inner: P,
    counters: Arc<PoolCounters>,
}

impl<P: ObjectPool> CountingPool<P> {
    pub fn new(inner: P, counters: Arc<PoolCounters>) -> Self {
        Self { inner, counters }
    }

    pub fn counters(&self) -> &Arc<PoolCounters> {
        &self.counters
    }
}

impl CountingPool<SlabPool> {
    /// Build a counting slab pool
    pub fn slab(config: &PoolConfig, counters: Arc<PoolCounters>) -> Result<Self> {
        Ok(Self::new(SlabPool::new(config)?, counters))
    }
}

impl<P: ObjectPool> ObjectPool for CountingPool<P> {
    type Mapping = P::Mapping;

    fn alloc(&self, size: usize) -> Result<Handle> {
        if self.counters.fail_allocs.load(Ordering::SeqCst) {
            return Err(Error::OutOfMemory { requested: size });
        }
        let handle = self.inner.alloc(size)?;
        self.counters.allocs.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    fn free(&self, handle: Handle) -> Result<()> {
        self.inner.free(handle)?;
        self.counters.frees.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn map(&self, handle: Handle) -> Result<P::Mapping> {
        self.counters.maps.fetch_add(1, Ordering::SeqCst);
        self.inner.map(handle)
    }

    fn total_bytes(&self) -> u64 {
        self.inner.total_bytes()
    }

    fn live_objects(&self) -> u64 {
        self.inner.live_objects()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_pool_counts() -> Result<()> {
        let counters = PoolCounters::new();
        let pool = CountingPool::slab(&PoolConfig::default(), counters.clone())?;

        let handle = pool.alloc(128)?;
        drop(pool.map(handle)?);
        pool.free(handle)?;

        assert_eq!(counters.allocs(), 1);
        assert_eq!(counters.maps(), 1);
        assert_eq!(counters.frees(), 1);
        assert_eq!(counters.live(), 0);
        Ok(())
    }

    #[test]
    fn test_injected_alloc_failure() -> Result<()> {
        let counters = PoolCounters::new();
        let pool = CountingPool::slab(&PoolConfig::default(), counters.clone())?;

        counters.fail_allocs(true);
        assert!(matches!(
            pool.alloc(64),
            Err(Error::OutOfMemory { requested: 64 })
        ));
        assert_eq!(counters.allocs(), 0);

        counters.fail_allocs(false);
        pool.alloc(64)?;
        assert_eq!(counters.allocs(), 1);
        Ok(())
    }
}
