//! Deferred slot reclamation
//!
//! Slot-free notifications may arrive in contexts that must not block on
//! the allocator, so they are only queued here. A dedicated worker thread
//! drains the queue in batches; I/O paths and `flush` can also drain it
//! inline. Each pending free carries the entry generation observed when it
//! was submitted, and is skipped if the page has been rewritten since.

use super::engine::PageStore;
use super::pool::ObjectPool;
use crate::error::Result;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

/// One queued free request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingFree {
    pub index: u64,
    pub generation: u64,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<PendingFree>,
    /// Worker has been woken for the current contents of `pending`
    scheduled: bool,
    /// Batches taken but not yet applied
    in_flight: usize,
    shutdown: bool,
}

struct Shared<P: ObjectPool> {
    store: Arc<PageStore<P>>,
    state: Mutex<QueueState>,
    wakeup: Condvar,
    idle: Condvar,
}

impl<P: ObjectPool> Shared<P> {
    /// Detach the whole queue, marking it in flight
    fn take_batch(&self) -> Vec<PendingFree> {
        let mut state = self.state.lock();
        let batch = std::mem::take(&mut state.pending);
        if !batch.is_empty() {
            state.in_flight += 1;
        }
        batch
    }

    fn apply_batch(&self, batch: &[PendingFree]) -> usize {
        let mut freed = 0;
        for free in batch {
            if self.store.reclaim(free.index, free.generation) {
                freed += 1;
            } else {
                debug!(index = free.index, "Page rewritten since free was queued, skipping");
            }
        }
        trace!(requested = batch.len(), freed, "Applied pending frees");

        let mut state = self.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.idle.notify_all();
        }
        freed
    }
}

/// Queue of pending frees plus the worker that drains it
pub struct Reclaimer<P: ObjectPool> {
    shared: Arc<Shared<P>>,
    worker: Option<JoinHandle<()>>,
}

impl<P: ObjectPool> Reclaimer<P> {
    /// Start the background worker for `store`
    pub fn start(store: Arc<PageStore<P>>) -> Result<Self> {
        let shared = Arc::new(Shared {
            store,
            state: Mutex::new(QueueState::default()),
            wakeup: Condvar::new(),
            idle: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("zblock-reclaim".to_string())
            .spawn(move || Self::worker_loop(worker_shared))?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Queue a free; never touches the allocator or the page table
    pub fn submit(&self, index: u64, generation: u64) {
        let mut state = self.shared.state.lock();
        state.pending.push(PendingFree { index, generation });
        if !state.scheduled {
            state.scheduled = true;
            self.shared.wakeup.notify_one();
        }
    }

    /// Number of frees not yet taken by anyone
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Apply everything queued so far on the calling thread
    ///
    /// Returns once every free submitted before the call has been applied,
    /// including batches the worker took first.
    pub fn drain_now(&self) -> usize {
        let batch = self.shared.take_batch();
        let freed = if batch.is_empty() {
            0
        } else {
            self.shared.apply_batch(&batch)
        };

        let mut state = self.shared.state.lock();
        while state.in_flight > 0 {
            self.shared.idle.wait(&mut state);
        }
        freed
    }

    /// Stop the worker and discard whatever is still queued
    pub fn shutdown(mut self) -> usize {
        self.stop()
    }

    fn stop(&mut self) -> usize {
        let discarded = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.wakeup.notify_all();
            std::mem::take(&mut state.pending).len()
        };
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Reclaim worker panicked");
            }
        }
        if discarded > 0 {
            debug!(discarded, "Discarded pending frees");
        }
        discarded
    }

    fn worker_loop(shared: Arc<Shared<P>>) {
        debug!("Reclaim worker started");
        loop {
            {
                let mut state = shared.state.lock();
                while state.pending.is_empty() && !state.shutdown {
                    state.scheduled = false;
                    shared.wakeup.wait(&mut state);
                }
                if state.shutdown {
                    break;
                }
                state.scheduled = false;
            }
            let batch = shared.take_batch();
            if !batch.is_empty() {
                shared.apply_batch(&batch);
            }
        }
        debug!("Reclaim worker stopped");
    }
}

impl<P: ObjectPool> Drop for Reclaimer<P> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}
