//! Free-list pool of batch objects.
//!
//! Avoids allocation churn on the publish hot path: consumed batches are
//! returned here by the consumer thread and handed back out reset for a new
//! key. The pool is a pure optimization — an empty pool allocates fresh.

use crate::metrics::batch::Batch;
use crate::metrics::key::MetricKey;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Pool usage counters for diagnostics
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Checkouts served from the free list
    pub hits: u64,
    /// Checkouts that had to allocate
    pub misses: u64,
    /// Batches currently available
    pub available: usize,
    /// Free-list capacity
    pub capacity: usize,
}

/// Bounded multi-producer/multi-consumer pool of [`Batch`] objects.
pub struct BatchPool {
    free: ArrayQueue<Arc<Batch>>,
    hits: AtomicU64,
    misses: AtomicU64,
    capacity: usize,
}

impl BatchPool {
    /// Creates an empty pool holding at most `capacity` idle batches
    pub fn new(capacity: usize) -> Self {
        BatchPool {
            free: ArrayQueue::new(capacity),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            capacity,
        }
    }

    /// Checks a batch out of the pool, reset for `key`.
    ///
    /// Allocates a fresh batch when the free list is empty.
    pub fn acquire(&self, key: MetricKey) -> Arc<Batch> {
        match self.free.pop() {
            Some(batch) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                batch.reset(key);
                batch
            },
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Arc::new(Batch::new(key))
            },
        }
    }

    /// Returns a consumed batch to the free list; dropped if the list is full
    pub fn release(&self, batch: Arc<Batch>) {
        let _ = self.free.push(batch);
    }

    /// Discards every idle batch (disable path)
    pub fn clear(&self) {
        while self.free.pop().is_some() {}
    }

    /// Returns pool usage counters
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            available: self.free.len(),
            capacity: self.capacity,
        }
    }
}
