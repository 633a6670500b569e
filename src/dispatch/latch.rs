//! Flush synchronization primitives.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One-shot countdown gate.
///
/// Starts at a fixed count; `count_down` decrements it and every waiter is
/// released once it reaches zero. Counting down past zero is a no-op.
#[derive(Debug)]
pub struct CountDownLatch {
    count: Mutex<usize>,
    zeroed: Condvar,
}

impl CountDownLatch {
    /// Creates a latch that opens after `count` calls to `count_down`
    pub fn new(count: usize) -> Self {
        CountDownLatch {
            count: Mutex::new(count),
            zeroed: Condvar::new(),
        }
    }

    /// Decrements the count, releasing waiters when it hits zero
    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.zeroed.notify_all();
            }
        }
    }

    /// Blocks until the count reaches zero or the timeout elapses.
    ///
    /// Returns true when the latch opened in time.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.zeroed.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }

    /// Current count, for diagnostics
    pub fn count(&self) -> usize {
        *self.count.lock()
    }
}

/// Drain marker travelling through the trace queues.
///
/// FIFO queues guarantee every trace offered before the event is dequeued
/// first, so the consumer counting the latch down on sight of the event
/// proves everything ahead of it was drained. The event is never forwarded.
#[derive(Debug, Clone)]
pub struct FlushEvent {
    latch: Arc<CountDownLatch>,
}

impl FlushEvent {
    /// Creates an event whose latch waits for `queues` consumers
    pub fn new(queues: usize) -> Self {
        FlushEvent {
            latch: Arc::new(CountDownLatch::new(queues)),
        }
    }

    /// Marks one queue as drained up to this event
    pub fn acknowledge(&self) {
        self.latch.count_down();
    }

    /// Waits for every queue carrying this event to acknowledge it
    pub fn wait(&self, timeout: Duration) -> bool {
        self.latch.wait(timeout)
    }
}
