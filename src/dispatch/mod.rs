//! Backpressure-policy trace dispatch.
//!
//! Finished traces are routed into one or two bounded lock-free queues
//! under a selectable policy. Policies differ in what they sacrifice when
//! a queue is full: latency (spin until it fits), dropped-priority traces,
//! or overflow into a secondary lane. A [`FlushEvent`] pushed through the
//! same queues gives callers a synchronous drain barrier.
//!
//! The queues are drained by the external writer that owns the encoder;
//! on seeing a [`WorkItem::Flush`] it must acknowledge the event and not
//! forward it.

#![warn(missing_docs)]

pub mod latch;

pub use latch::{CountDownLatch, FlushEvent};

use crate::core::types::priority;
use crate::core::{DispatchConfig, Trace};
use crossbeam::queue::ArrayQueue;
use crossbeam::utils::Backoff;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Element type of the dispatch queues.
#[derive(Debug, Clone)]
pub enum WorkItem {
    /// A finished trace awaiting serialization
    Trace(Trace),
    /// A drain barrier; acknowledge on sight, never forward
    Flush(FlushEvent),
}

/// Bounded multi-producer queue shared with the draining writer.
pub type TraceQueue = Arc<ArrayQueue<WorkItem>>;

/// Selectable backpressure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prioritization {
    /// Kept traces never drop: spin until the primary queue accepts.
    /// Dropped traces go best-effort to the secondary.
    EnsureTrace,
    /// Best-effort everywhere: kept to primary, dropped to secondary
    FastLane,
    /// Everything tries the primary; overflowing kept traces spill to the
    /// secondary, overflowing dropped traces are abandoned.
    DeadLetters,
    /// Dropped traces are rejected outright; kept best-effort to primary
    Drop,
}

impl Prioritization {
    /// Binds the policy to its queues
    pub fn strategy(
        self,
        primary: TraceQueue,
        secondary: TraceQueue,
    ) -> Box<dyn PrioritizationStrategy> {
        match self {
            Prioritization::EnsureTrace => Box::new(EnsureTraceStrategy { primary, secondary }),
            Prioritization::FastLane => Box::new(FastLaneStrategy { primary, secondary }),
            Prioritization::DeadLetters => Box::new(DeadLettersStrategy { primary, secondary }),
            Prioritization::Drop => Box::new(DropStrategy { primary }),
        }
    }
}

/// A bound backpressure policy.
pub trait PrioritizationStrategy: Send + Sync {
    /// Routes one trace according to its sampling priority.
    ///
    /// Returns true when the trace was accepted into a queue.
    fn publish(&self, priority: i32, trace: Trace) -> bool;

    /// Blocks until every trace published before this call has been
    /// drained, or the timeout elapses. Returns true on completion.
    fn flush(&self, timeout: Duration) -> bool;
}

/// Spins until the queue accepts the item.
fn blocking_offer(queue: &ArrayQueue<WorkItem>, item: WorkItem) {
    let backoff = Backoff::new();
    let mut item = item;
    while let Err(rejected) = queue.push(item) {
        item = rejected;
        backoff.snooze();
    }
}

fn offer(queue: &ArrayQueue<WorkItem>, item: WorkItem) -> bool {
    queue.push(item).is_ok()
}

/// Flushes strategies that only guarantee the primary queue.
fn flush_primary(primary: &ArrayQueue<WorkItem>, timeout: Duration) -> bool {
    let event = FlushEvent::new(1);
    blocking_offer(primary, WorkItem::Flush(event.clone()));
    event.wait(timeout)
}

struct EnsureTraceStrategy {
    primary: TraceQueue,
    secondary: TraceQueue,
}

impl PrioritizationStrategy for EnsureTraceStrategy {
    fn publish(&self, priority: i32, trace: Trace) -> bool {
        if priority::is_dropped(priority) {
            offer(&self.secondary, WorkItem::Trace(trace))
        } else {
            blocking_offer(&self.primary, WorkItem::Trace(trace));
            true
        }
    }

    fn flush(&self, timeout: Duration) -> bool {
        // ok not to flush the secondary
        flush_primary(&self.primary, timeout)
    }
}

struct FastLaneStrategy {
    primary: TraceQueue,
    secondary: TraceQueue,
}

impl PrioritizationStrategy for FastLaneStrategy {
    fn publish(&self, priority: i32, trace: Trace) -> bool {
        if priority::is_dropped(priority) {
            offer(&self.secondary, WorkItem::Trace(trace))
        } else {
            offer(&self.primary, WorkItem::Trace(trace))
        }
    }

    fn flush(&self, timeout: Duration) -> bool {
        flush_primary(&self.primary, timeout)
    }
}

struct DeadLettersStrategy {
    primary: TraceQueue,
    secondary: TraceQueue,
}

impl PrioritizationStrategy for DeadLettersStrategy {
    fn publish(&self, priority: i32, trace: Trace) -> bool {
        match self.primary.push(WorkItem::Trace(trace)) {
            Ok(()) => true,
            Err(WorkItem::Trace(trace)) if !priority::is_dropped(priority) => {
                offer(&self.secondary, WorkItem::Trace(trace))
            },
            Err(_) => false,
        }
    }

    fn flush(&self, timeout: Duration) -> bool {
        // both queues need to be drained
        let event = FlushEvent::new(2);
        blocking_offer(&self.primary, WorkItem::Flush(event.clone()));
        blocking_offer(&self.secondary, WorkItem::Flush(event.clone()));
        event.wait(timeout)
    }
}

struct DropStrategy {
    primary: TraceQueue,
}

impl PrioritizationStrategy for DropStrategy {
    fn publish(&self, priority: i32, trace: Trace) -> bool {
        if priority::is_dropped(priority) {
            false
        } else {
            offer(&self.primary, WorkItem::Trace(trace))
        }
    }

    fn flush(&self, timeout: Duration) -> bool {
        flush_primary(&self.primary, timeout)
    }
}

/// Owns the dispatch queues and the configured policy.
pub struct TraceDispatcher {
    primary: TraceQueue,
    secondary: TraceQueue,
    strategy: Box<dyn PrioritizationStrategy>,
}

impl TraceDispatcher {
    /// Builds the queues and binds the configured policy to them
    pub fn new(config: &DispatchConfig) -> Self {
        let primary: TraceQueue = Arc::new(ArrayQueue::new(config.primary_capacity));
        let secondary: TraceQueue = Arc::new(ArrayQueue::new(config.secondary_capacity));
        let strategy = config
            .prioritization
            .strategy(Arc::clone(&primary), Arc::clone(&secondary));
        TraceDispatcher {
            primary,
            secondary,
            strategy,
        }
    }

    /// Routes one trace according to its sampling priority
    pub fn publish(&self, priority: i32, trace: Trace) -> bool {
        self.strategy.publish(priority, trace)
    }

    /// Drains the policy's queues synchronously, bounded by `timeout`
    pub fn flush(&self, timeout: Duration) -> bool {
        self.strategy.flush(timeout)
    }

    /// Queue the draining writer pulls kept traces from
    pub fn primary(&self) -> &TraceQueue {
        &self.primary
    }

    /// Queue carrying dropped or overflow traces
    pub fn secondary(&self) -> &TraceQueue {
        &self.secondary
    }
}
