//! Pooled aggregate-counter batches.
//!
//! A [`Batch`] collects up to [`BATCH_CAPACITY`] data points for one
//! [`MetricKey`] between two report cycles. Producers race to add points
//! with a single CAS on a packed state word; the consumer thread drains a
//! batch exactly once and folds it into the interval's [`AggregateMetric`].
//! Losing a race never loses data: a point is only acknowledged after its
//! slot store, and the consumer spin-waits on claimed slots.

use crate::metrics::key::MetricKey;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum data points one batch conflates before producers must start a
/// fresh one.
pub const BATCH_CAPACITY: usize = 64;

const COUNT_MASK: u64 = 0xffff_ffff;
const GEN_SHIFT: u32 = 32;
/// Count-field sentinel marking the batch as consumed by a report cycle.
const CONSUMED: u64 = COUNT_MASK;

/// Point packing: bit 63 carries the error flag, the low 63 bits carry
/// duration + 1 so a fully stored point is never zero.
const ERROR_BIT: u64 = 1 << 63;
const DURATION_MASK: u64 = ERROR_BIT - 1;

fn pack(error: bool, duration_nanos: i64) -> u64 {
    let duration = u64::try_from(duration_nanos).unwrap_or(0).min(DURATION_MASK - 1);
    (duration + 1) | if error { ERROR_BIT } else { 0 }
}

fn unpack(point: u64) -> (bool, u64) {
    (point & ERROR_BIT != 0, (point & DURATION_MASK) - 1)
}

/// Mutable counters for one aggregation key within one reporting interval.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AggregateMetric {
    /// Number of spans folded into this aggregate
    pub hit_count: u64,
    /// Number of errored spans among them
    pub error_count: u64,
    /// Sum of span durations in nanoseconds
    pub duration_sum: u64,
}

impl AggregateMetric {
    /// Folds one data point into the counters
    pub fn fold(&mut self, error: bool, duration_nanos: u64) {
        self.hit_count += 1;
        if error {
            self.error_count += 1;
        }
        self.duration_sum += duration_nanos;
    }

    /// Resets the counters for the next interval
    pub fn clear(&mut self) {
        *self = AggregateMetric::default();
    }
}

/// A pooled batch of data points for one metric key.
///
/// The state word packs `(generation << 32) | count`. The generation is the
/// pool-reuse validity marker: it is bumped on every [`Batch::reset`], so a
/// producer holding a stale reference fails its CAS instead of writing into
/// a batch that was recycled for a different key.
#[derive(Debug)]
pub struct Batch {
    state: AtomicU64,
    points: [AtomicU64; BATCH_CAPACITY],
    key: Mutex<MetricKey>,
}

impl Batch {
    /// Creates a fresh batch for the given key
    pub fn new(key: MetricKey) -> Self {
        Batch {
            state: AtomicU64::new(0),
            points: std::array::from_fn(|_| AtomicU64::new(0)),
            key: Mutex::new(key),
        }
    }

    /// Returns a clone of the key this batch currently aggregates for
    pub fn key(&self) -> MetricKey {
        self.key.lock().clone()
    }

    /// Attempts to add a data point.
    ///
    /// Returns false when the batch is full, was already consumed by a
    /// report cycle, or was recycled since the caller looked it up. The
    /// caller then starts a new batch; the failed point was never recorded
    /// here, so nothing is lost.
    pub fn add(&self, error: bool, duration_nanos: i64) -> bool {
        loop {
            let state = self.state.load(Ordering::Acquire);
            let count = state & COUNT_MASK;
            if count >= BATCH_CAPACITY as u64 {
                // full or consumed (CONSUMED saturates the count field)
                return false;
            }
            if self
                .state
                .compare_exchange_weak(state, state + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.points[count as usize].store(pack(error, duration_nanos), Ordering::Release);
                return true;
            }
        }
    }

    /// Drains every stored point into `aggregate` and marks the batch
    /// consumed. Subsequent `add` calls fail until the batch is reset.
    ///
    /// A producer may have claimed a slot without storing yet; its point is
    /// still owed to this batch, so the drain spin-waits on the slot.
    pub fn contribute_to(&self, aggregate: &mut AggregateMetric) {
        let count = loop {
            let state = self.state.load(Ordering::Acquire);
            let count = state & COUNT_MASK;
            if count == CONSUMED {
                return;
            }
            let consumed = (state & !COUNT_MASK) | CONSUMED;
            if self
                .state
                .compare_exchange(state, consumed, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break (count as usize).min(BATCH_CAPACITY);
            }
        };
        for slot in &self.points[..count] {
            let mut point = slot.load(Ordering::Acquire);
            while point == 0 {
                std::hint::spin_loop();
                point = slot.load(Ordering::Acquire);
            }
            let (error, duration) = unpack(point);
            aggregate.fold(error, duration);
        }
    }

    /// Re-initializes a pooled batch for a new key.
    ///
    /// Only called with the batch checked out of the pool, after a drain:
    /// no old-epoch producer can still be storing (adds fail once consumed),
    /// so zeroing the slots here cannot race a slot store.
    pub fn reset(&self, key: MetricKey) {
        *self.key.lock() = key;
        for slot in &self.points {
            slot.store(0, Ordering::Relaxed);
        }
        let generation = self.state.load(Ordering::Relaxed) >> GEN_SHIFT;
        self.state
            .store((generation + 1) << GEN_SHIFT, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn generation(&self) -> u64 {
        self.state.load(Ordering::Acquire) >> GEN_SHIFT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Span;
    use std::sync::Arc;

    fn key(resource: &str) -> MetricKey {
        MetricKey::from_span(
            &Span::builder()
                .service("web")
                .operation("http.request")
                .resource(resource)
                .build(),
        )
    }

    #[test]
    fn test_add_then_contribute() {
        let batch = Batch::new(key("GET /"));
        assert!(batch.add(false, 100));
        assert!(batch.add(true, 200));
        assert!(batch.add(false, 300));

        let mut agg = AggregateMetric::default();
        batch.contribute_to(&mut agg);
        assert_eq!(agg.hit_count, 3);
        assert_eq!(agg.error_count, 1);
        assert_eq!(agg.duration_sum, 600);
    }

    #[test]
    fn test_consumed_batch_rejects_adds() {
        let batch = Batch::new(key("GET /"));
        assert!(batch.add(false, 1));
        let mut agg = AggregateMetric::default();
        batch.contribute_to(&mut agg);
        assert!(!batch.add(false, 2));
        // double drain is a no-op
        batch.contribute_to(&mut agg);
        assert_eq!(agg.hit_count, 1);
    }

    #[test]
    fn test_full_batch_rejects_adds() {
        let batch = Batch::new(key("GET /"));
        for _ in 0..BATCH_CAPACITY {
            assert!(batch.add(false, 1));
        }
        assert!(!batch.add(false, 1));

        let mut agg = AggregateMetric::default();
        batch.contribute_to(&mut agg);
        assert_eq!(agg.hit_count, BATCH_CAPACITY as u64);
    }

    #[test]
    fn test_reset_bumps_generation_and_revives() {
        let batch = Batch::new(key("GET /"));
        batch.add(true, 5);
        let mut agg = AggregateMetric::default();
        batch.contribute_to(&mut agg);
        let gen_before = batch.generation();

        batch.reset(key("GET /other"));
        assert_eq!(batch.generation(), gen_before + 1);
        assert_eq!(&*batch.key().resource, "GET /other");

        assert!(batch.add(false, 7));
        let mut agg = AggregateMetric::default();
        batch.contribute_to(&mut agg);
        assert_eq!(agg.hit_count, 1);
        assert_eq!(agg.error_count, 0);
        assert_eq!(agg.duration_sum, 7);
    }

    #[test]
    fn test_concurrent_adds_preserve_every_point() {
        let batch = Arc::new(Batch::new(key("GET /")));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let batch = Arc::clone(&batch);
                std::thread::spawn(move || {
                    let mut added = 0u64;
                    for _ in 0..BATCH_CAPACITY {
                        if batch.add(false, 10) {
                            added += 1;
                        }
                    }
                    added
                })
            })
            .collect();
        let added: u64 = threads.into_iter().map(|t| t.join().unwrap()).sum();
        assert_eq!(added, BATCH_CAPACITY as u64);

        let mut agg = AggregateMetric::default();
        batch.contribute_to(&mut agg);
        assert_eq!(agg.hit_count, BATCH_CAPACITY as u64);
        assert_eq!(agg.duration_sum, 10 * BATCH_CAPACITY as u64);
    }

    #[test]
    fn test_zero_duration_point_is_counted() {
        let batch = Batch::new(key("GET /"));
        assert!(batch.add(false, 0));
        let mut agg = AggregateMetric::default();
        batch.contribute_to(&mut agg);
        assert_eq!(agg.hit_count, 1);
        assert_eq!(agg.duration_sum, 0);
    }
}
