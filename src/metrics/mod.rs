//! Conflating metrics aggregation.
//!
//! Finished spans are folded into per-key interval aggregates: producers
//! conflate concurrently into pooled lock-free batches, a single consumer
//! thread totals them and serializes one bucket per reporting interval.

#![warn(missing_docs)]

pub mod aggregator;
pub mod batch;
pub mod key;
pub mod pool;
pub mod writer;

pub use aggregator::ConflatingAggregator;
pub use batch::{AggregateMetric, Batch, BATCH_CAPACITY};
pub use key::MetricKey;
pub use pool::BatchPool;
pub use writer::{MetricWriter, SerializingMetricWriter};
