//! Serialization seam between the aggregator's consumer thread and the sink.
//!
//! One report cycle is one "bucket": process identity tags, the interval
//! window, then a pre-sized array of per-key records. Container sizes are
//! known up front, so the bucket streams out in a single pass like the
//! trace encoder.

use crate::core::{Result, WellKnownTags};
use crate::export::{Payload, Sink};
use crate::metrics::batch::AggregateMetric;
use crate::metrics::key::MetricKey;
use rmp::encode::{write_array_len, write_map_len, write_str, write_u64};
use std::sync::Arc;

/// Consumes one bucket of aggregated metrics per report cycle.
pub trait MetricWriter: Send {
    /// Opens a bucket holding `metric_count` records for the interval
    /// starting at `start_nanos` and spanning `duration_nanos`.
    fn start_bucket(&mut self, metric_count: usize, start_nanos: u64, duration_nanos: u64)
        -> Result<()>;

    /// Appends one record to the open bucket
    fn add(&mut self, key: &MetricKey, aggregate: &AggregateMetric) -> Result<()>;

    /// Closes and ships the bucket
    fn finish_bucket(&mut self) -> Result<()>;
}

/// [`MetricWriter`] that encodes buckets as msgpack and transmits them
/// through the [`Sink`] shared with the trace export path.
pub struct SerializingMetricWriter {
    tags: WellKnownTags,
    sink: Arc<dyn Sink>,
    payload: Payload,
    buf: Vec<u8>,
}

impl SerializingMetricWriter {
    /// Creates a writer shipping buckets through `sink`
    pub fn new(tags: WellKnownTags, sink: Arc<dyn Sink>) -> Self {
        SerializingMetricWriter {
            tags,
            sink,
            payload: Payload::default(),
            buf: Vec::new(),
        }
    }
}

impl MetricWriter for SerializingMetricWriter {
    fn start_bucket(
        &mut self,
        metric_count: usize,
        start_nanos: u64,
        duration_nanos: u64,
    ) -> Result<()> {
        self.buf.clear();
        write_map_len(&mut self.buf, 9)?;
        write_str(&mut self.buf, "hostname")?;
        write_str(&mut self.buf, &self.tags.hostname)?;
        write_str(&mut self.buf, "env")?;
        write_str(&mut self.buf, &self.tags.env)?;
        write_str(&mut self.buf, "service")?;
        write_str(&mut self.buf, &self.tags.service)?;
        write_str(&mut self.buf, "version")?;
        write_str(&mut self.buf, &self.tags.version)?;
        write_str(&mut self.buf, "lang")?;
        write_str(&mut self.buf, &self.tags.language)?;
        write_str(&mut self.buf, "runtime-id")?;
        write_str(&mut self.buf, &self.tags.runtime_id)?;
        write_str(&mut self.buf, "start")?;
        write_u64(&mut self.buf, start_nanos)?;
        write_str(&mut self.buf, "duration")?;
        write_u64(&mut self.buf, duration_nanos)?;
        write_str(&mut self.buf, "stats")?;
        write_array_len(&mut self.buf, metric_count as u32)?;
        Ok(())
    }

    fn add(&mut self, key: &MetricKey, aggregate: &AggregateMetric) -> Result<()> {
        write_map_len(&mut self.buf, 8)?;
        write_str(&mut self.buf, "name")?;
        write_str(&mut self.buf, &key.operation)?;
        write_str(&mut self.buf, "service")?;
        write_str(&mut self.buf, &key.service)?;
        write_str(&mut self.buf, "resource")?;
        write_str(&mut self.buf, &key.resource)?;
        write_str(&mut self.buf, "type")?;
        write_str(&mut self.buf, &key.span_type)?;
        write_str(&mut self.buf, "http_status_code")?;
        write_u64(&mut self.buf, u64::from(key.http_status))?;
        write_str(&mut self.buf, "hits")?;
        write_u64(&mut self.buf, aggregate.hit_count)?;
        write_str(&mut self.buf, "errors")?;
        write_u64(&mut self.buf, aggregate.error_count)?;
        write_str(&mut self.buf, "duration")?;
        write_u64(&mut self.buf, aggregate.duration_sum)?;
        Ok(())
    }

    fn finish_bucket(&mut self) -> Result<()> {
        self.payload.reset();
        // one bucket per payload, framed as a single-element stream
        self.payload.push_trace(&self.buf);
        let result = self.sink.transmit(&self.payload);
        self.buf.clear();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Span;
    use crate::export::sink::EventListener;
    use parking_lot::Mutex;
    use rmpv::Value;

    #[derive(Default)]
    struct CaptureSink {
        payloads: Mutex<Vec<bytes::Bytes>>,
    }

    impl Sink for CaptureSink {
        fn register(&self, _listener: Arc<dyn EventListener>) {}

        fn transmit(&self, payload: &Payload) -> Result<()> {
            self.payloads.lock().push(payload.to_bytes());
            Ok(())
        }
    }

    fn lookup<'a>(map: &'a Value, key: &str) -> Option<&'a Value> {
        match map {
            Value::Map(entries) => entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    #[test]
    fn test_bucket_layout() {
        let sink = Arc::new(CaptureSink::default());
        let tags = WellKnownTags {
            hostname: "host-1".into(),
            env: "prod".into(),
            service: "web".into(),
            version: "1.2.3".into(),
            language: "rust".into(),
            runtime_id: "abc".into(),
        };
        let mut writer = SerializingMetricWriter::new(tags, Arc::clone(&sink) as Arc<dyn Sink>);

        let span = Span::builder()
            .service("web")
            .operation("http.request")
            .resource("GET /")
            .span_type("web")
            .build();
        let key = MetricKey::from_span(&span);
        let aggregate = AggregateMetric {
            hit_count: 2,
            error_count: 1,
            duration_sum: 300,
        };

        writer.start_bucket(1, 1_000, 10_000_000_000).unwrap();
        writer.add(&key, &aggregate).unwrap();
        writer.finish_bucket().unwrap();

        let payloads = sink.payloads.lock();
        assert_eq!(payloads.len(), 1);
        let value = rmpv::decode::read_value(&mut &payloads[0][..]).unwrap();
        let bucket = match &value {
            Value::Array(buckets) => &buckets[0],
            other => panic!("expected array framing, got {:?}", other),
        };
        assert_eq!(lookup(bucket, "env").unwrap().as_str(), Some("prod"));
        assert_eq!(lookup(bucket, "duration").unwrap().as_u64(), Some(10_000_000_000));

        let stats = lookup(bucket, "stats").unwrap();
        let records = match stats {
            Value::Array(records) => records,
            other => panic!("expected stats array, got {:?}", other),
        };
        assert_eq!(records.len(), 1);
        assert_eq!(lookup(&records[0], "hits").unwrap().as_u64(), Some(2));
        assert_eq!(lookup(&records[0], "errors").unwrap().as_u64(), Some(1));
        assert_eq!(lookup(&records[0], "duration").unwrap().as_u64(), Some(300));
        assert_eq!(lookup(&records[0], "name").unwrap().as_str(), Some("http.request"));
    }
}
