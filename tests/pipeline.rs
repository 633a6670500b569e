//! End-to-end pipeline tests: spans through the aggregator, the
//! dispatcher, the encoder and out of a capturing sink.

use parking_lot::Mutex;
use rmpv::Value;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracewire::core::{priority, AggregatorConfig, Config, Result, Span};
use tracewire::dispatch::{TraceDispatcher, WorkItem};
use tracewire::export::{EventListener, Payload, Sink, TraceEncoderV04};
use tracewire::metrics::ConflatingAggregator;

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

fn wait_for<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(5));
    }
}

fn web_span() -> Span {
    Span::builder()
        .service("web")
        .operation("http.request")
        .resource("GET /users")
        .span_type("web")
        .duration(1_000)
        .top_level(true)
        .build()
}

fn aggregator_with_sink(sink: Arc<CaptureSink>) -> ConflatingAggregator {
    let config = Config {
        aggregator: AggregatorConfig {
            // tests trigger reports by hand
            reporting_interval: Duration::from_secs(600),
            ..AggregatorConfig::default()
        },
        ..Config::default()
    };
    let aggregator = ConflatingAggregator::new(&config, sink);
    aggregator.start().unwrap();
    aggregator
}

#[test]
fn test_identical_keys_emit_one_record_with_two_hits() {
    let sink = Arc::new(CaptureSink::default());
    let aggregator = aggregator_with_sink(Arc::clone(&sink));

    aggregator.publish(&[web_span()]);
    aggregator.publish(&[web_span()]);
    aggregator.report();
    wait_for(|| !sink.payloads.lock().is_empty());
    aggregator.close();

    let payloads = sink.payloads.lock();
    let value = rmpv::decode::read_value(&mut &payloads[0][..]).unwrap();
    let bucket = match &value {
        Value::Array(buckets) => &buckets[0],
        other => panic!("expected array framing, got {:?}", other),
    };
    let records = match lookup(bucket, "stats").unwrap() {
        Value::Array(records) => records,
        other => panic!("expected stats array, got {:?}", other),
    };
    assert_eq!(records.len(), 1);
    assert_eq!(lookup(&records[0], "hits").unwrap().as_u64(), Some(2));
    assert_eq!(lookup(&records[0], "duration").unwrap().as_u64(), Some(2_000));
    assert_eq!(
        lookup(&records[0], "resource").unwrap().as_str(),
        Some("GET /users")
    );
}

#[test]
fn test_force_keep_bias_drives_dispatch_priority() {
    let sink = Arc::new(CaptureSink::default());
    let aggregator = aggregator_with_sink(Arc::clone(&sink));
    let config = Config::default();
    let dispatcher = TraceDispatcher::new(&config.dispatch);

    // first sighting of the key upgrades the trace to a kept priority
    let trace = vec![web_span()];
    let force_keep = aggregator.publish(&trace);
    assert!(force_keep);
    let sampling = if force_keep {
        priority::USER_KEEP
    } else {
        priority::SAMPLER_DROP
    };
    assert!(dispatcher.publish(sampling, trace));
    assert_eq!(dispatcher.primary().len(), 1);

    // repeat sighting without error keeps the sampler's drop verdict
    let trace = vec![web_span()];
    assert!(!aggregator.publish(&trace));
    assert!(dispatcher.publish(priority::SAMPLER_DROP, trace));
    assert_eq!(dispatcher.secondary().len(), 1);
    aggregator.close();
}

#[test]
fn test_ensure_trace_loses_nothing_against_slow_drain() {
    let config = Config::from_json(
        r#"{"dispatch": {"prioritization": "ensure_trace", "primary_capacity": 2}}"#,
    )
    .unwrap();
    let dispatcher = Arc::new(TraceDispatcher::new(&config.dispatch));

    let primary = Arc::clone(dispatcher.primary());
    let drainer = thread::spawn(move || {
        let mut drained = 0u32;
        loop {
            match primary.pop() {
                Some(WorkItem::Trace(_)) => {
                    drained += 1;
                    thread::sleep(Duration::from_millis(1));
                },
                Some(WorkItem::Flush(event)) => {
                    event.acknowledge();
                    break drained;
                },
                None => thread::yield_now(),
            }
        }
    });

    for _ in 0..32 {
        assert!(dispatcher.publish(priority::SAMPLER_KEEP, vec![web_span()]));
    }
    assert!(dispatcher.flush(Duration::from_secs(5)));
    assert_eq!(drainer.join().unwrap(), 32);
}

#[test]
fn test_drop_strategy_never_queues_dropped_traces() {
    let dispatcher = TraceDispatcher::new(
        &Config::from_json(r#"{"dispatch": {"prioritization": "drop"}}"#)
            .unwrap()
            .dispatch,
    );
    assert!(!dispatcher.publish(priority::SAMPLER_DROP, vec![web_span()]));
    assert!(!dispatcher.publish(priority::USER_DROP, vec![web_span()]));
    assert!(dispatcher.primary().is_empty());
    assert!(dispatcher.secondary().is_empty());
}

#[test]
fn test_flush_observes_all_prior_traces() {
    let dispatcher = Arc::new(TraceDispatcher::new(&Config::default().dispatch));
    for _ in 0..100 {
        assert!(dispatcher.publish(priority::USER_KEEP, vec![web_span()]));
    }
    let primary = Arc::clone(dispatcher.primary());
    let drainer = thread::spawn(move || {
        let mut traces = 0u32;
        loop {
            match primary.pop() {
                Some(WorkItem::Trace(_)) => traces += 1,
                Some(WorkItem::Flush(event)) => {
                    event.acknowledge();
                    break traces;
                },
                None => thread::yield_now(),
            }
        }
    });
    assert!(dispatcher.flush(Duration::from_secs(5)));
    assert_eq!(drainer.join().unwrap(), 100);
    assert!(dispatcher.primary().is_empty());
}

#[test]
fn test_encoded_meta_merges_baggage_and_tags() {
    let span = Span::builder()
        .service("web")
        .operation("http.request")
        .resource("GET /users")
        .trace_id(123)
        .span_id(456)
        .parent_id(0)
        .duration(789)
        .tag("env", "prod")
        .baggage("env", "staging")
        .baggage("session", "abc")
        .thread_name("worker-1")
        .thread_id(42)
        .build();

    let encoder = TraceEncoderV04::new();
    assert_eq!(encoder.endpoint(), "v0.4");
    let bytes = encoder.encode_trace(&[span]).unwrap();
    let value = rmpv::decode::read_value(&mut &bytes[..]).unwrap();
    let span_map = match &value {
        Value::Array(spans) => &spans[0],
        other => panic!("expected span array, got {:?}", other),
    };

    assert_eq!(lookup(span_map, "trace_id").unwrap().as_u64(), Some(123));
    assert_eq!(lookup(span_map, "span_id").unwrap().as_u64(), Some(456));
    assert_eq!(lookup(span_map, "duration").unwrap().as_i64(), Some(789));

    let meta = lookup(span_map, "meta").unwrap();
    // the tag wins the collision, baggage fills the gaps
    assert_eq!(lookup(meta, "env").unwrap().as_str(), Some("prod"));
    assert_eq!(lookup(meta, "session").unwrap().as_str(), Some("abc"));
    assert_eq!(lookup(meta, "thread.name").unwrap().as_str(), Some("worker-1"));
    assert_eq!(lookup(meta, "thread.id").unwrap().as_str(), Some("42"));
}

#[test]
fn test_measured_span_metrics_map_has_reserved_entry() {
    let span = Span::builder()
        .service("db")
        .operation("query")
        .resource("SELECT 1")
        .metric("rows", 10.0)
        .metric("cost", 0.5)
        .metric("retries", 1.0)
        .measured(true)
        .build();

    let bytes = TraceEncoderV04::new().encode_trace(&[span]).unwrap();
    let value = rmpv::decode::read_value(&mut &bytes[..]).unwrap();
    let span_map = match &value {
        Value::Array(spans) => &spans[0],
        other => panic!("expected span array, got {:?}", other),
    };
    let metrics = match lookup(span_map, "metrics").unwrap() {
        Value::Map(entries) => entries,
        other => panic!("expected metrics map, got {:?}", other),
    };
    // 3 numeric metrics plus the measured marker, no priority, no top-level
    assert_eq!(metrics.len(), 4);
    assert!(metrics.iter().any(|(k, _)| k.as_str() == Some("_dd.measured")));
    assert!(!metrics.iter().any(|(k, _)| k.as_str() == Some("_dd.top_level")));
}

#[test]
fn test_payload_accumulates_traces_under_ceiling() {
    let encoder = TraceEncoderV04::new();
    let mut payload = Payload::new(1 << 16);
    let mut accepted = 0;
    loop {
        if !encoder.encode_into(&mut payload, &[web_span()]).unwrap() {
            break;
        }
        accepted += 1;
    }
    assert!(accepted > 0);
    assert_eq!(payload.trace_count(), accepted);
    assert!(payload.size_in_bytes() <= 1 << 16);

    // the emitted bytes are one self-describing array of traces
    let bytes = payload.to_bytes();
    let value = rmpv::decode::read_value(&mut &bytes[..]).unwrap();
    match value {
        Value::Array(traces) => assert_eq!(traces.len(), accepted),
        other => panic!("expected trace array, got {:?}", other),
    }
}

#[test]
fn test_dropped_metrics_spans_do_not_bias_sampling() {
    let sink = Arc::new(CaptureSink::default());
    let aggregator = aggregator_with_sink(Arc::clone(&sink));

    // neither top-level nor measured: invisible to the aggregator
    let internal = Span::builder()
        .service("web")
        .operation("cache.lookup")
        .resource("GET key")
        .build();
    assert!(!aggregator.publish(&[internal]));
    aggregator.close();
    assert!(sink.payloads.lock().is_empty());
}
