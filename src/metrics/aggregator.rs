//! Conflating metrics aggregation engine.
//!
//! Many producer threads publish finished traces concurrently; one
//! dedicated consumer thread folds batches into per-key interval totals
//! and reports them on a timer. Producers conflate data points into
//! pending batches with a single CAS wherever possible, so the hot path
//! takes no locks beyond the sharded pending map.
//!
//! Control flows through the same inbox as data: a `Report` marker starts
//! a report cycle, a `Poison` marker stops the consumer. Because the inbox
//! is FIFO, the consumer observes them only after everything enqueued
//! before them.

use crate::core::{AggregatorConfig, Config, Result, Span, TracewireError};
use crate::export::{EventListener, Sink, SinkEvent};
use crate::metrics::batch::{AggregateMetric, Batch};
use crate::metrics::key::MetricKey;
use crate::metrics::pool::BatchPool;
use crate::metrics::writer::{MetricWriter, SerializingMetricWriter};
use crossbeam::utils::Backoff;
use crossbeam_channel::{bounded, tick, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, warn};

/// How long `close` waits for the consumer thread to finish.
const THREAD_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Inbox message. Sentinels travel the same queue as data so ordering
/// relative to data is guaranteed.
enum Inbound {
    Data(Arc<Batch>),
    Report,
    Poison,
}

/// State shared between producers, the consumer thread, the report timer
/// and the sink event listener.
struct Shared {
    enabled: AtomicBool,
    pending: DashMap<MetricKey, Arc<Batch>>,
    new_keys: DashMap<MetricKey, ()>,
    pool: BatchPool,
    inbox_tx: Sender<Inbound>,
    inbox_rx: Receiver<Inbound>,
    max_new_keys: usize,
}

impl Shared {
    /// Publishes one eligible span, returning the force-keep bias.
    fn publish_span(&self, span: &Span) -> bool {
        let error = span.has_error();
        let mut key = MetricKey::from_span(span);
        if let Some(batch) = self.pending.get(&key).map(|entry| Arc::clone(entry.value())) {
            if batch.add(error, span.duration) {
                // conflated into a pending batch prior to consumption, so
                // the key is not rare enough to override the sampler
                return false;
            }
            // the batch was full or already consumed: recycle its key for
            // the replacement instead of keeping our fresh allocation
            key = batch.key();
        }
        let batch = self.pool.acquire(key.clone());
        batch.add(error, span.duration);
        // last writer wins the slot; a superseded batch already holds the
        // points that were added to it, so nothing is lost
        self.pending.insert(key.clone(), Arc::clone(&batch));
        // offer to the inbox only after the pending map knows the batch
        let _ = self.inbox_tx.try_send(Inbound::Data(batch));
        if self.new_keys.len() > self.max_new_keys {
            // soft bound; evicting an arbitrary member may cause some
            // false positive sampler overrides under high cardinality
            if let Some(victim) = self.new_keys.iter().next().map(|entry| entry.key().clone()) {
                self.new_keys.remove(&victim);
            }
        }
        self.new_keys.insert(key, ()).is_none() || error
    }

    /// Posts a report marker, retrying until the inbox accepts it.
    fn report(&self) {
        let backoff = Backoff::new();
        loop {
            if !self.enabled.load(Ordering::Acquire) {
                return;
            }
            if self.inbox_tx.try_send(Inbound::Report).is_ok() {
                return;
            }
            backoff.snooze();
        }
    }

    /// Full defensive reset: producers become no-ops, all pooled and
    /// pending state is discarded, the consumer thread is told to exit.
    /// Not a graceful drain.
    fn disable(&self) {
        if self.enabled.swap(false, Ordering::SeqCst) {
            warn!("metric aggregation disabled");
            self.pending.clear();
            self.new_keys.clear();
            self.pool.clear();
            // crossbeam receivers are MPMC, so the inbox can be drained
            // from here before the consumer is stopped
            while self.inbox_rx.try_recv().is_ok() {}
            let _ = self.inbox_tx.try_send(Inbound::Poison);
        }
    }
}

/// Sink listener that disables the aggregator on collector downgrade.
struct AggregatorListener {
    shared: Arc<Shared>,
}

impl EventListener for AggregatorListener {
    fn on_event(&self, event: &SinkEvent) {
        match event {
            SinkEvent::Downgraded => {
                debug!("collector downgrade detected, disabling metric reporting");
                self.shared.disable();
            },
            SinkEvent::BadPayload(message) => {
                debug!(%message, "collector rejected a metrics payload");
            },
            SinkEvent::Error(message) => {
                debug!(%message, "collector errored receiving a metrics payload");
            },
        }
    }
}

struct Lifecycle {
    writer: Option<Box<dyn MetricWriter>>,
    consumer: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    timer_cancel: Option<Sender<()>>,
}

/// Concurrent multi-producer metrics aggregator.
///
/// `publish` conflates eligible spans into per-key batches and reports a
/// force-keep bias back to the caller; a consumer thread owned by this
/// struct turns the batches into metric buckets on a fixed cadence.
pub struct ConflatingAggregator {
    shared: Arc<Shared>,
    sink: Arc<dyn Sink>,
    reporting_interval: Duration,
    max_aggregates: usize,
    lifecycle: Mutex<Lifecycle>,
    done_tx: Sender<()>,
    done_rx: Receiver<()>,
}

impl ConflatingAggregator {
    /// Creates an aggregator shipping serialized buckets through `sink`
    pub fn new(config: &Config, sink: Arc<dyn Sink>) -> Self {
        let writer = Box::new(SerializingMetricWriter::new(
            config.tags.clone(),
            Arc::clone(&sink),
        ));
        Self::with_writer(&config.aggregator, sink, writer)
    }

    /// Creates an aggregator with a custom metric writer
    pub fn with_writer(
        config: &AggregatorConfig,
        sink: Arc<dyn Sink>,
        writer: Box<dyn MetricWriter>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = bounded(config.inbox_capacity);
        let (done_tx, done_rx) = bounded(1);
        ConflatingAggregator {
            shared: Arc::new(Shared {
                enabled: AtomicBool::new(true),
                pending: DashMap::new(),
                new_keys: DashMap::new(),
                pool: BatchPool::new(config.max_aggregates),
                inbox_tx,
                inbox_rx,
                max_new_keys: config.max_new_keys,
            }),
            sink,
            reporting_interval: config.reporting_interval,
            max_aggregates: config.max_aggregates,
            lifecycle: Mutex::new(Lifecycle {
                writer: Some(writer),
                consumer: None,
                timer: None,
                timer_cancel: None,
            }),
            done_tx,
            done_rx,
        }
    }

    /// Registers with the sink and starts the consumer and timer threads.
    ///
    /// Errors if called twice or if a thread cannot be spawned.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        let writer = lifecycle
            .writer
            .take()
            .ok_or_else(|| TracewireError::config("aggregator already started"))?;

        self.sink.register(Arc::new(AggregatorListener {
            shared: Arc::clone(&self.shared),
        }));

        let consumer = Consumer {
            shared: Arc::clone(&self.shared),
            writer,
            aggregates: HashMap::new(),
            max_aggregates: self.max_aggregates,
            interval: self.reporting_interval,
            dirty: false,
            done_tx: self.done_tx.clone(),
        };
        lifecycle.consumer = Some(
            std::thread::Builder::new()
                .name("tracewire-metrics".into())
                .spawn(move || consumer.run())?,
        );

        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let ticker = tick(self.reporting_interval);
        let shared = Arc::clone(&self.shared);
        lifecycle.timer = Some(
            std::thread::Builder::new()
                .name("tracewire-report-timer".into())
                .spawn(move || loop {
                    crossbeam_channel::select! {
                        recv(ticker) -> _ => shared.report(),
                        recv(cancel_rx) -> _ => break,
                    }
                })?,
        );
        lifecycle.timer_cancel = Some(cancel_tx);
        Ok(())
    }

    /// Publishes a finished trace.
    ///
    /// Aggregates every top-level or explicitly measured span and returns
    /// true when the caller should keep the trace regardless of its
    /// sampling priority: the trace carries an error or a key not seen
    /// yet this interval. No-op once the subsystem is disabled.
    pub fn publish(&self, trace: &[Span]) -> bool {
        let mut force_keep = false;
        if self.shared.enabled.load(Ordering::Acquire) {
            for span in trace {
                if span.is_metric_eligible() {
                    force_keep |= self.shared.publish_span(span);
                }
            }
        }
        force_keep
    }

    /// Triggers a report cycle out of band
    pub fn report(&self) {
        self.shared.report();
    }

    /// True until a collector downgrade disables the subsystem
    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    /// Cancels the report timer and tells the consumer thread to exit.
    ///
    /// The poison offer is non-blocking: if the inbox is completely full
    /// the consumer is already far behind and will be abandoned by `close`.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if let Some(cancel) = lifecycle.timer_cancel.take() {
            let _ = cancel.send(());
        }
        drop(lifecycle);
        let _ = self.shared.inbox_tx.try_send(Inbound::Poison);
    }

    /// Stops the aggregator and waits (bounded) for the consumer to exit
    pub fn close(&self) {
        self.stop();
        let mut lifecycle = self.lifecycle.lock();
        if let Some(handle) = lifecycle.consumer.take() {
            match self.done_rx.recv_timeout(THREAD_JOIN_TIMEOUT) {
                Ok(()) => {
                    let _ = handle.join();
                },
                Err(_) => warn!("metrics consumer did not exit within the join timeout"),
            }
        }
        if let Some(handle) = lifecycle.timer.take() {
            let _ = handle.join();
        }
    }
}

/// The single consumer thread: folds batches into interval totals and
/// reports them when the `Report` marker comes through the inbox.
struct Consumer {
    shared: Arc<Shared>,
    writer: Box<dyn MetricWriter>,
    aggregates: HashMap<MetricKey, AggregateMetric>,
    max_aggregates: usize,
    interval: Duration,
    dirty: bool,
    done_tx: Sender<()>,
}

impl Consumer {
    fn run(mut self) {
        debug!("metrics consumer started");
        loop {
            match self.shared.inbox_rx.recv() {
                Ok(Inbound::Data(batch)) => self.fold(batch),
                Ok(Inbound::Report) => self.report(),
                Ok(Inbound::Poison) | Err(_) => break,
            }
        }
        debug!("metrics consumer stopped");
        let _ = self.done_tx.send(());
    }

    fn fold(&mut self, batch: Arc<Batch>) {
        let key = batch.key();
        if self.aggregates.len() < self.max_aggregates || self.aggregates.contains_key(&key) {
            let aggregate = self.aggregates.entry(key).or_default();
            batch.contribute_to(aggregate);
            self.shared.pool.release(batch);
            self.dirty = true;
        }
        // over the key limit the batch is left alone: it stays in the
        // pending map until a producer supersedes it
    }

    fn report(&mut self) {
        if self.dirty {
            let end = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            let start = end.saturating_sub(self.interval);
            if let Err(e) = self.write_bucket(start.as_nanos() as u64) {
                error!(error = %e, category = e.category(), "failed to report metrics bucket");
            }
            self.aggregates.clear();
            self.dirty = false;
        }
        self.shared.new_keys.clear();
    }

    fn write_bucket(&mut self, start_nanos: u64) -> Result<()> {
        self.writer.start_bucket(
            self.aggregates.len(),
            start_nanos,
            self.interval.as_nanos() as u64,
        )?;
        for (key, aggregate) in &self.aggregates {
            self.writer.add(key, aggregate)?;
        }
        self.writer.finish_bucket()
    }
}
