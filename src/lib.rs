//! Tracewire - telemetry export core for a tracing client.
//!
//! Tracewire is the in-process back half of a tracer: finished traces come
//! in, msgpack payloads and aggregated metric buckets go out. It is built
//! for instrumented applications, so nothing on the publish path blocks
//! (unless explicitly configured to), allocates eagerly, or lets an error
//! escape into application code.
//!
//! # Architecture
//!
//! - `core`: span/trace data model, configuration, error type
//! - `metrics`: conflating aggregator turning spans into interval buckets
//! - `dispatch`: bounded trace queues under selectable backpressure policies
//! - `export`: msgpack v0.4 trace encoder, payload accumulation, sink seam
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tracewire::core::{priority, Config, Result, Span};
//! use tracewire::dispatch::TraceDispatcher;
//! use tracewire::export::{EventListener, Payload, Sink};
//! use tracewire::metrics::ConflatingAggregator;
//!
//! struct StdoutSink;
//!
//! impl Sink for StdoutSink {
//!     fn register(&self, _listener: Arc<dyn EventListener>) {}
//!     fn transmit(&self, payload: &Payload) -> Result<()> {
//!         println!("{} bytes", payload.size_in_bytes());
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let config = Config::default();
//!     let aggregator = ConflatingAggregator::new(&config, Arc::new(StdoutSink));
//!     aggregator.start()?;
//!     let dispatcher = TraceDispatcher::new(&config.dispatch);
//!
//!     let trace = vec![Span::builder()
//!         .service("web")
//!         .operation("http.request")
//!         .resource("GET /users")
//!         .top_level(true)
//!         .build()];
//!     let force_keep = aggregator.publish(&trace);
//!     let sampling = if force_keep { priority::USER_KEEP } else { priority::SAMPLER_KEEP };
//!     dispatcher.publish(sampling, trace);
//!     aggregator.close();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod core;
pub mod dispatch;
pub mod export;
pub mod metrics;

pub use crate::core::{Config, Result, Span, TracewireError};
pub use crate::dispatch::{Prioritization, TraceDispatcher};
pub use crate::export::{Payload, Sink, TraceEncoderV04};
pub use crate::metrics::ConflatingAggregator;
