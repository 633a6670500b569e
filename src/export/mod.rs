//! Wire encoding and transport seam.
//!
//! Finished traces become length-prefixed msgpack payloads here, bounded by
//! a byte ceiling, and leave the process through the [`Sink`] trait the
//! HTTP transport implements elsewhere.

#![warn(missing_docs)]

pub mod encoder;
pub mod payload;
pub mod sink;

pub use encoder::TraceEncoderV04;
pub use payload::{array_header_size, Payload, DEFAULT_MAX_PAYLOAD_BYTES};
pub use sink::{EventListener, Sink, SinkEvent};
