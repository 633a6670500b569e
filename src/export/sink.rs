//! Transport seam.
//!
//! The HTTP client that actually talks to the collector lives outside this
//! crate; it shows up here only as a [`Sink`]. Transport trouble arrives
//! back asynchronously as [`SinkEvent`]s, never as a synchronous error on
//! the publish path.

use crate::core::Result;
use crate::export::payload::Payload;
use std::sync::Arc;

/// Asynchronous notification from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// The collector only speaks an older protocol; metric reporting must
    /// shut itself off.
    Downgraded,
    /// The collector rejected a payload as malformed
    BadPayload(String),
    /// The collector errored while receiving a payload
    Error(String),
}

/// Receives [`SinkEvent`]s from the transport.
pub trait EventListener: Send + Sync {
    /// Called by the transport for every asynchronous event
    fn on_event(&self, event: &SinkEvent);
}

/// Outbound byte channel to the collector.
pub trait Sink: Send + Sync {
    /// Registers a listener for asynchronous transport events
    fn register(&self, listener: Arc<dyn EventListener>);

    /// Ships one payload to the collector
    fn transmit(&self, payload: &Payload) -> Result<()>;
}
