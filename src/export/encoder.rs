//! msgpack encoder for the "v0.4" trace wire format.
//!
//! Every container length is computed before its elements are written —
//! msgpack headers are length-prefixed and this encoder never backpatches.
//! Each span is a map of exactly 12 entries in fixed order.

use crate::core::{Result, Span};
use crate::export::payload::Payload;
use rmp::encode::{
    write_array_len, write_f64, write_i32, write_i64, write_map_len, write_str, write_u64,
};

/// Reserved metrics key carrying the sampling priority
const SAMPLING_PRIORITY_KEY: &str = "_sampling_priority_v1";
/// Reserved metrics key flagging an explicitly measured span
const MEASURED_KEY: &str = "_dd.measured";
/// Reserved metrics key flagging a service-local root span
const TOP_LEVEL_KEY: &str = "_dd.top_level";
/// Reserved meta key for the reporting thread name
const THREAD_NAME_KEY: &str = "thread.name";
/// Reserved meta key for the reporting thread id
const THREAD_ID_KEY: &str = "thread.id";

/// Baggage entries past this index are not collision-checked against tags.
/// An accepted approximation of this wire version: such entries may appear
/// as duplicate meta keys, and the tag value still wins for decoders that
/// keep the last duplicate because tags are written after baggage.
const COLLISION_BITSET_CAPACITY: usize = 64;

/// Stateless encoder producing v0.4 framing.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceEncoderV04;

impl TraceEncoderV04 {
    /// Creates the encoder
    pub fn new() -> Self {
        TraceEncoderV04
    }

    /// Wire-protocol version implemented by this encoder, used for content
    /// negotiation with the collector.
    pub fn endpoint(&self) -> &'static str {
        "v0.4"
    }

    /// Encodes one trace as a msgpack array of span maps
    pub fn encode_trace(&self, trace: &[Span]) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(256 * trace.len().max(1));
        write_array_len(&mut buf, trace.len() as u32)?;
        for span in trace {
            write_span(&mut buf, span)?;
        }
        Ok(buf)
    }

    /// Encodes a trace and appends it to `payload`.
    ///
    /// Returns `Ok(false)` when the payload ceiling would be exceeded.
    pub fn encode_into(&self, payload: &mut Payload, trace: &[Span]) -> Result<bool> {
        let encoded = self.encode_trace(trace)?;
        Ok(payload.push_trace(&encoded))
    }
}

fn write_span(buf: &mut Vec<u8>, span: &Span) -> Result<()> {
    write_map_len(buf, 12)?;
    /* 1  */
    write_str(buf, "service")?;
    write_str(buf, &span.service)?;
    /* 2  */
    write_str(buf, "name")?;
    write_str(buf, &span.operation)?;
    /* 3  */
    write_str(buf, "resource")?;
    write_str(buf, &span.resource)?;
    /* 4  */
    write_str(buf, "trace_id")?;
    write_u64(buf, span.trace_id)?;
    /* 5  */
    write_str(buf, "span_id")?;
    write_u64(buf, span.span_id)?;
    /* 6  */
    write_str(buf, "parent_id")?;
    write_u64(buf, span.parent_id)?;
    /* 7  */
    write_str(buf, "start")?;
    write_i64(buf, span.start)?;
    /* 8  */
    write_str(buf, "duration")?;
    write_i64(buf, span.duration)?;
    /* 9  */
    write_str(buf, "type")?;
    write_str(buf, &span.span_type)?;
    /* 10 */
    write_str(buf, "error")?;
    write_i32(buf, span.error)?;
    /* 11 */
    write_str(buf, "metrics")?;
    write_metrics(buf, span)?;
    /* 12 */
    write_str(buf, "meta")?;
    write_meta(buf, span)?;
    Ok(())
}

fn write_metrics(buf: &mut Vec<u8>, span: &Span) -> Result<()> {
    let mut len = span.metrics.len();
    len += usize::from(span.sampling_priority.is_some());
    len += usize::from(span.measured);
    len += usize::from(span.top_level);
    write_map_len(buf, len as u32)?;
    if let Some(priority) = span.sampling_priority {
        write_str(buf, SAMPLING_PRIORITY_KEY)?;
        write_i32(buf, priority)?;
    }
    if span.measured {
        write_str(buf, MEASURED_KEY)?;
        write_i32(buf, 1)?;
    }
    if span.top_level {
        write_str(buf, TOP_LEVEL_KEY)?;
        write_i32(buf, 1)?;
    }
    for (name, value) in &span.metrics {
        write_str(buf, name)?;
        write_f64(buf, *value)?;
    }
    Ok(())
}

/// Merges baggage and tags into the meta map, tags winning on collision.
///
/// Two passes over the same untouched baggage map, so iteration order is
/// identical between the size pre-pass and the write pass. The pre-pass
/// records colliding baggage indices in a bitset instead of re-probing the
/// tag map while writing.
fn write_meta(buf: &mut Vec<u8>, span: &Span) -> Result<()> {
    let mut len = span.tags.len() + 2;
    let mut overlaps: u64 = 0;
    for (i, key) in span.baggage.keys().enumerate() {
        if i < COLLISION_BITSET_CAPACITY && span.tags.contains_key(key) {
            overlaps |= 1 << i;
        } else {
            len += 1;
        }
    }
    write_map_len(buf, len as u32)?;
    for (i, (key, value)) in span.baggage.iter().enumerate() {
        if i < COLLISION_BITSET_CAPACITY && overlaps & (1 << i) != 0 {
            continue;
        }
        write_str(buf, key)?;
        write_str(buf, value)?;
    }
    write_str(buf, THREAD_NAME_KEY)?;
    write_str(buf, &span.thread_name)?;
    write_str(buf, THREAD_ID_KEY)?;
    write_str(buf, &span.thread_id.to_string())?;
    for (key, value) in &span.tags {
        write_str(buf, key)?;
        // the consuming schema treats all meta values as text
        write_str(buf, &value.to_string())?;
    }
    Ok(())
}
