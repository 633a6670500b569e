//! Span and trace data model.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Sampling priority values propagated from the upstream sampler.
///
/// Anything other than the two drop values classifies a trace as "kept".
pub mod priority {
    /// The user explicitly dropped the trace.
    pub const USER_DROP: i32 = -1;
    /// The sampler decided to drop the trace.
    pub const SAMPLER_DROP: i32 = 0;
    /// The sampler decided to keep the trace.
    pub const SAMPLER_KEEP: i32 = 1;
    /// The user explicitly kept the trace.
    pub const USER_KEEP: i32 = 2;

    /// Returns true if the priority marks the trace as dropped.
    pub fn is_dropped(priority: i32) -> bool {
        priority == SAMPLER_DROP || priority == USER_DROP
    }
}

/// A tag value attached to a span.
///
/// Numeric tag values exist so instrumentation can set counters as tags, but
/// the v0.4 wire schema treats every meta value as text, so integers are
/// rendered as decimal strings at encode time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    /// Text value
    Str(String),
    /// Integer value, serialized as decimal text on the wire
    Int(i64),
}

impl TagValue {
    /// Returns the text form if this is a string tag
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagValue::Str(s) => Some(s),
            TagValue::Int(_) => None,
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Str(s) => f.write_str(s),
            TagValue::Int(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for TagValue {
    fn from(s: &str) -> Self {
        TagValue::Str(s.to_owned())
    }
}

impl From<String> for TagValue {
    fn from(s: String) -> Self {
        TagValue::Str(s)
    }
}

impl From<i64> for TagValue {
    fn from(n: i64) -> Self {
        TagValue::Int(n)
    }
}

/// A finished span handed to the export core by instrumentation.
///
/// Read-only from this crate's perspective: the core never mutates spans,
/// it only aggregates and encodes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    /// Name of the service that produced the span
    pub service: String,
    /// Logical operation name (e.g. `http.request`)
    pub operation: String,
    /// Resource within the operation (e.g. `GET /users/:id`)
    pub resource: String,
    /// Trace identifier shared by all spans of one trace
    pub trace_id: u64,
    /// Identifier of this span
    pub span_id: u64,
    /// Identifier of the parent span, 0 for root spans
    pub parent_id: u64,
    /// Start timestamp in unix nanoseconds
    pub start: i64,
    /// Duration in nanoseconds
    pub duration: i64,
    /// Span type (e.g. `web`, `db`), empty when unset
    pub span_type: String,
    /// Error count; nonzero marks the span as errored
    pub error: i32,
    /// Numeric metrics attached by instrumentation
    pub metrics: HashMap<String, f64>,
    /// Tags; win over baggage on key collision in the encoded meta map
    pub tags: HashMap<String, TagValue>,
    /// Propagated baggage items
    pub baggage: HashMap<String, String>,
    /// True when instrumentation explicitly requested metrics for this span
    pub measured: bool,
    /// True when this span is the local root of its service
    pub top_level: bool,
    /// Sampling priority, if one was assigned upstream
    pub sampling_priority: Option<i32>,
    /// Name of the thread that finished the span
    pub thread_name: String,
    /// Id of the thread that finished the span
    pub thread_id: u64,
}

/// An ordered sequence of spans sharing a trace id.
pub type Trace = Vec<Span>;

impl Span {
    /// Creates a new span builder
    pub fn builder() -> SpanBuilder {
        SpanBuilder::default()
    }

    /// Returns true if the span recorded an error
    pub fn has_error(&self) -> bool {
        self.error > 0
    }

    /// Returns true if this span should feed the metrics aggregator
    pub fn is_metric_eligible(&self) -> bool {
        self.top_level || self.measured
    }

    /// Gets a tag value by key
    pub fn get_tag(&self, key: &str) -> Option<&TagValue> {
        self.tags.get(key)
    }

    /// Reads the HTTP status tag as an integer, 0 when absent or non-numeric
    pub fn http_status(&self) -> u16 {
        match self.tags.get("http.status_code") {
            Some(TagValue::Int(n)) => u16::try_from(*n).unwrap_or(0),
            Some(TagValue::Str(s)) => s.parse().unwrap_or(0),
            None => 0,
        }
    }
}

/// Builder for constructing spans
#[derive(Debug, Clone)]
pub struct SpanBuilder {
    span: Span,
}

impl Default for SpanBuilder {
    fn default() -> Self {
        SpanBuilder {
            span: Span {
                service: String::new(),
                operation: String::new(),
                resource: String::new(),
                trace_id: 0,
                span_id: 0,
                parent_id: 0,
                start: 0,
                duration: 0,
                span_type: String::new(),
                error: 0,
                metrics: HashMap::new(),
                tags: HashMap::new(),
                baggage: HashMap::new(),
                measured: false,
                top_level: false,
                sampling_priority: None,
                thread_name: String::new(),
                thread_id: 0,
            },
        }
    }
}

impl SpanBuilder {
    /// Sets the service name
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.span.service = service.into();
        self
    }

    /// Sets the operation name
    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.span.operation = operation.into();
        self
    }

    /// Sets the resource name
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.span.resource = resource.into();
        self
    }

    /// Sets the trace id
    pub fn trace_id(mut self, id: u64) -> Self {
        self.span.trace_id = id;
        self
    }

    /// Sets the span id
    pub fn span_id(mut self, id: u64) -> Self {
        self.span.span_id = id;
        self
    }

    /// Sets the parent span id
    pub fn parent_id(mut self, id: u64) -> Self {
        self.span.parent_id = id;
        self
    }

    /// Sets the start timestamp in unix nanoseconds
    pub fn start(mut self, nanos: i64) -> Self {
        self.span.start = nanos;
        self
    }

    /// Sets the duration in nanoseconds
    pub fn duration(mut self, nanos: i64) -> Self {
        self.span.duration = nanos;
        self
    }

    /// Sets the span type
    pub fn span_type(mut self, span_type: impl Into<String>) -> Self {
        self.span.span_type = span_type.into();
        self
    }

    /// Sets the error count
    pub fn error(mut self, error: i32) -> Self {
        self.span.error = error;
        self
    }

    /// Adds a numeric metric
    pub fn metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.span.metrics.insert(key.into(), value);
        self
    }

    /// Adds a tag
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.span.tags.insert(key.into(), value.into());
        self
    }

    /// Adds a baggage item
    pub fn baggage(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.span.baggage.insert(key.into(), value.into());
        self
    }

    /// Marks the span as explicitly measured
    pub fn measured(mut self, measured: bool) -> Self {
        self.span.measured = measured;
        self
    }

    /// Marks the span as a service-local root
    pub fn top_level(mut self, top_level: bool) -> Self {
        self.span.top_level = top_level;
        self
    }

    /// Sets the sampling priority
    pub fn sampling_priority(mut self, priority: i32) -> Self {
        self.span.sampling_priority = Some(priority);
        self
    }

    /// Sets the reporting thread name
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.span.thread_name = name.into();
        self
    }

    /// Sets the reporting thread id
    pub fn thread_id(mut self, id: u64) -> Self {
        self.span.thread_id = id;
        self
    }

    /// Builds the span
    pub fn build(self) -> Span {
        self.span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_classification() {
        assert!(priority::is_dropped(priority::SAMPLER_DROP));
        assert!(priority::is_dropped(priority::USER_DROP));
        assert!(!priority::is_dropped(priority::SAMPLER_KEEP));
        assert!(!priority::is_dropped(priority::USER_KEEP));
        // unknown positive priorities are kept
        assert!(!priority::is_dropped(7));
    }

    #[test]
    fn test_span_builder() {
        let span = Span::builder()
            .service("web")
            .operation("http.request")
            .resource("GET /")
            .trace_id(1)
            .span_id(2)
            .duration(1_000)
            .top_level(true)
            .tag("http.status_code", 200i64)
            .build();
        assert_eq!(span.http_status(), 200);
        assert!(span.is_metric_eligible());
        assert!(!span.has_error());
    }

    #[test]
    fn test_http_status_from_text_tag() {
        let span = Span::builder().tag("http.status_code", "503").build();
        assert_eq!(span.http_status(), 503);
        let span = Span::builder().tag("http.status_code", "abc").build();
        assert_eq!(span.http_status(), 0);
        let span = Span::builder().build();
        assert_eq!(span.http_status(), 0);
    }

    #[test]
    fn test_tag_value_display() {
        assert_eq!(TagValue::from("prod").to_string(), "prod");
        assert_eq!(TagValue::from(42i64).to_string(), "42");
    }
}
