//! Aggregation key identity.

use crate::core::Span;
use std::sync::Arc;

/// Identity of one aggregation bucket for one reporting interval.
///
/// Fields are shared strings so that recycling the key of a superseded
/// batch (see [`crate::metrics::ConflatingAggregator`]) is a pointer clone
/// rather than a reallocation of every component on high-churn keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricKey {
    /// Resource within the operation
    pub resource: Arc<str>,
    /// Service the span belongs to
    pub service: Arc<str>,
    /// Logical operation name
    pub operation: Arc<str>,
    /// Span type, empty when unset
    pub span_type: Arc<str>,
    /// HTTP status tag, 0 when absent
    pub http_status: u16,
}

impl MetricKey {
    /// Builds the aggregation key for a span.
    pub fn from_span(span: &Span) -> Self {
        MetricKey {
            resource: Arc::from(span.resource.as_str()),
            service: Arc::from(span.service.as_str()),
            operation: Arc::from(span.operation.as_str()),
            span_type: Arc::from(span.span_type.as_str()),
            http_status: span.http_status(),
        }
    }
}
