//! Core domain models for the export core.
//!
//! This module contains the span/trace data model, the configuration
//! surface, and the crate-wide error type.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use config::{AggregatorConfig, Config, DispatchConfig, ExportConfig, WellKnownTags};
pub use error::{Result, TracewireError};
pub use types::{priority, Span, SpanBuilder, TagValue, Trace};
