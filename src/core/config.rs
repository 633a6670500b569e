//! Configuration for the export core.
//!
//! All knobs are externally supplied; this crate only validates them and
//! threads them through as constructor parameters. Durations serialize in
//! human-friendly form (`10s`, `500ms`) via humantime.

use crate::core::{Result, TracewireError};
use crate::dispatch::Prioritization;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete configuration for the export core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Metrics aggregator configuration
    pub aggregator: AggregatorConfig,
    /// Trace dispatch configuration
    pub dispatch: DispatchConfig,
    /// Wire payload configuration
    pub export: ExportConfig,
    /// Process-wide identity tags attached to metric buckets
    pub tags: WellKnownTags,
}

/// Metrics aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// How often aggregated metrics are reported
    #[serde(with = "humantime_serde")]
    pub reporting_interval: Duration,
    /// Maximum distinct aggregation keys retained per interval
    pub max_aggregates: usize,
    /// Capacity of the consumer inbox queue
    pub inbox_capacity: usize,
    /// Soft cap on the first-seen key set used for force-keep decisions
    pub max_new_keys: usize,
}

/// Trace dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Backpressure policy applied when queues fill up
    pub prioritization: Prioritization,
    /// Capacity of the primary queue
    pub primary_capacity: usize,
    /// Capacity of the secondary queue
    pub secondary_capacity: usize,
}

/// Wire payload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Byte ceiling for one accumulated payload
    pub max_payload_bytes: usize,
}

/// Process identity tags reported with every metric bucket
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WellKnownTags {
    /// Host the process runs on
    pub hostname: String,
    /// Deployment environment (e.g. `prod`)
    pub env: String,
    /// Default service name
    pub service: String,
    /// Application version
    pub version: String,
    /// Tracer implementation language
    pub language: String,
    /// Stable id of this tracer process
    pub runtime_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            aggregator: AggregatorConfig::default(),
            dispatch: DispatchConfig::default(),
            export: ExportConfig::default(),
            tags: WellKnownTags::default(),
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        AggregatorConfig {
            reporting_interval: Duration::from_secs(10),
            max_aggregates: 2048,
            inbox_capacity: 2048,
            max_new_keys: 10_000,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            prioritization: Prioritization::FastLane,
            primary_capacity: 1024,
            secondary_capacity: 1024,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        ExportConfig {
            // 5MiB, sized to what the collector accepts in one request
            max_payload_bytes: 5 << 20,
        }
    }
}

impl Config {
    /// Parses a configuration from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.aggregator.reporting_interval.is_zero() {
            return Err(TracewireError::config("reporting_interval must be positive"));
        }
        if self.aggregator.max_aggregates == 0 {
            return Err(TracewireError::config("max_aggregates must be positive"));
        }
        if self.aggregator.inbox_capacity == 0 {
            return Err(TracewireError::config("inbox_capacity must be positive"));
        }
        if self.dispatch.primary_capacity == 0 || self.dispatch.secondary_capacity == 0 {
            return Err(TracewireError::config("queue capacities must be positive"));
        }
        if self.export.max_payload_bytes == 0 {
            return Err(TracewireError::config("max_payload_bytes must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.aggregator.reporting_interval, Duration::from_secs(10));
        assert_eq!(config.export.max_payload_bytes, 5 << 20);
    }

    #[test]
    fn test_json_round_trip() {
        let config = Config::default();
        let json = config.to_json().unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.aggregator.max_aggregates, config.aggregator.max_aggregates);
        assert_eq!(parsed.dispatch.primary_capacity, config.dispatch.primary_capacity);
    }

    #[test]
    fn test_humantime_interval() {
        let config = Config::from_json(r#"{"aggregator": {"reporting_interval": "2s"}}"#).unwrap();
        assert_eq!(config.aggregator.reporting_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let result = Config::from_json(r#"{"dispatch": {"primary_capacity": 0}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_strategy_parsing() {
        let config =
            Config::from_json(r#"{"dispatch": {"prioritization": "ensure_trace"}}"#).unwrap();
        assert_eq!(config.dispatch.prioritization, Prioritization::EnsureTrace);
    }
}
