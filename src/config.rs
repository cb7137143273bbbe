// Tracer configuration
//
// Loaded from TOML (e.g. `latencywatch.toml`) or built in code; every field
// has a default so an empty file is a valid configuration.

use crate::error::{Result, TracerError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for a [`crate::hook::Tracer`]
///
/// # Example
/// ```
/// use latencywatch::config::TracerConfig;
///
/// let config = TracerConfig::from_toml_str("min_latency_us = 250").unwrap();
/// assert_eq!(config.min_latency_us, Some(250));
/// assert!(!config.start_enabled);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TracerConfig {
    /// Begin receiving events immediately instead of waiting for `enable()`
    ///
    /// Default: false
    pub start_enabled: bool,

    /// Only aggregate calls at least this slow (microseconds)
    ///
    /// Calls below the threshold still count toward their caller's child time,
    /// they are just not recorded under their own name. `None` aggregates
    /// every call.
    ///
    /// Default: None
    pub min_latency_us: Option<u64>,

    /// Number of recent consistency faults kept for the reporter
    ///
    /// Counters are unbounded; only the detailed log is capped.
    ///
    /// Default: 256
    pub fault_log_capacity: usize,

    /// Frames preallocated per thread stack
    ///
    /// Default: 32
    pub stack_capacity: usize,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            start_enabled: false,
            min_latency_us: None,
            fault_log_capacity: 256,
            stack_capacity: 32,
        }
    }
}

impl TracerConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: TracerConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), "loaded tracer config");
        Self::from_toml_str(&contents)
    }

    /// Reject values the tracer cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.fault_log_capacity == 0 {
            return Err(TracerError::InvalidConfig(
                "fault_log_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Threshold below which calls are not aggregated
    pub fn min_latency(&self) -> Option<Duration> {
        self.min_latency_us.map(Duration::from_micros)
    }

    /// Builder-style: start enabled
    pub fn enabled(mut self) -> Self {
        self.start_enabled = true;
        self
    }

    /// Builder-style: set the aggregation threshold
    pub fn with_min_latency(mut self, threshold: Duration) -> Self {
        self.min_latency_us = Some(threshold.as_micros() as u64);
        self
    }
}
