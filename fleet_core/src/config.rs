//! Tracker configuration.

use h3o::Resolution;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TrackerError};

/// Configuration for the Tracker
///
/// Deserializable so the composing layer can load it from whatever source
/// it owns; every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Seconds without an update before an agent is evicted (default: 60)
    pub staleness_threshold_secs: u64,

    /// Reaper period in seconds (default: half the staleness threshold)
    pub sweep_interval_secs: Option<u64>,

    /// Target grid cell edge in meters (default: 1000, H3 resolution 7)
    pub cell_edge_meters: f64,

    /// Largest radius `query_nearby` accepts (default: 10 km)
    pub max_radius_meters: f64,

    /// Number of independently locked partitions (default: 16)
    pub partition_count: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_secs: 60,
            sweep_interval_secs: None,
            cell_edge_meters: 1_000.0,
            max_radius_meters: 10_000.0,
            partition_count: 16,
        }
    }
}

impl TrackerConfig {
    /// Sets the staleness threshold.
    pub fn with_staleness_threshold(mut self, secs: u64) -> Self {
        self.staleness_threshold_secs = secs;
        self
    }

    /// Sets an explicit reaper period.
    pub fn with_sweep_interval(mut self, secs: u64) -> Self {
        self.sweep_interval_secs = Some(secs);
        self
    }

    /// Sets the target cell edge length.
    pub fn with_cell_edge(mut self, meters: f64) -> Self {
        self.cell_edge_meters = meters;
        self
    }

    /// Sets the maximum accepted query radius.
    pub fn with_max_radius(mut self, meters: f64) -> Self {
        self.max_radius_meters = meters;
        self
    }

    /// Sets the partition fan-out.
    pub fn with_partitions(mut self, count: usize) -> Self {
        self.partition_count = count;
        self
    }

    /// Checks every field, returning the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.staleness_threshold_secs == 0 {
            return Err(TrackerError::config("staleness_threshold_secs must be > 0"));
        }
        if self.sweep_interval_secs == Some(0) {
            return Err(TrackerError::config("sweep_interval_secs must be > 0"));
        }
        if !(self.cell_edge_meters.is_finite() && self.cell_edge_meters > 0.0) {
            return Err(TrackerError::config(format!(
                "cell_edge_meters must be a positive number, got {}",
                self.cell_edge_meters
            )));
        }
        if !(self.max_radius_meters.is_finite() && self.max_radius_meters > 0.0) {
            return Err(TrackerError::config(format!(
                "max_radius_meters must be a positive number, got {}",
                self.max_radius_meters
            )));
        }
        if self.partition_count == 0 {
            return Err(TrackerError::config("partition_count must be > 0"));
        }
        Ok(())
    }

    /// Staleness threshold as a `Duration`.
    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_secs)
    }

    /// Reaper period as a `Duration`.
    ///
    /// Falls back to half the threshold, never below one millisecond.
    pub fn sweep_interval(&self) -> Duration {
        match self.sweep_interval_secs {
            Some(secs) => Duration::from_secs(secs),
            None => (self.staleness_threshold() / 2).max(Duration::from_millis(1)),
        }
    }

    /// The H3 resolution matching `cell_edge_meters`.
    pub fn resolution(&self) -> Resolution {
        resolution_for_edge(self.cell_edge_meters)
    }
}

/// Finest H3 resolution whose average hexagon edge is at least `edge_m`.
///
/// Requests coarser than resolution 0 clamp to resolution 0.
pub fn resolution_for_edge(edge_m: f64) -> Resolution {
    let mut chosen = Resolution::Zero;
    for level in 0u8..=15 {
        let Ok(resolution) = Resolution::try_from(level) else {
            break;
        };
        if resolution.edge_length_m() >= edge_m {
            chosen = resolution;
        } else {
            break;
        }
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TrackerConfig::default();
        assert_eq!(config.staleness_threshold_secs, 60);
        assert_eq!(config.partition_count, 16);
        assert_eq!(config.max_radius_meters, 10_000.0);
        assert_eq!(config.sweep_interval(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_sweep_interval() {
        let config = TrackerConfig::default().with_sweep_interval(5);
        assert_eq!(config.sweep_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        assert!(TrackerConfig::default().with_partitions(0).validate().is_err());
        assert!(TrackerConfig::default().with_staleness_threshold(0).validate().is_err());
        assert!(TrackerConfig::default().with_cell_edge(-1.0).validate().is_err());
        assert!(TrackerConfig::default().with_max_radius(f64::NAN).validate().is_err());
        assert!(TrackerConfig::default().with_sweep_interval(0).validate().is_err());
    }

    #[test]
    fn test_resolution_for_edge() {
        // 1 km cells land on resolution 7 (~1.4 km average edge)
        assert_eq!(resolution_for_edge(1_000.0), Resolution::Seven);
        // Monotonic: larger edges never pick a finer resolution
        let coarse = u8::from(resolution_for_edge(10_000.0));
        let fine = u8::from(resolution_for_edge(100.0));
        assert!(coarse < fine);
        // Huge requests clamp to the coarsest level
        assert_eq!(resolution_for_edge(10_000_000.0), Resolution::Zero);
        // The chosen edge always covers the request
        assert!(resolution_for_edge(250.0).edge_length_m() >= 250.0);
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: TrackerConfig =
            serde_json::from_str(r#"{"staleness_threshold_secs": 10, "partition_count": 4}"#)
                .unwrap();
        assert_eq!(config.staleness_threshold_secs, 10);
        assert_eq!(config.partition_count, 4);
        assert_eq!(config.cell_edge_meters, 1_000.0);
        assert_eq!(config.sweep_interval(), Duration::from_secs(5));
    }
}
