//! Error types for the tracker core.

use thiserror::Error;

/// Errors returned across the tracker boundary.
///
/// Every variant is raised before shared state is touched, so a failed call
/// never leaves a partial update behind.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackerError {
    /// Latitude outside [-90, 90], longitude outside [-180, 180], or not finite
    #[error("Invalid coordinate: lat={latitude}, lon={longitude}")]
    InvalidCoordinate { latitude: f64, longitude: f64 },

    /// Radius not positive, not finite, or above the allowed maximum
    #[error("Invalid radius: {radius_m}m (max {max_radius_m}m)")]
    InvalidRadius { radius_m: f64, max_radius_m: f64 },

    /// Agent ids must be non-empty
    #[error("Agent id must not be empty")]
    InvalidAgentId,

    #[error("Unknown agent status: {0}")]
    InvalidStatus(String),

    /// Explicit removal of an agent that has no live record
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TrackerError {
    /// Creates an invalid-coordinate error.
    pub fn coordinate(latitude: f64, longitude: f64) -> Self {
        Self::InvalidCoordinate { latitude, longitude }
    }

    /// Creates a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

/// Convenience alias used throughout the core.
pub type Result<T> = std::result::Result<T, TrackerError>;
