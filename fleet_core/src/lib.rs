//! Fleet Tracker Core - In-Memory Geospatial Freshness Index
//!
//! Tracks the live position of a moving fleet and answers "who is within R
//! meters of P" under heavy concurrent write load:
//! 1. **Distance Engine**: haversine distance + coordinate validation
//! 2. **Spatial Index**: H3 cell buckets with k-ring candidate search
//! 3. **Agent Registry**: agent id → latest record
//! 4. **Freshness Reaper**: evicts agents that stop reporting
//! 5. **Tracker**: partitioned orchestration keeping 2 and 3 in lock-step

pub mod config;
pub mod distance;
pub mod error;
pub mod reaper;
pub mod registry;
pub mod spatial;
pub mod tracker;

// Re-export key types for convenience
pub use config::TrackerConfig;
pub use distance::{distance_m, validate_coordinate, Coordinate};
pub use error::TrackerError;
pub use reaper::{FreshnessReaper, ReaperHandle};
pub use registry::{AgentRecord, AgentRegistry, AgentStatus, StatusCounts};
pub use spatial::{CellGrid, CellKey, SpatialIndex, SpatialStats};
pub use tracker::{Nearby, NearbyResponse, Tracker, TrackerStats, UpdateAck, UpdateCounts};
