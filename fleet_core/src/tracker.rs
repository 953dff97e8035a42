//! Tracker Service - keeps the Agent Registry and Spatial Index in lock-step.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Tracker                            │
//! │   hash(agent_id) % partition_count                           │
//! │        │                                                     │
//! │  ┌─────▼──────────────┐ ┌────────────────────┐               │
//! │  │ RwLock<Partition>  │ │ RwLock<Partition>  │   ...         │
//! │  │  ┌──────────────┐  │ │  ┌──────────────┐  │               │
//! │  │  │ AgentRegistry│  │ │  │ AgentRegistry│  │               │
//! │  │  ├──────────────┤  │ │  ├──────────────┤  │               │
//! │  │  │ SpatialIndex │  │ │  │ SpatialIndex │  │               │
//! │  │  └──────────────┘  │ │  └──────────────┘  │               │
//! │  └────────────────────┘ └────────────────────┘               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each partition owns both halves of an agent's state behind one lock, so
//! an update, a query hit, and an eviction always see the record and its
//! cell membership together.

use fleet_env::FleetContext;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info, trace};

use crate::config::TrackerConfig;
use crate::distance::{distance_m, validate_coordinate, Coordinate};
use crate::error::{Result, TrackerError};
use crate::reaper::{FreshnessReaper, ReaperHandle};
use crate::registry::{AgentRecord, AgentRegistry, AgentStatus, StatusCounts};
use crate::spatial::{CellGrid, CellKey, SpatialIndex, SpatialStats};

/// One independently locked shard of the tracker.
#[derive(Debug)]
pub(crate) struct Partition {
    pub(crate) registry: AgentRegistry,
    pub(crate) index: SpatialIndex,
}

impl Partition {
    fn new(grid: CellGrid) -> Self {
        Self {
            registry: AgentRegistry::new(),
            index: SpatialIndex::new(grid.resolution()),
        }
    }
}

/// Acknowledgement for an accepted position update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpdateAck {
    /// Cell the agent is now filed under
    pub cell: CellKey,

    /// First update seen for this agent id
    pub created: bool,

    /// The agent crossed into a different cell
    pub cell_changed: bool,
}

/// One proximity hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nearby {
    #[serde(rename = "id")]
    pub agent_id: String,
    pub distance_m: f64,
}

/// A query answer in the `{count, drivers}` shape callers render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyResponse {
    pub count: usize,
    pub drivers: Vec<Nearby>,
}

impl From<Vec<Nearby>> for NearbyResponse {
    fn from(drivers: Vec<Nearby>) -> Self {
        Self {
            count: drivers.len(),
            drivers,
        }
    }
}

/// Accepted updates per reported status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCounts {
    pub online: u64,
    pub busy: u64,
    pub offline: u64,
}

/// Point-in-time summary of the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerStats {
    pub agents: usize,
    pub partitions: usize,
    pub spatial: SpatialStats,
    pub status: StatusCounts,
    pub updates: UpdateCounts,
    pub queries: u64,
    pub evictions: u64,
    pub removals: u64,
}

#[derive(Debug, Default)]
struct Counters {
    updates_by_status: [AtomicU64; 3],
    queries: AtomicU64,
    evictions: AtomicU64,
    removals: AtomicU64,
}

/// The geospatial freshness index.
///
/// Generic over the context so the same tracker runs against the Tokio
/// clock in production and a virtual clock in simulation. Share it with
/// `Arc<Tracker<_>>`; every operation takes `&self`.
pub struct Tracker<Ctx: FleetContext> {
    context: Arc<Ctx>,
    config: TrackerConfig,
    grid: CellGrid,
    partitions: Box<[RwLock<Partition>]>,
    counters: Counters,
}

impl<Ctx: FleetContext> Tracker<Ctx> {
    /// Creates an empty tracker after validating `config`.
    pub fn new(context: Arc<Ctx>, config: TrackerConfig) -> Result<Self> {
        config.validate()?;

        let grid = CellGrid::new(config.resolution());
        let partitions = (0..config.partition_count)
            .map(|_| RwLock::new(Partition::new(grid)))
            .collect();

        info!(
            "Tracker ready: {} partitions, H3 resolution {} (~{:.0}m cells), staleness {}s",
            config.partition_count,
            u8::from(grid.resolution()),
            grid.edge_length_m(),
            config.staleness_threshold_secs,
        );

        Ok(Self {
            context,
            config,
            grid,
            partitions,
            counters: Counters::default(),
        })
    }

    pub fn context(&self) -> &Arc<Ctx> {
        &self.context
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn grid(&self) -> CellGrid {
        self.grid
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// The partition that owns `agent_id`.
    pub fn partition_of(&self, agent_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        agent_id.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as usize
    }

    // Every critical section leaves both maps consistent, so a poisoned
    // lock still guards valid data.
    fn read(&self, partition: usize) -> RwLockReadGuard<'_, Partition> {
        self.partitions[partition]
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, partition: usize) -> RwLockWriteGuard<'_, Partition> {
        self.partitions[partition]
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Records the latest position and status of an agent.
    ///
    /// Coordinates are snapped to 6 decimals before storage. The registry
    /// upsert and the cell move happen under one partition write lock.
    pub fn update_position(
        &self,
        agent_id: &str,
        latitude: f64,
        longitude: f64,
        status: AgentStatus,
    ) -> Result<UpdateAck> {
        if agent_id.is_empty() {
            return Err(TrackerError::InvalidAgentId);
        }
        let position = Coordinate::try_new(latitude, longitude)?.rounded();
        let cell = self.grid.cell_key_for(position.latitude, position.longitude)?;

        let now = self.context.now();
        let reported_at = self.context.system_time();
        let partition_idx = self.partition_of(agent_id);

        let (created, cell_changed) = {
            let mut guard = self.write(partition_idx);
            let partition = &mut *guard;

            let previous = partition
                .registry
                .upsert(agent_id, position, status, now, reported_at);

            match (previous, partition.index.cell_of(agent_id)) {
                (None, _) => {
                    partition.index.insert(cell, agent_id);
                    (true, false)
                }
                (Some(_), Some(old_cell)) => {
                    let moved = partition.index.move_agent(old_cell, cell, agent_id);
                    (false, moved)
                }
                (Some(_), None) => {
                    debug_assert!(false, "agent {agent_id} had a record but no index entry");
                    partition.index.insert(cell, agent_id);
                    (false, true)
                }
            }
        };

        self.counters.updates_by_status[status.slot()].fetch_add(1, Ordering::Relaxed);
        if created {
            debug!(agent = agent_id, %cell, "Agent registered");
        }

        Ok(UpdateAck {
            cell,
            created,
            cell_changed,
        })
    }

    /// Removes an agent explicitly.
    pub fn remove_agent(&self, agent_id: &str) -> Result<AgentRecord> {
        let partition_idx = self.partition_of(agent_id);
        let removed = {
            let mut partition = self.write(partition_idx);
            let record = partition.registry.remove(agent_id);
            if record.is_some() {
                let cell = partition.index.remove_agent(agent_id);
                debug_assert!(cell.is_some(), "agent {agent_id} had a record but no index entry");
            }
            record
        };

        match removed {
            Some(record) => {
                self.counters.removals.fetch_add(1, Ordering::Relaxed);
                debug!(agent = agent_id, "Agent removed");
                Ok(record)
            }
            None => Err(TrackerError::AgentNotFound(agent_id.to_string())),
        }
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Agents within `radius_m` of a point, capped by the configured maximum.
    pub fn query_nearby(&self, latitude: f64, longitude: f64, radius_m: f64) -> Result<Vec<Nearby>> {
        self.query_nearby_capped(latitude, longitude, radius_m, self.config.max_radius_meters)
    }

    /// Agents within `radius_m` of a point, with an explicit radius cap.
    ///
    /// Sorted by ascending distance, ties broken by agent id. The boundary is
    /// inclusive. Distances are computed from the registry record read under
    /// the partition lock, never from the cell.
    pub fn query_nearby_capped(
        &self,
        latitude: f64,
        longitude: f64,
        radius_m: f64,
        max_radius_m: f64,
    ) -> Result<Vec<Nearby>> {
        if !validate_coordinate(latitude, longitude) {
            return Err(TrackerError::coordinate(latitude, longitude));
        }
        let radius_ok = radius_m.is_finite() && radius_m > 0.0;
        let max_ok = max_radius_m.is_finite() && max_radius_m > 0.0;
        if !(radius_ok && max_ok && radius_m <= max_radius_m) {
            return Err(TrackerError::InvalidRadius {
                radius_m,
                max_radius_m,
            });
        }

        let center = Coordinate::new(latitude, longitude);
        let populated: usize = (0..self.partitions.len())
            .map(|idx| self.read(idx).index.cell_count())
            .sum();
        let cover = self.grid.covering_cells_within(center, radius_m, populated)?;

        let mut results = Vec::new();
        for partition_idx in 0..self.partitions.len() {
            let partition = self.read(partition_idx);
            for agent_id in partition.index.candidates_in(&cover) {
                // Evicted between index lookup and fetch: drop silently
                let Some(record) = partition.registry.get(agent_id) else {
                    continue;
                };
                let distance = distance_m(center, record.coordinate());
                if distance <= radius_m {
                    results.push(Nearby {
                        agent_id: record.agent_id.clone(),
                        distance_m: distance,
                    });
                }
            }
        }

        results.sort_by(|a, b| {
            a.distance_m
                .total_cmp(&b.distance_m)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });

        self.counters.queries.fetch_add(1, Ordering::Relaxed);
        trace!(
            lat = latitude,
            lon = longitude,
            radius_m,
            cells = cover.len(),
            scan_all = cover.is_everything(),
            hits = results.len(),
            "Nearby query"
        );

        Ok(results)
    }

    /// Current record for `agent_id`.
    pub fn get_agent(&self, agent_id: &str) -> Option<AgentRecord> {
        self.read(self.partition_of(agent_id))
            .registry
            .get(agent_id)
            .cloned()
    }

    /// Copies every live record, one partition at a time.
    ///
    /// Each partition is consistent with itself; records in other partitions
    /// may move while the copy is taken.
    pub fn snapshot(&self) -> Vec<AgentRecord> {
        (0..self.partitions.len())
            .flat_map(|idx| self.read(idx).registry.snapshot())
            .collect()
    }

    /// Number of live agents.
    pub fn agent_count(&self) -> usize {
        (0..self.partitions.len())
            .map(|idx| self.read(idx).registry.len())
            .sum()
    }

    /// Aggregated counters and index shape.
    pub fn stats(&self) -> TrackerStats {
        let mut agents = 0;
        let mut entries = 0;
        let mut cells: HashSet<CellKey> = HashSet::new();
        let mut status = StatusCounts::default();

        for idx in 0..self.partitions.len() {
            let partition = self.read(idx);
            agents += partition.registry.len();
            entries += partition.index.len();
            cells.extend(partition.index.locations().map(|(_, cell)| cell));
            status.merge(partition.registry.status_counts());
        }

        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let [online, busy, offline] = &self.counters.updates_by_status;

        TrackerStats {
            agents,
            partitions: self.partitions.len(),
            spatial: SpatialStats::from_totals(entries, cells.len(), self.grid.resolution()),
            status,
            updates: UpdateCounts {
                online: load(online),
                busy: load(busy),
                offline: load(offline),
            },
            queries: load(&self.counters.queries),
            evictions: load(&self.counters.evictions),
            removals: load(&self.counters.removals),
        }
    }

    /// Verifies that registry and index agree in every partition.
    ///
    /// Returns a description of the first disagreement found.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        for idx in 0..self.partitions.len() {
            let partition = self.read(idx);

            if partition.registry.len() != partition.index.len() {
                return Err(format!(
                    "partition {idx}: {} records but {} index entries",
                    partition.registry.len(),
                    partition.index.len()
                ));
            }

            for record in partition.registry.records() {
                let id = record.agent_id.as_str();
                if self.partition_of(id) != idx {
                    return Err(format!("agent {id} stored in partition {idx}"));
                }
                let expected = self
                    .grid
                    .cell_key_for(record.latitude, record.longitude)
                    .map_err(|e| e.to_string())?;
                if partition.index.cell_of(id) != Some(expected) {
                    return Err(format!(
                        "agent {id} filed under {:?}, position maps to {expected}",
                        partition.index.cell_of(id)
                    ));
                }
                if !partition.index.members(&expected).any(|member| member == id) {
                    return Err(format!("agent {id} missing from cell {expected}"));
                }
            }

            for (id, _) in partition.index.locations() {
                if !partition.registry.contains(id) {
                    return Err(format!("index entry for {id} has no record"));
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // EXPIRY (used by the reaper)
    // ========================================================================

    /// Ids in one partition that look stale at `now`. Read lock only.
    pub(crate) fn stale_in_partition(&self, partition: usize, now: Duration, threshold: Duration) -> Vec<String> {
        self.read(partition).registry.stale_ids(now, threshold)
    }

    /// Evicts `agent_id` if it is still stale under the write lock.
    ///
    /// An update that landed after the stale scan keeps the agent alive.
    pub(crate) fn evict_if_stale(
        &self,
        partition_idx: usize,
        agent_id: &str,
        now: Duration,
        threshold: Duration,
    ) -> bool {
        let mut partition = self.write(partition_idx);

        let stale = partition
            .registry
            .get(agent_id)
            .is_some_and(|record| record.is_stale(now, threshold));
        if !stale {
            return false;
        }

        partition.registry.remove(agent_id);
        let cell = partition.index.remove_agent(agent_id);
        debug_assert!(cell.is_some(), "agent {agent_id} had a record but no index entry");
        drop(partition);

        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Starts the background freshness reaper on this tracker's context.
    pub fn start_reaper(self: &Arc<Self>) -> ReaperHandle {
        FreshnessReaper::new(Arc::clone(self)).spawn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use fleet_env::TokioContext;

    const TAIPEI_101: (f64, f64) = (25.0330, 121.5654);

    fn tracker() -> Tracker<TokioContext> {
        Tracker::new(TokioContext::shared(), TrackerConfig::default()).unwrap()
    }

    fn ids(results: &[Nearby]) -> Vec<&str> {
        results.iter().map(|n| n.agent_id.as_str()).collect()
    }

    #[test]
    fn test_update_then_query_same_point() {
        let tracker = tracker();
        let (lat, lon) = TAIPEI_101;

        let ack = tracker.update_position("A", lat, lon, AgentStatus::Online).unwrap();
        assert!(ack.created);
        assert!(!ack.cell_changed);

        let results = tracker.query_nearby(lat, lon, 100.0).unwrap();
        assert_eq!(ids(&results), vec!["A"]);
        assert!(results[0].distance_m < 1.0);
    }

    #[test]
    fn test_concrete_walkthrough() {
        let tracker = tracker();
        let (lat, lon) = TAIPEI_101;

        tracker.update_position("A", lat, lon, AgentStatus::Online).unwrap();
        let hit = tracker.query_nearby(lat, lon, 100.0).unwrap();
        assert_eq!(ids(&hit), vec!["A"]);
        assert_abs_diff_eq!(hit[0].distance_m, 0.0, epsilon = 1e-6);

        // ~2 km north
        let miss = tracker.query_nearby(lat + 0.018, lon, 100.0).unwrap();
        assert!(miss.is_empty());

        // Move ~50 m north
        let ack = tracker.update_position("A", lat + 0.00045, lon, AgentStatus::Online).unwrap();
        assert!(!ack.created);

        let moved = tracker.query_nearby(lat, lon, 100.0).unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].agent_id, "A");
        assert_abs_diff_eq!(moved[0].distance_m, 50.0, epsilon = 1.0);
        tracker.check_invariants().unwrap();
    }

    #[test]
    fn test_repeated_update_is_idempotent() {
        let tracker = tracker();
        let (lat, lon) = TAIPEI_101;

        for _ in 0..25 {
            tracker.update_position("A", lat, lon, AgentStatus::Busy).unwrap();
        }

        assert_eq!(tracker.agent_count(), 1);
        let stats = tracker.stats();
        assert_eq!(stats.spatial.total_entries, 1);
        assert_eq!(stats.updates.busy, 25);
        assert_eq!(tracker.query_nearby(lat, lon, 50.0).unwrap().len(), 1);
        tracker.check_invariants().unwrap();
    }

    #[test]
    fn test_results_sorted_with_id_tiebreak() {
        let tracker = tracker();
        let (lat, lon) = TAIPEI_101;

        tracker.update_position("far", lat + 0.002, lon, AgentStatus::Online).unwrap();
        tracker.update_position("twin_b", lat + 0.001, lon, AgentStatus::Online).unwrap();
        tracker.update_position("twin_a", lat + 0.001, lon, AgentStatus::Busy).unwrap();
        tracker.update_position("here", lat, lon, AgentStatus::Online).unwrap();

        let results = tracker.query_nearby(lat, lon, 1_000.0).unwrap();
        assert_eq!(ids(&results), vec!["here", "twin_a", "twin_b", "far"]);
        assert!(results.windows(2).all(|w| w[0].distance_m <= w[1].distance_m));
    }

    #[test]
    fn test_radius_boundary_is_inclusive() {
        let tracker = tracker();
        let (lat, lon) = TAIPEI_101;
        let agent = Coordinate::new(25.0355, 121.5671);
        tracker
            .update_position("edge", agent.latitude, agent.longitude, AgentStatus::Online)
            .unwrap();

        let exact = distance_m(Coordinate::new(lat, lon), agent);
        assert_eq!(ids(&tracker.query_nearby(lat, lon, exact).unwrap()), vec!["edge"]);
        assert!(tracker.query_nearby(lat, lon, exact - 0.001).unwrap().is_empty());
    }

    #[test]
    fn test_coordinates_stored_at_six_decimals() {
        let tracker = tracker();
        tracker
            .update_position("A", 25.03300049, 121.56540051, AgentStatus::Online)
            .unwrap();

        let record = tracker.get_agent("A").unwrap();
        assert_eq!(record.latitude, 25.033);
        assert_eq!(record.longitude, 121.565401);
    }

    #[test]
    fn test_invalid_input_rejected_before_state_changes() {
        let tracker = tracker();
        let (lat, lon) = TAIPEI_101;

        assert!(matches!(
            tracker.update_position("A", 91.0, lon, AgentStatus::Online),
            Err(TrackerError::InvalidCoordinate { .. })
        ));
        assert!(matches!(
            tracker.update_position("A", lat, f64::NAN, AgentStatus::Online),
            Err(TrackerError::InvalidCoordinate { .. })
        ));
        assert_eq!(
            tracker.update_position("", lat, lon, AgentStatus::Online),
            Err(TrackerError::InvalidAgentId)
        );
        assert_eq!(tracker.agent_count(), 0);

        assert!(matches!(
            tracker.query_nearby(lat, 181.0, 100.0),
            Err(TrackerError::InvalidCoordinate { .. })
        ));
        for radius in [0.0, -5.0, f64::NAN, 10_000.5] {
            assert!(
                matches!(
                    tracker.query_nearby(lat, lon, radius),
                    Err(TrackerError::InvalidRadius { .. })
                ),
                "radius {radius} accepted"
            );
        }
        // Exactly the maximum is allowed
        assert!(tracker.query_nearby(lat, lon, 10_000.0).is_ok());
        // An explicit cap overrides the configured one
        assert!(tracker.query_nearby_capped(lat, lon, 20_000.0, 25_000.0).is_ok());
        assert!(tracker.query_nearby_capped(lat, lon, 600.0, 500.0).is_err());
    }

    #[test]
    fn test_status_changes_without_moving() {
        let tracker = tracker();
        let (lat, lon) = TAIPEI_101;

        tracker.update_position("A", lat, lon, AgentStatus::Online).unwrap();
        let ack = tracker.update_position("A", lat, lon, AgentStatus::Busy).unwrap();
        assert!(!ack.cell_changed);

        assert_eq!(tracker.get_agent("A").unwrap().status, AgentStatus::Busy);
        assert_eq!(tracker.stats().status.busy, 1);
        assert_eq!(tracker.stats().status.online, 0);
    }

    #[test]
    fn test_cell_change_is_reported() {
        let tracker = tracker();
        let (lat, lon) = TAIPEI_101;

        let first = tracker.update_position("A", lat, lon, AgentStatus::Online).unwrap();
        // ~20 km north, several cells away at the default resolution
        let second = tracker.update_position("A", lat + 0.18, lon, AgentStatus::Online).unwrap();

        assert!(second.cell_changed);
        assert_ne!(first.cell, second.cell);
        assert!(tracker.query_nearby(lat, lon, 1_000.0).unwrap().is_empty());
        assert_eq!(tracker.stats().spatial.total_cells, 1);
        tracker.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_agent() {
        let tracker = tracker();
        let (lat, lon) = TAIPEI_101;
        tracker.update_position("A", lat, lon, AgentStatus::Online).unwrap();

        let removed = tracker.remove_agent("A").unwrap();
        assert_eq!(removed.agent_id, "A");
        assert!(tracker.query_nearby(lat, lon, 100.0).unwrap().is_empty());
        assert_eq!(
            tracker.remove_agent("A"),
            Err(TrackerError::AgentNotFound("A".to_string()))
        );
        assert_eq!(tracker.stats().removals, 1);
        tracker.check_invariants().unwrap();
    }

    #[test]
    fn test_agents_spread_across_partitions() {
        let tracker = tracker();
        let (lat, lon) = TAIPEI_101;

        for i in 0..200 {
            let id = format!("driver_{i:03}");
            tracker
                .update_position(&id, lat + (i as f64) * 1e-5, lon, AgentStatus::Online)
                .unwrap();
        }

        let used: HashSet<usize> = (0..200)
            .map(|i| tracker.partition_of(&format!("driver_{i:03}")))
            .collect();
        assert!(used.len() > 1);
        assert_eq!(tracker.snapshot().len(), 200);
        assert_eq!(tracker.query_nearby(lat, lon, 1_000.0).unwrap().len(), 200);
        tracker.check_invariants().unwrap();
    }

    #[test]
    fn test_nearby_response_shape() {
        let response = NearbyResponse::from(vec![Nearby {
            agent_id: "driver_1".to_string(),
            distance_m: 3.5,
        }]);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"count": 1, "drivers": [{"id": "driver_1", "distance_m": 3.5}]})
        );
    }

    #[test]
    fn test_concurrent_writers_never_tear_records() {
        const WRITERS: usize = 4;
        const AGENTS_PER_WRITER: usize = 25;
        const ROUNDS: usize = 200;

        let tracker = tracker();
        let (lat, lon) = TAIPEI_101;

        // Each agent flips between two states that differ in every field,
        // so a torn record can never match either one.
        let state = |i: usize, flip: bool| -> (Coordinate, AgentStatus) {
            let base = (i as f64) * 1e-4;
            if flip {
                (Coordinate::new(lat + base, lon + 0.002).rounded(), AgentStatus::Busy)
            } else {
                (Coordinate::new(lat + 0.002 + base, lon).rounded(), AgentStatus::Online)
            }
        };
        let agent_index = |id: &str| -> usize { id.trim_start_matches("agent_").parse().unwrap() };

        std::thread::scope(|scope| {
            for w in 0..WRITERS {
                let tracker = &tracker;
                scope.spawn(move || {
                    for round in 0..ROUNDS {
                        for j in 0..AGENTS_PER_WRITER {
                            let i = w * AGENTS_PER_WRITER + j;
                            let (at, status) = state(i, round % 2 == 1);
                            tracker
                                .update_position(&format!("agent_{i}"), at.latitude, at.longitude, status)
                                .unwrap();
                        }
                    }
                });
            }

            for _ in 0..2 {
                let tracker = &tracker;
                scope.spawn(move || {
                    let center = Coordinate::new(lat, lon);
                    for _ in 0..ROUNDS {
                        let results = tracker.query_nearby(lat, lon, 2_000.0).unwrap();

                        let unique: HashSet<&str> = ids(&results).into_iter().collect();
                        assert_eq!(unique.len(), results.len(), "agent returned twice");

                        for hit in &results {
                            let i = agent_index(&hit.agent_id);
                            let a = distance_m(center, state(i, false).0);
                            let b = distance_m(center, state(i, true).0);
                            assert!(
                                (hit.distance_m - a).abs() < 1e-6 || (hit.distance_m - b).abs() < 1e-6,
                                "{} at {}m matches neither written state",
                                hit.agent_id,
                                hit.distance_m
                            );

                            if let Some(record) = tracker.get_agent(&hit.agent_id) {
                                let seen = (record.coordinate(), record.status);
                                assert!(
                                    seen == state(i, false) || seen == state(i, true),
                                    "torn record {seen:?}"
                                );
                            }
                        }
                    }
                });
            }
        });

        assert_eq!(tracker.agent_count(), WRITERS * AGENTS_PER_WRITER);
        tracker.check_invariants().unwrap();
    }

    #[test]
    fn test_concurrent_updates_to_one_agent_never_mix() {
        const ROUNDS: usize = 2_000;

        let config = TrackerConfig::default().with_partitions(2);
        let tracker = Tracker::new(TokioContext::shared(), config).unwrap();
        let (lat, lon) = TAIPEI_101;
        let center = Coordinate::new(lat, lon);

        // One state per writer, distinct in latitude, longitude and status
        let states: Vec<(Coordinate, AgentStatus)> = AgentStatus::ALL
            .iter()
            .enumerate()
            .map(|(w, status)| {
                let step = (w as f64 + 1.0) * 1e-3;
                (Coordinate::new(lat + step, lon - step).rounded(), *status)
            })
            .collect();
        let states = &states;

        std::thread::scope(|scope| {
            for (at, status) in states.iter().copied() {
                let tracker = &tracker;
                scope.spawn(move || {
                    for _ in 0..ROUNDS {
                        tracker
                            .update_position("X", at.latitude, at.longitude, status)
                            .unwrap();
                    }
                });
            }

            for _ in 0..2 {
                let tracker = &tracker;
                scope.spawn(move || {
                    for _ in 0..ROUNDS {
                        if let Some(record) = tracker.get_agent("X") {
                            let seen = (record.coordinate(), record.status);
                            assert!(states.contains(&seen), "mixed record {seen:?}");
                        }

                        let results = tracker.query_nearby(lat, lon, 2_000.0).unwrap();
                        assert!(results.len() <= 1, "X returned {} times", results.len());
                        for hit in &results {
                            assert!(
                                states
                                    .iter()
                                    .any(|(at, _)| (distance_m(center, *at) - hit.distance_m).abs() < 1e-6),
                                "X at {}m matches no written position",
                                hit.distance_m
                            );
                        }
                    }
                });
            }
        });

        let record = tracker.get_agent("X").unwrap();
        assert!(states.contains(&(record.coordinate(), record.status)));
        assert_eq!(tracker.agent_count(), 1);
        assert_eq!(tracker.stats().spatial.total_entries, 1);
        tracker.check_invariants().unwrap();
    }

    #[test]
    fn test_huge_capped_radius_scans_populated_cells() {
        let tracker = tracker();
        let (lat, lon) = TAIPEI_101;
        tracker.update_position("taipei", lat, lon, AgentStatus::Online).unwrap();
        // Kaohsiung, ~300 km south
        tracker.update_position("kaohsiung", 22.6273, 120.3014, AgentStatus::Busy).unwrap();
        // Tokyo, ~2100 km away
        tracker.update_position("tokyo", 35.6762, 139.6503, AgentStatus::Online).unwrap();

        let results = tracker
            .query_nearby_capped(lat, lon, 1_000_000.0, 2_000_000.0)
            .unwrap();
        assert_eq!(ids(&results), vec!["taipei", "kaohsiung"]);
        assert_abs_diff_eq!(results[0].distance_m, 0.0, epsilon = 1e-6);
        assert!(results[1].distance_m > 250_000.0 && results[1].distance_m < 350_000.0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Tracker::new(TokioContext::shared(), TrackerConfig::default().with_partitions(0));
        assert!(matches!(result, Err(TrackerError::InvalidConfig(_))));
    }
}
