//! SimWorld - The simulation harness container.
//!
//! Owns the virtual clock, the ground truth oracle and the tracker under
//! test, and drives them in lock-step one tick at a time.

use crate::context::SimContext;
use crate::oracle::{Oracle, PositionReport};

use fleet_core::{
    Coordinate, FreshnessReaper, Nearby, Tracker, TrackerConfig, TrackerError,
};
use fleet_env::FleetContext;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of drivers to spawn
    pub num_drivers: usize,

    /// Tick rate in Hz
    pub tick_rate_hz: u32,

    /// Maximum simulation duration in seconds (0 = unlimited)
    pub max_duration_secs: f64,

    /// GPS noise standard deviation for position reports (meters)
    pub gps_noise_std_m: f64,

    /// Driver speed range in m/s
    pub speed_range: (f64, f64),

    /// Tracker under test
    pub tracker: TrackerConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_drivers: 200,
            tick_rate_hz: 1,
            max_duration_secs: 60.0,
            gps_noise_std_m: 5.0,
            speed_range: (0.0, 15.0),
            tracker: TrackerConfig::default(),
        }
    }
}

/// The last report the tracker accepted for a driver.
#[derive(Debug, Clone, Copy)]
pub struct AcceptedReport {
    /// Position as stored (rounded)
    pub position: Coordinate,
    /// Virtual time of the report
    pub at: Duration,
}

/// What happened during one tick.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub updates: u64,
    pub rejected: u64,
    pub cell_changes: u64,
    pub evictions: u64,
    pub swept: bool,
}

/// The SimWorld - container for the entire simulation.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    /// Ground truth oracle
    pub oracle: Oracle,

    /// Tracker under test
    pub tracker: Arc<Tracker<SimContext>>,

    reaper: FreshnessReaper<SimContext>,

    /// Accepted reports by driver id
    accepted: BTreeMap<String, AcceptedReport>,

    last_sweep: Duration,

    /// Current tick count
    tick_count: u64,
}

impl SimWorld {
    /// Creates a new SimWorld with the given configuration.
    pub fn new(config: SimConfig) -> Result<Self, TrackerError> {
        // Physics gets its own seed stream
        let physics_seed = config.seed.wrapping_mul(0x9e3779b97f4a7c15);

        let context = SimContext::shared();
        let mut oracle = Oracle::new(physics_seed);
        oracle.set_gps_noise(config.gps_noise_std_m);

        let tracker = Arc::new(Tracker::new(Arc::clone(&context), config.tracker.clone())?);
        let reaper = FreshnessReaper::new(Arc::clone(&tracker));

        Ok(Self {
            config,
            context,
            oracle,
            tracker,
            reaper,
            accepted: BTreeMap::new(),
            last_sweep: Duration::ZERO,
            tick_count: 0,
        })
    }

    /// Spawns the configured number of drivers and returns their ids.
    pub fn spawn_drivers(&mut self) -> Vec<String> {
        let (min_speed, max_speed) = self.config.speed_range;
        self.oracle
            .spawn_random(self.config.num_drivers, min_speed, max_speed)
    }

    /// Tick length.
    pub fn dt(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.config.tick_rate_hz.max(1) as f64)
    }

    /// Advances simulation by one tick.
    ///
    /// Moves virtual time and physics, feeds every report to the tracker,
    /// then sweeps if a full reaper interval has passed since the last sweep.
    pub fn tick(&mut self) -> TickReport {
        let dt = self.dt();

        // Advance virtual time
        self.context.advance_time(dt);

        // Advance physics
        self.oracle.step(dt.as_secs_f64());

        let mut report = TickReport::default();
        let readings = self.oracle.readings();
        for reading in &readings {
            self.ingest(reading, &mut report);
        }

        let now = self.context.now();
        if now.saturating_sub(self.last_sweep) >= self.reaper.interval() {
            report.evictions = self.reaper.sweep() as u64;
            report.swept = true;
            self.last_sweep = now;
            let tracker = &self.tracker;
            self.accepted.retain(|id, _| tracker.get_agent(id).is_some());
        }

        self.tick_count += 1;
        report
    }

    fn ingest(&mut self, reading: &PositionReport, report: &mut TickReport) {
        match self.tracker.update_position(
            &reading.driver_id,
            reading.latitude,
            reading.longitude,
            reading.status,
        ) {
            Ok(ack) => {
                report.updates += 1;
                if ack.cell_changed {
                    report.cell_changes += 1;
                }
                self.accepted.insert(
                    reading.driver_id.clone(),
                    AcceptedReport {
                        position: Coordinate::new(reading.latitude, reading.longitude).rounded(),
                        at: self.context.now(),
                    },
                );
            }
            Err(e) => {
                warn!(driver = %reading.driver_id, "Report rejected: {}", e);
                report.rejected += 1;
            }
        }
    }

    /// Brute-force answer over every accepted report still in the tracker.
    pub fn expected_nearby(&self, center: Coordinate, radius_m: f64) -> Vec<(String, f64)> {
        Oracle::nearby(
            center,
            radius_m,
            self.accepted.iter().map(|(id, r)| (id, &r.position)),
        )
    }

    /// Runs one query against the tracker and the brute-force reference.
    ///
    /// Returns a description of the first difference, if any.
    pub fn verify_query(&self, center: Coordinate, radius_m: f64) -> Result<usize, String> {
        let actual = self
            .tracker
            .query_nearby(center.latitude, center.longitude, radius_m)
            .map_err(|e| format!("query rejected: {}", e))?;
        let expected = self.expected_nearby(center, radius_m);
        compare_results(&actual, &expected)?;
        Ok(actual.len())
    }

    pub fn accepted(&self, id: &str) -> Option<&AcceptedReport> {
        self.accepted.get(id)
    }

    pub fn reaper(&self) -> &FreshnessReaper<SimContext> {
        &self.reaper
    }

    /// Returns the current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    /// Returns the current tick count.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Returns the number of drivers the tracker currently holds.
    pub fn agent_count(&self) -> usize {
        self.tracker.agent_count()
    }

    /// Whether the configured duration has elapsed.
    pub fn finished(&self) -> bool {
        self.config.max_duration_secs > 0.0 && self.time() >= self.config.max_duration_secs
    }
}

/// Compares tracker output with a reference answer: same ids in the same
/// order, same distances.
pub fn compare_results(actual: &[Nearby], expected: &[(String, f64)]) -> Result<(), String> {
    if actual.len() != expected.len() {
        return Err(format!(
            "expected {} results, tracker returned {}",
            expected.len(),
            actual.len()
        ));
    }
    for (i, (got, (want_id, want_d))) in actual.iter().zip(expected).enumerate() {
        if &got.agent_id != want_id {
            return Err(format!(
                "rank {}: expected {}, tracker returned {}",
                i, want_id, got.agent_id
            ));
        }
        if (got.distance_m - want_d).abs() > 1e-6 {
            return Err(format!(
                "{}: distance {:.6} differs from reference {:.6}",
                got.agent_id, got.distance_m, want_d
            ));
        }
    }
    Ok(())
}
