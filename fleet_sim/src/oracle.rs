//! Ground truth oracle for simulation.
//!
//! The Oracle maintains the "God's eye view" of the simulated fleet:
//! - True positions and headings of all drivers
//! - Kinematics inside a bounding box (constant speed, bounce at edges)
//! - Position report generation with GPS noise
//! - A brute-force radius search used as the reference answer

use fleet_core::{distance_m, AgentStatus, Coordinate};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Meters per degree of latitude on the mean-radius sphere.
const METERS_PER_DEGREE: f64 = 111_195.08;

/// Axis-aligned latitude/longitude box the fleet lives in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// Central Taipei, roughly 11 km by 15 km.
    pub const TAIPEI: BoundingBox = BoundingBox {
        min_lat: 25.00,
        max_lat: 25.10,
        min_lon: 121.45,
        max_lon: 121.60,
    };

    pub fn contains(&self, position: Coordinate) -> bool {
        (self.min_lat..=self.max_lat).contains(&position.latitude)
            && (self.min_lon..=self.max_lon).contains(&position.longitude)
    }

    /// Uniformly random point inside the box.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Coordinate {
        Coordinate::new(
            rng.gen_range(self.min_lat..self.max_lat),
            rng.gen_range(self.min_lon..self.max_lon),
        )
    }
}

/// A ground truth driver in the simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthDriver {
    pub id: String,

    /// True position
    pub position: Coordinate,

    /// Velocity [north, east] in m/s
    pub velocity: [f64; 2],

    pub status: AgentStatus,

    /// Silenced drivers keep moving but stop sending reports
    pub reporting: bool,
}

impl GroundTruthDriver {
    pub fn speed(&self) -> f64 {
        self.velocity[0].hypot(self.velocity[1])
    }
}

/// A position report generated from ground truth with noise.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionReport {
    pub driver_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub status: AgentStatus,
}

/// The Oracle - maintains ground truth and generates position reports.
pub struct Oracle {
    /// RNG for physics (noise, headings, status changes)
    physics_rng: ChaCha8Rng,

    /// All drivers, ordered by id so iteration is deterministic
    drivers: BTreeMap<String, GroundTruthDriver>,

    bounds: BoundingBox,

    /// Current simulation time (seconds)
    current_time: f64,

    /// GPS noise; `None` reports exact positions
    gps_noise: Option<Normal<f64>>,

    /// Probability per report that a driver changes status
    status_flip_rate: f64,
}

impl Oracle {
    /// Creates a new Oracle over the Taipei box with the given physics seed.
    pub fn new(physics_seed: u64) -> Self {
        Self::with_bounds(physics_seed, BoundingBox::TAIPEI)
    }

    pub fn with_bounds(physics_seed: u64, bounds: BoundingBox) -> Self {
        Self {
            physics_rng: ChaCha8Rng::seed_from_u64(physics_seed),
            drivers: BTreeMap::new(),
            bounds,
            current_time: 0.0,
            gps_noise: Normal::new(0.0, 5.0).ok(), // 5m GPS noise by default
            status_flip_rate: 0.02,
        }
    }

    /// Sets the GPS noise standard deviation in meters. Zero disables noise.
    pub fn set_gps_noise(&mut self, std_dev_m: f64) {
        self.gps_noise = if std_dev_m > 0.0 {
            Normal::new(0.0, std_dev_m).ok()
        } else {
            None
        };
    }

    pub fn set_status_flip_rate(&mut self, rate: f64) {
        self.status_flip_rate = rate.clamp(0.0, 1.0);
    }

    pub fn bounds(&self) -> BoundingBox {
        self.bounds
    }

    /// Spawns a driver at an explicit position and velocity.
    pub fn spawn_driver(&mut self, id: &str, position: Coordinate, velocity: [f64; 2]) {
        self.drivers.insert(
            id.to_string(),
            GroundTruthDriver {
                id: id.to_string(),
                position,
                velocity,
                status: AgentStatus::Online,
                reporting: true,
            },
        );
    }

    /// Spawns `count` drivers at random positions with random headings.
    ///
    /// Speeds are drawn from `min_speed..max_speed` m/s. Returns the new ids.
    pub fn spawn_random(&mut self, count: usize, min_speed: f64, max_speed: f64) -> Vec<String> {
        let first = self.drivers.len();
        let mut ids = Vec::with_capacity(count);

        for i in first..first + count {
            let id = format!("driver_tpe_{i:04}");
            let position = self.bounds.sample(&mut self.physics_rng);
            let heading = self.physics_rng.gen_range(0.0..std::f64::consts::TAU);
            let speed = if max_speed > min_speed {
                self.physics_rng.gen_range(min_speed..max_speed)
            } else {
                min_speed
            };
            self.spawn_driver(&id, position, [speed * heading.cos(), speed * heading.sin()]);
            ids.push(id);
        }

        ids
    }

    /// Stops a driver's reports. It keeps moving in ground truth.
    pub fn silence(&mut self, id: &str) -> bool {
        match self.drivers.get_mut(id) {
            Some(driver) => {
                driver.reporting = false;
                true
            }
            None => false,
        }
    }

    /// Advances physics by dt seconds.
    pub fn step(&mut self, dt: f64) {
        let bounds = self.bounds;
        for driver in self.drivers.values_mut() {
            let lat = driver.position.latitude
                + driver.velocity[0] * dt / METERS_PER_DEGREE;
            let lon = driver.position.longitude
                + driver.velocity[1] * dt / (METERS_PER_DEGREE * lat.to_radians().cos());

            // Bounce off the box edges
            let (lat, flip_north) = reflect(lat, bounds.min_lat, bounds.max_lat);
            let (lon, flip_east) = reflect(lon, bounds.min_lon, bounds.max_lon);
            if flip_north {
                driver.velocity[0] = -driver.velocity[0];
            }
            if flip_east {
                driver.velocity[1] = -driver.velocity[1];
            }
            driver.position = Coordinate::new(lat, lon);
        }
        self.current_time += dt;
    }

    /// Generates position reports for every reporting driver.
    ///
    /// Each report carries independent GPS noise and may flip the driver's
    /// status.
    pub fn readings(&mut self) -> Vec<PositionReport> {
        let mut reports = Vec::with_capacity(self.drivers.len());

        for driver in self.drivers.values_mut() {
            if !driver.reporting {
                continue;
            }
            if self.physics_rng.gen_bool(self.status_flip_rate) {
                let idx = self.physics_rng.gen_range(0..AgentStatus::ALL.len());
                driver.status = AgentStatus::ALL[idx];
            }

            let (north, east) = match &self.gps_noise {
                Some(noise) => (
                    noise.sample(&mut self.physics_rng),
                    noise.sample(&mut self.physics_rng),
                ),
                None => (0.0, 0.0),
            };
            let latitude = driver.position.latitude + north / METERS_PER_DEGREE;
            let longitude = driver.position.longitude
                + east / (METERS_PER_DEGREE * driver.position.latitude.to_radians().cos());

            reports.push(PositionReport {
                driver_id: driver.id.clone(),
                latitude: latitude.clamp(-90.0, 90.0),
                longitude: longitude.clamp(-180.0, 180.0),
                status: driver.status,
            });
        }

        reports
    }

    /// Brute-force radius search over `positions`, sorted the way the tracker
    /// sorts: ascending distance, then id.
    pub fn nearby<'a, I>(center: Coordinate, radius_m: f64, positions: I) -> Vec<(String, f64)>
    where
        I: IntoIterator<Item = (&'a String, &'a Coordinate)>,
    {
        let mut hits: Vec<(String, f64)> = positions
            .into_iter()
            .filter_map(|(id, position)| {
                let d = distance_m(center, *position);
                (d <= radius_m).then(|| (id.clone(), d))
            })
            .collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        hits
    }

    /// Random query center inside the box.
    pub fn random_point(&mut self) -> Coordinate {
        self.bounds.sample(&mut self.physics_rng)
    }

    /// Random radius in `min..max` meters.
    pub fn random_radius(&mut self, min: f64, max: f64) -> f64 {
        self.physics_rng.gen_range(min..max)
    }

    pub fn driver(&self, id: &str) -> Option<&GroundTruthDriver> {
        self.drivers.get(id)
    }

    pub fn drivers(&self) -> impl Iterator<Item = &GroundTruthDriver> {
        self.drivers.values()
    }

    pub fn driver_count(&self) -> usize {
        self.drivers.len()
    }

    pub fn reporting_count(&self) -> usize {
        self.drivers.values().filter(|d| d.reporting).count()
    }

    /// Returns current simulation time.
    pub fn time(&self) -> f64 {
        self.current_time
    }
}

/// Folds `value` back into `[min, max]`. Returns whether it was reflected.
fn reflect(value: f64, min: f64, max: f64) -> (f64, bool) {
    if value < min {
        ((2.0 * min - value).min(max), true)
    } else if value > max {
        ((2.0 * max - value).max(min), true)
    } else {
        (value, false)
    }
}
