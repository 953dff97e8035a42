//! Fleet Tracker Deterministic Simulation Testing (DST) Harness
//!
//! A controlled environment where the tracker runs against a simulated
//! fleet whose ground truth is always known.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: Virtual clock advances only when the harness ticks
//! - **Movement**: Drivers follow seeded constant-velocity paths
//! - **Randomness**: All entropy derived from a single 64-bit seed
//!
//! The one exception is the `swarm` scenario, which uses real threads.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimContext (Virtual Clock)                           │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                        │                            │
//! │  ┌────▼────────────┐      ┌────▼────────────┐               │
//! │  │ Tracker         │◄─────│ FreshnessReaper │               │
//! │  └────▲────────────┘      └─────────────────┘               │
//! │       │ position reports / reference queries                │
//! │  ┌────┴─────────────────────────────┐                       │
//! │  │            Oracle                │                       │
//! │  │  (Ground Truth Fleet)            │                       │
//! │  └──────────────────────────────────┘                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use fleet_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 200)
//!     .with_duration(60.0)
//!     .run(ScenarioId::RushHour);
//! assert!(result.passed);
//! ```

mod context;
mod oracle;
mod runner;
mod world;
pub mod scenarios;

pub use context::SimContext;
pub use oracle::{BoundingBox, GroundTruthDriver, Oracle, PositionReport};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{compare_results, AcceptedReport, SimConfig, SimWorld, TickReport};
