//! Fleet Tracker Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the tracker core
//! to run in both **Production** (tokio) and **Simulation** (virtual clock)
//! environments.
//!
//! # Core Concept
//!
//! Everything the freshness index needs from the outside world goes
//! through one trait:
//! - Time (`now()`, `system_time()`, `sleep()`)
//! - Background tasks (`spawn()`)
//!
//! Staleness is therefore a pure function of the context clock, and any
//! expiry bug can be replayed by driving a virtual clock.
//!
//! # Example
//!
//! ```ignore
//! use fleet_env::FleetContext;
//!
//! async fn sweep_loop<Ctx: FleetContext>(ctx: &Ctx) {
//!     loop {
//!         ctx.sleep(Duration::from_secs(30)).await;
//!         sweep(ctx.now());
//!     }
//! }
//! ```

mod context;
mod tokio_impl;

pub use context::FleetContext;
pub use tokio_impl::TokioContext;
