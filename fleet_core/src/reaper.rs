//! Freshness Reaper - evicts agents that stopped reporting.
//!
//! A sweep visits one partition at a time: it collects stale ids under the
//! read lock, then re-checks and evicts each id under the write lock. Writers
//! to other partitions are never blocked, and an agent that reports between
//! the scan and the eviction survives.
//!
//! Eviction is eventually consistent. An agent that crossed the threshold
//! stays visible until the next sweep, at most one interval later.

use fleet_env::FleetContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

use crate::tracker::Tracker;

/// Periodic staleness sweep over a tracker.
pub struct FreshnessReaper<Ctx: FleetContext> {
    tracker: Arc<Tracker<Ctx>>,
    interval: Duration,
    threshold: Duration,
}

impl<Ctx: FleetContext> FreshnessReaper<Ctx> {
    /// Creates a reaper using the tracker's configured threshold and interval.
    pub fn new(tracker: Arc<Tracker<Ctx>>) -> Self {
        let interval = tracker.config().sweep_interval();
        let threshold = tracker.config().staleness_threshold();
        Self {
            tracker,
            interval,
            threshold,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Runs one sweep at the context's current time.
    ///
    /// Returns the number of agents evicted.
    pub fn sweep(&self) -> usize {
        let now = self.tracker.context().now();
        let mut evicted = 0;

        for partition in 0..self.tracker.partition_count() {
            for agent_id in self.tracker.stale_in_partition(partition, now, self.threshold) {
                if self
                    .tracker
                    .evict_if_stale(partition, &agent_id, now, self.threshold)
                {
                    debug!(agent = %agent_id, "Evicted stale agent");
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            debug!(evicted, at_secs = now.as_secs_f64(), "Sweep complete");
        }
        evicted
    }

    /// Sleeps one interval, sweeps, repeats until `shutdown` flips to `true`
    /// or its sender is dropped.
    ///
    /// Intended for real clocks. A virtual clock whose `sleep` returns
    /// immediately should call [`sweep`](Self::sweep) directly instead.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Freshness reaper started (interval {:?}, threshold {:?})",
            self.interval, self.threshold
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = self.tracker.context().sleep(self.interval) => {
                    self.sweep();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Freshness reaper stopped");
    }

    /// Spawns [`run`](Self::run) on the tracker's context.
    pub fn spawn(self) -> ReaperHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();
        let context = Arc::clone(self.tracker.context());

        context.spawn("freshness-reaper", async move {
            self.run(shutdown_rx).await;
            let _ = done_tx.send(());
        });

        ReaperHandle {
            shutdown: shutdown_tx,
            finished: done_rx,
        }
    }
}

/// Owner-side control for a spawned reaper.
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    finished: oneshot::Receiver<()>,
}

impl ReaperHandle {
    /// Asks the reaper to stop without waiting for it.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stops the reaper and waits until its loop has exited.
    pub async fn shutdown(self) {
        self.signal_shutdown();
        let _ = self.finished.await;
    }
}
