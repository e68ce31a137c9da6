//! Periodic liveness sweep.
//!
//! Demotes workers whose last heartbeat is older than the staleness
//! threshold and loses every executor they still hold. Runs on its own
//! interval, independent of request traffic.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fleet::Fleet;
use crate::types::{BuildRef, WorkerName};

/// What one sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub workers_offline: Vec<WorkerName>,
    pub executors_lost: Vec<BuildRef>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.workers_offline.is_empty() && self.executors_lost.is_empty()
    }
}

pub struct HealthMonitor {
    fleet: Arc<Fleet>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(fleet: Arc<Fleet>, interval: Duration) -> Self {
        Self { fleet, interval }
    }

    /// Demote every stale worker once.
    ///
    /// Workers are visited one at a time, so heartbeats to other workers
    /// proceed while the sweep runs.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for name in self.fleet.worker_names().await {
            match self.fleet.demote_if_stale(&name).await {
                Ok(Some(lost)) => {
                    report
                        .executors_lost
                        .extend(lost.into_iter().map(|e| e.build));
                    report.workers_offline.push(name);
                }
                Ok(None) => {}
                // Workers are never removed, but a failed visit must not end the sweep.
                Err(e) => warn!(worker = %name, error = %e, "Sweep skipped worker"),
            }
        }

        if report.is_empty() {
            debug!("Health sweep found no stale workers");
        } else {
            info!(
                workers = report.workers_offline.len(),
                executors = report.executors_lost.len(),
                "Health sweep demoted stale workers"
            );
        }
        report
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_ms = self.interval.as_millis() as u64, "Health monitor started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
            }
        }

        info!("Health monitor stopped");
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
