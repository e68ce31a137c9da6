//! Worker registration, heartbeats and liveness.

use std::collections::BTreeSet;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::executor::{Executor, ExecutorState, SlotTable};
use super::worker::{Worker, WorkerHealth, WorkerRecord, WorkerRegistration};
use super::{ExecutorKey, Fleet, WorkerEntry};
use crate::error::{FleetError, Result};
use crate::types::{BuildRef, WorkerName};

/// Outcome of reconciling one heartbeat against the executor table.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatReport {
    pub worker: Worker,
    /// Reported builds the registry did not know about, now Running.
    pub adopted: Vec<BuildRef>,
    /// Builds the worker stopped reporting while Running.
    pub completed: Vec<BuildRef>,
    /// Builds the worker stopped reporting after a kill was issued.
    pub cancelled: Vec<BuildRef>,
    /// Reported builds that could not be adopted (bound elsewhere or no
    /// free slot).
    pub rejected: Vec<BuildRef>,
}

impl Fleet {
    /// Register a worker, or refresh an existing registration.
    ///
    /// Re-registration updates address and capacity and restarts the
    /// liveness clock. Executors are left alone; the next heartbeat
    /// reconciles them.
    pub async fn register(&self, registration: WorkerRegistration) -> Result<Worker> {
        if registration.name.as_str().is_empty() {
            return Err(FleetError::InvalidRequest(
                "worker name must not be empty".to_string(),
            ));
        }
        if registration.capacity == 0 {
            return Err(FleetError::InvalidRequest(
                "worker capacity must be at least 1".to_string(),
            ));
        }

        let existing = {
            let mut workers = self.workers.write().await;
            match workers.entry(registration.name.clone()) {
                Entry::Occupied(slot) => Some(slot.get().clone()),
                Entry::Vacant(slot) => {
                    let entry = WorkerEntry {
                        record: WorkerRecord::new(registration.clone()),
                        slots: SlotTable::default(),
                    };
                    slot.insert(Arc::new(Mutex::new(entry)));
                    None
                }
            }
        };

        match existing {
            None => {
                info!(
                    worker = %registration.name,
                    address = %registration.address,
                    capacity = registration.capacity,
                    "Worker registered"
                );
                self.worker(&registration.name).await
            }
            Some(entry) => {
                let mut entry = entry.lock().await;
                entry.record.address = registration.address;
                entry.record.capacity = registration.capacity;
                entry.record.touch();
                info!(
                    worker = %entry.record.name,
                    address = %entry.record.address,
                    capacity = entry.record.capacity,
                    executors = entry.slots.occupied(),
                    "Worker re-registered"
                );
                Ok(self.snapshot(&entry))
            }
        }
    }

    /// Record a heartbeat and reconcile the worker's executors against the
    /// builds it reports as running.
    ///
    /// Applying the same report twice leaves the table unchanged.
    pub async fn heartbeat(
        &self,
        name: &WorkerName,
        reported: Vec<BuildRef>,
    ) -> Result<HeartbeatReport> {
        let entry = self.entry(name).await?;
        let mut entry = entry.lock().await;

        if entry.record.swept_offline {
            info!(worker = %name, "Worker back online");
        }
        entry.record.touch();

        let reported: BTreeSet<BuildRef> = reported.into_iter().collect();
        let mut builds = self.builds.lock().await;

        let mut adopted = Vec::new();
        let mut completed = Vec::new();
        let mut cancelled = Vec::new();
        let mut rejected = Vec::new();

        let vanished: Vec<(u32, ExecutorState)> = entry
            .slots
            .iter()
            .filter(|e| !reported.contains(&e.build))
            .map(|e| {
                let next = match e.state {
                    ExecutorState::CancelRequested => ExecutorState::Cancelled,
                    _ => ExecutorState::Completed,
                };
                (e.slot, next)
            })
            .collect();

        for (slot, next) in vanished {
            if let Some(executor) = self.finish_locked(&mut entry, &mut builds, slot, next).await {
                match next {
                    ExecutorState::Cancelled => cancelled.push(executor.build),
                    _ => completed.push(executor.build),
                }
            }
        }

        for build in reported {
            if entry.slots.find_by_build(&build).is_some() {
                continue;
            }

            if let Some(owner) = builds.get(&build) {
                warn!(
                    worker = %name,
                    build = %build,
                    owner = %owner.worker,
                    "Reported build is bound to another worker, not adopting"
                );
                rejected.push(build);
                continue;
            }

            let Some(slot) = entry.slots.free_slot(entry.record.capacity) else {
                warn!(
                    worker = %name,
                    build = %build,
                    capacity = entry.record.capacity,
                    "No free slot to adopt reported build"
                );
                rejected.push(build);
                continue;
            };

            let executor = Executor::new(name.clone(), slot, build.clone());
            builds.insert(
                build.clone(),
                ExecutorKey {
                    worker: name.clone(),
                    slot,
                    executor: executor.id,
                },
            );
            entry.slots.insert(executor);
            info!(worker = %name, slot, build = %build, "Adopted reported executor");
            adopted.push(build);
        }

        drop(builds);

        debug!(
            worker = %name,
            adopted = adopted.len(),
            completed = completed.len(),
            cancelled = cancelled.len(),
            rejected = rejected.len(),
            "Heartbeat reconciled"
        );

        Ok(HeartbeatReport {
            worker: self.snapshot(&entry),
            adopted,
            completed,
            cancelled,
            rejected,
        })
    }

    /// Liveness of a single worker.
    pub async fn health(&self, name: &WorkerName) -> Result<WorkerHealth> {
        let worker = self.worker(name).await?;
        Ok(WorkerHealth::from(&worker))
    }

    pub async fn worker(&self, name: &WorkerName) -> Result<Worker> {
        let entry = self.entry(name).await?;
        let entry = entry.lock().await;
        Ok(self.snapshot(&entry))
    }

    /// All registered workers, ordered by name.
    pub async fn workers(&self) -> Vec<Worker> {
        let mut out = Vec::new();
        for name in self.worker_names().await {
            if let Ok(worker) = self.worker(&name).await {
                out.push(worker);
            }
        }
        out
    }

    /// Demote a stale worker: every executor it still holds is lost and its
    /// slot released.
    ///
    /// Returns `None` when the worker is live or was already demoted since
    /// its last heartbeat.
    pub(crate) async fn demote_if_stale(&self, name: &WorkerName) -> Result<Option<Vec<Executor>>> {
        let entry = self.entry(name).await?;
        let mut entry = entry.lock().await;

        if entry.record.swept_offline || !entry.record.is_stale(self.settings.staleness_threshold) {
            return Ok(None);
        }
        entry.record.swept_offline = true;

        let slots: Vec<u32> = entry
            .slots
            .iter()
            .filter(|e| !e.state.is_terminal())
            .map(|e| e.slot)
            .collect();

        let mut lost = Vec::with_capacity(slots.len());
        let mut builds = self.builds.lock().await;
        for slot in slots {
            if let Some(executor) = self
                .finish_locked(&mut entry, &mut builds, slot, ExecutorState::Lost)
                .await
            {
                lost.push(executor);
            }
        }

        warn!(
            worker = %name,
            age_ms = entry.record.heartbeat_age().as_millis() as u64,
            lost = lost.len(),
            "Worker marked offline"
        );
        Ok(Some(lost))
    }
}
