//! Executor assignment, release and build lookup.

use tracing::info;

use super::executor::Executor;
use super::{ExecutorKey, Fleet};
use crate::error::{FleetError, Result};
use crate::types::{BuildRef, WorkerName};

impl Fleet {
    /// Bind `build` to a free slot on `worker`.
    ///
    /// Fails with a conflict when the worker is offline or at capacity, or
    /// when the build is already bound anywhere in the fleet.
    pub async fn assign(&self, worker: &WorkerName, build: BuildRef) -> Result<Executor> {
        let entry = self.entry(worker).await?;
        let mut entry = entry.lock().await;

        if entry.record.is_stale(self.settings.staleness_threshold) {
            return Err(FleetError::WorkerOffline(worker.clone()));
        }

        let mut builds = self.builds.lock().await;
        if let Some(owner) = builds.get(&build) {
            return Err(FleetError::BuildAlreadyBound {
                build,
                worker: owner.worker.clone(),
            });
        }

        let slot = entry
            .slots
            .free_slot(entry.record.capacity)
            .ok_or_else(|| FleetError::AtCapacity {
                worker: worker.clone(),
                capacity: entry.record.capacity,
            })?;

        let executor = Executor::new(worker.clone(), slot, build.clone());
        builds.insert(
            build,
            ExecutorKey {
                worker: worker.clone(),
                slot,
                executor: executor.id,
            },
        );
        entry.slots.insert(executor.clone());

        info!(
            worker = %worker,
            slot,
            build = %executor.build,
            executor = %executor.id,
            "Executor assigned"
        );
        Ok(executor)
    }

    /// Free a slot whose executor has reached a terminal state.
    ///
    /// Terminal executors already leave their slot when they finish, so an
    /// empty slot answers with the last executor that held it while history
    /// still remembers it. Releasing is idempotent.
    pub async fn release(&self, worker: &WorkerName, slot: u32) -> Result<Executor> {
        let entry = self.entry(worker).await?;
        let mut entry = entry.lock().await;

        match entry.slots.get(slot).map(|e| e.state) {
            Some(state) if !state.is_terminal() => Err(FleetError::ExecutorActive {
                worker: worker.clone(),
                slot,
            }),
            Some(_) => {
                let mut builds = self.builds.lock().await;
                self.release_locked(&mut entry, &mut builds, slot)
                    .await
                    .ok_or_else(|| FleetError::SlotNotFound {
                        worker: worker.clone(),
                        slot,
                    })
            }
            None => self
                .history
                .lock()
                .await
                .last_in_slot(worker, slot)
                .cloned()
                .ok_or_else(|| FleetError::SlotNotFound {
                    worker: worker.clone(),
                    slot,
                }),
        }
    }

    /// The live executor bound to `build`.
    pub async fn lookup_by_build(&self, build: &BuildRef) -> Result<Executor> {
        let key = self
            .builds
            .lock()
            .await
            .get(build)
            .cloned()
            .ok_or_else(|| FleetError::BuildNotFound(build.clone()))?;

        self.executor_at(&key)
            .await
            .ok_or_else(|| FleetError::BuildNotFound(build.clone()))
    }

    /// The live executor bound to `build`, or its most recent finished run.
    pub async fn find_build(&self, build: &BuildRef) -> Result<Executor> {
        match self.lookup_by_build(build).await {
            Ok(executor) => Ok(executor),
            Err(FleetError::BuildNotFound(_)) => self
                .history
                .lock()
                .await
                .get(build)
                .cloned()
                .ok_or_else(|| FleetError::BuildNotFound(build.clone())),
            Err(e) => Err(e),
        }
    }

    /// Executors currently occupying slots on `worker`, ordered by slot.
    pub async fn executors(&self, worker: &WorkerName) -> Result<Vec<Executor>> {
        let entry = self.entry(worker).await?;
        let entry = entry.lock().await;
        Ok(entry.slots.iter().cloned().collect())
    }

    /// Snapshot of the executor `key` points at, if it is still that
    /// incarnation.
    pub(crate) async fn executor_at(&self, key: &ExecutorKey) -> Option<Executor> {
        let entry = self.entry(&key.worker).await.ok()?;
        let entry = entry.lock().await;
        entry
            .slots
            .get(key.slot)
            .filter(|e| e.id == key.executor)
            .cloned()
    }
}
