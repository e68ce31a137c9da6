//! Worker registry and executor table.
//!
//! [`Fleet`] is the single store behind every handler and the health sweep.
//! It is constructed explicitly and shared through an `Arc`; tests build as
//! many independent instances as they need.
//!
//! ## Locking
//!
//! - `workers`: the name → entry map. Held only long enough to clone the
//!   entry's `Arc`.
//! - one `Mutex<WorkerEntry>` per worker: the worker record and its slots.
//!   Operations on different workers never contend.
//! - `builds`: the fleet-wide build → executor index. Only mutated while the
//!   owning worker's entry lock is held, so a build is never transiently
//!   missing or bound twice.
//! - `history`: finished executors.
//!
//! Acquisition order is always entry → `builds` → `history`. Readers that
//! start from the index copy the key out and drop the index lock before
//! taking an entry lock.

mod cancellation;
mod executor;
mod history;
mod registry;
mod table;
mod worker;

pub use cancellation::{AttemptGate, CancelStart, CancelTicket};
pub use executor::{CancellationAttempt, Executor, ExecutorState};
pub use registry::HeartbeatReport;
pub use worker::{Worker, WorkerHealth, WorkerRegistration, WorkerStatus};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use crate::config::RegistryConfig;
use crate::error::{FleetError, Result};
use crate::types::{BuildRef, ExecutorId, WorkerName};
use executor::SlotTable;
use history::FinishedExecutors;
use worker::WorkerRecord;

/// Registry tuning.
#[derive(Debug, Clone)]
pub struct FleetSettings {
    pub staleness_threshold: Duration,
    pub history_limit: usize,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self::from(&RegistryConfig::default())
    }
}

impl From<&RegistryConfig> for FleetSettings {
    fn from(cfg: &RegistryConfig) -> Self {
        Self {
            staleness_threshold: cfg.staleness_threshold(),
            history_limit: cfg.history_limit,
        }
    }
}

/// Where a bound build lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExecutorKey {
    pub worker: WorkerName,
    pub slot: u32,
    pub executor: ExecutorId,
}

#[derive(Debug)]
pub(crate) struct WorkerEntry {
    pub record: WorkerRecord,
    pub slots: SlotTable,
}

type BuildIndex = HashMap<BuildRef, ExecutorKey>;

pub struct Fleet {
    settings: FleetSettings,
    workers: RwLock<HashMap<WorkerName, Arc<Mutex<WorkerEntry>>>>,
    builds: Mutex<BuildIndex>,
    history: Mutex<FinishedExecutors>,
}

impl Fleet {
    pub fn new(settings: FleetSettings) -> Self {
        let history = FinishedExecutors::new(settings.history_limit);
        Self {
            settings,
            workers: RwLock::new(HashMap::new()),
            builds: Mutex::new(HashMap::new()),
            history: Mutex::new(history),
        }
    }

    pub fn settings(&self) -> &FleetSettings {
        &self.settings
    }

    async fn entry(&self, name: &WorkerName) -> Result<Arc<Mutex<WorkerEntry>>> {
        self.workers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| FleetError::WorkerNotFound(name.clone()))
    }

    pub(crate) async fn worker_names(&self) -> Vec<WorkerName> {
        let mut names: Vec<WorkerName> = self.workers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    fn snapshot(&self, entry: &WorkerEntry) -> Worker {
        entry
            .record
            .snapshot(self.settings.staleness_threshold, entry.slots.occupied())
    }

    /// Move the executor in `slot` to a terminal state and free the slot.
    ///
    /// Caller holds the entry lock and the index lock.
    async fn finish_locked(
        &self,
        entry: &mut WorkerEntry,
        builds: &mut BuildIndex,
        slot: u32,
        state: ExecutorState,
    ) -> Option<Executor> {
        let executor = entry.slots.get_mut(slot)?;
        let from = executor.state;
        if !executor.transition(state) {
            tracing::warn!(
                worker = %entry.record.name,
                slot,
                from = %from,
                to = %state,
                "Ignoring invalid executor transition"
            );
            return None;
        }

        tracing::info!(
            worker = %entry.record.name,
            slot,
            build = %executor.build,
            from = %from,
            to = %state,
            "Executor finished"
        );
        self.release_locked(entry, builds, slot).await
    }

    /// Free a slot whose executor is terminal, unbinding its build and
    /// moving it to history.
    async fn release_locked(
        &self,
        entry: &mut WorkerEntry,
        builds: &mut BuildIndex,
        slot: u32,
    ) -> Option<Executor> {
        if !entry.slots.get(slot)?.state.is_terminal() {
            return None;
        }
        let executor = entry.slots.remove(slot)?;

        if builds
            .get(&executor.build)
            .is_some_and(|key| key.executor == executor.id)
        {
            builds.remove(&executor.build);
        }
        self.history.lock().await.record(executor.clone());

        Some(executor)
    }
}
