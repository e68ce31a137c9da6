//! Executor records, their state machine, and the per-worker slot table.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{BuildRef, ExecutorId, WorkerName};

/// Lifecycle of an executor.
///
/// ```text
/// Running         -> CancelRequested | Completed | Lost
/// CancelRequested -> Cancelled | Lost
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorState {
    Running,
    CancelRequested,
    Cancelled,
    Completed,
    Lost,
}

impl ExecutorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Lost)
    }

    pub fn can_transition_to(&self, next: ExecutorState) -> bool {
        use ExecutorState::*;
        matches!(
            (self, next),
            (Running, CancelRequested)
                | (Running, Completed)
                | (Running, Lost)
                | (CancelRequested, Cancelled)
                | (CancelRequested, Lost)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::CancelRequested => "cancel_requested",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Lost => "lost",
        }
    }
}

impl std::fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping for an in-flight termination handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancellationAttempt {
    pub requested_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// One slot on a worker bound to one build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Executor {
    pub id: ExecutorId,
    pub worker: WorkerName,
    pub slot: u32,
    pub build: BuildRef,
    pub state: ExecutorState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation: Option<CancellationAttempt>,
}

impl Executor {
    pub(crate) fn new(worker: WorkerName, slot: u32, build: BuildRef) -> Self {
        Self {
            id: ExecutorId::new(),
            worker,
            slot,
            build,
            state: ExecutorState::Running,
            created_at: Utc::now(),
            finished_at: None,
            cancellation: None,
        }
    }

    /// Apply a state transition. Returns `false` and leaves the executor
    /// untouched when the transition is not allowed.
    pub(crate) fn transition(&mut self, next: ExecutorState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }

        self.state = next;
        match next {
            ExecutorState::CancelRequested => {
                self.cancellation = Some(CancellationAttempt {
                    requested_at: Utc::now(),
                    attempts: 0,
                    last_attempt_at: None,
                });
            }
            s if s.is_terminal() => {
                self.finished_at = Some(Utc::now());
                self.cancellation = None;
            }
            _ => {}
        }
        true
    }

    pub(crate) fn record_attempt(&mut self) -> u32 {
        match self.cancellation.as_mut() {
            Some(attempt) => {
                attempt.attempts += 1;
                attempt.last_attempt_at = Some(Utc::now());
                attempt.attempts
            }
            None => 0,
        }
    }
}

/// Executor slots of a single worker, keyed by slot index.
///
/// Only non-terminal executors occupy a slot.
#[derive(Debug, Default)]
pub(crate) struct SlotTable {
    slots: BTreeMap<u32, Executor>,
}

impl SlotTable {
    pub fn occupied(&self) -> usize {
        self.slots.len()
    }

    /// Lowest free slot index, or `None` when the worker is at capacity.
    pub fn free_slot(&self, capacity: u32) -> Option<u32> {
        if self.slots.len() >= capacity as usize {
            return None;
        }
        (0..).find(|slot| !self.slots.contains_key(slot))
    }

    pub fn get(&self, slot: u32) -> Option<&Executor> {
        self.slots.get(&slot)
    }

    pub fn get_mut(&mut self, slot: u32) -> Option<&mut Executor> {
        self.slots.get_mut(&slot)
    }

    pub fn insert(&mut self, executor: Executor) {
        self.slots.insert(executor.slot, executor);
    }

    pub fn remove(&mut self, slot: u32) -> Option<Executor> {
        self.slots.remove(&slot)
    }

    pub fn find_by_build(&self, build: &BuildRef) -> Option<&Executor> {
        self.slots.values().find(|e| &e.build == build)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Executor> {
        self.slots.values()
    }
}
