//! Executor-side half of the cancellation handshake.
//!
//! Every step takes the owning worker's lock, checks that the executor is
//! still the same incarnation in the expected state, mutates, and releases
//! the lock before the dispatcher touches the network.

use tracing::{debug, info};
use url::Url;

use super::executor::{Executor, ExecutorState};
use super::{ExecutorKey, Fleet};
use crate::error::{FleetError, Result};
use crate::types::{BuildRef, ExecutorId};

/// Everything the dispatcher needs to signal a worker without holding a lock.
#[derive(Debug, Clone)]
pub struct CancelTicket {
    pub(crate) key: ExecutorKey,
    pub build: BuildRef,
    pub address: Url,
}

impl CancelTicket {
    pub fn executor(&self) -> ExecutorId {
        self.key.executor
    }

    pub fn slot(&self) -> u32 {
        self.key.slot
    }
}

/// Result of asking to cancel a build.
#[derive(Debug, Clone)]
pub enum CancelStart {
    /// The executor moved to CancelRequested; the caller owns the handshake.
    Dispatch(CancelTicket),
    /// A handshake is already running for this executor.
    InProgress(Executor),
    /// The executor had already finished.
    AlreadyTerminal(Executor),
}

/// Whether the next dispatch attempt should go out.
#[derive(Debug, Clone)]
pub enum AttemptGate {
    Proceed { attempt: u32 },
    /// The executor left CancelRequested by another path (heartbeat, sweep).
    Settled(Option<Executor>),
}

impl Fleet {
    /// Resolve `build` and move its executor from Running to CancelRequested.
    pub async fn begin_cancel(&self, build: &BuildRef) -> Result<CancelStart> {
        self.start_cancel(build, None).await
    }

    /// Like [`Fleet::begin_cancel`], but only if `build` is still bound to
    /// the executor `expected`. A build that has since been rebound answers
    /// from history and never touches the new executor.
    pub async fn begin_cancel_executor(
        &self,
        build: &BuildRef,
        expected: ExecutorId,
    ) -> Result<CancelStart> {
        self.start_cancel(build, Some(expected)).await
    }

    async fn start_cancel(
        &self,
        build: &BuildRef,
        expected: Option<ExecutorId>,
    ) -> Result<CancelStart> {
        let key = self
            .builds
            .lock()
            .await
            .get(build)
            .filter(|key| expected.is_none_or(|id| key.executor == id))
            .cloned();
        let Some(key) = key else {
            return self.finished_or_missing(build, expected).await;
        };

        let entry = self.entry(&key.worker).await?;
        let mut entry = entry.lock().await;
        let address = entry.record.address.clone();

        let Some(executor) = entry
            .slots
            .get_mut(key.slot)
            .filter(|e| e.id == key.executor)
        else {
            drop(entry);
            return self.finished_or_missing(build, expected).await;
        };

        match executor.state {
            ExecutorState::Running => {
                executor.transition(ExecutorState::CancelRequested);
                info!(
                    worker = %key.worker,
                    slot = key.slot,
                    build = %build,
                    "Cancellation requested"
                );
                Ok(CancelStart::Dispatch(CancelTicket {
                    key,
                    build: build.clone(),
                    address,
                }))
            }
            ExecutorState::CancelRequested => {
                debug!(build = %build, "Cancellation already in progress");
                Ok(CancelStart::InProgress(executor.clone()))
            }
            _ => Ok(CancelStart::AlreadyTerminal(executor.clone())),
        }
    }

    /// Count a dispatch attempt, unless the executor has already settled.
    pub async fn record_cancel_attempt(&self, ticket: &CancelTicket) -> AttemptGate {
        let attempt = match self.entry(&ticket.key.worker).await {
            Ok(entry) => {
                let mut entry = entry.lock().await;
                entry
                    .slots
                    .get_mut(ticket.key.slot)
                    .filter(|e| {
                        e.id == ticket.key.executor && e.state == ExecutorState::CancelRequested
                    })
                    .map(|e| e.record_attempt())
            }
            Err(_) => None,
        };

        match attempt {
            Some(attempt) => AttemptGate::Proceed { attempt },
            None => AttemptGate::Settled(self.settled(ticket).await),
        }
    }

    /// Close the handshake with `state` (Cancelled or Lost).
    ///
    /// Returns `Err` with the settled executor, if still known, when another
    /// path finished it first.
    pub async fn finish_cancel(
        &self,
        ticket: &CancelTicket,
        state: ExecutorState,
    ) -> std::result::Result<Executor, Option<Executor>> {
        let finished = match self.entry(&ticket.key.worker).await {
            Ok(entry) => {
                let mut entry = entry.lock().await;
                let pending = entry.slots.get(ticket.key.slot).is_some_and(|e| {
                    e.id == ticket.key.executor && e.state == ExecutorState::CancelRequested
                });
                if pending {
                    let mut builds = self.builds.lock().await;
                    self.finish_locked(&mut entry, &mut builds, ticket.key.slot, state)
                        .await
                } else {
                    None
                }
            }
            Err(_) => None,
        };

        match finished {
            Some(executor) => Ok(executor),
            None => Err(self.settled(ticket).await),
        }
    }

    /// Current view of the ticket's executor: live if it still occupies its
    /// slot, otherwise from history.
    async fn settled(&self, ticket: &CancelTicket) -> Option<Executor> {
        if let Some(executor) = self.executor_at(&ticket.key).await {
            return Some(executor);
        }
        self.history
            .lock()
            .await
            .get(&ticket.build)
            .filter(|e| e.id == ticket.key.executor)
            .cloned()
    }

    async fn finished_or_missing(
        &self,
        build: &BuildRef,
        expected: Option<ExecutorId>,
    ) -> Result<CancelStart> {
        let history = self.history.lock().await;
        let finished = history
            .get(build)
            .filter(|e| expected.is_none_or(|id| e.id == id));
        match finished {
            Some(executor) => Ok(CancelStart::AlreadyTerminal(executor.clone())),
            None => Err(FleetError::BuildNotFound(build.clone())),
        }
    }
}
