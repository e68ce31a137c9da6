//! Error types for registry, executor table and cancellation operations.

use std::time::Duration;

use thiserror::Error;

use crate::types::{BuildRef, WorkerName};

/// Errors surfaced by the fleet core.
///
/// Every variant except [`FleetError::DispatchExhausted`] is a local
/// validation failure and is reported immediately, never retried.
#[derive(Debug, Clone, Error)]
pub enum FleetError {
    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerName),

    #[error("No executor bound to build {0}")]
    BuildNotFound(BuildRef),

    #[error("Repository not found: {0}")]
    RepoNotFound(String),

    #[error("Invalid build number: {0}")]
    InvalidBuildNumber(String),

    #[error("No executor for build {build} on worker {worker}")]
    ExecutorNotFound { worker: WorkerName, build: BuildRef },

    #[error("Worker {worker} has no executor in slot {slot}")]
    SlotNotFound { worker: WorkerName, slot: u32 },

    #[error("Worker {worker} is at capacity ({capacity} executors)")]
    AtCapacity { worker: WorkerName, capacity: u32 },

    #[error("Build {build} is already bound to an executor on worker {worker}")]
    BuildAlreadyBound { build: BuildRef, worker: WorkerName },

    #[error("Worker {0} is offline")]
    WorkerOffline(WorkerName),

    #[error("Executor in slot {slot} on worker {worker} has not finished")]
    ExecutorActive { worker: WorkerName, slot: u32 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Termination of build {build} was not acknowledged after {attempts} attempts: {last_error}")]
    DispatchExhausted {
        build: BuildRef,
        attempts: u32,
        last_error: DispatchError,
    },
}

/// Coarse classification used by the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Invalid,
    Unauthorized,
    Timeout,
    Internal,
}

impl FleetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::WorkerNotFound(_)
            | Self::BuildNotFound(_)
            | Self::RepoNotFound(_)
            | Self::ExecutorNotFound { .. }
            | Self::SlotNotFound { .. } => ErrorKind::NotFound,
            Self::AtCapacity { .. }
            | Self::BuildAlreadyBound { .. }
            | Self::WorkerOffline(_)
            | Self::ExecutorActive { .. } => ErrorKind::Conflict,
            Self::InvalidRequest(_) | Self::InvalidBuildNumber(_) => ErrorKind::Invalid,
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::DispatchExhausted { .. } => ErrorKind::Timeout,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Failure of a single termination signal sent to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("worker answered HTTP {0}")]
    Rejected(u16),
}

pub type Result<T> = std::result::Result<T, FleetError>;
