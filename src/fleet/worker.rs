//! Worker records and derived liveness status.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use url::Url;

use crate::types::WorkerName;

/// Liveness status of a worker.
///
/// Never stored: it is recomputed from heartbeat age and slot occupancy on
/// every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
}

impl WorkerStatus {
    pub fn derive(heartbeat_age: Duration, staleness_threshold: Duration, occupied: usize) -> Self {
        if heartbeat_age > staleness_threshold {
            Self::Offline
        } else if occupied > 0 {
            Self::Busy
        } else {
            Self::Idle
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a worker announces when it registers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub name: WorkerName,
    /// Base URL termination requests are sent to.
    pub address: Url,
    /// Maximum number of concurrent executors.
    pub capacity: u32,
}

/// Registry-owned worker state.
#[derive(Debug, Clone)]
pub(crate) struct WorkerRecord {
    pub name: WorkerName,
    pub address: Url,
    pub capacity: u32,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: Instant,
    pub last_heartbeat_at: DateTime<Utc>,
    /// Set once the health sweep has demoted this worker and lost its
    /// executors; cleared by the next heartbeat or registration.
    pub swept_offline: bool,
}

impl WorkerRecord {
    pub fn new(registration: WorkerRegistration) -> Self {
        let now = Utc::now();
        Self {
            name: registration.name,
            address: registration.address,
            capacity: registration.capacity,
            registered_at: now,
            last_heartbeat: Instant::now(),
            last_heartbeat_at: now,
            swept_offline: false,
        }
    }

    pub fn touch(&mut self) {
        self.last_heartbeat = Instant::now();
        self.last_heartbeat_at = Utc::now();
        self.swept_offline = false;
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.elapsed()
    }

    pub fn is_stale(&self, staleness_threshold: Duration) -> bool {
        self.heartbeat_age() > staleness_threshold
    }

    pub fn snapshot(&self, staleness_threshold: Duration, occupied: usize) -> Worker {
        let age = self.heartbeat_age();
        Worker {
            name: self.name.clone(),
            address: self.address.clone(),
            capacity: self.capacity,
            occupied: occupied as u32,
            status: WorkerStatus::derive(age, staleness_threshold, occupied),
            registered_at: self.registered_at,
            last_heartbeat_at: self.last_heartbeat_at,
            last_heartbeat_age_ms: age.as_millis() as u64,
        }
    }
}

/// Point-in-time view of a worker handed out to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub name: WorkerName,
    pub address: Url,
    pub capacity: u32,
    pub occupied: u32,
    pub status: WorkerStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub last_heartbeat_age_ms: u64,
}

/// Body of the worker health endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub status: WorkerStatus,
    pub last_heartbeat_age_ms: u64,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl From<&Worker> for WorkerHealth {
    fn from(worker: &Worker) -> Self {
        Self {
            status: worker.status,
            last_heartbeat_age_ms: worker.last_heartbeat_age_ms,
            last_heartbeat_at: worker.last_heartbeat_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_derivation() {
        let threshold = Duration::from_secs(30);

        assert_eq!(
            WorkerStatus::derive(Duration::from_secs(1), threshold, 0),
            WorkerStatus::Idle
        );
        assert_eq!(
            WorkerStatus::derive(Duration::from_secs(1), threshold, 2),
            WorkerStatus::Busy
        );
        assert_eq!(
            WorkerStatus::derive(Duration::from_secs(31), threshold, 2),
            WorkerStatus::Offline
        );
        // The threshold itself is still live.
        assert_eq!(
            WorkerStatus::derive(threshold, threshold, 0),
            WorkerStatus::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_goes_stale_and_touch_revives() {
        let mut record = WorkerRecord::new(WorkerRegistration {
            name: WorkerName::new("w1"),
            address: Url::parse("http://10.0.0.5:8080").unwrap(),
            capacity: 2,
        });
        let threshold = Duration::from_secs(10);

        assert!(!record.is_stale(threshold));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(record.is_stale(threshold));
        assert_eq!(record.snapshot(threshold, 0).status, WorkerStatus::Offline);

        record.swept_offline = true;
        record.touch();
        assert!(!record.is_stale(threshold));
        assert!(!record.swept_offline);
        assert_eq!(record.snapshot(threshold, 1).status, WorkerStatus::Busy);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&WorkerStatus::Offline).unwrap(),
            "\"offline\""
        );
    }
}
