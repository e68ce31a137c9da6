//! Kill handshake: resolve a build, signal its worker, settle the executor.
//!
//! ```text
//! Running --kill--> CancelRequested --ack--> Cancelled
//!                                   --retries exhausted--> Lost
//! ```
//!
//! The executor moves to CancelRequested under the worker lock before any
//! signal is sent, so a concurrent second kill sees the in-flight handshake
//! and returns without signalling. Signals are sent with no lock held.

pub mod client;

pub use client::{HttpWorkerClient, TerminateRequest, WorkerClient};

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::CancellationConfig;
use crate::error::{DispatchError, FleetError, Result};
use crate::fleet::{AttemptGate, CancelStart, CancelTicket, Executor, ExecutorState, Fleet};
use crate::types::{BuildRef, ExecutorId};

/// Retry policy for termination signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&CancellationConfig::default())
    }
}

impl From<&CancellationConfig> for RetryPolicy {
    fn from(cfg: &CancellationConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            attempt_timeout: Duration::from_millis(cfg.attempt_timeout_ms),
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling from `initial_backoff`
    /// and capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

/// Result of a kill request that did not fail.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "executor", rename_all = "snake_case")]
pub enum KillOutcome {
    /// The worker acknowledged termination (or stopped reporting the build).
    Cancelled(Executor),
    /// Another request's handshake is still running.
    CancelRequested(Executor),
    /// The executor had already finished; nothing was sent.
    AlreadyTerminal(Executor),
}

impl KillOutcome {
    pub fn executor(&self) -> &Executor {
        match self {
            Self::Cancelled(e) | Self::CancelRequested(e) | Self::AlreadyTerminal(e) => e,
        }
    }
}

pub struct CancellationDispatcher {
    fleet: Arc<Fleet>,
    client: Arc<dyn WorkerClient>,
    policy: RetryPolicy,
}

impl CancellationDispatcher {
    pub fn new(fleet: Arc<Fleet>, client: Arc<dyn WorkerClient>, policy: RetryPolicy) -> Self {
        Self {
            fleet,
            client,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Terminate the executor bound to `build`.
    ///
    /// The handshake runs on its own task. Dropping the returned future
    /// abandons only the wait, never the handshake.
    pub async fn kill(&self, build: &BuildRef) -> Result<KillOutcome> {
        let start = self.fleet.begin_cancel(build).await?;
        self.drive(start).await
    }

    /// Terminate `build` only while it is still bound to `executor`.
    pub async fn kill_executor(&self, build: &BuildRef, executor: ExecutorId) -> Result<KillOutcome> {
        let start = self.fleet.begin_cancel_executor(build, executor).await?;
        self.drive(start).await
    }

    async fn drive(&self, start: CancelStart) -> Result<KillOutcome> {
        let ticket = match start {
            CancelStart::Dispatch(ticket) => ticket,
            CancelStart::InProgress(executor) => return Ok(KillOutcome::CancelRequested(executor)),
            CancelStart::AlreadyTerminal(executor) => {
                return Ok(KillOutcome::AlreadyTerminal(executor));
            }
        };

        let handshake = Handshake {
            fleet: self.fleet.clone(),
            client: self.client.clone(),
            policy: self.policy.clone(),
            ticket,
        };
        tokio::spawn(handshake.run())
            .await
            .map_err(|e| FleetError::Internal(format!("cancellation task failed: {e}")))?
    }
}

struct Handshake {
    fleet: Arc<Fleet>,
    client: Arc<dyn WorkerClient>,
    policy: RetryPolicy,
    ticket: CancelTicket,
}

impl Handshake {
    async fn run(self) -> Result<KillOutcome> {
        let request = TerminateRequest {
            executor: self.ticket.executor(),
            slot: self.ticket.slot(),
            build: self.ticket.build.clone(),
        };
        let mut last_error = DispatchError::Timeout(self.policy.attempt_timeout);
        let mut attempts = 0;

        for _ in 0..self.policy.max_attempts {
            let attempt = match self.fleet.record_cancel_attempt(&self.ticket).await {
                AttemptGate::Proceed { attempt } => attempt,
                AttemptGate::Settled(executor) => return self.settled(executor),
            };
            attempts = attempt;

            let sent = tokio::time::timeout(
                self.policy.attempt_timeout,
                self.client.terminate(&self.ticket.address, &request),
            )
            .await
            .unwrap_or(Err(DispatchError::Timeout(self.policy.attempt_timeout)));

            match sent {
                Ok(()) => return self.acknowledged().await,
                Err(e) => {
                    if attempt < self.policy.max_attempts {
                        let delay = self.policy.backoff(attempt);
                        warn!(
                            build = %self.ticket.build,
                            worker = %self.ticket.key.worker,
                            attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %e,
                            "Termination signal failed, retrying"
                        );
                        last_error = e;
                        tokio::time::sleep(delay).await;
                    } else {
                        last_error = e;
                    }
                }
            }
        }

        match self.fleet.finish_cancel(&self.ticket, ExecutorState::Lost).await {
            Ok(_) => {
                error!(
                    build = %self.ticket.build,
                    worker = %self.ticket.key.worker,
                    attempts,
                    error = %last_error,
                    "Termination not acknowledged, executor lost"
                );
                Err(FleetError::DispatchExhausted {
                    build: self.ticket.build.clone(),
                    attempts,
                    last_error,
                })
            }
            Err(executor) => self.settled(executor),
        }
    }

    async fn acknowledged(&self) -> Result<KillOutcome> {
        match self
            .fleet
            .finish_cancel(&self.ticket, ExecutorState::Cancelled)
            .await
        {
            Ok(executor) => {
                info!(
                    build = %self.ticket.build,
                    worker = %self.ticket.key.worker,
                    slot = executor.slot,
                    "Termination acknowledged"
                );
                Ok(KillOutcome::Cancelled(executor))
            }
            Err(executor) => self.settled(executor),
        }
    }

    /// Another path (heartbeat, sweep) finished the executor mid-handshake.
    fn settled(&self, executor: Option<Executor>) -> Result<KillOutcome> {
        match executor {
            Some(executor) if executor.state == ExecutorState::Cancelled => {
                Ok(KillOutcome::Cancelled(executor))
            }
            Some(executor) => Ok(KillOutcome::AlreadyTerminal(executor)),
            None => Err(FleetError::BuildNotFound(self.ticket.build.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::client::fake::{RecordingClient, Reply};
    use super::*;
    use crate::fleet::{FleetSettings, WorkerRegistration};
    use crate::types::WorkerName;
    use url::Url;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(4),
        }
    }

    async fn setup(client: Arc<RecordingClient>) -> (Arc<Fleet>, CancellationDispatcher, WorkerName) {
        let fleet = Arc::new(Fleet::new(FleetSettings {
            staleness_threshold: Duration::from_secs(60),
            history_limit: 64,
        }));
        let w1 = WorkerName::new("w1");
        fleet
            .register(WorkerRegistration {
                name: w1.clone(),
                address: Url::parse("http://w1.internal:8080").unwrap(),
                capacity: 1,
            })
            .await
            .unwrap();
        let dispatcher = CancellationDispatcher::new(fleet.clone(), client, policy());
        (fleet, dispatcher, w1)
    }

    fn build(number: u64) -> BuildRef {
        BuildRef::new("octo", "app", number)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_millis(250));
        assert_eq!(policy.backoff(2), Duration::from_millis(500));
        assert_eq!(policy.backoff(3), Duration::from_secs(1));
        assert_eq!(policy.backoff(6), Duration::from_secs(4));
        assert_eq!(policy.backoff(40), Duration::from_secs(4));
    }

    #[test]
    fn test_policy_from_config() {
        let policy = RetryPolicy::from(&CancellationConfig {
            max_attempts: 0,
            attempt_timeout_ms: 1500,
            initial_backoff_ms: 100,
            max_backoff_ms: 800,
        });
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.attempt_timeout, Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_kill_acknowledged_frees_slot() {
        let client = Arc::new(RecordingClient::new(Reply::Ack));
        let (fleet, dispatcher, w1) = setup(client.clone()).await;
        let assigned = fleet.assign(&w1, build(1)).await.unwrap();

        let outcome = dispatcher.kill(&build(1)).await.unwrap();

        let KillOutcome::Cancelled(executor) = outcome else {
            panic!("expected cancelled, got {outcome:?}");
        };
        assert_eq!(executor.state, ExecutorState::Cancelled);
        assert_eq!(client.calls(), 1);
        assert_eq!(client.requests()[0].executor, assigned.id);

        // Slot is immediately reusable.
        let next = fleet.assign(&w1, build(2)).await.unwrap();
        assert_eq!(next.slot, assigned.slot);
    }

    #[tokio::test]
    async fn test_kill_executor_skips_rerun_on_other_worker() {
        let client = Arc::new(RecordingClient::new(Reply::Ack));
        let (fleet, dispatcher, w1) = setup(client.clone()).await;
        let first = fleet.assign(&w1, build(1)).await.unwrap();
        fleet.heartbeat(&w1, vec![]).await.unwrap();

        let w2 = WorkerName::new("w2");
        fleet
            .register(WorkerRegistration {
                name: w2.clone(),
                address: Url::parse("http://w2.internal:8080").unwrap(),
                capacity: 1,
            })
            .await
            .unwrap();
        fleet.assign(&w2, build(1)).await.unwrap();

        let outcome = dispatcher.kill_executor(&build(1), first.id).await.unwrap();

        let KillOutcome::AlreadyTerminal(executor) = outcome else {
            panic!("expected already terminal, got {outcome:?}");
        };
        assert_eq!(executor.id, first.id);
        assert_eq!(client.calls(), 0);
        assert_eq!(
            fleet.lookup_by_build(&build(1)).await.unwrap().state,
            ExecutorState::Running
        );
    }

    #[tokio::test]
    async fn test_kill_unknown_build_is_not_found() {
        let client = Arc::new(RecordingClient::new(Reply::Ack));
        let (_, dispatcher, _) = setup(client.clone()).await;

        let err = dispatcher.kill(&build(1)).await.unwrap_err();
        assert!(matches!(err, FleetError::BuildNotFound(_)));
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_double_kill_sends_one_signal() {
        let client = Arc::new(RecordingClient::new(Reply::AckAfter(
            Duration::from_millis(200),
        )));
        let (fleet, dispatcher, w1) = setup(client.clone()).await;
        fleet.assign(&w1, build(1)).await.unwrap();

        let target = build(1);
        let (first, second) = tokio::join!(dispatcher.kill(&target), dispatcher.kill(&target));

        let outcomes = [first.unwrap(), second.unwrap()];
        assert_eq!(client.calls(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, KillOutcome::Cancelled(_)))
                .count(),
            1
        );
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, KillOutcome::CancelRequested(_)))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_kill_after_completion_sends_nothing() {
        let client = Arc::new(RecordingClient::new(Reply::Ack));
        let (fleet, dispatcher, w1) = setup(client.clone()).await;
        fleet.assign(&w1, build(1)).await.unwrap();
        fleet.heartbeat(&w1, vec![]).await.unwrap();

        let outcome = dispatcher.kill(&build(1)).await.unwrap();

        match outcome {
            KillOutcome::AlreadyTerminal(executor) => {
                assert_eq!(executor.state, ExecutorState::Completed)
            }
            other => panic!("expected already terminal, got {other:?}"),
        }
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_second_kill_after_cancel_sends_nothing() {
        let client = Arc::new(RecordingClient::new(Reply::Ack));
        let (fleet, dispatcher, w1) = setup(client.clone()).await;
        fleet.assign(&w1, build(1)).await.unwrap();

        dispatcher.kill(&build(1)).await.unwrap();
        let outcome = dispatcher.kill(&build(1)).await.unwrap();

        assert!(matches!(outcome, KillOutcome::AlreadyTerminal(_)));
        assert_eq!(outcome.executor().state, ExecutorState::Cancelled);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_acknowledged() {
        let client = Arc::new(RecordingClient::scripted(
            vec![
                Reply::Fail(DispatchError::Transport("connection reset".into())),
                Reply::Hang,
            ],
            Reply::Ack,
        ));
        let (fleet, dispatcher, w1) = setup(client.clone()).await;
        fleet.assign(&w1, build(1)).await.unwrap();

        let started = tokio::time::Instant::now();
        let outcome = dispatcher.kill(&build(1)).await.unwrap();

        assert!(matches!(outcome, KillOutcome::Cancelled(_)));
        assert_eq!(client.calls(), 3);
        // 250ms backoff, 5s timeout on the hung attempt, 500ms backoff.
        assert!(started.elapsed() >= Duration::from_millis(5750));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_mark_executor_lost() {
        let client = Arc::new(RecordingClient::new(Reply::Hang));
        let (fleet, dispatcher, w1) = setup(client.clone()).await;
        fleet.assign(&w1, build(1)).await.unwrap();

        let err = dispatcher.kill(&build(1)).await.unwrap_err();

        match err {
            FleetError::DispatchExhausted {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, DispatchError::Timeout(Duration::from_secs(5)));
            }
            other => panic!("expected exhausted dispatch, got {other:?}"),
        }
        assert_eq!(client.calls(), 3);
        assert_eq!(
            fleet.find_build(&build(1)).await.unwrap().state,
            ExecutorState::Lost
        );
        assert_eq!(fleet.worker(&w1).await.unwrap().occupied, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_during_handshake_settles_as_cancelled() {
        let client = Arc::new(RecordingClient::new(Reply::Hang));
        let (fleet, dispatcher, w1) = setup(client.clone()).await;
        fleet.assign(&w1, build(1)).await.unwrap();
        let dispatcher = Arc::new(dispatcher);

        let kill = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.kill(&build(1)).await }
        });

        // Let the first attempt go out, then report the build gone.
        tokio::time::sleep(Duration::from_secs(1)).await;
        fleet.heartbeat(&w1, vec![]).await.unwrap();

        let outcome = kill.await.unwrap().unwrap();
        assert!(matches!(outcome, KillOutcome::Cancelled(_)));
        assert_eq!(outcome.executor().state, ExecutorState::Cancelled);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_kill_request_still_completes_handshake() {
        let client = Arc::new(RecordingClient::new(Reply::AckAfter(Duration::from_secs(1))));
        let (fleet, dispatcher, w1) = setup(client.clone()).await;
        fleet.assign(&w1, build(1)).await.unwrap();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), dispatcher.kill(&build(1))).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            fleet.find_build(&build(1)).await.unwrap().state,
            ExecutorState::Cancelled
        );
    }
}
