//! Outbound termination signal to a worker agent.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::DispatchError;
use crate::types::{BuildRef, ExecutorId};

/// Body of `POST {worker}/executors/{executor}/terminate`.
///
/// The executor id doubles as the idempotency key: a worker that receives
/// the same id twice terminates at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminateRequest {
    pub executor: ExecutorId,
    pub slot: u32,
    pub build: BuildRef,
}

/// Sends termination signals. Implementations must not retry internally;
/// the dispatcher owns the retry policy.
pub trait WorkerClient: Send + Sync {
    fn terminate<'a>(
        &'a self,
        address: &'a Url,
        request: &'a TerminateRequest,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>>;
}

/// [`WorkerClient`] over HTTP.
pub struct HttpWorkerClient {
    client: Client,
    token: Option<String>,
    timeout: Duration,
}

impl HttpWorkerClient {
    /// `timeout` is a transport-level ceiling; the dispatcher applies its own
    /// per-attempt timeout on top.
    pub fn new(token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("fleet-orchestrator/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            token,
            timeout,
        })
    }

    async fn send(&self, address: &Url, request: &TerminateRequest) -> Result<(), DispatchError> {
        let url = terminate_url(address, request.executor)?;
        debug!(url = %url, build = %request.build, "Sending termination signal");

        let mut req = self.client.post(url).json(request);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                DispatchError::Timeout(self.timeout)
            } else {
                DispatchError::Transport(e.to_string())
            }
        })?;

        match response.status() {
            s if s.is_success() => Ok(()),
            // The worker no longer knows the executor, so nothing is left to stop.
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(()),
            s => Err(DispatchError::Rejected(s.as_u16())),
        }
    }
}

impl WorkerClient for HttpWorkerClient {
    fn terminate<'a>(
        &'a self,
        address: &'a Url,
        request: &'a TerminateRequest,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
        Box::pin(self.send(address, request))
    }
}

fn terminate_url(address: &Url, executor: ExecutorId) -> Result<Url, DispatchError> {
    // Treat the registered address as a directory so a path prefix survives the join.
    let mut base = address.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(&format!("executors/{executor}/terminate"))
        .map_err(|e| DispatchError::Transport(format!("invalid worker address {address}: {e}")))
}
