// Core modules
pub mod api;
pub mod auth;
pub mod cancel;
pub mod config;
pub mod error;
pub mod fleet;
pub mod monitor;
pub mod shutdown;
pub mod types;

// Re-export key types
pub use cancel::{CancellationDispatcher, HttpWorkerClient, KillOutcome, RetryPolicy, WorkerClient};
pub use config::{FleetConfig, load_config};
pub use error::{DispatchError, ErrorKind, FleetError};
pub use fleet::{Executor, ExecutorState, Fleet, FleetSettings, Worker, WorkerStatus};
pub use monitor::{HealthMonitor, SweepReport};
pub use types::{BuildRef, ExecutorId, WorkerName};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use auth::ApiKeyAuth;

/// The registry, the kill dispatcher and the auth check, wired from one
/// configuration. The HTTP router and the health monitor share them.
pub struct FleetServices {
    pub fleet: Arc<Fleet>,
    pub dispatcher: Arc<CancellationDispatcher>,
    pub auth: Arc<ApiKeyAuth>,
    sweep_interval: Duration,
}

impl FleetServices {
    /// Build services that signal workers over HTTP.
    pub fn from_config(config: &FleetConfig) -> Result<Self> {
        let policy = RetryPolicy::from(&config.cancellation);
        let client = HttpWorkerClient::new(
            config.auth.worker_token.clone(),
            policy.attempt_timeout,
        )?;
        Ok(Self::with_client(config, Arc::new(client)))
    }

    /// Build services around a caller-supplied worker client.
    pub fn with_client(config: &FleetConfig, client: Arc<dyn WorkerClient>) -> Self {
        let fleet = Arc::new(Fleet::new(FleetSettings::from(&config.registry)));
        let dispatcher = Arc::new(CancellationDispatcher::new(
            fleet.clone(),
            client,
            RetryPolicy::from(&config.cancellation),
        ));
        let auth = Arc::new(ApiKeyAuth::new(config.auth.api_key.as_deref()));

        Self {
            fleet,
            dispatcher,
            auth,
            sweep_interval: config.monitor.sweep_interval(),
        }
    }

    pub fn app_state(&self) -> api::AppState {
        api::AppState {
            fleet: self.fleet.clone(),
            dispatcher: self.dispatcher.clone(),
            auth: self.auth.clone(),
        }
    }

    pub fn router(&self) -> Router {
        api::create_router(self.app_state())
    }

    pub fn monitor(&self) -> HealthMonitor {
        HealthMonitor::new(self.fleet.clone(), self.sweep_interval)
    }
}
