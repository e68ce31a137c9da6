use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use fleet_orchestrator::{FleetServices, load_config, shutdown::install_shutdown_handler};

#[derive(Parser)]
#[command(name = "fleet-orchestrator")]
#[command(about = "CI worker registry, executor tracking and build cancellation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API and the worker health monitor
    Server {
        /// Bind address, overrides `server.bind` from the config file
        #[arg(long, env = "FLEET_BIND")]
        bind: Option<String>,
        /// Path to the JSON config file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Operator API key, overrides `auth.api_key`
        #[arg(long, env = "FLEET_API_KEY")]
        api_key: Option<String>,
        /// Bearer token sent to workers, overrides `auth.worker_token`
        #[arg(long, env = "FLEET_WORKER_TOKEN")]
        worker_token: Option<String>,
    },
    /// Print the effective configuration as JSON
    ShowConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

const DEFAULT_LOG_FILTER: &str = "fleet_orchestrator=info";

/// `RUST_LOG` wins when set; otherwise only this crate logs, at info.
fn log_filter(directives: Option<String>) -> Result<EnvFilter> {
    let directives = directives.unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    Ok(EnvFilter::try_new(directives)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok())?)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            bind,
            config,
            api_key,
            worker_token,
        } => {
            let mut config = load_config(config)?;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if api_key.is_some() {
                config.auth.api_key = api_key;
            }
            if worker_token.is_some() {
                config.auth.worker_token = worker_token;
            }
            config.validate()?;

            let services = FleetServices::from_config(&config)?;
            if services.auth.is_enabled() {
                info!("Static API key authentication enabled");
            } else {
                warn!("No API key configured, running in anonymous mode");
            }

            let shutdown = install_shutdown_handler();
            let monitor = services.monitor().spawn(shutdown.clone());

            let app = services.router();
            let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
            info!("Fleet orchestrator listening on http://{}", config.server.bind);

            let token = shutdown.clone();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await?;

            // The server may also stop on its own; make sure the monitor follows.
            shutdown.cancel();
            if let Err(e) = monitor.await {
                tracing::error!("Health monitor task failed: {}", e);
            }
            info!("Fleet orchestrator stopped");
        }
        Commands::ShowConfig { config } => {
            let mut config = load_config(config)?;
            for secret in [&mut config.auth.api_key, &mut config.auth.worker_token] {
                if secret.is_some() {
                    *secret = Some("<redacted>".to_string());
                }
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
