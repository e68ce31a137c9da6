use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, path::PathBuf, time::Duration};

/// Top-level server configuration, read from `fleet.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub cancellation: CancellationConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Heartbeat age after which a worker reads as Offline.
    #[serde(default = "default_staleness_threshold_ms")]
    pub staleness_threshold_ms: u64,
    /// Number of finished executors remembered for kill/lookup answers.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_ms: default_staleness_threshold_ms(),
            history_limit: default_history_limit(),
        }
    }
}

impl RegistryConfig {
    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_millis(self.staleness_threshold_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl MonitorConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for CancellationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Operator key required on every route when set.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Bearer token presented to workers on termination requests.
    #[serde(default)]
    pub worker_token: Option<String>,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_staleness_threshold_ms() -> u64 {
    60_000
}

fn default_history_limit() -> usize {
    1024
}

fn default_sweep_interval_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_attempt_timeout_ms() -> u64 {
    5_000
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    4_000
}

impl FleetConfig {
    /// Reject settings that would make the registry or the handshake spin.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.registry.staleness_threshold_ms == 0 {
            anyhow::bail!("registry.staleness_threshold_ms must be greater than zero");
        }
        if self.monitor.sweep_interval_ms == 0 {
            anyhow::bail!("monitor.sweep_interval_ms must be greater than zero");
        }
        if self.cancellation.max_attempts == 0 {
            anyhow::bail!("cancellation.max_attempts must be at least 1");
        }
        if self.cancellation.attempt_timeout_ms == 0 {
            anyhow::bail!("cancellation.attempt_timeout_ms must be greater than zero");
        }
        if self.cancellation.initial_backoff_ms > self.cancellation.max_backoff_ms {
            anyhow::bail!(
                "cancellation.initial_backoff_ms ({}) exceeds cancellation.max_backoff_ms ({})",
                self.cancellation.initial_backoff_ms,
                self.cancellation.max_backoff_ms
            );
        }
        Ok(())
    }
}

/// Locate the configuration file.
///
/// An explicit path wins, then `FLEET_CONFIG`, then `./fleet.json`.
/// `None` means run on built-in defaults.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p);
    }

    if let Ok(p) = env::var("FLEET_CONFIG") {
        return Some(PathBuf::from(p));
    }

    let candidate = PathBuf::from("fleet.json");
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}

fn expand_config(cfg: FleetConfig) -> FleetConfig {
    let mut cfg = cfg;

    cfg.server.bind = expand_env_vars(&cfg.server.bind);
    if let Some(key) = cfg.auth.api_key.as_mut() {
        *key = expand_env_vars(key);
    }
    if let Some(token) = cfg.auth.worker_token.as_mut() {
        *token = expand_env_vars(token);
    }

    cfg
}

/// Read, expand and validate a configuration file.
pub fn load_config_file(path: &Path) -> anyhow::Result<FleetConfig> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Could not read config {}: {}", path.display(), e))?;
    let cfg: FleetConfig = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))?;
    let cfg = expand_config(cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Resolve and load the configuration, falling back to defaults.
pub fn load_config(explicit: Option<PathBuf>) -> anyhow::Result<FleetConfig> {
    match resolve_config_path(explicit) {
        Some(path) => {
            tracing::info!("Loading configuration from {}", path.display());
            load_config_file(&path)
        }
        None => {
            tracing::info!("No configuration file found, using defaults");
            Ok(FleetConfig::default())
        }
    }
}
