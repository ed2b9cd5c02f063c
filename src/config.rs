//! Environment-based configuration and shared application state.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use crate::orchestrator::Engine;

/// Engine configuration loaded from `ARGYLL_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub host: String,
    pub port: u16,
    /// Public base URL of this replica; embedded in async callback
    /// URLs handed to step services.
    pub public_url: String,

    // Event store
    pub key_prefix: String,
    pub redis_rest_url: Option<String>,
    pub redis_rest_token: Option<String>,
    pub store_poll_interval: Duration,
    pub subscription_buffer: usize,

    // Orchestration
    pub stabilization: Duration,
    pub lease_timeout: Duration,
    pub shutdown_grace: Duration,

    // Hibernation
    pub hibernate_after: Duration,
    pub hibernate_sweep: Duration,
}

impl Config {
    /// Load configuration. Malformed numeric values are a hard
    /// configuration error, not a silent default.
    pub fn from_env() -> anyhow::Result<Self> {
        let host = env::var("ARGYLL_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port: u16 = parse_var("ARGYLL_PORT", 8080)?;
        let public_url = env::var("ARGYLL_PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://{host}:{port}"));

        Ok(Self {
            host,
            port,
            public_url,
            key_prefix: env::var("ARGYLL_KEY_PREFIX").unwrap_or_else(|_| "argyll".to_string()),
            redis_rest_url: env::var("ARGYLL_REDIS_REST_URL").ok(),
            redis_rest_token: env::var("ARGYLL_REDIS_REST_TOKEN").ok(),
            store_poll_interval: Duration::from_millis(parse_var("ARGYLL_STORE_POLL_MS", 250)?),
            subscription_buffer: parse_var("ARGYLL_SUBSCRIPTION_BUFFER", 1024)?,
            stabilization: Duration::from_millis(parse_var("ARGYLL_STABILIZATION_MS", 200)?),
            lease_timeout: Duration::from_secs(parse_var("ARGYLL_LEASE_TIMEOUT_SECS", 60)?),
            shutdown_grace: Duration::from_secs(parse_var("ARGYLL_SHUTDOWN_GRACE_SECS", 10)?),
            hibernate_after: Duration::from_secs(parse_var("ARGYLL_HIBERNATE_AFTER_SECS", 3_600)?),
            hibernate_sweep: Duration::from_secs(parse_var("ARGYLL_HIBERNATE_SWEEP_SECS", 300)?),
        })
    }

    /// Server bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {name}={raw}: {e}")),
        Err(_) => Ok(default),
    }
}

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(config: Arc<Config>, engine: Arc<Engine>) -> Self {
        Self { config, engine }
    }
}
