//! Configuration loading for Herald
//!
//! Sources are layered: built-in defaults, then an optional file, then
//! environment variables prefixed with `HERALD__` (for example
//! `HERALD__COORDINATION__ADDRESS=http://consul:8500`).

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{HeraldError, Result};
use crate::paths::{DEFAULT_ROOT, ServicePaths};

const ENV_PREFIX: &str = "HERALD";
const ENV_SEPARATOR: &str = "__";

/// Coordination backend selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process store, for embedded use and tests
    Memory,
    /// Consul HTTP API
    #[default]
    Consul,
}

/// Connection settings for the coordination service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub backend: Backend,
    /// Connection string (e.g. `http://127.0.0.1:8500`)
    pub address: String,
    /// Optional namespace prefix for every node path
    pub namespace: Option<String>,
    /// Root node under the namespace
    pub root: String,
    /// Session TTL; ephemeral nodes vanish this long after contact is lost
    pub session_ttl_ms: u64,
    /// Per-request timeout
    pub request_timeout_ms: u64,
    /// Maximum wait of a single blocking watch query
    pub wait_time_ms: u64,
    /// Optional ACL token
    pub token: Option<String>,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Consul,
            address: "http://127.0.0.1:8500".to_string(),
            namespace: None,
            root: DEFAULT_ROOT.to_string(),
            session_ttl_ms: 15_000,
            request_timeout_ms: 10_000,
            wait_time_ms: 30_000,
            token: None,
        }
    }
}

impl CoordinationConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }

    pub fn paths(&self) -> ServicePaths {
        ServicePaths::new(self.namespace.as_deref(), &self.root)
    }
}

/// Exponential backoff with jitter for reconnects and replays.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let base = (self.initial_backoff_ms as f64 * exp).min(self.max_backoff_ms as f64);
        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        let delay = if jitter > 0.0 {
            let spread = base * jitter;
            base + rand::rng().random_range(-spread..=spread)
        } else {
            base
        };
        Duration::from_millis(delay.clamp(0.0, self.max_backoff_ms as f64) as u64)
    }
}

/// Top-level Herald configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeraldConfig {
    pub coordination: CoordinationConfig,
    pub retry: RetryConfig,
}

impl HeraldConfig {
    /// Load defaults, then `path` if given, then `HERALD__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_from(path, None)
    }

    fn load_from(path: Option<&Path>, env: Option<config::Map<String, String>>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&HeraldConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .source(env),
        );

        let config: HeraldConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let coordination = &self.coordination;
        if coordination.backend == Backend::Consul && coordination.address.trim().is_empty() {
            return Err(HeraldError::Config(
                "coordination.address is required for the consul backend".to_string(),
            ));
        }
        if coordination.session_ttl_ms == 0 {
            return Err(HeraldError::Config(
                "coordination.session_ttl_ms must be positive".to_string(),
            ));
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(HeraldError::Config(
                "retry.max_backoff_ms must not be below retry.initial_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}
