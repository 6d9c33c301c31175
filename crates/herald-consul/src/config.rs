// Configuration for the Consul backend

use std::time::Duration;

use herald_common::{HeraldConfig, RetryConfig};

/// Consul's accepted session TTL range starts at ten seconds.
pub const MIN_SERVER_TTL: Duration = Duration::from_secs(10);

/// Connection settings for a [`ConsulClient`](crate::ConsulClient)
#[derive(Clone, Debug)]
pub struct ConsulConfig {
    /// Agent address, e.g. `http://127.0.0.1:8500`
    pub address: String,
    /// Optional ACL token sent as `X-Consul-Token`
    pub token: Option<String>,
    /// Session TTL; renewals happen every third of it
    pub session_ttl: Duration,
    /// Timeout of ordinary requests
    pub request_timeout: Duration,
    /// Server-side wait of one blocking query
    pub wait_time: Duration,
    /// Session name shown in the Consul UI
    pub session_name: String,
    /// Backoff used while re-creating a lost session
    pub retry: RetryConfig,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8500".to_string(),
            token: None,
            session_ttl: Duration::from_secs(15),
            request_timeout: Duration::from_secs(10),
            wait_time: Duration::from_secs(30),
            session_name: default_session_name(),
            retry: RetryConfig::default(),
        }
    }
}

impl ConsulConfig {
    /// Create a config for a single agent address
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            ..Default::default()
        }
    }

    /// Build from the loaded Herald configuration
    pub fn from_herald(config: &HeraldConfig) -> Self {
        let coordination = &config.coordination;
        Self {
            address: coordination.address.clone(),
            token: coordination.token.clone(),
            session_ttl: coordination.session_ttl(),
            request_timeout: coordination.request_timeout(),
            wait_time: coordination.wait_time(),
            session_name: default_session_name(),
            retry: config.retry.clone(),
        }
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_wait_time(mut self, wait: Duration) -> Self {
        self.wait_time = wait;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Interval between session renewals
    pub fn renew_interval(&self) -> Duration {
        (self.session_ttl / 3).max(Duration::from_millis(10))
    }

    /// TTL string sent to the server, raised to Consul's minimum
    pub fn server_ttl(&self) -> String {
        let ttl = self.session_ttl.max(MIN_SERVER_TTL);
        format!("{}s", ttl.as_secs_f64().ceil() as u64)
    }
}

fn default_session_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("herald-{}", host)
}
