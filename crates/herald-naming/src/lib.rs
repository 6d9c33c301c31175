//! Herald Naming - service registry and host discovery
//!
//! Producers advertise themselves through a [`ServiceRegistry`]; consumers
//! follow the live endpoints of a service through a [`HostDiscovery`]. Both
//! share one coordination client and one [`SessionMonitor`], which feeds them
//! session transitions so registrations are replayed and caches rebuilt after
//! a session loss.
//!
//! # Example
//!
//! ```ignore
//! use herald_common::{Endpoint, HeraldConfig};
//! use herald_naming::{Herald, ServiceRegistry};
//!
//! let herald = Herald::connect(HeraldConfig::load(None)?).await?;
//! let registry = herald.registry();
//! registry.register(Endpoint::new("Foo", "server:8080")?).await?;
//!
//! let discovery = herald.discovery("Foo").await?;
//! let endpoints = discovery.get_endpoints()?;
//! ```

pub mod discovery;
pub mod listener;
pub mod registry;
pub mod session;

use std::sync::Arc;

use herald_common::{Backend, HeraldConfig, Result, RetryConfig, ServicePaths};
use herald_consul::{ConsulClient, ConsulConfig};
use herald_coordination::{CoordinationClient, MemoryStore};
use tracing::info;

pub use discovery::{EndpointChanges, HostDiscovery, diff_endpoints};
pub use listener::{EndpointListener, FnEndpointListener};
pub use registry::{CoordinationRegistry, ServiceRegistry};
pub use session::SessionMonitor;

/// Open a coordination client for the configured backend.
///
/// The `memory` backend gets a private store, visible only to this client.
/// Share a [`MemoryStore`] through [`Herald::with_client`] instead when
/// several handles must see each other.
pub async fn connect(config: &HeraldConfig) -> Result<Arc<dyn CoordinationClient>> {
    config.validate()?;
    let client: Arc<dyn CoordinationClient> = match config.coordination.backend {
        Backend::Memory => MemoryStore::new().connect(),
        Backend::Consul => ConsulClient::connect(ConsulConfig::from_herald(config)).await?,
    };
    info!(backend = ?config.coordination.backend, "Coordination client connected");
    Ok(client)
}

/// A coordination client bundled with its session monitor and path layout.
pub struct Herald {
    client: Arc<dyn CoordinationClient>,
    monitor: Arc<SessionMonitor>,
    paths: ServicePaths,
    retry: RetryConfig,
}

impl Herald {
    /// Connect using `config`; see [`connect`].
    pub async fn connect(config: HeraldConfig) -> Result<Self> {
        let client = connect(&config).await?;
        Ok(Self::with_client(client, &config))
    }

    /// Wrap an existing client. Must be called within a Tokio runtime.
    pub fn with_client(client: Arc<dyn CoordinationClient>, config: &HeraldConfig) -> Self {
        let monitor = SessionMonitor::new(client.clone());
        Self {
            client,
            monitor,
            paths: config.coordination.paths(),
            retry: config.retry.clone(),
        }
    }

    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        &self.client
    }

    pub fn monitor(&self) -> &Arc<SessionMonitor> {
        &self.monitor
    }

    pub fn paths(&self) -> &ServicePaths {
        &self.paths
    }

    /// A registry writing under this bundle's path layout.
    pub fn registry(&self) -> CoordinationRegistry {
        CoordinationRegistry::with_retry(
            self.client.clone(),
            self.monitor.clone(),
            self.paths.clone(),
            self.retry.clone(),
        )
    }

    /// Start discovering `service_name`.
    pub async fn discovery(&self, service_name: &str) -> Result<HostDiscovery> {
        HostDiscovery::with_retry(
            self.client.clone(),
            self.monitor.clone(),
            &self.paths,
            service_name,
            self.retry.clone(),
        )
        .await
    }

    /// Stop the session monitor and close the client, removing its ephemeral
    /// nodes. Close registries and discoveries built from this bundle first.
    pub async fn close(&self) {
        self.monitor.close();
        self.client.close().await;
    }
}
