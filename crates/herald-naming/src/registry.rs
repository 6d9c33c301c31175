//! Service registry
//!
//! Each registered endpoint becomes an ephemeral node at
//! `/<root>/<service>/<id>`. The registry remembers what it registered and
//! re-creates those nodes whenever the session monitor reports RECONNECTED, so
//! nodes removed by a session expiry come back without caller action.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use herald_common::{
    CoordinationError, Endpoint, EndpointKey, HeraldError, Result, RetryConfig, ServicePaths,
};
use herald_coordination::{CoordinationClient, SessionState};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::session::SessionMonitor;

/// Register and unregister endpoints.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Advertise `endpoint`. Registering the same identity again replaces its
    /// payload. Fails with [`HeraldError::Registration`] when the coordination
    /// service cannot be reached; the call is not retried.
    async fn register(&self, endpoint: Endpoint) -> Result<bool>;

    /// Withdraw `endpoint`. Succeeds when the node is already gone; a node
    /// now held by another session is left in place.
    async fn unregister(&self, endpoint: &Endpoint) -> Result<bool>;
}

struct RegistryInner {
    client: Arc<dyn CoordinationClient>,
    paths: ServicePaths,
    retry: RetryConfig,
    registered: DashMap<EndpointKey, Endpoint>,
    /// Nodes whose delete failed while the session may still hold them
    orphans: DashMap<EndpointKey, String>,
    closed: AtomicBool,
}

/// [`ServiceRegistry`] backed by ephemeral coordination-store nodes.
pub struct CoordinationRegistry {
    inner: Arc<RegistryInner>,
    replay: Mutex<Option<JoinHandle<()>>>,
}

impl CoordinationRegistry {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        monitor: Arc<SessionMonitor>,
        paths: ServicePaths,
    ) -> Self {
        Self::with_retry(client, monitor, paths, RetryConfig::default())
    }

    /// Create a registry whose replay retries use `retry`. Must be called
    /// within a Tokio runtime.
    pub fn with_retry(
        client: Arc<dyn CoordinationClient>,
        monitor: Arc<SessionMonitor>,
        paths: ServicePaths,
        retry: RetryConfig,
    ) -> Self {
        let inner = Arc::new(RegistryInner {
            client,
            paths,
            retry,
            registered: DashMap::new(),
            orphans: DashMap::new(),
            closed: AtomicBool::new(false),
        });
        let events = monitor.subscribe();
        let replay = tokio::spawn(replay_on_reconnect(inner.clone(), monitor, events));

        Self {
            inner,
            replay: Mutex::new(Some(replay)),
        }
    }

    /// Endpoints currently believed registered, sorted by identity.
    pub fn registered(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self
            .inner
            .registered
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        endpoints.sort_by(|a, b| a.key().cmp(&b.key()));
        endpoints
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop replaying and remove every registered node this session still
    /// owns. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.replay.lock().take() {
            task.abort();
        }

        let keys: Vec<EndpointKey> = self
            .inner
            .registered
            .iter()
            .map(|e| e.key().clone())
            .collect();
        let paths: Vec<String> = keys
            .iter()
            .filter_map(|key| self.inner.registered.remove(key))
            .map(|(key, _)| self.inner.paths.endpoint_path(&key.service_name, &key.id))
            .chain(self.inner.orphans.iter().map(|e| e.value().clone()))
            .collect();
        self.inner.orphans.clear();

        let results =
            join_all(paths.iter().map(|path| self.inner.client.delete_owned(path))).await;
        let removed = results.iter().filter(|r| matches!(r, Ok(true))).count();
        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(removed, failed, "Service registry closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(HeraldError::Closed("registry"));
        }
        Ok(())
    }
}

impl RegistryInner {
    fn path_of(&self, endpoint: &Endpoint) -> String {
        self.paths.endpoint_path(endpoint.service_name(), endpoint.id())
    }

    async fn create(&self, endpoint: &Endpoint) -> std::result::Result<(), CoordinationError> {
        let data = endpoint
            .encode()
            .map_err(|e| CoordinationError::Backend(e.to_string()))?;
        self.client.create_ephemeral(&self.path_of(endpoint), data).await
    }

    /// Re-create one node, then reconcile with a register or unregister that
    /// may have raced the replay.
    async fn replay_one(&self, endpoint: &Endpoint) -> std::result::Result<(), CoordinationError> {
        self.create(endpoint).await?;
        let current = self
            .registered
            .get(&endpoint.key())
            .map(|e| e.value().clone());
        match current {
            None => self.client.delete_owned(&self.path_of(endpoint)).await.map(|_| ()),
            Some(current) if !current.same_payload(endpoint) => self.create(&current).await,
            Some(_) => Ok(()),
        }
    }

    /// Restore every registered node and retry pending deletes.
    /// Returns the number of failures.
    async fn replay(&self) -> usize {
        let pending: Vec<Endpoint> = self.registered.iter().map(|e| e.value().clone()).collect();
        let results = join_all(pending.iter().map(|endpoint| self.replay_one(endpoint))).await;

        let mut failed = 0;
        for (endpoint, result) in pending.iter().zip(results) {
            if let Err(e) = result {
                warn!(endpoint = %endpoint, error = %e, "Failed to restore registration");
                failed += 1;
            }
        }
        info!(restored = pending.len() - failed, failed, "Registrations replayed");

        let orphans: Vec<(EndpointKey, String)> = self
            .orphans
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (key, path) in orphans {
            match self.client.delete_owned(&path).await {
                Ok(_) => {
                    self.orphans.remove_if(&key, |_, p| *p == path);
                }
                Err(e) => {
                    debug!(endpoint = %key, error = %e, "Pending delete still failing");
                    failed += 1;
                }
            }
        }
        failed
    }
}

async fn replay_on_reconnect(
    inner: Arc<RegistryInner>,
    monitor: Arc<SessionMonitor>,
    mut events: broadcast::Receiver<SessionState>,
) {
    loop {
        match events.recv().await {
            Ok(SessionState::Reconnected) => {}
            Ok(SessionState::Lost) => {
                // Expiry removed every node the old session held
                let dropped = inner.orphans.len();
                inner.orphans.clear();
                if dropped > 0 {
                    debug!(dropped, "Pending deletes dropped with expired session");
                }
                continue;
            }
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Registry lagged behind session events");
                if !monitor.state().is_live() {
                    continue;
                }
            }
            Err(RecvError::Closed) => break,
        }

        let mut attempt = 0;
        while !inner.closed.load(Ordering::SeqCst) && inner.replay().await > 0 {
            if !inner.client.session_state().is_live() {
                break;
            }
            tokio::time::sleep(inner.retry.delay_for(attempt)).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl ServiceRegistry for CoordinationRegistry {
    async fn register(&self, endpoint: Endpoint) -> Result<bool> {
        self.ensure_open()?;
        let key = endpoint.key();

        // Recorded first so a replay racing the create covers this endpoint
        let previous = self.inner.registered.insert(key.clone(), endpoint.clone());
        if let Err(e) = self.inner.create(&endpoint).await {
            warn!(endpoint = %key, error = %e, "Registration failed");
            if let Entry::Occupied(mut entry) = self.inner.registered.entry(key.clone())
                && entry.get().same_payload(&endpoint)
            {
                match previous {
                    Some(previous) => {
                        entry.insert(previous);
                    }
                    None => {
                        entry.remove();
                    }
                }
            }
            return Err(HeraldError::Registration {
                endpoint: key.to_string(),
                source: e,
            });
        }

        self.inner.orphans.remove(&key);
        info!(service = %key.service_name, id = %key.id, "Endpoint registered");
        Ok(true)
    }

    async fn unregister(&self, endpoint: &Endpoint) -> Result<bool> {
        self.ensure_open()?;
        let key = endpoint.key();
        let path = self.inner.path_of(endpoint);
        self.inner.registered.remove(&key);

        match self.inner.client.delete_owned(&path).await {
            Ok(_) => {}
            // Expiry already removed the node
            Err(CoordinationError::SessionExpired) => {}
            Err(e) => {
                warn!(endpoint = %key, error = %e, "Unregistration failed");
                if e.is_connection_issue() {
                    self.inner.orphans.insert(key.clone(), path);
                }
                return Err(HeraldError::Registration {
                    endpoint: key.to_string(),
                    source: e,
                });
            }
        }

        self.inner.orphans.remove(&key);
        info!(service = %key.service_name, id = %key.id, "Endpoint unregistered");
        Ok(true)
    }
}

impl Drop for CoordinationRegistry {
    fn drop(&mut self) {
        if let Some(task) = self.replay.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use herald_coordination::{ChildWatch, MemoryClient, MemoryStore};
    use std::time::Duration;

    const FOO_PATH: &str = "/herald/Foo/server%3A8080";

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    fn setup(store: &MemoryStore) -> (Arc<MemoryClient>, CoordinationRegistry) {
        setup_with_delay(store, Duration::from_millis(10))
    }

    fn setup_with_delay(
        store: &MemoryStore,
        reconnect_delay: Duration,
    ) -> (Arc<MemoryClient>, CoordinationRegistry) {
        let client = store.connect_with_delay(reconnect_delay);
        let monitor = SessionMonitor::new(client.clone());
        let registry = CoordinationRegistry::with_retry(
            client.clone(),
            monitor,
            ServicePaths::default(),
            fast_retry(),
        );
        (client, registry)
    }

    fn foo() -> Endpoint {
        Endpoint::new("Foo", "server:8080").unwrap()
    }

    async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..250 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// Client whose first create succeeds server-side, then loses the session
    /// and only answers once the replacement session is up.
    struct ExpiringCreate {
        inner: Arc<MemoryClient>,
        tripped: AtomicBool,
    }

    #[async_trait]
    impl CoordinationClient for ExpiringCreate {
        async fn create_ephemeral(
            &self,
            path: &str,
            data: Bytes,
        ) -> herald_coordination::Result<()> {
            self.inner.create_ephemeral(path, data).await?;
            if !self.tripped.swap(true, Ordering::SeqCst) {
                self.inner.expire_session();
                while self.inner.session_state() != SessionState::Reconnected {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Ok(())
        }

        async fn delete(&self, path: &str) -> herald_coordination::Result<()> {
            self.inner.delete(path).await
        }

        async fn delete_owned(&self, path: &str) -> herald_coordination::Result<bool> {
            self.inner.delete_owned(path).await
        }

        async fn get_children_watched(
            &self,
            path: &str,
        ) -> herald_coordination::Result<(Vec<String>, ChildWatch)> {
            self.inner.get_children_watched(path).await
        }

        async fn get_data(&self, path: &str) -> herald_coordination::Result<Option<Bytes>> {
            self.inner.get_data(path).await
        }

        fn session_events(&self) -> broadcast::Receiver<SessionState> {
            self.inner.session_events()
        }

        fn session_state(&self) -> SessionState {
            self.inner.session_state()
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_register_creates_node() {
        let store = MemoryStore::new();
        let (_client, registry) = setup(&store);

        let endpoint = Endpoint::new("Foo", "server:8080").unwrap();
        assert!(registry.register(endpoint.clone()).await.unwrap());
        assert!(store.exists("/herald/Foo/server%3A8080"));
        assert_eq!(registry.registered(), vec![endpoint]);
    }

    #[tokio::test]
    async fn test_unregister_is_tolerant() {
        let store = MemoryStore::new();
        let (_client, registry) = setup(&store);

        let endpoint = Endpoint::new("Foo", "never-registered").unwrap();
        assert!(registry.unregister(&endpoint).await.unwrap());
    }

    #[tokio::test]
    async fn test_register_while_suspended_fails() {
        let store = MemoryStore::new();
        let (client, registry) = setup(&store);
        client.suspend();

        let endpoint = Endpoint::new("Foo", "a").unwrap();
        let err = registry.register(endpoint).await.unwrap_err();
        assert!(matches!(
            err,
            HeraldError::Registration {
                source: CoordinationError::ConnectionLoss,
                ..
            }
        ));
        assert!(registry.registered().is_empty());
    }

    #[tokio::test]
    async fn test_failed_unregister_is_retried_on_reconnect() {
        let store = MemoryStore::new();
        let (client, registry) = setup(&store);
        let endpoint = Endpoint::new("Foo", "a").unwrap();
        registry.register(endpoint.clone()).await.unwrap();

        client.suspend();
        assert!(registry.unregister(&endpoint).await.is_err());
        assert!(store.exists("/herald/Foo/a"));

        client.resume();
        for _ in 0..100 {
            if !store.exists("/herald/Foo/a") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!store.exists("/herald/Foo/a"));
    }

    #[tokio::test]
    async fn test_close_removes_nodes() {
        let store = MemoryStore::new();
        let (_client, registry) = setup(&store);
        registry
            .register(Endpoint::new("Foo", "a").unwrap())
            .await
            .unwrap();
        registry
            .register(Endpoint::new("Bar", "b").unwrap())
            .await
            .unwrap();

        registry.close().await;
        registry.close().await;

        assert_eq!(store.node_count(), 0);
        assert!(matches!(
            registry.register(Endpoint::new("Foo", "c").unwrap()).await,
            Err(HeraldError::Closed("registry"))
        ));
    }

    #[tokio::test]
    async fn test_pending_delete_spares_node_registered_by_new_owner() {
        let store = MemoryStore::new();
        let (a_client, a) = setup(&store);
        let (_b_client, b) = setup(&store);

        a.register(foo()).await.unwrap();
        a_client.suspend();
        assert!(a.unregister(&foo()).await.is_err());

        // The expiry removes A's node; B takes the identity before A is back
        a_client.expire_session();
        assert!(!store.exists(FOO_PATH));
        b.register(foo()).await.unwrap();
        a_client.resume();

        assert!(eventually(|| a_client.session_state().is_live()).await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(store.exists(FOO_PATH));
        assert_eq!(b.registered(), vec![foo()]);
    }

    #[tokio::test]
    async fn test_replay_retries_until_foreign_owner_leaves() {
        let store = MemoryStore::new();
        let (a_client, a) = setup_with_delay(&store, Duration::from_millis(150));
        let (b_client, b) = setup(&store);

        a.register(foo()).await.unwrap();
        a_client.expire_session();
        b.register(foo()).await.unwrap();

        // A's replay hits NodeOwned and keeps retrying while B holds the node
        assert!(eventually(|| a_client.session_state().is_live()).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.owner(FOO_PATH), b_client.session_id());

        b.unregister(&foo()).await.unwrap();
        assert!(eventually(|| store.owner(FOO_PATH) == a_client.session_id()).await);
        assert_eq!(a.registered(), vec![foo()]);
    }

    #[tokio::test]
    async fn test_close_leaves_node_owned_by_other_session() {
        let store = MemoryStore::new();
        let (a_client, a) = setup_with_delay(&store, Duration::from_millis(150));
        let (b_client, b) = setup(&store);

        a.register(foo()).await.unwrap();
        a_client.expire_session();
        b.register(foo()).await.unwrap();
        assert!(eventually(|| a_client.session_state().is_live()).await);

        a.close().await;
        assert_eq!(store.owner(FOO_PATH), b_client.session_id());
        assert_eq!(b.registered(), vec![foo()]);
    }

    #[tokio::test]
    async fn test_registration_survives_session_loss_during_create() {
        let store = MemoryStore::new();
        let inner = store.connect_with_delay(Duration::from_millis(10));
        let client = Arc::new(ExpiringCreate {
            inner: inner.clone(),
            tripped: AtomicBool::new(false),
        });
        let monitor = SessionMonitor::new(client.clone());
        let registry =
            CoordinationRegistry::with_retry(client, monitor, ServicePaths::default(), fast_retry());

        assert!(registry.register(foo()).await.unwrap());
        assert!(eventually(|| store.owner(FOO_PATH) == inner.session_id()).await);
        assert_eq!(registry.registered(), vec![foo()]);
    }

    #[tokio::test]
    async fn test_failed_reregistration_keeps_previous_payload() {
        let store = MemoryStore::new();
        let (client, registry) = setup(&store);
        let v1 = Endpoint::with_payload("Foo", "a", "v1").unwrap();
        let v2 = Endpoint::with_payload("Foo", "a", "v2").unwrap();

        registry.register(v1.clone()).await.unwrap();
        client.suspend();
        assert!(registry.register(v2).await.is_err());

        let registered = registry.registered();
        assert_eq!(registered.len(), 1);
        assert!(registered[0].same_payload(&v1));
    }
}
