//! Host discovery
//!
//! A `HostDiscovery` mirrors the live children of `/<root>/<service>` in a
//! local cache. One update task owns every cache write: it applies watch
//! fires, session transitions and retry timers serially, swaps in a complete
//! new snapshot, then notifies listeners. Readers clone the current snapshot
//! `Arc` and never wait on coordination I/O.
//!
//! Session handling:
//! - SUSPENDED / LOST: the cache is cleared and every cached endpoint is
//!   reported removed, since freshness cannot be trusted without a session
//! - RECONNECTED: children are re-read and diffed against the (empty) cache,
//!   so everything still present is reported added

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use herald_common::paths::child_path;
use herald_common::{CoordinationError, Endpoint, HeraldError, Result, RetryConfig, ServicePaths};
use herald_coordination::{ChildWatch, CoordinationClient, SessionState, WatchEvent};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::listener::EndpointListener;
use crate::session::SessionMonitor;

/// Endpoints keyed by id.
pub type EndpointMap = HashMap<String, Endpoint>;

/// Difference between two cache generations, each side sorted by id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EndpointChanges {
    /// Gone, or superseded by a new payload (old value)
    pub removed: Vec<Endpoint>,
    /// New, or carrying a new payload (new value)
    pub added: Vec<Endpoint>,
}

impl EndpointChanges {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Compute the changes turning `old` into `new`. A payload change shows up
/// as a removal of the old endpoint plus an addition of the new one.
pub fn diff_endpoints(old: &EndpointMap, new: &EndpointMap) -> EndpointChanges {
    let mut removed: Vec<Endpoint> = old
        .iter()
        .filter(|(id, endpoint)| !new.get(*id).is_some_and(|n| n.same_payload(endpoint)))
        .map(|(_, endpoint)| endpoint.clone())
        .collect();
    let mut added: Vec<Endpoint> = new
        .iter()
        .filter(|(id, endpoint)| !old.get(*id).is_some_and(|o| o.same_payload(endpoint)))
        .map(|(_, endpoint)| endpoint.clone())
        .collect();
    removed.sort_by(|a, b| a.id().cmp(b.id()));
    added.sort_by(|a, b| a.id().cmp(b.id()));
    EndpointChanges { removed, added }
}

struct Shared {
    service_name: String,
    cache: RwLock<Arc<EndpointMap>>,
    listeners: RwLock<Vec<Arc<dyn EndpointListener>>>,
    closed: AtomicBool,
}

impl Shared {
    /// Replace the cache with `fresh` and notify listeners, removes first.
    fn apply(&self, fresh: EndpointMap) {
        let current = self.cache.read().clone();
        let changes = diff_endpoints(&current, &fresh);
        if changes.is_empty() {
            return;
        }

        *self.cache.write() = Arc::new(fresh);
        debug!(
            service = %self.service_name,
            added = changes.added.len(),
            removed = changes.removed.len(),
            "Discovery cache updated"
        );

        let listeners = self.listeners.read().clone();
        for endpoint in &changes.removed {
            for listener in &listeners {
                listener.on_remove(endpoint);
            }
        }
        for endpoint in &changes.added {
            for listener in &listeners {
                listener.on_add(endpoint);
            }
        }
    }
}

/// Watches one service name and keeps its live endpoint set.
pub struct HostDiscovery {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HostDiscovery {
    /// Start watching `service_name`.
    ///
    /// Performs the initial watched read before returning. The client and
    /// monitor are required handles; an empty service name fails with
    /// [`HeraldError::InvalidArgument`].
    pub async fn new(
        client: Arc<dyn CoordinationClient>,
        monitor: Arc<SessionMonitor>,
        paths: &ServicePaths,
        service_name: &str,
    ) -> Result<Self> {
        Self::with_retry(client, monitor, paths, service_name, RetryConfig::default()).await
    }

    /// Like [`new`](Self::new), retrying failed re-reads with `retry`.
    pub async fn with_retry(
        client: Arc<dyn CoordinationClient>,
        monitor: Arc<SessionMonitor>,
        paths: &ServicePaths,
        service_name: &str,
        retry: RetryConfig,
    ) -> Result<Self> {
        if service_name.trim().is_empty() {
            return Err(HeraldError::InvalidArgument(
                "service name is empty".to_string(),
            ));
        }

        let events = monitor.subscribe();
        let shared = Arc::new(Shared {
            service_name: service_name.to_string(),
            cache: RwLock::new(Arc::new(EndpointMap::new())),
            listeners: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        let mut updater = Updater {
            client,
            monitor,
            shared: shared.clone(),
            path: paths.service_path(service_name),
            retry,
            watch: None,
            retry_at: None,
            attempt: 0,
        };

        if updater.monitor.state().is_live()
            && let Err(CoordinationError::Closed) = updater.resync().await
        {
            return Err(CoordinationError::Closed.into());
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(updater.run(events, shutdown_rx));
        info!(service = %service_name, "Host discovery started");

        Ok(Self {
            shared,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.shared.service_name
    }

    /// Point-in-time snapshot of the live endpoints, sorted by id.
    ///
    /// Fails with [`HeraldError::Closed`] once [`close`](Self::close) was called.
    pub fn get_endpoints(&self) -> Result<Vec<Endpoint>> {
        if self.is_closed() {
            return Err(HeraldError::Closed("discovery"));
        }
        let snapshot = self.shared.cache.read().clone();
        let mut endpoints: Vec<Endpoint> = snapshot.values().cloned().collect();
        endpoints.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(endpoints)
    }

    pub fn add_listener(&self, listener: Arc<dyn EndpointListener>) {
        self.shared.listeners.write().push(listener);
    }

    /// Remove a listener previously added; matched by pointer identity.
    pub fn remove_listener(&self, listener: &Arc<dyn EndpointListener>) -> bool {
        let mut listeners = self.shared.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Release the watch and stop following session events. No listener is
    /// called after this returns. Idempotent.
    ///
    /// Must not be awaited from inside a listener callback.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.shared.listeners.write().clear();
        info!(service = %self.shared.service_name, "Host discovery closed");
    }
}

impl Drop for HostDiscovery {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// State owned by the update task.
struct Updater {
    client: Arc<dyn CoordinationClient>,
    monitor: Arc<SessionMonitor>,
    shared: Arc<Shared>,
    path: String,
    retry: RetryConfig,
    watch: Option<ChildWatch>,
    retry_at: Option<Instant>,
    attempt: u32,
}

impl Updater {
    async fn run(
        mut self,
        mut events: broadcast::Receiver<SessionState>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                event = events.recv() => match event {
                    Ok(state) => self.on_session(state).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(service = %self.shared.service_name, skipped, "Discovery lagged behind session events");
                        let state = self.monitor.state();
                        self.on_session(state).await;
                    }
                    Err(RecvError::Closed) => break,
                },

                fired = next_fire(&mut self.watch) => {
                    self.watch = None;
                    match fired {
                        Ok(WatchEvent::ChildrenChanged { .. }) => {
                            debug!(service = %self.shared.service_name, "Watch fired");
                            let _ = self.resync().await;
                        }
                        Err(e) => {
                            debug!(service = %self.shared.service_name, error = %e, "Watch discarded");
                            self.schedule_retry();
                        }
                    }
                }

                _ = sleep_until(self.retry_at) => {
                    self.retry_at = None;
                    let _ = self.resync().await;
                }
            }
        }
        debug!(service = %self.shared.service_name, "Discovery update task stopped");
    }

    async fn on_session(&mut self, state: SessionState) {
        match state {
            SessionState::Suspended | SessionState::Lost => {
                self.watch = None;
                self.retry_at = None;
                self.attempt = 0;
                info!(service = %self.shared.service_name, %state, "Clearing discovery cache");
                self.shared.apply(EndpointMap::new());
            }
            SessionState::Connected | SessionState::Reconnected => {
                self.attempt = 0;
                info!(service = %self.shared.service_name, %state, "Rebuilding discovery cache");
                let _ = self.resync().await;
            }
        }
    }

    /// Re-read the children (arming the next watch in the same call) and
    /// apply the result. Failures schedule a retry while the session is live.
    async fn resync(&mut self) -> std::result::Result<(), CoordinationError> {
        match read_children(self.client.as_ref(), &self.path, &self.shared.service_name).await {
            Ok((fresh, watch)) => {
                self.retry_at = None;
                self.attempt = 0;
                self.shared.apply(fresh);
                self.watch = Some(watch);
                Ok(())
            }
            Err(e) => {
                self.watch = None;
                if e == CoordinationError::Closed {
                    debug!(service = %self.shared.service_name, "Coordination client closed");
                } else {
                    warn!(service = %self.shared.service_name, error = %e, "Failed to read service children");
                    self.schedule_retry();
                }
                Err(e)
            }
        }
    }

    fn schedule_retry(&mut self) {
        if !self.client.session_state().is_live() {
            self.retry_at = None;
            return;
        }
        let delay = self.retry.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.retry_at = Some(Instant::now() + delay);
    }
}

async fn next_fire(watch: &mut Option<ChildWatch>) -> herald_coordination::Result<WatchEvent> {
    match watch {
        Some(watch) => watch.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// List the children of `path`, arming a watch, and decode each entry.
/// Entries that fail to decode or belong to another service are skipped.
async fn read_children(
    client: &dyn CoordinationClient,
    path: &str,
    service_name: &str,
) -> std::result::Result<(EndpointMap, ChildWatch), CoordinationError> {
    let (children, watch) = client.get_children_watched(path).await?;
    let node_paths: Vec<String> = children.iter().map(|c| child_path(path, c)).collect();
    let reads = join_all(node_paths.iter().map(|p| client.get_data(p))).await;

    let mut endpoints = EndpointMap::with_capacity(node_paths.len());
    for (node_path, read) in node_paths.iter().zip(reads) {
        // Deleted between listing and read; the armed watch covers it
        let Some(data) = read? else {
            continue;
        };
        match Endpoint::decode(&data) {
            Ok(endpoint) if endpoint.service_name() == service_name => {
                endpoints.insert(endpoint.id().to_string(), endpoint);
            }
            Ok(endpoint) => {
                warn!(path = %node_path, found = %endpoint.service_name(), "Skipping entry of another service");
            }
            Err(e) => {
                warn!(path = %node_path, error = %e, "Skipping undecodable entry");
            }
        }
    }
    Ok((endpoints, watch))
}
