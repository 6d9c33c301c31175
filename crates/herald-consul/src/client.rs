//! `CoordinationClient` implementation backed by Consul
//!
//! Node paths map onto KV keys by dropping the leading `/`. Ephemeral nodes
//! are keys acquired by the client's session; child watches are blocking
//! queries on the parent prefix that fire once `X-Consul-Index` moves.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use herald_coordination::{
    ChildWatch, CoordinationClient, CoordinationError, Result, SessionState, WatchTrigger,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::ConsulApi;
use crate::config::ConsulConfig;
use crate::session::{SessionTracker, run_keepalive};

/// Consul-backed coordination client.
pub struct ConsulClient {
    api: Arc<ConsulApi>,
    tracker: Arc<SessionTracker>,
    shutdown: watch::Sender<bool>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ConsulClient {
    /// Create a session on the agent and start renewing it.
    pub async fn connect(config: ConsulConfig) -> Result<Arc<Self>> {
        let api = Arc::new(ConsulApi::new(&config)?);
        let id = api
            .create_session(&config.session_name, config.server_ttl())
            .await?;
        info!(session = %id, address = %config.address, "Connected to Consul");

        let tracker = Arc::new(SessionTracker::new(id));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let keepalive = tokio::spawn(run_keepalive(
            api.clone(),
            tracker.clone(),
            config,
            shutdown_rx,
        ));

        Ok(Arc::new(Self {
            api,
            tracker,
            shutdown,
            keepalive: Mutex::new(Some(keepalive)),
            closed: AtomicBool::new(false),
        }))
    }

    /// Id of the current session, if any.
    pub fn session_id(&self) -> Option<String> {
        self.tracker.id()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordinationError::Closed);
        }
        Ok(())
    }

    fn live_session(&self) -> Result<String> {
        self.ensure_open()?;
        self.tracker.live_id()
    }
}

fn to_key(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// Block on the prefix until its index moves, then fire the trigger.
///
/// An index going backwards (snapshot restore, leader change) also counts as
/// a change. Dropping the trigger on error or shutdown resolves the watch
/// with `ConnectionLoss`.
async fn watch_prefix(
    api: Arc<ConsulApi>,
    prefix: String,
    index: u64,
    mut trigger: WatchTrigger,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let listing = tokio::select! {
            _ = trigger.abandoned() => return,
            _ = shutdown.changed() => return,
            listing = api.keys(&prefix, Some(index.max(1))) => listing,
        };
        match listing {
            Ok(listing) if listing.index == index => continue,
            Ok(listing) => {
                debug!(prefix = %prefix, from = index, to = listing.index, "Consul watch fired");
                trigger.fire();
                return;
            }
            Err(e) => {
                debug!(prefix = %prefix, error = %e, "Consul watch query failed");
                return;
            }
        }
    }
}

#[async_trait]
impl CoordinationClient for ConsulClient {
    async fn create_ephemeral(&self, path: &str, data: Bytes) -> Result<()> {
        let session = self.live_session()?;
        if self.api.acquire(to_key(path), &session, data).await? {
            Ok(())
        } else {
            Err(CoordinationError::NodeOwned(path.to_string()))
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.live_session()?;
        self.api.delete(to_key(path)).await?;
        Ok(())
    }

    async fn delete_owned(&self, path: &str) -> Result<bool> {
        let session = self.live_session()?;
        let key = to_key(path);
        let Some(pair) = self.api.get_pair(key).await? else {
            return Ok(false);
        };
        if pair.session.as_deref() != Some(session.as_str()) {
            debug!(key, holder = ?pair.session, "Key not held by this session, left in place");
            return Ok(false);
        }
        // cas guards against a release and re-acquire between read and delete
        Ok(self.api.delete_cas(key, pair.modify_index).await?)
    }

    async fn get_children_watched(&self, path: &str) -> Result<(Vec<String>, ChildWatch)> {
        self.live_session()?;
        let prefix = format!("{}/", to_key(path).trim_end_matches('/'));
        let listing = self.api.keys(&prefix, None).await?;

        let children = listing
            .keys
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|name| !name.is_empty() && !name.contains('/'))
            .map(str::to_string)
            .collect();

        let (trigger, child_watch) = ChildWatch::channel(path.trim_end_matches('/'));
        tokio::spawn(watch_prefix(
            self.api.clone(),
            prefix,
            listing.index,
            trigger,
            self.shutdown.subscribe(),
        ));
        Ok((children, child_watch))
    }

    async fn get_data(&self, path: &str) -> Result<Option<Bytes>> {
        self.live_session()?;
        Ok(self.api.get(to_key(path)).await?)
    }

    fn session_events(&self) -> broadcast::Receiver<SessionState> {
        self.tracker.subscribe()
    }

    fn session_state(&self) -> SessionState {
        self.tracker.state()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        let keepalive = self.keepalive.lock().take();
        if let Some(handle) = keepalive {
            let _ = handle.await;
        }
        if let Some(id) = self.tracker.take() {
            match self.api.destroy_session(&id).await {
                Ok(()) => info!(session = %id, "Consul session destroyed"),
                Err(e) => warn!(session = %id, error = %e, "Failed to destroy Consul session"),
            }
        }
    }
}

impl Drop for ConsulClient {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.keepalive.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_key() {
        assert_eq!(to_key("/herald/Foo/a"), "herald/Foo/a");
        assert_eq!(to_key("herald"), "herald");
    }
}
