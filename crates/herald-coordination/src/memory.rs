//! In-process coordination store
//!
//! `MemoryStore` plays the server: it owns nodes, sessions and armed watches.
//! Each `MemoryClient` holds one session at a time and exposes fault
//! injection (`suspend`, `resume`, `expire_session`) that drives the same
//! SUSPENDED / LOST / RECONNECTED transitions a networked client reports.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::watch::{ChildWatch, WatchTrigger};
use crate::{CoordinationClient, CoordinationError, Result, SESSION_EVENT_CAPACITY, SessionState};

/// Default delay before a client re-establishes a session after expiry.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(50);

type SessionId = u64;

struct Node {
    data: Bytes,
    owner: SessionId,
}

struct ArmedWatch {
    session: SessionId,
    trigger: WatchTrigger,
}

#[derive(Default)]
struct StoreInner {
    next_session: SessionId,
    sessions: HashSet<SessionId>,
    nodes: BTreeMap<String, Node>,
    /// Armed watches keyed by the parent path they observe
    watches: HashMap<String, Vec<ArmedWatch>>,
}

impl StoreInner {
    fn open_session(&mut self) -> SessionId {
        self.next_session += 1;
        let id = self.next_session;
        self.sessions.insert(id);
        id
    }

    fn children(&self, parent: &str) -> Vec<String> {
        let prefix = format!("{}/", parent.trim_end_matches('/'));
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter_map(|(path, _)| {
                let name = &path[prefix.len()..];
                (!name.contains('/')).then(|| name.to_string())
            })
            .collect()
    }

    fn fire_watches(&mut self, path: &str) {
        if let Some(armed) = self.watches.remove(parent_of(path)) {
            for watch in armed {
                watch.trigger.fire();
            }
        }
    }

    /// Remove a session together with its ephemeral nodes and armed watches.
    fn expire(&mut self, session: SessionId) -> usize {
        if !self.sessions.remove(&session) {
            return 0;
        }

        for armed in self.watches.values_mut() {
            armed.retain(|w| w.session != session);
        }
        self.watches.retain(|_, armed| !armed.is_empty());

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == session)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            self.nodes.remove(path);
            self.fire_watches(path);
        }
        owned.len()
    }
}

fn parent_of(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Shared in-process coordination store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client with its own session.
    pub fn connect(&self) -> Arc<MemoryClient> {
        self.connect_with_delay(DEFAULT_RECONNECT_DELAY)
    }

    /// Open a client that waits `reconnect_delay` before replacing an expired session.
    pub fn connect_with_delay(&self, reconnect_delay: Duration) -> Arc<MemoryClient> {
        let session = self.inner.lock().open_session();
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        debug!(session, "Memory client connected");
        Arc::new(MemoryClient {
            store: self.clone(),
            link: Arc::new(Mutex::new(Link {
                session: Some(session),
                state: SessionState::Connected,
                network_up: true,
            })),
            events,
            reconnect_delay,
            closed: Arc::new(AtomicBool::new(false)),
            read_failures: AtomicUsize::new(0),
        })
    }

    /// Whether a node exists at `path`.
    pub fn exists(&self, path: &str) -> bool {
        self.inner.lock().nodes.contains_key(path)
    }

    /// Total number of nodes held by the store.
    pub fn node_count(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    /// Number of watches currently armed.
    pub fn armed_watch_count(&self) -> usize {
        self.inner.lock().watches.values().map(Vec::len).sum()
    }

    /// Session owning the node at `path`; `Some(0)` for raw nodes.
    pub fn owner(&self, path: &str) -> Option<u64> {
        self.inner.lock().nodes.get(path).map(|node| node.owner)
    }

    /// Drop every watch armed on `path` without a change, as a server does
    /// when it loses track of its watchers. The watches resolve with
    /// `ConnectionLoss` while the sessions stay alive.
    pub fn discard_watches(&self, path: &str) -> usize {
        self.inner
            .lock()
            .watches
            .remove(path.trim_end_matches('/'))
            .map_or(0, |armed| armed.len())
    }

    /// Write a node owned by no live session; for tests that need foreign data.
    pub fn put_raw(&self, path: &str, data: impl Into<Bytes>) {
        let mut inner = self.inner.lock();
        inner.nodes.insert(
            path.to_string(),
            Node {
                data: data.into(),
                owner: 0,
            },
        );
        inner.fire_watches(path);
    }
}

struct Link {
    session: Option<SessionId>,
    state: SessionState,
    network_up: bool,
}

/// One client handle onto a [`MemoryStore`].
pub struct MemoryClient {
    store: MemoryStore,
    link: Arc<Mutex<Link>>,
    events: broadcast::Sender<SessionState>,
    reconnect_delay: Duration,
    closed: Arc<AtomicBool>,
    /// Child listings still to fail with a transport error
    read_failures: AtomicUsize,
}

impl MemoryClient {
    /// Id of the current session, if any.
    pub fn session_id(&self) -> Option<u64> {
        self.link.lock().session
    }

    /// Fail the next `count` child listings with a transport error while
    /// the session stays live.
    pub fn fail_next_reads(&self, count: usize) {
        self.read_failures.store(count, Ordering::SeqCst);
    }

    /// Child listings still set to fail.
    pub fn pending_read_failures(&self) -> usize {
        self.read_failures.load(Ordering::SeqCst)
    }

    /// Simulate a network partition: operations fail, the session survives.
    pub fn suspend(&self) {
        let mut link = self.link.lock();
        link.network_up = false;
        if link.state.is_live() {
            self.transition(&mut link, SessionState::Suspended);
        }
    }

    /// Heal a partition created by [`suspend`](Self::suspend).
    ///
    /// Resumes the old session when it is still alive, otherwise reports LOST
    /// and establishes a fresh one.
    pub fn resume(&self) {
        let mut link = self.link.lock();
        link.network_up = true;
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match link.state {
            SessionState::Suspended => {
                let alive = link
                    .session
                    .is_some_and(|s| self.store.inner.lock().sessions.contains(&s));
                if !alive {
                    self.transition(&mut link, SessionState::Lost);
                    link.session = Some(self.store.inner.lock().open_session());
                }
                self.transition(&mut link, SessionState::Reconnected);
            }
            SessionState::Lost => {
                link.session = Some(self.store.inner.lock().open_session());
                self.transition(&mut link, SessionState::Reconnected);
            }
            _ => {}
        }
    }

    /// Expire this client's session server-side.
    ///
    /// Ephemeral nodes are deleted and armed watches discarded. The client
    /// reports LOST and, once the network is up, opens a new session after the
    /// reconnect delay. Must be called from within a Tokio runtime.
    pub fn expire_session(&self) {
        let mut link = self.link.lock();
        let Some(session) = link.session.take() else {
            return;
        };
        let removed = self.store.inner.lock().expire(session);
        info!(session, removed, "Memory session expired");

        if link.state != SessionState::Lost {
            self.transition(&mut link, SessionState::Lost);
        }

        if link.network_up {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&self) {
        let store = self.store.clone();
        let link = self.link.clone();
        let events = self.events.clone();
        let closed = self.closed.clone();
        let delay = self.reconnect_delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut link = link.lock();
            if closed.load(Ordering::SeqCst)
                || !link.network_up
                || link.state != SessionState::Lost
            {
                return;
            }
            let session = store.inner.lock().open_session();
            link.session = Some(session);
            link.state = SessionState::Reconnected;
            debug!(session, "Memory client re-established session");
            let _ = events.send(SessionState::Reconnected);
        });
    }

    /// Update the state and publish it while holding the link lock, so
    /// subscribers see transitions in order.
    fn transition(&self, link: &mut Link, next: SessionState) {
        debug!(from = %link.state, to = %next, "Memory session transition");
        link.state = next;
        let _ = self.events.send(next);
    }

    fn live_session(&self) -> Result<SessionId> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordinationError::Closed);
        }
        let link = self.link.lock();
        match (link.state, link.session) {
            (state, Some(session)) if state.is_live() => Ok(session),
            (SessionState::Lost, _) => Err(CoordinationError::SessionExpired),
            _ => Err(CoordinationError::ConnectionLoss),
        }
    }
}

#[async_trait]
impl CoordinationClient for MemoryClient {
    async fn create_ephemeral(&self, path: &str, data: Bytes) -> Result<()> {
        let session = self.live_session()?;
        let mut inner = self.store.inner.lock();
        if let Some(existing) = inner.nodes.get(path)
            && existing.owner != session
        {
            return Err(CoordinationError::NodeOwned(path.to_string()));
        }
        inner.nodes.insert(
            path.to_string(),
            Node {
                data,
                owner: session,
            },
        );
        inner.fire_watches(path);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.live_session()?;
        let mut inner = self.store.inner.lock();
        if inner.nodes.remove(path).is_some() {
            inner.fire_watches(path);
        }
        Ok(())
    }

    async fn delete_owned(&self, path: &str) -> Result<bool> {
        let session = self.live_session()?;
        let mut inner = self.store.inner.lock();
        if !inner.nodes.get(path).is_some_and(|node| node.owner == session) {
            return Ok(false);
        }
        inner.nodes.remove(path);
        inner.fire_watches(path);
        Ok(true)
    }

    async fn get_children_watched(&self, path: &str) -> Result<(Vec<String>, ChildWatch)> {
        let session = self.live_session()?;
        if self
            .read_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CoordinationError::Transport(
                "injected read failure".to_string(),
            ));
        }
        let mut inner = self.store.inner.lock();
        let children = inner.children(path);
        let parent = path.trim_end_matches('/').to_string();
        let (trigger, watch) = ChildWatch::channel(parent.clone());
        let armed = inner.watches.entry(parent).or_default();
        armed.retain(|w| !w.trigger.is_abandoned());
        armed.push(ArmedWatch { session, trigger });
        Ok((children, watch))
    }

    async fn get_data(&self, path: &str) -> Result<Option<Bytes>> {
        self.live_session()?;
        Ok(self
            .store
            .inner
            .lock()
            .nodes
            .get(path)
            .map(|node| node.data.clone()))
    }

    fn session_events(&self) -> broadcast::Receiver<SessionState> {
        self.events.subscribe()
    }

    fn session_state(&self) -> SessionState {
        self.link.lock().state
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.link.lock().session.take();
        if let Some(session) = session {
            let removed = self.store.inner.lock().expire(session);
            debug!(session, removed, "Memory client closed");
        }
    }
}
