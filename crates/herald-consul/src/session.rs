//! Consul session lifecycle
//!
//! A session is created with `Behavior=delete`, so every key acquired by it
//! disappears when it is invalidated. The keepalive task renews it every third
//! of the TTL and maps renewal outcomes onto [`SessionState`]:
//! - renewal transport failure: SUSPENDED
//! - renewal failing for longer than the TTL, or a 404: LOST
//! - a fresh session created after LOST: RECONNECTED
//! - renewal succeeding again while SUSPENDED: RECONNECTED

use std::sync::Arc;
use std::time::Instant;

use herald_coordination::{CoordinationError, SESSION_EVENT_CAPACITY, SessionState};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::api::ConsulApi;
use crate::config::ConsulConfig;

struct Slot {
    id: Option<String>,
    /// Session given up locally that the server may still hold
    stale: Option<String>,
    state: SessionState,
}

/// Current session id and state, shared by the client and its keepalive task.
pub(crate) struct SessionTracker {
    slot: Mutex<Slot>,
    events: broadcast::Sender<SessionState>,
}

impl SessionTracker {
    pub(crate) fn new(id: String) -> Self {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self {
            slot: Mutex::new(Slot {
                id: Some(id),
                stale: None,
                state: SessionState::Connected,
            }),
            events,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.slot.lock().state
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.events.subscribe()
    }

    pub(crate) fn id(&self) -> Option<String> {
        self.slot.lock().id.clone()
    }

    /// Session id usable for a request right now.
    pub(crate) fn live_id(&self) -> Result<String, CoordinationError> {
        let slot = self.slot.lock();
        match (slot.state, &slot.id) {
            (state, Some(id)) if state.is_live() => Ok(id.clone()),
            (SessionState::Lost, _) => Err(CoordinationError::SessionExpired),
            _ => Err(CoordinationError::ConnectionLoss),
        }
    }

    fn transition(&self, slot: &mut Slot, next: SessionState) {
        if slot.state == next {
            return;
        }
        debug!(from = %slot.state, to = %next, "Consul session transition");
        slot.state = next;
        let _ = self.events.send(next);
    }

    pub(crate) fn suspend(&self) {
        let mut slot = self.slot.lock();
        if slot.state.is_live() {
            self.transition(&mut slot, SessionState::Suspended);
        }
    }

    /// Renewal succeeded; leaves SUSPENDED if we were there.
    pub(crate) fn renewed(&self) {
        let mut slot = self.slot.lock();
        if slot.state == SessionState::Suspended {
            self.transition(&mut slot, SessionState::Reconnected);
        }
    }

    /// Give up the current session. `stale` is kept so it can be destroyed
    /// once the agent is reachable again.
    pub(crate) fn lose(&self, stale: Option<String>) {
        let mut slot = self.slot.lock();
        slot.id = None;
        if stale.is_some() {
            slot.stale = stale;
        }
        self.transition(&mut slot, SessionState::Lost);
    }

    pub(crate) fn establish(&self, id: String) {
        let mut slot = self.slot.lock();
        slot.id = Some(id);
        self.transition(&mut slot, SessionState::Reconnected);
    }

    fn stale(&self) -> Option<String> {
        self.slot.lock().stale.clone()
    }

    fn clear_stale(&self) {
        self.slot.lock().stale = None;
    }

    /// Take the session id for final cleanup.
    pub(crate) fn take(&self) -> Option<String> {
        let mut slot = self.slot.lock();
        slot.stale.take();
        slot.id.take()
    }
}

/// Renew the session until shutdown, replacing it when lost.
pub(crate) async fn run_keepalive(
    api: Arc<ConsulApi>,
    tracker: Arc<SessionTracker>,
    config: ConsulConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = config.renew_interval();
    let mut last_renewed = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        let delay = if tracker.state() == SessionState::Lost {
            config.retry.delay_for(attempt)
        } else {
            interval
        };
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        match tracker.id() {
            Some(id) => match api.renew_session(&id).await {
                Ok(true) => {
                    last_renewed = Instant::now();
                    tracker.renewed();
                }
                Ok(false) => {
                    warn!(session = %id, "Consul session invalidated by the server");
                    tracker.lose(None);
                    attempt = 0;
                }
                Err(e) => {
                    debug!(session = %id, error = %e, "Consul session renewal failed");
                    tracker.suspend();
                    if last_renewed.elapsed() >= config.session_ttl {
                        warn!(session = %id, "Consul session not renewed within its TTL");
                        tracker.lose(Some(id));
                        attempt = 0;
                    }
                }
            },
            None => {
                if let Some(stale) = tracker.stale() {
                    match api.destroy_session(&stale).await {
                        Ok(()) => tracker.clear_stale(),
                        Err(e) => {
                            debug!(session = %stale, error = %e, "Failed to destroy stale session");
                            attempt = attempt.saturating_add(1);
                            continue;
                        }
                    }
                }
                match api
                    .create_session(&config.session_name, config.server_ttl())
                    .await
                {
                    Ok(id) => {
                        info!(session = %id, "Consul session re-established");
                        last_renewed = Instant::now();
                        attempt = 0;
                        tracker.establish(id);
                    }
                    Err(e) => {
                        warn!(error = %e, attempt, "Failed to re-create Consul session");
                        attempt = attempt.saturating_add(1);
                    }
                }
            }
        }
    }
}
