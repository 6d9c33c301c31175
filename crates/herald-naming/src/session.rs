//! Session Monitor
//!
//! Re-dispatches the coordination client's session transitions to every
//! registry and discovery built on the same client handle, in the order the
//! client reported them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use herald_coordination::{CoordinationClient, SESSION_EVENT_CAPACITY, SessionState};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct SessionMonitor {
    state: Arc<RwLock<SessionState>>,
    events: broadcast::Sender<SessionState>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SessionMonitor {
    /// Start monitoring `client`. Must be called within a Tokio runtime.
    pub fn new(client: Arc<dyn CoordinationClient>) -> Arc<Self> {
        let raw = client.session_events();
        let state = Arc::new(RwLock::new(client.session_state()));
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);

        let task = tokio::spawn(dispatch(client, raw, state.clone(), events.clone()));

        Arc::new(Self {
            state,
            events,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        })
    }

    /// Last state observed from the client.
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Subscribe to transitions. Subscribe before reading [`state`](Self::state)
    /// so no transition falls between the two.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop re-dispatching. Subscribers see the channel close once the last
    /// handle to the monitor is dropped.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        debug!("Session monitor closed");
    }
}

impl Drop for SessionMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

async fn dispatch(
    client: Arc<dyn CoordinationClient>,
    mut raw: broadcast::Receiver<SessionState>,
    state: Arc<RwLock<SessionState>>,
    events: broadcast::Sender<SessionState>,
) {
    loop {
        let next = match raw.recv().await {
            Ok(next) => next,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Session monitor lagged, resyncing from client state");
                let current = client.session_state();
                if current == *state.read() {
                    continue;
                }
                current
            }
            Err(RecvError::Closed) => break,
        };

        let previous = std::mem::replace(&mut *state.write(), next);
        if !previous.can_transition_to(next) {
            warn!(from = %previous, to = %next, "Unexpected session transition");
        }
        info!(from = %previous, to = %next, "Session state changed");
        let _ = events.send(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_coordination::MemoryStore;
    use std::time::Duration;

    async fn next(rx: &mut broadcast::Receiver<SessionState>) -> SessionState {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_redispatches_in_order() {
        let store = MemoryStore::new();
        let client = store.connect_with_delay(Duration::from_millis(10));
        let monitor = SessionMonitor::new(client.clone());
        let mut rx = monitor.subscribe();
        assert_eq!(monitor.state(), SessionState::Connected);

        client.suspend();
        client.resume();
        client.expire_session();

        assert_eq!(next(&mut rx).await, SessionState::Suspended);
        assert_eq!(next(&mut rx).await, SessionState::Reconnected);
        assert_eq!(next(&mut rx).await, SessionState::Lost);
        assert_eq!(next(&mut rx).await, SessionState::Reconnected);
        assert_eq!(monitor.state(), SessionState::Reconnected);
    }

    #[tokio::test]
    async fn test_close_stops_dispatch() {
        let store = MemoryStore::new();
        let client = store.connect();
        let monitor = SessionMonitor::new(client.clone());
        let mut rx = monitor.subscribe();

        monitor.close();
        monitor.close();
        assert!(monitor.is_closed());

        client.suspend();
        let received = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(received.is_err());
        assert_eq!(monitor.state(), SessionState::Connected);
    }
}
