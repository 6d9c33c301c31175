//! Herald Coordination - the coordination-service capability surface
//!
//! Registry and discovery only need five primitives from a coordination
//! service: create an ephemeral node, delete a node, list children while
//! arming a one-shot watch, read node data, and observe session state.
//! [`CoordinationClient`] captures exactly those. Backends:
//! - [`memory::MemoryStore`]: in-process store with real session, ephemeral and
//!   watch semantics, plus fault injection for tests
//! - `herald-consul`: Consul sessions and blocking queries

pub mod memory;
pub mod watch;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

pub use herald_common::CoordinationError;
pub use memory::{MemoryClient, MemoryStore};
pub use watch::{ChildWatch, WatchEvent, WatchTrigger};

pub type Result<T> = std::result::Result<T, CoordinationError>;

/// Capacity of per-client session event channels.
pub const SESSION_EVENT_CAPACITY: usize = 64;

/// Connection lifecycle of a coordination-client handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Initial state, operations complete normally
    Connected,
    /// Contact lost but the session has not expired yet
    Suspended,
    /// Session expired; its ephemeral nodes are gone
    Lost,
    /// Contact re-established (same session after SUSPENDED, new one after LOST)
    Reconnected,
}

impl SessionState {
    /// Whether operations are expected to succeed in this state.
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Reconnected)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connected, Suspended)
                | (Connected, Lost)
                | (Suspended, Reconnected)
                | (Suspended, Lost)
                | (Lost, Reconnected)
                | (Reconnected, Suspended)
                | (Reconnected, Lost)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Connected => "CONNECTED",
            SessionState::Suspended => "SUSPENDED",
            SessionState::Lost => "LOST",
            SessionState::Reconnected => "RECONNECTED",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client handle to a coordination service.
///
/// Session transitions are delivered in the order the client observes them.
/// Watches are one-shot and must be re-armed by calling
/// [`get_children_watched`](CoordinationClient::get_children_watched) again.
#[async_trait]
pub trait CoordinationClient: Send + Sync + 'static {
    /// Create an ephemeral node owned by this client's session, overwriting
    /// the data if this session already owns it.
    async fn create_ephemeral(&self, path: &str, data: Bytes) -> Result<()>;

    /// Delete a node. Deleting an absent node succeeds.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Delete a node only while this client's current session owns it.
    /// Returns whether a node was removed; an absent node or one held by
    /// another session is left alone.
    async fn delete_owned(&self, path: &str) -> Result<bool>;

    /// List the child names of `path` and atomically arm a watch that fires
    /// on the next create, delete or rewrite of any child.
    async fn get_children_watched(&self, path: &str) -> Result<(Vec<String>, ChildWatch)>;

    /// Read a node's data, `None` if it does not exist.
    async fn get_data(&self, path: &str) -> Result<Option<Bytes>>;

    /// Subscribe to session state transitions.
    fn session_events(&self) -> broadcast::Receiver<SessionState>;

    /// Current session state.
    fn session_state(&self) -> SessionState;

    /// Release the session; its ephemeral nodes are removed.
    async fn close(&self);
}
