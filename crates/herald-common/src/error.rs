//! Error types for Herald
//!
//! This module defines:
//! - `HeraldError`: errors surfaced to registry and discovery callers
//! - `CoordinationError`: failures reported by a coordination-service backend

/// Failures reported by a coordination-service client.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    /// The client has no live connection (transient, session may still be alive)
    #[error("connection to coordination service lost")]
    ConnectionLoss,

    /// The session backing ephemeral nodes has expired
    #[error("coordination session expired")]
    SessionExpired,

    /// The ephemeral node is held by a different session
    #[error("node '{0}' is owned by another session")]
    NodeOwned(String),

    /// The client handle has been closed
    #[error("coordination client closed")]
    Closed,

    /// Transport-level failure (HTTP, socket)
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend answered with something we cannot use
    #[error("backend error: {0}")]
    Backend(String),
}

impl CoordinationError {
    /// Whether the failure is caused by connectivity rather than by the request itself.
    pub fn is_connection_issue(&self) -> bool {
        matches!(
            self,
            CoordinationError::ConnectionLoss
                | CoordinationError::SessionExpired
                | CoordinationError::Transport(_)
        )
    }
}

/// Errors surfaced by Herald's registry and discovery APIs.
#[derive(thiserror::Error, Debug)]
pub enum HeraldError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to register '{endpoint}': {source}")]
    Registration {
        endpoint: String,
        #[source]
        source: CoordinationError,
    },

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

impl From<config::ConfigError> for HeraldError {
    fn from(e: config::ConfigError) -> Self {
        HeraldError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HeraldError>;
