// Error types for the Consul backend

use herald_coordination::CoordinationError;

/// Errors raised while talking to the Consul HTTP API
#[derive(Debug, thiserror::Error)]
pub enum ConsulError {
    #[error("Invalid Consul address '{0}'")]
    InvalidAddress(String),

    #[error("Request failed with status {status}: {body}")]
    RequestFailed { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid value encoding: {0}")]
    Encoding(#[from] base64::DecodeError),
}

impl From<ConsulError> for CoordinationError {
    fn from(e: ConsulError) -> Self {
        match &e {
            ConsulError::Http(err) => CoordinationError::Transport(err.to_string()),
            ConsulError::RequestFailed { status, .. } if *status >= 500 => {
                CoordinationError::Transport(e.to_string())
            }
            _ => CoordinationError::Backend(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConsulError>;
