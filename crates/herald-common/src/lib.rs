//! Herald Common - shared types, errors, and configuration
//!
//! This crate provides the foundational types used across all Herald components:
//! - Error taxonomy for registry, discovery and coordination backends
//! - The `Endpoint` value type and its stored entry format
//! - Node path layout
//! - Configuration loading and retry policy
//! - Logging initialisation

pub mod config;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod paths;

pub use config::{Backend, CoordinationConfig, HeraldConfig, RetryConfig};
pub use endpoint::{Endpoint, EndpointKey};
pub use error::{CoordinationError, HeraldError, Result};
pub use paths::ServicePaths;
