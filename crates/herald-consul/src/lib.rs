//! Herald Consul - Consul HTTP backend for the coordination client
//!
//! Maps the coordination primitives onto Consul:
//! - ephemeral node: KV key acquired by a session created with `Behavior=delete`
//! - child watch: blocking query on the parent prefix (`?keys&separator=/&index=N`)
//! - session state: outcome of periodic `PUT /v1/session/renew/<id>`
//!
//! # Example
//!
//! ```ignore
//! use herald_consul::{ConsulClient, ConsulConfig};
//!
//! let client = ConsulClient::connect(ConsulConfig::new("http://127.0.0.1:8500")).await?;
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod model;
mod session;

pub use client::ConsulClient;
pub use config::ConsulConfig;
pub use error::ConsulError;
