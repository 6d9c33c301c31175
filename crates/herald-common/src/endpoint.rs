//! Service endpoint value type and its coordination-store entry codec

use std::fmt;
use std::hash::{Hash, Hasher};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{HeraldError, Result};

/// One network-addressable instance of a named service.
///
/// Identity is `(service_name, id)`: two endpoints with the same identity are
/// equal and hash alike regardless of payload. Use [`Endpoint::same_payload`]
/// to compare contents.
#[derive(Clone)]
pub struct Endpoint {
    service_name: String,
    id: String,
    payload: Option<Bytes>,
}

/// Identity key of an endpoint, used to key registered-sets and caches.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    pub service_name: String,
    pub id: String,
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_name, self.id)
    }
}

/// JSON shape stored in each ephemeral node.
#[derive(Serialize, Deserialize)]
struct EndpointRecord {
    service: String,
    id: String,
    #[serde(default)]
    payload: Option<String>,
}

impl Endpoint {
    /// Create an endpoint without payload.
    pub fn new(service_name: impl Into<String>, id: impl Into<String>) -> Result<Self> {
        Self::build(service_name.into(), id.into(), None)
    }

    /// Create an endpoint carrying an opaque payload.
    pub fn with_payload(
        service_name: impl Into<String>,
        id: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<Self> {
        Self::build(service_name.into(), id.into(), Some(payload.into()))
    }

    fn build(service_name: String, id: String, payload: Option<Bytes>) -> Result<Self> {
        if service_name.trim().is_empty() {
            return Err(HeraldError::InvalidEndpoint(
                "service name must not be empty".to_string(),
            ));
        }
        if id.trim().is_empty() {
            return Err(HeraldError::InvalidEndpoint(
                "endpoint id must not be empty".to_string(),
            ));
        }
        Ok(Self {
            service_name,
            id,
            payload,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            service_name: self.service_name.clone(),
            id: self.id.clone(),
        }
    }

    /// Whether both endpoints carry byte-identical payloads.
    pub fn same_payload(&self, other: &Endpoint) -> bool {
        self.payload == other.payload
    }

    /// Serialize into the coordination-store entry format.
    pub fn encode(&self) -> Result<Bytes> {
        let record = EndpointRecord {
            service: self.service_name.clone(),
            id: self.id.clone(),
            payload: self.payload.as_ref().map(|p| STANDARD.encode(p)),
        };
        serde_json::to_vec(&record)
            .map(Bytes::from)
            .map_err(|e| HeraldError::InvalidEndpoint(format!("cannot encode endpoint: {}", e)))
    }

    /// Parse an entry read back from the coordination store.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let record: EndpointRecord = serde_json::from_slice(data)
            .map_err(|e| HeraldError::InvalidEndpoint(format!("malformed entry: {}", e)))?;
        let payload = match record.payload {
            Some(encoded) => Some(Bytes::from(STANDARD.decode(encoded).map_err(|e| {
                HeraldError::InvalidEndpoint(format!("payload is not valid base64: {}", e))
            })?)),
            None => None,
        };
        Self::build(record.service, record.id, payload)
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.service_name == other.service_name && self.id == other.id
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.service_name.hash(state);
        self.id.hash(state);
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("service_name", &self.service_name)
            .field("id", &self.id)
            .field("payload_len", &self.payload.as_ref().map(|p| p.len()))
            .finish()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_name, self.id)
    }
}
