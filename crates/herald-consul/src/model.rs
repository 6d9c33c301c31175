// Consul API request and response shapes

use serde::{Deserialize, Serialize};

/// Session behaviour that deletes held keys when the session is invalidated
pub const BEHAVIOR_DELETE: &str = "delete";

/// Body of `PUT /v1/session/create`
#[derive(Debug, Clone, Serialize)]
pub struct SessionCreateRequest {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "TTL")]
    pub ttl: String,

    #[serde(rename = "Behavior")]
    pub behavior: String,

    #[serde(rename = "LockDelay")]
    pub lock_delay: String,
}

impl SessionCreateRequest {
    /// Session whose held keys disappear with it, with no lock delay
    pub fn ephemeral(name: &str, ttl: String) -> Self {
        Self {
            name: name.to_string(),
            ttl,
            behavior: BEHAVIOR_DELETE.to_string(),
            lock_delay: "0s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionCreateResponse {
    #[serde(rename = "ID")]
    pub id: String,
}

/// One entry returned by `GET /v1/kv/<key>`
#[derive(Debug, Clone, Deserialize)]
pub struct KVPair {
    #[serde(rename = "Key")]
    pub key: String,

    #[serde(rename = "CreateIndex", default)]
    pub create_index: u64,

    #[serde(rename = "ModifyIndex", default)]
    pub modify_index: u64,

    #[serde(rename = "LockIndex", default)]
    pub lock_index: u64,

    #[serde(rename = "Flags", default)]
    pub flags: u64,

    /// Base64-encoded value, `null` for an empty key
    #[serde(rename = "Value", default)]
    pub value: Option<String>,

    #[serde(rename = "Session", default)]
    pub session: Option<String>,
}
