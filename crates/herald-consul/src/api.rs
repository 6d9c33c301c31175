//! Thin wrapper over the Consul session and KV endpoints

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use tracing::debug;
use url::Url;

use crate::config::ConsulConfig;
use crate::error::{ConsulError, Result};
use crate::model::{KVPair, SessionCreateRequest, SessionCreateResponse};

pub const TOKEN_HEADER: &str = "X-Consul-Token";
pub const INDEX_HEADER: &str = "X-Consul-Index";

/// Result of a key listing: child keys plus the index to block on next
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyListing {
    pub keys: Vec<String>,
    pub index: u64,
}

pub struct ConsulApi {
    http: Client,
    base: Url,
    token: Option<String>,
    request_timeout: Duration,
    wait_time: Duration,
}

impl ConsulApi {
    pub fn new(config: &ConsulConfig) -> Result<Self> {
        let base = Url::parse(&config.address)
            .map_err(|_| ConsulError::InvalidAddress(config.address.clone()))?;
        if base.cannot_be_a_base() {
            return Err(ConsulError::InvalidAddress(config.address.clone()));
        }

        let http = Client::builder()
            .connect_timeout(config.request_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            base,
            token: config.token.clone(),
            request_timeout: config.request_timeout,
            wait_time: config.wait_time,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ConsulError::InvalidAddress(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// `key` is split on `/`; every piece is percent-encoded as one segment.
    fn kv_url(&self, key: &str) -> Result<Url> {
        let mut segments = vec!["v1", "kv"];
        segments.extend(key.split('/'));
        self.url(&segments)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.header(TOKEN_HEADER, token),
            None => builder,
        }
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ConsulError::RequestFailed {
            status: status.as_u16(),
            body,
        })
    }

    /// Create a session; returns its id.
    pub async fn create_session(&self, name: &str, ttl: String) -> Result<String> {
        let url = self.url(&["v1", "session", "create"])?;
        let body = SessionCreateRequest::ephemeral(name, ttl);
        let response = self.request(Method::PUT, url).json(&body).send().await?;
        let created: SessionCreateResponse = Self::check(response).await?.json().await?;
        debug!(session = %created.id, "Created Consul session");
        Ok(created.id)
    }

    /// Renew a session. `Ok(false)` means the server no longer knows it.
    pub async fn renew_session(&self, id: &str) -> Result<bool> {
        let url = self.url(&["v1", "session", "renew", id])?;
        let response = self.request(Method::PUT, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(response).await?;
        Ok(true)
    }

    /// Destroy a session; keys it holds are deleted by the server.
    pub async fn destroy_session(&self, id: &str) -> Result<()> {
        let url = self.url(&["v1", "session", "destroy", id])?;
        let response = self.request(Method::PUT, url).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Write `data` at `key` while acquiring it for `session`.
    /// `Ok(false)` means another session holds the key.
    pub async fn acquire(&self, key: &str, session: &str, data: Bytes) -> Result<bool> {
        let url = self.kv_url(key)?;
        let response = self
            .request(Method::PUT, url)
            .query(&[("acquire", session)])
            .body(data)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let url = self.kv_url(key)?;
        let response = self.request(Method::DELETE, url).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Delete `key` only if it is unchanged since `modify_index`.
    /// `Ok(false)` means the key was modified in between.
    pub async fn delete_cas(&self, key: &str, modify_index: u64) -> Result<bool> {
        let url = self.kv_url(key)?;
        let response = self
            .request(Method::DELETE, url)
            .query(&[("cas", modify_index)])
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// List keys directly below `prefix` (which must end in `/`).
    ///
    /// With `index` set this is a blocking query that returns once the
    /// prefix's index moves past it or the wait time elapses.
    pub async fn keys(&self, prefix: &str, index: Option<u64>) -> Result<KeyListing> {
        let url = self.kv_url(prefix)?;
        let mut builder = self
            .request(Method::GET, url)
            .query(&[("keys", ""), ("separator", "/")]);
        if let Some(index) = index {
            let wait = format!("{}ms", self.wait_time.as_millis());
            builder = builder
                .query(&[("index", index.to_string()), ("wait", wait)])
                .timeout(self.wait_time + self.request_timeout);
        }

        let response = builder.send().await?;
        let index = consul_index(&response);
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(KeyListing {
                keys: Vec::new(),
                index,
            });
        }
        let keys: Vec<String> = Self::check(response).await?.json().await?;
        Ok(KeyListing { keys, index })
    }

    /// Read the entry at `key` with its metadata.
    pub async fn get_pair(&self, key: &str) -> Result<Option<KVPair>> {
        let url = self.kv_url(key)?;
        let response = self.request(Method::GET, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let pairs: Vec<KVPair> = Self::check(response).await?.json().await?;
        Ok(pairs.into_iter().find(|p| p.key == key))
    }

    /// Read the raw value at `key`.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let Some(pair) = self.get_pair(key).await? else {
            return Ok(None);
        };
        match pair.value {
            Some(value) => Ok(Some(Bytes::from(STANDARD.decode(value)?))),
            None => Ok(Some(Bytes::new())),
        }
    }
}

fn consul_index(response: &Response) -> u64 {
    response
        .headers()
        .get(INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
