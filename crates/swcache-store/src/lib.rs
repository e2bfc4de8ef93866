//! # swcache Store
//!
//! Request/response storage partitioned into named generations.
//!
//! ## Architecture
//!
//! ```text
//! CacheStore (process-wide)
//!     ├── "static-v2"    (Generation)
//!     │       └── CacheKey → CachedResponse
//!     └── "refreshed-v2" (Generation)
//!             └── CacheKey → CachedResponse
//! ```
//!
//! A generation is the unit of invalidation: entries never expire on their
//! own, a whole generation is deleted when a new version activates. Writes are
//! upserts and the last writer for a key wins.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use swcache_net::{Request, Response, ResponseSource};
use thiserror::Error;
use tracing::warn;
use url::Url;

pub mod disk;
pub mod memory;

pub use disk::{DiskGeneration, DiskStore};
pub use memory::{MemoryGeneration, MemoryStore};

// ==================== Errors ====================

/// Errors raised by a cache store backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid generation name: {0:?}")]
    InvalidName(String),

    #[error("Generation deleted: {0}")]
    GenerationDeleted(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Reject names that cannot be used as a generation.
pub(crate) fn validate_name(name: &str) -> StoreResult<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

// ==================== Keys ====================

/// Cache key: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    method: String,
    url: String,
}

impl CacheKey {
    pub fn new(method: &http::Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_string(),
            url: url.into(),
        }
    }

    pub fn for_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stable hex digest, used for on-disk file names.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.method.as_bytes());
        hasher.update(b" ");
        hasher.update(self.url.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

// ==================== Entries ====================

/// A captured response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub url: Option<String>,
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_base64")]
    pub body: Bytes,
    /// Milliseconds since the Unix epoch. Informational only.
    pub cached_at: u64,
}

impl CachedResponse {
    /// Capture a copy of `response`.
    pub fn from_response(response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        Self {
            url: response.url.as_ref().map(|u| u.to_string()),
            status: response.status,
            status_text: response.status_text.clone(),
            headers,
            body: response.body.clone(),
            cached_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    /// Rebuild a response marked as served from cache.
    pub fn to_response(&self) -> Response {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(n), Ok(v)) => {
                    headers.append(n, v);
                }
                _ => warn!(header = %name, "Dropping unrepresentable cached header"),
            }
        }

        Response {
            url: self.url.as_deref().and_then(|u| Url::parse(u).ok()),
            status: self.status,
            status_text: self.status_text.clone(),
            headers,
            body: self.body.clone(),
            source: ResponseSource::Cache,
        }
    }

    /// Approximate bytes this entry occupies.
    pub fn size(&self) -> u64 {
        let headers: usize = self.headers.iter().map(|(n, v)| n.len() + v.len()).sum();
        (self.body.len() + headers + self.url.as_ref().map_or(0, |u| u.len())) as u64
    }
}

mod body_base64 {
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

// ==================== Traits ====================

/// One named partition of the store.
#[async_trait]
pub trait Generation: Send + Sync {
    fn name(&self) -> &str;

    /// Pure read.
    async fn lookup(&self, key: &CacheKey) -> StoreResult<Option<CachedResponse>>;

    /// Upsert; replaces any prior value for `key`.
    async fn put(&self, key: CacheKey, value: CachedResponse) -> StoreResult<()>;

    async fn delete(&self, key: &CacheKey) -> StoreResult<bool>;

    async fn keys(&self) -> StoreResult<Vec<CacheKey>>;
}

/// The process-wide set of generations.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Open a generation, creating it if absent.
    async fn open(&self, name: &str) -> StoreResult<Arc<dyn Generation>>;

    async fn has(&self, name: &str) -> StoreResult<bool>;

    /// All generation names, sorted.
    async fn names(&self) -> StoreResult<Vec<String>>;

    /// Delete a whole generation. Returns whether it existed.
    async fn delete(&self, name: &str) -> StoreResult<bool>;

    /// Aggregate bytes used by every generation.
    async fn usage(&self) -> StoreResult<u64>;
}
