//! Fixtures shared by the worker integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use swcache_common::RetryConfig;
use swcache_net::{Fetcher, NetError, Request, Response};
use swcache_store::{CacheKey, CacheStore, CachedResponse, Generation, MemoryStore, StoreResult};
use swcache_worker::{ClientRegistry, OfflineWorker, StorageConfig, WorkerConfig};

pub const SCOPE: &str = "https://dicey.test/";

#[derive(Debug, Clone)]
struct Route {
    status: u16,
    body: Bytes,
    delay: Duration,
}

/// Fetcher that answers from a fixed table and records every call.
#[derive(Default)]
pub struct ScriptedFetcher {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<Vec<String>>,
    offline: AtomicBool,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, url: &str, status: u16, body: &str) {
        self.route_slow(url, status, body, Duration::ZERO);
    }

    pub fn route_slow(&self, url: &str, status: u16, body: &str, delay: Duration) {
        self.routes.lock().unwrap().insert(
            url.to_string(),
            Route {
                status,
                body: Bytes::from(body.to_string()),
                delay,
            },
        );
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == url).count()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let url = request.url.to_string();
        self.calls.lock().unwrap().push(url.clone());

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::RequestFailed(format!("{url}: network unreachable")));
        }

        let route = self.routes.lock().unwrap().get(&url).cloned();
        let Some(route) = route else {
            return Ok(Response::new(
                request.url.clone(),
                StatusCode::NOT_FOUND,
                HeaderMap::new(),
                Bytes::new(),
            ));
        };

        if !route.delay.is_zero() {
            tokio::time::sleep(route.delay).await;
        }

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        Ok(Response::new(
            request.url.clone(),
            StatusCode::from_u16(route.status).unwrap(),
            headers,
            route.body,
        ))
    }
}

/// Memory store whose generation lookups take `delay`.
pub struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            delay,
        })
    }
}

struct SlowGeneration {
    inner: Arc<dyn Generation>,
    delay: Duration,
}

#[async_trait]
impl Generation for SlowGeneration {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn lookup(&self, key: &CacheKey) -> StoreResult<Option<CachedResponse>> {
        tokio::time::sleep(self.delay).await;
        self.inner.lookup(key).await
    }

    async fn put(&self, key: CacheKey, response: CachedResponse) -> StoreResult<()> {
        self.inner.put(key, response).await
    }

    async fn delete(&self, key: &CacheKey) -> StoreResult<bool> {
        self.inner.delete(key).await
    }

    async fn keys(&self) -> StoreResult<Vec<CacheKey>> {
        self.inner.keys().await
    }
}

#[async_trait]
impl CacheStore for SlowStore {
    async fn open(&self, name: &str) -> StoreResult<Arc<dyn Generation>> {
        Ok(Arc::new(SlowGeneration {
            inner: self.inner.open(name).await?,
            delay: self.delay,
        }))
    }

    async fn has(&self, name: &str) -> StoreResult<bool> {
        self.inner.has(name).await
    }

    async fn names(&self) -> StoreResult<Vec<String>> {
        self.inner.names().await
    }

    async fn delete(&self, name: &str) -> StoreResult<bool> {
        self.inner.delete(name).await
    }

    async fn usage(&self) -> StoreResult<u64> {
        self.inner.usage().await
    }
}

pub fn url(path: &str) -> String {
    format!("https://dicey.test{path}")
}

pub fn get(url: &str) -> Request {
    Request::parse_get(url).unwrap()
}

pub fn config(version: &str, manifest: &[&str]) -> WorkerConfig {
    WorkerConfig {
        scope: SCOPE.to_string(),
        version: version.to_string(),
        manifest: manifest.iter().map(|m| m.to_string()).collect(),
        storage: StorageConfig::Memory,
        install_retry: RetryConfig::none(),
        ..Default::default()
    }
}

/// A worker that has been installed and activated.
pub async fn activated(
    config: &WorkerConfig,
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    clients: Arc<ClientRegistry>,
) -> OfflineWorker {
    let worker = OfflineWorker::new(config, store, fetcher, clients).unwrap();
    worker.install().await.unwrap();
    worker.activate().await.unwrap();
    worker
}

/// Body of the entry stored under GET `url` in `generation`, if any.
pub async fn stored_body(store: &dyn CacheStore, generation: &str, url: &str) -> Option<String> {
    let key = CacheKey::for_request(&get(url));
    let entry = store.open(generation).await.unwrap().lookup(&key).await.unwrap()?;
    Some(String::from_utf8(entry.body.to_vec()).unwrap())
}
