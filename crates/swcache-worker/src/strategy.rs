//! Request-handling strategies.
//!
//! Every strategy resolves to a [`Response`]. Faults below this layer
//! (unreachable network, rejected writes, store errors) degrade to a cache
//! fallback or to `Response::error()`; nothing propagates to the platform.

use std::fmt;
use std::sync::Arc;

use futures::future::{select_ok, BoxFuture, FutureExt};
use http::Method;
use swcache_net::{Fetcher, Request, Response};
use swcache_store::{CacheKey, CacheStore, CachedResponse, StoreResult};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::background::LifetimeExtender;
use crate::generation::{CacheRole, GenerationSet};
use crate::usage::UsageReporter;

/// How a strategy reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPolicy {
    CacheThenNetwork,
    RaceCacheAndNetwork,
    NetworkThenCache,
    NetworkOnly,
}

/// A request-handling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    CacheFirst,
    CacheFirstWithRefresh,
    NetworkFirst,
    PassThrough,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::CacheFirst => "cache-first",
            Strategy::CacheFirstWithRefresh => "cache-first-with-refresh",
            Strategy::NetworkFirst => "network-first",
            Strategy::PassThrough => "pass-through",
        }
    }

    pub fn read_policy(&self) -> ReadPolicy {
        match self {
            Strategy::CacheFirst => ReadPolicy::CacheThenNetwork,
            Strategy::CacheFirstWithRefresh => ReadPolicy::RaceCacheAndNetwork,
            Strategy::NetworkFirst => ReadPolicy::NetworkThenCache,
            Strategy::PassThrough => ReadPolicy::NetworkOnly,
        }
    }

    /// Generation this strategy writes into, if any.
    pub fn write_target(&self) -> Option<CacheRole> {
        match self {
            Strategy::CacheFirst => Some(CacheRole::Static),
            Strategy::CacheFirstWithRefresh | Strategy::NetworkFirst => Some(CacheRole::Refreshed),
            Strategy::PassThrough => None,
        }
    }

    /// All writes happen after the response is returned.
    pub fn writes_in_background(&self) -> bool {
        self.write_target().is_some()
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why one side of the refresh race produced nothing.
#[derive(Debug)]
enum RaceMiss {
    Cache,
    Network(String),
}

impl fmt::Display for RaceMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaceMiss::Cache => f.write_str("cache miss"),
            RaceMiss::Network(e) => write!(f, "network: {e}"),
        }
    }
}

/// Everything a strategy needs: network, store, generation names and the reporter.
#[derive(Clone)]
pub struct StrategyContext {
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    generations: GenerationSet,
    reporter: UsageReporter,
}

impl StrategyContext {
    pub fn new(
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        generations: GenerationSet,
        reporter: UsageReporter,
    ) -> Self {
        Self {
            store,
            fetcher,
            generations,
            reporter,
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    pub fn generations(&self) -> &GenerationSet {
        &self.generations
    }

    pub fn reporter(&self) -> &UsageReporter {
        &self.reporter
    }

    /// Produce a response for `request` using `strategy`.
    pub async fn respond(
        &self,
        strategy: Strategy,
        request: &Request,
        extender: &LifetimeExtender,
    ) -> Response {
        debug!(url = %request.url, strategy = strategy.name(), "Handling fetch");
        match strategy {
            Strategy::CacheFirst => self.cache_first(request, extender).await,
            Strategy::CacheFirstWithRefresh => {
                self.cache_first_with_refresh(request, extender).await
            }
            Strategy::NetworkFirst => self.network_first(request, extender).await,
            Strategy::PassThrough => self.pass_through(request).await,
        }
    }

    async fn cache_first(&self, request: &Request, extender: &LifetimeExtender) -> Response {
        let key = CacheKey::for_request(request);
        if let Some(hit) = self.lookup(CacheRole::Static, &key).await {
            debug!(url = %request.url, "Cache hit");
            return hit;
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.ok() {
                    self.schedule_put(extender, CacheRole::Static, request, &response);
                }
                response
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Network failed with nothing cached");
                Response::error()
            }
        }
    }

    async fn cache_first_with_refresh(
        &self,
        request: &Request,
        extender: &LifetimeExtender,
    ) -> Response {
        let key = CacheKey::for_request(request);

        // The fetch runs as extended work so its cache write survives losing the race.
        let (tx, rx) = oneshot::channel();
        let ctx = self.clone();
        let req = request.clone();
        extender.wait_until(async move {
            let result = ctx.fetcher.fetch(&req).await;
            let copy = match &result {
                Ok(response) if response.ok() => Some(response.clone()),
                _ => None,
            };
            let _ = tx.send(result);
            if let Some(response) = copy {
                ctx.put_in_cache(CacheRole::Refreshed, &req, response).await;
            }
        });

        let network: BoxFuture<'_, Result<Response, RaceMiss>> = async move {
            match rx.await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(e)) => Err(RaceMiss::Network(e.to_string())),
                Err(_) => Err(RaceMiss::Network("fetch task ended without a result".to_string())),
            }
        }
        .boxed();

        // Takes `key` by value: the race result outlives this frame's locals.
        let cache: BoxFuture<'_, Result<Response, RaceMiss>> = async move {
            self.lookup(CacheRole::Refreshed, &key)
                .await
                .ok_or(RaceMiss::Cache)
        }
        .boxed();

        match select_ok([network, cache]).await {
            Ok((response, _loser)) => response,
            Err(miss) => {
                warn!(url = %request.url, reason = %miss, "Refresh race produced no response");
                Response::error()
            }
        }
    }

    async fn network_first(&self, request: &Request, extender: &LifetimeExtender) -> Response {
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.ok() {
                    self.schedule_put(extender, CacheRole::Refreshed, request, &response);
                }
                response
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed, falling back to cache");
                let key = CacheKey::for_request(request);
                self.lookup(CacheRole::Refreshed, &key)
                    .await
                    .unwrap_or_else(Response::error)
            }
        }
    }

    async fn pass_through(&self, request: &Request) -> Response {
        match self.fetcher.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %request.url, error = %e, "Pass-through fetch failed");
                Response::error()
            }
        }
    }

    /// Look in `role`'s generation, then the other current generation.
    pub async fn lookup(&self, role: CacheRole, key: &CacheKey) -> Option<Response> {
        for role in [role, role.other()] {
            let name = self.generations.name(role);
            let found = async {
                let generation = self.store.open(&name).await?;
                generation.lookup(key).await
            };
            match found.await {
                Ok(Some(entry)) => return Some(entry.to_response()),
                Ok(None) => {}
                Err(e) => warn!(generation = %name, key = %key, error = %e, "Cache lookup failed"),
            }
        }
        None
    }

    fn schedule_put(
        &self,
        extender: &LifetimeExtender,
        role: CacheRole,
        request: &Request,
        response: &Response,
    ) {
        if request.method != Method::GET {
            debug!(url = %request.url, method = %request.method, "Not caching non-GET response");
            return;
        }
        let ctx = self.clone();
        let req = request.clone();
        let copy = response.clone();
        extender.wait_until(async move {
            ctx.put_in_cache(role, &req, copy).await;
        });
    }

    /// Write without telemetry. Only GET responses are storable.
    pub async fn store_response(
        &self,
        role: CacheRole,
        request: &Request,
        response: &Response,
    ) -> StoreResult<bool> {
        if request.method != Method::GET {
            return Ok(false);
        }
        let generation = self.store.open(&self.generations.name(role)).await?;
        generation
            .put(
                CacheKey::for_request(request),
                CachedResponse::from_response(response),
            )
            .await?;
        Ok(true)
    }

    /// Write a copy of `response` and broadcast usage. Failures are logged and dropped.
    pub async fn put_in_cache(
        &self,
        role: CacheRole,
        request: &Request,
        response: Response,
    ) -> bool {
        match self.store_response(role, request, &response).await {
            Ok(true) => {
                debug!(
                    url = %request.url,
                    generation = %self.generations.name(role),
                    "Cached response"
                );
                self.reporter.broadcast().await;
                true
            }
            Ok(false) => {
                debug!(
                    url = %request.url,
                    method = %request.method,
                    "Not caching non-GET response"
                );
                false
            }
            Err(e) => {
                warn!(url = %request.url, role = %role, error = %e, "Cache write failed");
                false
            }
        }
    }
}
