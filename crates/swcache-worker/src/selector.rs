//! Per-request strategy routing.

use swcache_common::SwCacheError;
use swcache_net::{Request, UrlPattern};
use tracing::trace;
use url::{Origin, Url};

use crate::config::WorkerConfig;
use crate::strategy::Strategy;

/// Maps a request to the strategy that serves it.
///
/// Rules are checked in order and the first match wins:
///
/// 1. non-network scheme: pass-through
/// 2. foreign origin: cache-first
/// 3. pass-through path pattern: pass-through
/// 4. revalidate path pattern: cache-first-with-refresh
/// 5. anything else: network-first
#[derive(Debug, Clone)]
pub struct StrategySelector {
    origin: Origin,
    root_path: String,
    passthrough: Vec<UrlPattern>,
    revalidate: Vec<UrlPattern>,
}

impl StrategySelector {
    /// Selector for `scope` with no path rules.
    pub fn new(scope: &Url) -> Self {
        Self {
            origin: scope.origin(),
            root_path: scope.path().to_string(),
            passthrough: Vec::new(),
            revalidate: Vec::new(),
        }
    }

    pub fn with_passthrough(mut self, pattern: UrlPattern) -> Self {
        self.passthrough.push(pattern);
        self
    }

    pub fn with_revalidate(mut self, pattern: UrlPattern) -> Self {
        self.revalidate.push(pattern);
        self
    }

    pub fn from_config(config: &WorkerConfig) -> Result<Self, SwCacheError> {
        let mut selector = Self::new(&config.scope_url()?);
        for pattern in &config.passthrough_patterns {
            selector = selector.with_passthrough(compile(pattern)?);
        }
        for pattern in &config.revalidate_patterns {
            selector = selector.with_revalidate(compile(pattern)?);
        }
        Ok(selector)
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn select(&self, request: &Request) -> Strategy {
        let url = &request.url;
        let strategy = if !request.is_network_scheme() {
            Strategy::PassThrough
        } else if url.origin() != self.origin {
            Strategy::CacheFirst
        } else if self.passthrough.iter().any(|p| p.matches_path(url)) {
            Strategy::PassThrough
        } else if self.revalidate.iter().any(|p| p.matches_path(url)) {
            Strategy::CacheFirstWithRefresh
        } else {
            Strategy::NetworkFirst
        };
        trace!(url = %url, strategy = strategy.name(), "Selected strategy");
        strategy
    }

    /// Strip the query and fragment from same-origin root document requests.
    pub fn canonicalize(&self, request: Request) -> Request {
        if !self.is_root_document(&request.url) {
            return request;
        }
        if request.url.query().is_none() && request.url.fragment().is_none() {
            return request;
        }
        let mut url = request.url.clone();
        url.set_query(None);
        url.set_fragment(None);
        trace!(from = %request.url, to = %url, "Canonicalized root request");
        request.with_url(url)
    }

    fn is_root_document(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
            && url.origin() == self.origin
            && (url.path() == "/" || url.path() == self.root_path)
    }
}

fn compile(pattern: &str) -> Result<UrlPattern, SwCacheError> {
    UrlPattern::regex(pattern)
        .map_err(|e| SwCacheError::config_with_source("invalid path pattern", e))
}
