//! Storage usage telemetry.

use std::sync::Arc;
use std::time::Duration;

use swcache_common::with_timeout;
use swcache_store::CacheStore;
use tracing::{debug, warn};

use crate::clients::{CacheSize, ClientMessage, ClientRegistry};

/// Queries store usage and broadcasts it to every connected client.
#[derive(Clone)]
pub struct UsageReporter {
    store: Arc<dyn CacheStore>,
    clients: Arc<ClientRegistry>,
    timeout: Duration,
}

impl UsageReporter {
    pub fn new(
        store: Arc<dyn CacheStore>,
        clients: Arc<ClientRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            clients,
            timeout,
        }
    }

    /// Best-effort usage query; never fails.
    pub async fn estimate(&self) -> CacheSize {
        match with_timeout(self.timeout, || self.store.usage()).await {
            Ok(Ok(bytes)) => CacheSize::Bytes(bytes),
            Ok(Err(e)) => {
                warn!(error = %e, "Storage usage unavailable");
                CacheSize::Unknown
            }
            Err(e) => {
                warn!(error = %e, "Storage usage query timed out");
                CacheSize::Unknown
            }
        }
    }

    /// Broadcast the current usage. Returns how many clients accepted it.
    pub async fn broadcast(&self) -> usize {
        let size = self.estimate().await;
        let delivered = self
            .clients
            .broadcast(ClientMessage::CacheSizeUpdate { size })
            .await;
        debug!(?size, delivered, "Broadcast cache size");
        delivered
    }
}
