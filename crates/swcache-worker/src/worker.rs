//! One versioned worker instance and its lifecycle.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use swcache_common::{retry_with_backoff, RetryConfig};
use swcache_net::{Fetcher, HttpFetcher, NetError, Request, Response};
use swcache_store::{CacheStore, DiskStore, MemoryStore};
use tracing::{debug, info, warn};
use url::{Origin, Url};

use crate::background::{BackgroundTasks, LifetimeExtender};
use crate::clients::{ClientId, ClientRegistry};
use crate::config::{StorageConfig, WorkerConfig};
use crate::generation::{CacheRole, GenerationSet};
use crate::selector::StrategySelector;
use crate::strategy::{Strategy, StrategyContext};
use crate::usage::UsageReporter;
use crate::{WorkerError, WorkerResult};

// ==================== Types ====================

/// Unique identifier for a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkerState {
    /// Constructed, install not started.
    #[default]
    Parsed,
    /// Precaching the manifest.
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Dropping stale generations and claiming clients.
    Activating,
    /// Active and handling fetches.
    Activated,
    /// Replaced, or install failed.
    Redundant,
}

/// Outcome of precaching the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Entries written into every generation.
    pub cached: usize,
    /// Entries that could not be fetched or stored.
    pub failed: Vec<Url>,
}

/// Outcome of activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    /// Stale generations removed.
    pub deleted: Vec<String>,
    /// Current generations left in place.
    pub kept: Vec<String>,
    /// Clients whose controller changed to this worker.
    pub claimed: Vec<ClientId>,
}

/// A response produced by the worker, plus a handle on its background writes.
#[derive(Debug)]
pub struct HandledFetch {
    pub response: Response,
    pub strategy: Strategy,
    extender: LifetimeExtender,
}

impl HandledFetch {
    /// Wait for the background work this fetch scheduled.
    pub async fn settled(&self) {
        self.extender.settled().await;
    }

    pub fn into_response(self) -> Response {
        self.response
    }
}

// ==================== Worker ====================

/// A single version of the offline cache worker.
pub struct OfflineWorker {
    id: WorkerId,
    state: RwLock<WorkerState>,
    generations: GenerationSet,
    selector: StrategySelector,
    context: StrategyContext,
    clients: Arc<ClientRegistry>,
    tasks: Arc<BackgroundTasks>,
    manifest: Vec<Url>,
    install_retry: RetryConfig,
    skip_waiting: bool,
}

impl OfflineWorker {
    pub fn new(
        config: &WorkerConfig,
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        clients: Arc<ClientRegistry>,
    ) -> WorkerResult<Self> {
        config.validate()?;
        let generations = GenerationSet::new(config.version.clone());
        let reporter = UsageReporter::new(store.clone(), clients.clone(), config.usage_timeout());

        Ok(Self {
            id: WorkerId::next(),
            state: RwLock::new(WorkerState::Parsed),
            selector: StrategySelector::from_config(config)?,
            context: StrategyContext::new(store, fetcher, generations.clone(), reporter),
            generations,
            clients,
            tasks: Arc::new(BackgroundTasks::new()),
            manifest: config.manifest_urls()?,
            install_retry: config.install_retry.clone(),
            skip_waiting: config.skip_waiting,
        })
    }

    /// Build the store and fetcher the config describes.
    pub async fn from_config(
        config: &WorkerConfig,
        clients: Arc<ClientRegistry>,
    ) -> WorkerResult<Self> {
        let store: Arc<dyn CacheStore> = match &config.storage {
            StorageConfig::Memory => Arc::new(MemoryStore::new()),
            StorageConfig::Disk { dir } => Arc::new(DiskStore::open_root(dir).await?),
        };
        let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(config.network.clone())?);
        Self::new(config, store, fetcher, clients)
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
        debug!(worker = %self.id, ?state, "State change");
    }

    /// Move from `from` to `to`, failing if the worker is anywhere else.
    fn transition(&self, from: WorkerState, to: WorkerState) -> WorkerResult<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return Err(WorkerError::State(format!(
                "{} cannot move to {to:?} from {:?}",
                self.id, *state
            )));
        }
        *state = to;
        debug!(worker = %self.id, state = ?to, "State change");
        Ok(())
    }

    pub fn version(&self) -> &str {
        self.generations.version()
    }

    pub fn generations(&self) -> &GenerationSet {
        &self.generations
    }

    pub fn origin(&self) -> &Origin {
        self.selector.origin()
    }

    pub fn selector(&self) -> &StrategySelector {
        &self.selector
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        self.context.store()
    }

    pub fn skips_waiting(&self) -> bool {
        self.skip_waiting
    }

    /// Background tasks not yet finished.
    pub fn pending_background(&self) -> usize {
        self.tasks.pending()
    }

    /// Precache the manifest into both generations.
    ///
    /// A failing entry is counted and skipped. Failing to open a generation
    /// makes the worker redundant.
    pub async fn install(&self) -> WorkerResult<InstallReport> {
        self.transition(WorkerState::Parsed, WorkerState::Installing)?;
        info!(
            worker = %self.id,
            version = self.version(),
            entries = self.manifest.len(),
            "Installing"
        );

        for role in CacheRole::ALL {
            let name = self.generations.name(role);
            if let Err(e) = self.store().open(&name).await {
                warn!(worker = %self.id, generation = %name, error = %e, "Cannot open generation");
                self.set_state(WorkerState::Redundant);
                return Err(e.into());
            }
        }

        let results = join_all(self.manifest.iter().map(|url| self.precache(url))).await;

        let mut report = InstallReport::default();
        for (url, stored) in self.manifest.iter().zip(results) {
            if stored {
                report.cached += 1;
            } else {
                report.failed.push(url.clone());
            }
        }

        if report.cached > 0 {
            self.context.reporter().broadcast().await;
        }

        self.transition(WorkerState::Installing, WorkerState::Installed)?;
        info!(
            worker = %self.id,
            cached = report.cached,
            failed = report.failed.len(),
            "Installed"
        );
        Ok(report)
    }

    async fn precache(&self, url: &Url) -> bool {
        let request = Request::get(url.clone());
        let fetcher: &dyn Fetcher = self.context.fetcher().as_ref();
        let req = &request;
        let attempt = move || fetch_ok(fetcher, req);
        let response = match retry_with_backoff(&self.install_retry, url.as_str(), attempt).await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %url, error = %e, "Manifest entry not cached");
                return false;
            }
        };

        let mut stored = true;
        for role in CacheRole::ALL {
            if let Err(e) = self.context.store_response(role, &request, &response).await {
                warn!(url = %url, role = %role, error = %e, "Manifest write failed");
                stored = false;
            }
        }
        stored
    }

    /// Drop generations from other versions and take control of every client.
    pub async fn activate(&self) -> WorkerResult<ActivationReport> {
        self.transition(WorkerState::Installed, WorkerState::Activating)?;
        info!(worker = %self.id, version = self.version(), "Activating");

        let names = match self.store().names().await {
            Ok(names) => names,
            Err(e) => {
                self.set_state(WorkerState::Redundant);
                return Err(e.into());
            }
        };

        let mut report = ActivationReport::default();
        for name in names {
            if self.generations.is_expected(&name) {
                report.kept.push(name);
                continue;
            }
            match self.store().delete(&name).await {
                Ok(_) => {
                    info!(generation = %name, "Deleted stale generation");
                    report.deleted.push(name);
                }
                Err(e) => {
                    warn!(generation = %name, error = %e, "Failed to delete stale generation")
                }
            }
        }

        report.claimed = self.clients.claim(self.id).await;

        self.transition(WorkerState::Activating, WorkerState::Activated)?;
        info!(
            worker = %self.id,
            deleted = report.deleted.len(),
            claimed = report.claimed.len(),
            "Activated"
        );
        self.context.reporter().broadcast().await;
        Ok(report)
    }

    /// Serve `request`. `None` means the platform should handle it.
    pub async fn handle_fetch(&self, request: Request) -> Option<HandledFetch> {
        if self.state() != WorkerState::Activated {
            return None;
        }

        let request = self.selector.canonicalize(request);
        let strategy = self.selector.select(&request);
        let extender = LifetimeExtender::new(self.tasks.clone());
        let response = self.context.respond(strategy, &request, &extender).await;

        Some(HandledFetch {
            response,
            strategy,
            extender,
        })
    }

    /// Mark the worker as superseded.
    pub fn retire(&self) {
        if self.state() != WorkerState::Redundant {
            self.set_state(WorkerState::Redundant);
            info!(worker = %self.id, "Retired");
        }
    }

    /// Wait for every background write this worker started.
    pub async fn shutdown(&self) {
        self.tasks.drain().await;
    }
}

impl fmt::Debug for OfflineWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineWorker")
            .field("id", &self.id)
            .field("version", &self.version())
            .field("state", &self.state())
            .finish()
    }
}

async fn fetch_ok(fetcher: &dyn Fetcher, request: &Request) -> Result<Response, NetError> {
    let response = fetcher.fetch(request).await?;
    if response.ok() {
        Ok(response)
    } else {
        Err(NetError::RequestFailed(format!(
            "{} answered {}",
            request.url, response.status
        )))
    }
}
