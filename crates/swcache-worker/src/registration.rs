//! Per-scope registration: which worker installs, waits and controls.

use std::sync::Arc;

use swcache_net::Request;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use url::Url;

use crate::clients::{ClientId, ClientRegistry};
use crate::worker::{ActivationReport, HandledFetch, OfflineWorker, WorkerId, WorkerState};
use crate::{WorkerError, WorkerResult};

/// Registration events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    /// A new worker started installing.
    UpdateFound { scope: String, worker: WorkerId },
    /// A worker changed state.
    StateChange {
        scope: String,
        worker: WorkerId,
        state: WorkerState,
    },
    /// A client is now controlled by a different worker.
    ControllerChange { client: ClientId, worker: WorkerId },
}

#[derive(Default)]
struct Slots {
    installing: Option<Arc<OfflineWorker>>,
    waiting: Option<Arc<OfflineWorker>>,
    active: Option<Arc<OfflineWorker>>,
}

/// Worker slots for one scope.
///
/// Fetches run under the read lock and activation under the write lock, so
/// stale generations are never deleted underneath an in-flight request.
pub struct Registration {
    scope: Url,
    clients: Arc<ClientRegistry>,
    slots: RwLock<Slots>,
    event_tx: mpsc::UnboundedSender<RegistrationEvent>,
}

impl Registration {
    pub fn new(
        scope: Url,
        clients: Arc<ClientRegistry>,
    ) -> (Self, mpsc::UnboundedReceiver<RegistrationEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                scope,
                clients,
                slots: RwLock::new(Slots::default()),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    fn emit(&self, event: RegistrationEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, worker: &OfflineWorker) {
        self.emit(RegistrationEvent::StateChange {
            scope: self.scope.to_string(),
            worker: worker.id(),
            state: worker.state(),
        });
    }

    /// Install `worker`, park it as waiting and activate it if it skips waiting.
    ///
    /// The current active worker keeps serving fetches while the new one installs.
    pub async fn register(&self, worker: OfflineWorker) -> WorkerResult<Arc<OfflineWorker>> {
        if worker.origin() != &self.scope.origin() {
            return Err(WorkerError::State(format!(
                "{} does not belong to scope {}",
                worker.id(),
                self.scope
            )));
        }

        let worker = Arc::new(worker);
        self.emit(RegistrationEvent::UpdateFound {
            scope: self.scope.to_string(),
            worker: worker.id(),
        });
        let previous = self.slots.write().await.installing.replace(worker.clone());
        if let Some(previous) = previous {
            previous.retire();
            self.emit_state(&previous);
        }

        self.emit(RegistrationEvent::StateChange {
            scope: self.scope.to_string(),
            worker: worker.id(),
            state: WorkerState::Installing,
        });
        let result = worker.install().await;
        self.emit_state(&worker);

        {
            let mut slots = self.slots.write().await;
            if slots
                .installing
                .as_ref()
                .is_some_and(|w| Arc::ptr_eq(w, &worker))
            {
                slots.installing = None;
            }
            if let Err(e) = result {
                warn!(scope = %self.scope, worker = %worker.id(), error = %e, "Install failed");
                worker.retire();
                return Err(e);
            }
            if worker.state() != WorkerState::Installed {
                return Err(WorkerError::State(format!(
                    "{} was superseded while installing",
                    worker.id()
                )));
            }
            if let Some(replaced) = slots.waiting.replace(worker.clone()) {
                replaced.retire();
                self.emit_state(&replaced);
            }
        }

        if worker.skips_waiting() {
            self.activate_waiting().await?;
        }
        Ok(worker)
    }

    /// Promote the waiting worker to active, superseding the current one.
    ///
    /// Returns `None` when nothing is waiting.
    pub async fn activate_waiting(&self) -> WorkerResult<Option<ActivationReport>> {
        let mut slots = self.slots.write().await;
        let Some(worker) = slots.waiting.take() else {
            return Ok(None);
        };

        let previous = slots.active.take();
        if let Some(previous) = &previous {
            previous.shutdown().await;
        }

        let report = match worker.activate().await {
            Ok(report) => report,
            Err(e) => {
                warn!(scope = %self.scope, worker = %worker.id(), error = %e, "Activation failed");
                self.emit_state(&worker);
                slots.active = previous;
                return Err(e);
            }
        };

        if let Some(previous) = previous {
            previous.retire();
            self.emit_state(&previous);
        }
        self.emit_state(&worker);
        for client in &report.claimed {
            self.emit(RegistrationEvent::ControllerChange {
                client: *client,
                worker: worker.id(),
            });
        }
        info!(
            scope = %self.scope,
            worker = %worker.id(),
            version = worker.version(),
            "Now controlling scope"
        );

        slots.active = Some(worker);
        Ok(Some(report))
    }

    /// Route a fetch to the active worker.
    pub async fn handle_fetch(&self, request: Request) -> Option<HandledFetch> {
        let slots = self.slots.read().await;
        let active = slots.active.as_ref()?;
        active.handle_fetch(request).await
    }

    pub async fn active(&self) -> Option<Arc<OfflineWorker>> {
        self.slots.read().await.active.clone()
    }

    pub async fn waiting(&self) -> Option<Arc<OfflineWorker>> {
        self.slots.read().await.waiting.clone()
    }

    pub async fn installing(&self) -> Option<Arc<OfflineWorker>> {
        self.slots.read().await.installing.clone()
    }

    /// Retire every worker. Returns whether anything was registered.
    ///
    /// Cached generations are left in place.
    pub async fn unregister(&self) -> bool {
        let mut slots = self.slots.write().await;
        let workers: Vec<Arc<OfflineWorker>> = [
            slots.installing.take(),
            slots.waiting.take(),
            slots.active.take(),
        ]
        .into_iter()
        .flatten()
        .collect();

        for worker in &workers {
            worker.shutdown().await;
            worker.retire();
            self.emit_state(worker);
        }
        if !workers.is_empty() {
            info!(scope = %self.scope, "Unregistered");
        }
        !workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StorageConfig, WorkerConfig};
    use async_trait::async_trait;
    use http::{HeaderMap, StatusCode};
    use swcache_common::RetryConfig;
    use swcache_net::{Fetcher, NetError, Response};
    use swcache_store::MemoryStore;

    struct Echo;

    #[async_trait]
    impl Fetcher for Echo {
        async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
            Ok(Response::new(
                request.url.clone(),
                StatusCode::OK,
                HeaderMap::new(),
                Default::default(),
            ))
        }
    }

    fn config(version: &str, skip_waiting: bool) -> WorkerConfig {
        WorkerConfig {
            scope: "https://dicey.test/".into(),
            version: version.into(),
            manifest: vec!["/".into()],
            storage: StorageConfig::Memory,
            install_retry: RetryConfig::none(),
            skip_waiting,
            ..Default::default()
        }
    }

    fn worker(clients: &Arc<ClientRegistry>, version: &str, skip_waiting: bool) -> OfflineWorker {
        OfflineWorker::new(
            &config(version, skip_waiting),
            Arc::new(MemoryStore::new()),
            Arc::new(Echo),
            clients.clone(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_no_active_worker_means_default_handling() {
        let clients = Arc::new(ClientRegistry::new());
        let (registration, _events) =
            Registration::new(Url::parse("https://dicey.test/").unwrap(), clients);
        let request = Request::parse_get("https://dicey.test/").unwrap();
        assert!(registration.handle_fetch(request).await.is_none());
        assert!(!registration.unregister().await);
    }

    #[tokio::test]
    async fn test_register_without_skip_waiting_parks_worker() {
        let clients = Arc::new(ClientRegistry::new());
        let (registration, _events) =
            Registration::new(Url::parse("https://dicey.test/").unwrap(), clients.clone());

        let worker = registration.register(worker(&clients, "v1", false)).await.unwrap();
        assert_eq!(worker.state(), WorkerState::Installed);
        assert!(registration.active().await.is_none());
        assert!(registration.waiting().await.is_some());

        let report = registration.activate_waiting().await.unwrap().unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(registration.active().await.unwrap().id(), worker.id());
        assert!(registration.activate_waiting().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_events_follow_lifecycle() {
        let clients = Arc::new(ClientRegistry::new());
        let (client, _rx) = clients.connect(Url::parse("https://dicey.test/").unwrap()).await;
        let (registration, mut events) =
            Registration::new(Url::parse("https://dicey.test/").unwrap(), clients.clone());

        let worker = registration.register(worker(&clients, "v1", true)).await.unwrap();
        let id = worker.id();
        let scope = "https://dicey.test/".to_string();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                RegistrationEvent::UpdateFound {
                    scope: scope.clone(),
                    worker: id
                },
                RegistrationEvent::StateChange {
                    scope: scope.clone(),
                    worker: id,
                    state: WorkerState::Installing
                },
                RegistrationEvent::StateChange {
                    scope: scope.clone(),
                    worker: id,
                    state: WorkerState::Installed
                },
                RegistrationEvent::StateChange {
                    scope,
                    worker: id,
                    state: WorkerState::Activated
                },
                RegistrationEvent::ControllerChange { client, worker: id },
            ]
        );
    }

    #[tokio::test]
    async fn test_foreign_worker_rejected() {
        let clients = Arc::new(ClientRegistry::new());
        let (registration, _events) =
            Registration::new(Url::parse("https://other.test/").unwrap(), clients.clone());
        let result = registration.register(worker(&clients, "v1", true)).await;
        assert!(matches!(result, Err(WorkerError::State(_))));
    }
}
