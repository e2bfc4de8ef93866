//! # swcache Worker
//!
//! Offline fetch-interception cache worker.
//!
//! ## Features
//!
//! - **Lifecycle**: install (precache manifest), activate (drop stale generations, claim clients)
//! - **Strategies**: cache-first, stale-while-revalidate, network-first, pass-through
//! - **Routing**: per-request strategy selection by scheme, origin and path
//! - **Background writes**: responses return before their cache copy is written
//! - **Usage telemetry**: `CACHE_SIZE_UPDATE` broadcast to connected clients
//!
//! ## Architecture
//!
//! ```text
//! Registration (scope)
//!     ├── installing (OfflineWorker)
//!     ├── waiting    (OfflineWorker)
//!     └── active     (OfflineWorker)
//!             ├── StrategySelector ── Request → Strategy
//!             ├── StrategyContext  ── Fetcher + CacheStore
//!             │       └── LifetimeExtender → BackgroundTasks
//!             └── UsageReporter    ── ClientRegistry
//!
//! CacheStore
//!     ├── static-<version>
//!     └── refreshed-<version>
//! ```

use swcache_common::SwCacheError;
use swcache_net::NetError;
use swcache_store::StoreError;
use thiserror::Error;

pub mod background;
pub mod clients;
pub mod config;
pub mod generation;
pub mod registration;
pub mod selector;
pub mod strategy;
pub mod usage;
pub mod worker;

pub use background::{BackgroundTasks, LifetimeExtender};
pub use clients::{CacheSize, Client, ClientId, ClientMessage, ClientRegistry};
pub use config::{StorageConfig, WorkerConfig};
pub use generation::{CacheRole, GenerationSet};
pub use registration::{Registration, RegistrationEvent};
pub use selector::StrategySelector;
pub use strategy::{ReadPolicy, Strategy, StrategyContext};
pub use usage::UsageReporter;
pub use worker::{
    ActivationReport, HandledFetch, InstallReport, OfflineWorker, WorkerId, WorkerState,
};

// ==================== Errors ====================

/// Errors surfaced by lifecycle operations.
///
/// Fetch handling never returns these; it degrades to `Response::error()`.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("State error: {0}")]
    State(String),

    #[error("Client not found: {0}")]
    ClientNotFound(ClientId),

    #[error("Client disconnected: {0}")]
    ClientGone(ClientId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Common(#[from] SwCacheError),
}

pub type WorkerResult<T> = Result<T, WorkerError>;
