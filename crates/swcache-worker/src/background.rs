//! Lifetime extension for work that outlives a response.
//!
//! A strategy hands its cache write to [`LifetimeExtender::wait_until`] and
//! returns immediately. The write runs as a detached task tracked twice: by
//! the extender (so the caller of one fetch can await its own work) and by the
//! worker's [`BackgroundTasks`] (so shutdown can await everything).

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Worker-wide set of detached tasks.
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    tasks: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `future` onto the current runtime and track it.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        reap(&mut tasks);
        tasks.spawn(future);
    }

    /// Tasks not yet observed as finished.
    pub fn pending(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        reap(&mut tasks);
        tasks.len()
    }

    /// Wait for every tracked task, including ones spawned while draining.
    pub async fn drain(&self) {
        loop {
            let mut batch = {
                let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *tasks)
            };
            if batch.is_empty() {
                return;
            }
            debug!(count = batch.len(), "Draining background tasks");
            while let Some(result) = batch.join_next().await {
                log_join(result);
            }
        }
    }
}

fn reap(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        log_join(result);
    }
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "Background task panicked");
        }
    }
}

/// Per-fetch handle used to keep background work alive past the response.
#[derive(Debug, Clone)]
pub struct LifetimeExtender {
    tasks: Arc<BackgroundTasks>,
    done: Arc<Mutex<Vec<oneshot::Receiver<()>>>>,
}

impl LifetimeExtender {
    pub fn new(tasks: Arc<BackgroundTasks>) -> Self {
        Self {
            tasks,
            done: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Run `future` detached; it is guaranteed to be awaited by shutdown.
    pub fn wait_until<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(rx);
        self.tasks.spawn(async move {
            future.await;
            let _ = tx.send(());
        });
    }

    /// Wait until all work registered through this extender has finished.
    pub async fn settled(&self) {
        loop {
            let receivers = {
                let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *done)
            };
            if receivers.is_empty() {
                return;
            }
            for rx in receivers {
                // A dropped sender means the task panicked or was aborted; either way it is over.
                let _ = rx.await;
            }
        }
    }
}
