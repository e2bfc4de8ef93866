//! In-memory store backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    validate_name, CacheKey, CacheStore, CachedResponse, Generation, StoreError, StoreResult,
};

/// A generation held in memory.
#[derive(Debug)]
pub struct MemoryGeneration {
    name: String,
    entries: RwLock<HashMap<CacheKey, CachedResponse>>,
    deleted: AtomicBool,
}

impl MemoryGeneration {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(HashMap::new()),
            deleted: AtomicBool::new(false),
        }
    }

    async fn size(&self) -> u64 {
        self.entries.read().await.values().map(CachedResponse::size).sum()
    }
}

#[async_trait]
impl Generation for MemoryGeneration {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, key: &CacheKey) -> StoreResult<Option<CachedResponse>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: CacheKey, value: CachedResponse) -> StoreResult<()> {
        // Handles outlive deletion; a late write must not land in a dropped generation.
        if self.deleted.load(Ordering::Acquire) {
            return Err(StoreError::GenerationDeleted(self.name.clone()));
        }
        self.entries.write().await.insert(key, value);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> StoreResult<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn keys(&self) -> StoreResult<Vec<CacheKey>> {
        let mut keys: Vec<CacheKey> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// Store that keeps every generation in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    generations: RwLock<HashMap<String, Arc<MemoryGeneration>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn open(&self, name: &str) -> StoreResult<Arc<dyn Generation>> {
        validate_name(name)?;

        if let Some(generation) = self.generations.read().await.get(name) {
            return Ok(generation.clone());
        }

        let mut generations = self.generations.write().await;
        let generation = generations
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(generation = name, "Creating generation");
                Arc::new(MemoryGeneration::new(name))
            })
            .clone();
        Ok(generation)
    }

    async fn has(&self, name: &str) -> StoreResult<bool> {
        Ok(self.generations.read().await.contains_key(name))
    }

    async fn names(&self) -> StoreResult<Vec<String>> {
        let mut names: Vec<String> = self.generations.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> StoreResult<bool> {
        match self.generations.write().await.remove(name) {
            Some(generation) => {
                generation.deleted.store(true, Ordering::Release);
                debug!(generation = name, "Deleted generation");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn usage(&self) -> StoreResult<u64> {
        let generations: Vec<Arc<MemoryGeneration>> =
            self.generations.read().await.values().cloned().collect();
        let mut total = 0;
        for generation in generations {
            total += generation.size().await;
        }
        Ok(total)
    }
}
