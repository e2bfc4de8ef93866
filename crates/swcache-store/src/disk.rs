//! Persistent store backend.
//!
//! Layout:
//!
//! ```text
//! <root>/
//!     static-v2/                 percent-encoded generation name
//!         <sha256(key)>.json     { "key": .., "response": .. }
//!     refreshed-v2/
//! ```
//!
//! Entries are written to a unique temp file and renamed into place, so a
//! reader sees either the old or the new value, never a torn one.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::{
    validate_name, CacheKey, CacheStore, CachedResponse, Generation, StoreError, StoreResult,
};

const ENTRY_EXT: &str = "json";
const TEMP_EXT: &str = "tmp";

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    key: CacheKey,
    response: CachedResponse,
}

/// A generation backed by one directory.
#[derive(Debug)]
pub struct DiskGeneration {
    name: String,
    dir: PathBuf,
}

impl DiskGeneration {
    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.{}", key.digest(), ENTRY_EXT))
    }

    fn temp_path(&self, key: &CacheKey) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        self.dir.join(format!(
            ".{}.{}.{}.{}",
            key.digest(),
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed),
            TEMP_EXT
        ))
    }

    async fn read_entry(path: &Path) -> StoreResult<Option<StoredEntry>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Generation for DiskGeneration {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, key: &CacheKey) -> StoreResult<Option<CachedResponse>> {
        let entry = Self::read_entry(&self.entry_path(key)).await?;
        Ok(entry.filter(|e| &e.key == key).map(|e| e.response))
    }

    async fn put(&self, key: CacheKey, value: CachedResponse) -> StoreResult<()> {
        if !fs::try_exists(&self.dir).await? {
            return Err(StoreError::GenerationDeleted(self.name.clone()));
        }

        let target = self.entry_path(&key);
        let temp = self.temp_path(&key);
        let bytes = serde_json::to_vec(&StoredEntry { key, response: value })?;

        fs::write(&temp, &bytes).await?;
        if let Err(e) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(match e.kind() {
                ErrorKind::NotFound => StoreError::GenerationDeleted(self.name.clone()),
                _ => e.into(),
            });
        }
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> StoreResult<bool> {
        match fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> StoreResult<Vec<CacheKey>> {
        let mut keys = Vec::new();
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                continue;
            }
            match Self::read_entry(&path).await {
                Ok(Some(entry)) => keys.push(entry.key),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable entry"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Store that persists generations under a root directory.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open_root(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        info!(root = %root.display(), "Disk cache store opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn generation_dir(&self, name: &str) -> PathBuf {
        self.root.join(&*urlencoding::encode(name))
    }
}

#[async_trait]
impl CacheStore for DiskStore {
    async fn open(&self, name: &str) -> StoreResult<Arc<dyn Generation>> {
        validate_name(name)?;
        let dir = self.generation_dir(name);
        fs::create_dir_all(&dir).await?;
        Ok(Arc::new(DiskGeneration {
            name: name.to_string(),
            dir,
        }))
    }

    async fn has(&self, name: &str) -> StoreResult<bool> {
        validate_name(name)?;
        Ok(fs::try_exists(self.generation_dir(name)).await?)
    }

    async fn names(&self) -> StoreResult<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            if !item.file_type().await?.is_dir() {
                continue;
            }
            let raw = item.file_name();
            let Some(raw) = raw.to_str() else {
                continue;
            };
            match urlencoding::decode(raw) {
                Ok(name) => names.push(name.into_owned()),
                Err(_) => warn!(dir = raw, "Skipping undecodable generation directory"),
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> StoreResult<bool> {
        validate_name(name)?;
        match fs::remove_dir_all(self.generation_dir(name)).await {
            Ok(()) => {
                debug!(generation = name, "Deleted generation");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn usage(&self) -> StoreResult<u64> {
        let mut total = 0;
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                // Deleted concurrently.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(item) = entries.next_entry().await? {
                let metadata = match item.metadata().await {
                    Ok(m) => m,
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                if metadata.is_dir() {
                    pending.push(item.path());
                } else {
                    total += metadata.len();
                }
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn key(path: &str) -> CacheKey {
        let url = url::Url::parse(&format!("https://app.test{path}")).unwrap();
        CacheKey::new(&http::Method::GET, &url)
    }

    fn entry(body: &'static str) -> CachedResponse {
        CachedResponse {
            url: Some(format!("https://app.test/{body}")),
            status: 200,
            status_text: "OK".to_string(),
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: Bytes::from_static(body.as_bytes()),
            cached_at: 1,
        }
    }

    #[tokio::test]
    async fn test_put_and_lookup() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskStore::open_root(tmp.path()).await.unwrap();
        let generation = store.open("static-v1").await.unwrap();

        assert!(generation.lookup(&key("/a")).await.unwrap().is_none());
        generation.put(key("/a"), entry("a")).await.unwrap();
        assert_eq!(
            generation.lookup(&key("/a")).await.unwrap(),
            Some(entry("a"))
        );
    }

    #[tokio::test]
    async fn test_names_are_decoded() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskStore::open_root(tmp.path()).await.unwrap();
        store.open("static/v1").await.unwrap();
        store.open("refreshed-v1").await.unwrap();

        assert_eq!(
            store.names().await.unwrap(),
            vec!["refreshed-v1".to_string(), "static/v1".to_string()]
        );
        assert!(store.has("static/v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskStore::open_root(tmp.path()).await.unwrap();
        let generation = store.open("static-v1").await.unwrap();
        generation.put(key("/a"), entry("a")).await.unwrap();
        generation.put(key("/a"), entry("b")).await.unwrap();

        let mut files = Vec::new();
        let mut dir = fs::read_dir(tmp.path().join("static-v1")).await.unwrap();
        while let Some(item) = dir.next_entry().await.unwrap() {
            files.push(item.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with(".json"));
    }

    #[tokio::test]
    async fn test_delete_and_late_write() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskStore::open_root(tmp.path()).await.unwrap();
        let generation = store.open("static-v0").await.unwrap();
        generation.put(key("/a"), entry("a")).await.unwrap();

        assert!(store.delete("static-v0").await.unwrap());
        assert!(!store.has("static-v0").await.unwrap());
        assert!(matches!(
            generation.put(key("/b"), entry("b")).await,
            Err(StoreError::GenerationDeleted(_))
        ));
        assert!(!store.has("static-v0").await.unwrap());
    }

    #[tokio::test]
    async fn test_usage_counts_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskStore::open_root(tmp.path()).await.unwrap();
        assert_eq!(store.usage().await.unwrap(), 0);

        let generation = store.open("static-v1").await.unwrap();
        generation.put(key("/a"), entry("a")).await.unwrap();
        assert!(store.usage().await.unwrap() > 0);
    }
}
