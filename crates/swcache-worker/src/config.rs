//! Worker configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use swcache_common::{LogConfig, RetryConfig, SwCacheError};
use swcache_net::{LoaderConfig, UrlPattern};
use url::Url;

/// Where generations are persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Process-local, lost on exit.
    Memory,
    /// One directory per generation under `dir`.
    Disk { dir: PathBuf },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Disk {
            dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("swcache"),
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Scope URL; its origin is the worker's own origin.
    pub scope: String,

    /// Version tag baked into generation names.
    pub version: String,

    /// Assets precached on install. Relative entries resolve against the scope.
    pub manifest: Vec<String>,

    /// Same-origin paths that are never cached.
    pub passthrough_patterns: Vec<String>,

    /// Same-origin paths served stale-while-revalidate.
    pub revalidate_patterns: Vec<String>,

    /// Cache store backend
    pub storage: StorageConfig,

    /// Network client settings
    pub network: LoaderConfig,

    /// Retry policy for each manifest entry during install
    pub install_retry: RetryConfig,

    /// Upper bound on a storage usage query, in milliseconds
    pub usage_timeout_ms: u64,

    /// Activate as soon as install finishes.
    pub skip_waiting: bool,

    /// Logging settings
    pub logging: LogConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scope: "http://localhost:8000/".to_string(),
            version: "v1".to_string(),
            manifest: [
                "/",
                "/D12.svg",
                "/dicey.webmanifest",
                "/main.css",
                "/main.rb",
                "/dicey.pack.rb",
                "/vector_number.pack.rb",
                "https://cdn.jsdelivr.net/npm/@ruby/3.4-wasm-wasi@2.7.2/dist/browser.script.iife.js",
                "https://cdn.jsdelivr.net/npm/@ruby/3.4-wasm-wasi@2.7.2/dist/ruby+stdlib.wasm",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            passthrough_patterns: vec![r"\.png$".to_string()],
            revalidate_patterns: vec![r"\.(svg|woff2?|ttf|otf)$".to_string()],
            storage: StorageConfig::default(),
            network: LoaderConfig::default(),
            install_retry: RetryConfig::default(),
            usage_timeout_ms: 2_000,
            skip_waiting: true,
            logging: LogConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Read a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SwCacheError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SwCacheError::config_with_source(format!("cannot read {}", path.display()), e)
        })?;
        Self::from_json_str(&text)
    }

    /// Parse and validate a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self, SwCacheError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SwCacheError::config_with_source("invalid worker config", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SwCacheError> {
        let scope = self.scope_url()?;
        if !matches!(scope.scheme(), "http" | "https") {
            return Err(SwCacheError::config(format!(
                "scope must be http(s), got {}",
                scope.scheme()
            )));
        }
        if self.version.is_empty() {
            return Err(SwCacheError::config("version must not be empty"));
        }
        if self.version.contains(['/', '\\']) {
            return Err(SwCacheError::config(format!(
                "version {:?} contains a path separator",
                self.version
            )));
        }
        self.manifest_urls()?;
        self.install_retry.validate()?;
        self.logging
            .validate()
            .map_err(|e| SwCacheError::config_with_source("invalid logging section", e))?;
        for pattern in self.passthrough_patterns.iter().chain(&self.revalidate_patterns) {
            UrlPattern::regex(pattern)
                .map_err(|e| SwCacheError::config_with_source("invalid path pattern", e))?;
        }
        Ok(())
    }

    pub fn scope_url(&self) -> Result<Url, SwCacheError> {
        Url::parse(&self.scope).map_err(|e| {
            SwCacheError::config_with_source(format!("invalid scope {:?}", self.scope), e)
        })
    }

    /// Manifest entries resolved against the scope, in order.
    pub fn manifest_urls(&self) -> Result<Vec<Url>, SwCacheError> {
        let scope = self.scope_url()?;
        self.manifest
            .iter()
            .map(|entry| {
                scope.join(entry).map_err(|e| {
                    SwCacheError::config_with_source(format!("invalid manifest entry {entry:?}"), e)
                })
            })
            .collect()
    }

    pub fn usage_timeout(&self) -> Duration {
        Duration::from_millis(self.usage_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = WorkerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.manifest.len(), 9);
        assert!(config.skip_waiting);
    }

    #[test]
    fn test_manifest_resolves_against_scope() {
        let config = WorkerConfig {
            scope: "https://dicey.test/app/".to_string(),
            manifest: vec!["/main.css".into(), "icon.svg".into(), "https://cdn.test/x.js".into()],
            ..Default::default()
        };
        let urls: Vec<String> = config
            .manifest_urls()
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            urls,
            vec![
                "https://dicey.test/main.css",
                "https://dicey.test/app/icon.svg",
                "https://cdn.test/x.js"
            ]
        );
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = WorkerConfig::from_json_str(
            r#"{
                "scope": "https://dicey.test/",
                "version": "v7",
                "storage": { "backend": "memory" },
                "network": { "timeout_ms": 500 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.version, "v7");
        assert_eq!(config.storage, StorageConfig::Memory);
        assert_eq!(config.network.timeout_ms, 500);
        assert_eq!(config.passthrough_patterns, vec![r"\.png$"]);
        assert_eq!(config.usage_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_disk_storage_json() {
        let config =
            WorkerConfig::from_json_str(r#"{ "storage": { "backend": "disk", "dir": "/tmp/sw" } }"#)
                .unwrap();
        assert_eq!(
            config.storage,
            StorageConfig::Disk {
                dir: PathBuf::from("/tmp/sw")
            }
        );
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let bad_pattern = WorkerConfig {
            revalidate_patterns: vec!["(unclosed".into()],
            ..Default::default()
        };
        assert_eq!(bad_pattern.validate().unwrap_err().category(), "config");

        let bad_scope = WorkerConfig {
            scope: "file:///srv/app/".into(),
            ..Default::default()
        };
        assert!(bad_scope.validate().is_err());

        let bad_version = WorkerConfig {
            version: "../v1".into(),
            ..Default::default()
        };
        assert!(bad_version.validate().is_err());

        assert!(WorkerConfig::from_json_str("{ not json").is_err());
    }

    #[test]
    fn test_shrinking_backoff_rejected() {
        let err = WorkerConfig::from_json_str(
            r#"{ "install_retry": { "max_attempts": 3, "backoff_multiplier": -2.0 } }"#,
        )
        .unwrap_err();
        assert_eq!(err.category(), "config");
        assert!(err.to_string().contains("backoff_multiplier"));
    }

    #[test]
    fn test_unknown_log_level_rejected() {
        let err = WorkerConfig::from_json_str(r#"{ "logging": { "level": "loud" } }"#).unwrap_err();
        assert_eq!(err.category(), "config");

        let bad_filter = WorkerConfig {
            logging: LogConfig::default().with_filter("swcache_worker=loud"),
            ..Default::default()
        };
        assert!(bad_filter.validate().is_err());
    }

    #[test]
    fn test_default_storage_under_cache_dir() {
        let StorageConfig::Disk { dir } = StorageConfig::default() else {
            panic!("default storage is on disk");
        };
        assert!(dir.ends_with("swcache"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(&path, r#"{ "version": "v2" }"#).unwrap();
        assert_eq!(WorkerConfig::load(&path).unwrap().version, "v2");
        assert!(WorkerConfig::load(dir.path().join("missing.json")).is_err());
    }
}
