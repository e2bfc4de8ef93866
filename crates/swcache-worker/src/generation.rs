//! Generation naming.

use std::fmt;

/// Logical role of a cache generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheRole {
    /// Precached assets and immutable third-party assets.
    Static,
    /// Same-origin assets rewritten whenever the network answers.
    Refreshed,
}

impl CacheRole {
    pub const ALL: [CacheRole; 2] = [CacheRole::Static, CacheRole::Refreshed];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheRole::Static => "static",
            CacheRole::Refreshed => "refreshed",
        }
    }

    pub fn other(&self) -> CacheRole {
        match self {
            CacheRole::Static => CacheRole::Refreshed,
            CacheRole::Refreshed => CacheRole::Static,
        }
    }
}

impl fmt::Display for CacheRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The generation names belonging to one worker version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationSet {
    version: String,
}

impl GenerationSet {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// `<role>-<version>`.
    pub fn name(&self, role: CacheRole) -> String {
        format!("{}-{}", role.as_str(), self.version)
    }

    pub fn expected(&self) -> Vec<String> {
        CacheRole::ALL.iter().map(|role| self.name(*role)).collect()
    }

    pub fn is_expected(&self, name: &str) -> bool {
        CacheRole::ALL.iter().any(|role| self.name(*role) == name)
    }
}
