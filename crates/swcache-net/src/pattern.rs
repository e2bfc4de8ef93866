//! Path patterns used to route requests to caching strategies.

use regex_lite::Regex;
use url::Url;

use crate::NetError;

/// A compiled regular expression matched against URL paths.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    regex: Regex,
}

impl UrlPattern {
    /// Compile a regular expression pattern.
    pub fn regex(pattern: &str) -> Result<Self, NetError> {
        let regex = Regex::new(pattern).map_err(|e| NetError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { regex })
    }

    /// Check only the URL path; query and fragment never take part.
    pub fn matches_path(&self, url: &Url) -> bool {
        self.regex.is_match(url.path())
    }
}
