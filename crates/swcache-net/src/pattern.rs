//! URL patterns for route matching.

use regex::Regex;
use url::Url;

use crate::NetError;

/// Regular expression matched anywhere in the full URL.
///
/// `/*` matches every URL, which is what the default route table uses.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    compiled: Regex,
}

impl UrlPattern {
    /// Compile a pattern.
    pub fn regex(pattern: &str) -> Result<Self, NetError> {
        let compiled = Regex::new(pattern)
            .map_err(|e| NetError::InvalidPattern(format!("{}: {}", pattern, e)))?;
        Ok(Self { compiled })
    }

    /// Source text of the pattern.
    pub fn as_str(&self) -> &str {
        self.compiled.as_str()
    }

    /// Check if a URL matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        self.compiled.is_match(url.as_str())
    }
}
