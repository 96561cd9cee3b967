//! Origin allow-list for cross-origin requests

use axum::http::HeaderValue;
use tracing::debug;

/// Origins allowed to call the API.
///
/// Entries are either exact origins (`https://app.example.com`) or suffix
/// patterns written as `*.example.com`, which match any origin ending in
/// `.example.com`.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    exact: Vec<String>,
    suffixes: Vec<String>,
}

impl OriginPolicy {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut policy = Self::default();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            match entry.strip_prefix('*') {
                Some(suffix) if suffix.starts_with('.') => policy.suffixes.push(suffix.to_string()),
                _ => policy.exact.push(entry.to_string()),
            }
        }
        policy
    }

    /// A missing origin (curl, health checks) is always allowed
    pub fn is_allowed(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };
        let allowed = self.exact.iter().any(|o| o == origin)
            || self.suffixes.iter().any(|s| origin.ends_with(s.as_str()));
        if !allowed {
            debug!("Rejected origin {}", origin);
        }
        allowed
    }

    /// Header form used by the CORS layer
    pub fn allows_header(&self, origin: &HeaderValue) -> bool {
        origin
            .to_str()
            .map(|o| self.is_allowed(Some(o)))
            .unwrap_or(false)
    }
}
