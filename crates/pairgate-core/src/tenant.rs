//! Tenant identity

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, caller-supplied tenant identifier; the unit of isolation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse a request-supplied identifier, rejecting blank values
    pub fn parse(raw: Option<&str>) -> crate::Result<Self> {
        match raw.map(str::trim) {
            Some(id) if !id.is_empty() => Ok(Self(id.to_string())),
            _ => Err(crate::Error::MissingTenantId),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_missing_and_blank() {
        assert!(matches!(TenantId::parse(None), Err(crate::Error::MissingTenantId)));
        assert!(matches!(TenantId::parse(Some("   ")), Err(crate::Error::MissingTenantId)));
        assert_eq!(TenantId::parse(Some(" alice ")).unwrap().as_str(), "alice");
    }
}
