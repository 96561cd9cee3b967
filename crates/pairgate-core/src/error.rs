//! Error types for pairgate

use crate::state::CloseReason;
use crate::tenant::TenantId;
use thiserror::Error;

/// Main error type for pairgate operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Tenant identifier missing from request")]
    MissingTenantId,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transport unavailable for {tenant}: {message}")]
    TransportUnavailable { tenant: TenantId, message: String },

    #[error("Tenant {0} is not connected")]
    NotConnected(TenantId),

    #[error("Tenant {0} was logged out; wipe required")]
    LoggedOut(TenantId),

    #[error("Credentials for {tenant} rejected ({reason}); wipe required")]
    CredentialsInvalid { tenant: TenantId, reason: CloseReason },

    #[error("Tenant {0} is reconnecting")]
    TransientDisconnect(TenantId),

    #[error("Start for {0} was superseded by a concurrent stop")]
    Superseded(TenantId),

    #[error("Credential storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

}

/// Result type alias using pairgate's Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a transport-unavailable error
    pub fn transport_unavailable(tenant: &TenantId, message: impl Into<String>) -> Self {
        Error::TransportUnavailable {
            tenant: tenant.clone(),
            message: message.into(),
        }
    }

    /// Build the error a caller sees after a terminal close
    pub fn from_terminal_close(tenant: &TenantId, reason: CloseReason) -> Self {
        match reason {
            CloseReason::LoggedOut => Error::LoggedOut(tenant.clone()),
            reason => Error::CredentialsInvalid {
                tenant: tenant.clone(),
                reason,
            },
        }
    }

    /// Stable machine-readable code used in API responses
    pub fn code(&self) -> &'static str {
        match self {
            Error::MissingTenantId => "MISSING_TENANT_ID",
            Error::InvalidRequest(_) => "INVALID_REQUEST",
            Error::TransportUnavailable { .. } => "TRANSPORT_UNAVAILABLE",
            Error::NotConnected(_) => "NOT_CONNECTED",
            Error::LoggedOut(_) => "LOGGED_OUT",
            Error::CredentialsInvalid { .. } => "CREDENTIALS_INVALID",
            Error::TransientDisconnect(_) => "TRANSIENT_DISCONNECT",
            Error::Superseded(_) => "SUPERSEDED",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Whether the caller can reasonably try the same request again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransportUnavailable { .. }
                | Error::TransientDisconnect(_)
                | Error::Superseded(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_close_mapping() {
        let tenant = TenantId::new("alice");
        assert!(matches!(
            Error::from_terminal_close(&tenant, CloseReason::LoggedOut),
            Error::LoggedOut(_)
        ));
        let err = Error::from_terminal_close(&tenant, CloseReason::Forbidden);
        assert_eq!(err.code(), "CREDENTIALS_INVALID");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_transport_unavailable_is_retryable() {
        let err = Error::transport_unavailable(&TenantId::new("bob"), "socket refused");
        assert_eq!(err.code(), "TRANSPORT_UNAVAILABLE");
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Transport unavailable for bob: socket refused"
        );
    }
}
