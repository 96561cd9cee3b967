//! Transport adapter seam
//!
//! The realtime messaging transport is an external collaborator. It is seen
//! here through two traits: [`Transport`] opens a connection for a tenant, and
//! [`TransportConnection`] is the live connection owned by a session handle.
//! Everything the transport reports asynchronously arrives as a
//! [`TransportEvent`] on the channel returned by `open`.

use crate::credentials::Credentials;
use async_trait::async_trait;
use pairgate_core::{CloseReason, TenantId};
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport unreachable: {0}")]
    Unreachable(String),
    #[error("Connection already closed")]
    Closed,
}

/// Normalized event emitted by a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A new pairing payload; supersedes any earlier one for this attempt
    Artifact(String),
    /// The connection is authenticated and usable (once per attempt)
    Opened,
    /// Terminal for this connection (once per attempt)
    Closed(CloseReason),
    /// The shared credential document changed and should be persisted
    CredentialsChanged,
}

/// Result of a successful open
pub struct OpenedTransport {
    pub connection: Box<dyn TransportConnection>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens transport connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection for `tenant`. The transport may mutate `credentials`
    /// and report it with [`TransportEvent::CredentialsChanged`].
    async fn open(
        &self,
        tenant: &TenantId,
        credentials: Credentials,
    ) -> Result<OpenedTransport, TransportError>;
}

/// A live transport connection
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// Non-blocking liveness probe (e.g. the socket ready-state)
    fn is_live(&self) -> bool;

    /// Unlink this device from the account
    async fn logout(&self) -> Result<(), TransportError>;

    /// Close the underlying connection
    async fn close(&self) -> Result<(), TransportError>;

    /// Deliver a text message to `to`
    async fn send_text(&self, to: &str, text: &str) -> Result<(), TransportError>;
}
