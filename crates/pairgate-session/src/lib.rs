//! pairgate Session - Per-tenant session lifecycle
//!
//! Keeps one transport connection per tenant alive, caches the pairing
//! artifact while a device is being linked, and reconnects after transient
//! closes.
//!
//! # Session Flow
//!
//! 1. A caller invokes `LifecycleController::start()` for a tenant
//! 2. Stored credentials are loaded and the transport is opened
//! 3. If the device is not linked yet, the transport emits a QR payload that
//!    is cached for a short TTL and served to the caller
//! 4. Once the QR is scanned the transport reports `Opened` and the tenant is
//!    connected
//! 5. A non-terminal close schedules a single reconnect after a backoff; a
//!    logout leaves the tenant offline until it is wiped
//!
//! # Example
//!
//! ```no_run
//! use pairgate_core::{Config, TenantId};
//! use pairgate_session::{LifecycleController, MemoryCredentialStore, Script, ScriptedTransport};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! async fn example() {
//!     let transport = Arc::new(ScriptedTransport::new(
//!         Script::new().artifact_at(Duration::ZERO, "2@abc"),
//!     ));
//!     let store = Arc::new(MemoryCredentialStore::new());
//!     let controller = LifecycleController::new(Config::default(), transport, store);
//!
//!     let tenant = TenantId::new("alice");
//!     controller.start(&tenant).await.unwrap();
//!     let state = controller
//!         .wait_for_artifact_or_connection(&tenant, Duration::from_secs(5))
//!         .await;
//!     println!("{} is {}", tenant, state);
//! }
//! ```

pub mod artifact;
pub mod controller;
pub mod credentials;
pub mod registry;
pub mod scripted;
pub mod transport;

pub use artifact::{ArtifactCache, PairingArtifact};
pub use controller::{LifecycleController, SessionSnapshot};
pub use credentials::{
    CredentialStore, Credentials, FileCredentialStore, MemoryCredentialStore, StorageError,
    StorageResult,
};
pub use registry::{Reservation, SessionHandle, SessionRegistry, Ticket};
pub use scripted::{Script, ScriptedTransport, TransportCall};
pub use transport::{OpenedTransport, Transport, TransportConnection, TransportError, TransportEvent};
