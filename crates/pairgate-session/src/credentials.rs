//! Durable per-tenant credential storage
//!
//! The lifecycle controller never looks inside a tenant's credentials. It hands
//! the shared document to the transport on open, asks the store to persist it
//! whenever the transport reports a change, and purges it on wipe.
//!
//! [`FileCredentialStore`] keeps one JSON file per tenant under the configured
//! directory (by default `~/.config/pairgate/auth`).

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use pairgate_core::TenantId;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, info};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Stored credentials for {tenant} are corrupt: {source}")]
    Corrupt {
        tenant: TenantId,
        source: serde_json::Error,
    },
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for pairgate_core::Error {
    fn from(err: StorageError) -> Self {
        pairgate_core::Error::Storage(err.to_string())
    }
}

/// Opaque credential document shared between the transport and the store
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    doc: Arc<RwLock<Value>>,
}

impl Credentials {
    pub fn new(doc: Value) -> Self {
        Self {
            doc: Arc::new(RwLock::new(doc)),
        }
    }

    /// Copy of the current document
    pub fn snapshot(&self) -> Value {
        self.doc
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the whole document (transport side)
    pub fn replace(&self, doc: Value) {
        *self.doc.write().unwrap_or_else(PoisonError::into_inner) = doc;
    }

    /// Mutate the document in place (transport side)
    pub fn update(&self, f: impl FnOnce(&mut Value)) {
        let mut guard = self.doc.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut *guard);
    }

    /// True when nothing has been stored yet (a fresh pairing is needed)
    pub fn is_empty(&self) -> bool {
        let guard = self.doc.read().unwrap_or_else(PoisonError::into_inner);
        match &*guard {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }
}

/// Persistence collaborator for tenant credentials
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load stored credentials, or an empty document for a new tenant
    async fn load(&self, tenant: &TenantId) -> StorageResult<Credentials>;

    /// Persist the current state of `credentials`
    async fn save(&self, tenant: &TenantId, credentials: &Credentials) -> StorageResult<()>;

    /// Delete everything stored for the tenant; absent tenants are not an error
    async fn purge(&self, tenant: &TenantId) -> StorageResult<()>;
}

/// JSON file per tenant
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    /// Create a store rooted at `dir`, creating the directory if needed
    pub fn new(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        info!("Credential storage at {:?}", dir);
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Tenant ids are arbitrary strings, so file names are URL-safe base64
    fn path_for(&self, tenant: &TenantId) -> PathBuf {
        let name = URL_SAFE_NO_PAD.encode(tenant.as_str().as_bytes());
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self, tenant: &TenantId) -> StorageResult<Credentials> {
        let path = self.path_for(tenant);
        if !path.exists() {
            debug!("No stored credentials for {}, starting fresh", tenant);
            return Ok(Credentials::default());
        }

        let contents = std::fs::read_to_string(&path)?;
        let doc = serde_json::from_str(&contents).map_err(|source| StorageError::Corrupt {
            tenant: tenant.clone(),
            source,
        })?;
        debug!("Loaded credentials for {} from {:?}", tenant, path);
        Ok(Credentials::new(doc))
    }

    async fn save(&self, tenant: &TenantId, credentials: &Credentials) -> StorageResult<()> {
        let path = self.path_for(tenant);
        let json = serde_json::to_string_pretty(&credentials.snapshot())?;

        // Write-then-rename: readers never observe a partial file
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        debug!("Saved credentials for {} to {:?}", tenant, path);
        Ok(())
    }

    async fn purge(&self, tenant: &TenantId) -> StorageResult<()> {
        let path = self.path_for(tenant);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!("Purged credentials for {}", tenant);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No credentials to purge for {}", tenant);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store for ephemeral runs and tests
#[derive(Default)]
pub struct MemoryCredentialStore {
    docs: Mutex<HashMap<TenantId, Value>>,
    saves: AtomicUsize,
    purges: AtomicUsize,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed stored credentials for a tenant
    pub fn insert(&self, tenant: &TenantId, doc: Value) {
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant.clone(), doc);
    }

    pub fn get(&self, tenant: &TenantId) -> Option<Value> {
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant)
            .cloned()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn purge_count(&self) -> usize {
        self.purges.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, tenant: &TenantId) -> StorageResult<Credentials> {
        Ok(self.get(tenant).map(Credentials::new).unwrap_or_default())
    }

    async fn save(&self, tenant: &TenantId, credentials: &Credentials) -> StorageResult<()> {
        self.insert(tenant, credentials.snapshot());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn purge(&self, tenant: &TenantId) -> StorageResult<()> {
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tenant);
        self.purges.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
