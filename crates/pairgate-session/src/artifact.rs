//! Pairing artifact cache
//!
//! Holds at most one outstanding QR payload per tenant. Expiry is lazy: an
//! artifact older than its TTL is treated as absent by every reader and is
//! evicted the first time someone observes it expired.

use chrono::{DateTime, Utc};
use pairgate_core::TenantId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A pairing payload with its issue time and validity
#[derive(Debug, Clone)]
pub struct PairingArtifact {
    /// Opaque payload handed to the QR encoder
    pub payload: String,
    /// Wall-clock issue time, for display
    pub issued_at: DateTime<Utc>,
    /// Validity measured from issue
    pub ttl: Duration,
    /// Monotonic issue time, used for expiry
    issued: Instant,
}

impl PairingArtifact {
    fn new(payload: String, ttl: Duration) -> Self {
        Self {
            payload,
            issued_at: Utc::now(),
            ttl,
            issued: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.issued)
    }

    /// Valid while `age < ttl`
    pub fn is_expired(&self) -> bool {
        self.age() >= self.ttl
    }

    /// Time left before expiry, zero once expired
    pub fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.age())
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl.as_secs()
    }
}

/// Per-tenant artifact store
#[derive(Default)]
pub struct ArtifactCache {
    entries: Mutex<HashMap<TenantId, PairingArtifact>>,
}

impl ArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TenantId, PairingArtifact>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a payload issued now, replacing any previous artifact
    pub fn put(&self, tenant: &TenantId, payload: impl Into<String>, ttl: Duration) {
        self.lock()
            .insert(tenant.clone(), PairingArtifact::new(payload.into(), ttl));
    }

    /// The artifact if still valid; an expired one is evicted
    pub fn get(&self, tenant: &TenantId) -> Option<PairingArtifact> {
        let mut entries = self.lock();
        match entries.get(tenant) {
            Some(artifact) if artifact.is_expired() => {
                debug!("Pairing artifact for {} expired, evicting", tenant);
                entries.remove(tenant);
                None
            }
            Some(artifact) => Some(artifact.clone()),
            None => None,
        }
    }

    /// Remove any artifact unconditionally
    pub fn clear(&self, tenant: &TenantId) {
        self.lock().remove(tenant);
    }

    /// Evict every expired artifact, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, artifact| !artifact.is_expired());
        before - entries.len()
    }

    /// Number of stored entries, expired or not
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
