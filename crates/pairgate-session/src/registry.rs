//! Session registry
//!
//! Single source of truth for "does this tenant have a session". Each tenant
//! has its own slot guarded by its own lock, so unrelated tenants never
//! contend; the outer map lock is only held long enough to find the slot.
//!
//! A start goes through two atomic steps:
//!
//! 1. [`SessionRegistry::reserve`] either returns the live handle, joins an
//!    in-flight open, or grants a [`Ticket`] and marks the slot as opening.
//! 2. [`SessionRegistry::try_register`] installs the new handle only if the
//!    slot still holds that ticket. A stop in between invalidates it.
//!
//! Tickets are unique for the lifetime of the registry, so a slot that was
//! forgotten and recreated never accepts a ticket granted before.

use crate::credentials::Credentials;
use crate::transport::TransportConnection;
use pairgate_core::TenantId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// Outcome published to callers waiting on an in-flight open
pub type StartOutcome = Option<Result<Arc<SessionHandle>, String>>;

/// Serializes credential writes and purges of one tenant
pub type StorageGate = Arc<tokio::sync::Mutex<()>>;

/// One attempt to keep a transport connection alive for a tenant
pub struct SessionHandle {
    id: Uuid,
    tenant: TenantId,
    attempt: u64,
    connection: Box<dyn TransportConnection>,
    credentials: Credentials,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    pub fn new(
        tenant: TenantId,
        attempt: u64,
        connection: Box<dyn TransportConnection>,
        credentials: Credentials,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant,
            attempt,
            connection,
            credentials,
            dispatcher: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn connection(&self) -> &dyn TransportConnection {
        self.connection.as_ref()
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn is_live(&self) -> bool {
        self.connection.is_live()
    }

    /// Attach the task consuming this handle's event stream
    pub fn attach_dispatcher(&self, task: JoinHandle<()>) {
        let mut slot = self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    /// Stop consuming events from this handle
    pub fn abort_dispatcher(&self) {
        let task = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("tenant", &self.tenant)
            .field("attempt", &self.attempt)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Permission to install a handle, granted by [`SessionRegistry::reserve`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    serial: u64,
    attempt: u64,
}

impl Ticket {
    pub fn attempt(&self) -> u64 {
        self.attempt
    }
}

/// Answer to a reservation request
pub enum Reservation {
    /// A live handle is already registered
    Existing(Arc<SessionHandle>),
    /// Another caller is opening a connection right now
    InFlight(watch::Receiver<StartOutcome>),
    /// The caller owns the next attempt; a dead handle it displaced is returned for teardown
    Granted {
        ticket: Ticket,
        stale: Option<Arc<SessionHandle>>,
    },
}

enum Slot {
    Vacant,
    Opening {
        ticket: Ticket,
        outcome: watch::Sender<StartOutcome>,
    },
    Active {
        handle: Arc<SessionHandle>,
        connected: bool,
    },
}

struct TenantSlot {
    attempts: u64,
    slot: Slot,
    storage: StorageGate,
}

/// Point-in-time view of one tenant's registry entry
#[derive(Debug, Clone, Default)]
pub struct RegistryEntry {
    pub handle: Option<Arc<SessionHandle>>,
    pub connected: bool,
    pub opening: bool,
    pub attempts: u64,
}

/// tenant -> session handle
#[derive(Default)]
pub struct SessionRegistry {
    tenants: RwLock<HashMap<TenantId, Arc<Mutex<TenantSlot>>>>,
    serials: AtomicU64,
}

fn lock(slot: &Mutex<TenantSlot>) -> MutexGuard<'_, TenantSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn existing(&self, tenant: &TenantId) -> Option<Arc<Mutex<TenantSlot>>> {
        self.tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant)
            .cloned()
    }

    fn slot(&self, tenant: &TenantId) -> Arc<Mutex<TenantSlot>> {
        if let Some(slot) = self.existing(tenant) {
            return slot;
        }
        self.tenants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(tenant.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(TenantSlot {
                    attempts: 0,
                    slot: Slot::Vacant,
                    storage: StorageGate::default(),
                }))
            })
            .clone()
    }

    /// Atomically decide who opens the next connection for `tenant`
    pub fn reserve(&self, tenant: &TenantId) -> Reservation {
        let slot = self.slot(tenant);
        let mut guard = lock(&slot);

        match &guard.slot {
            Slot::Active { handle, .. } if handle.is_live() => {
                return Reservation::Existing(handle.clone());
            }
            Slot::Opening { outcome, .. } => {
                return Reservation::InFlight(outcome.subscribe());
            }
            _ => {}
        }

        guard.attempts += 1;
        let ticket = Ticket {
            serial: self.serials.fetch_add(1, Ordering::Relaxed) + 1,
            attempt: guard.attempts,
        };
        let (outcome, _) = watch::channel(None);
        let previous = std::mem::replace(&mut guard.slot, Slot::Opening { ticket, outcome });
        let stale = match previous {
            Slot::Active { handle, .. } => Some(handle),
            _ => None,
        };

        Reservation::Granted { ticket, stale }
    }

    /// Install `handle` iff the slot still holds `ticket`.
    ///
    /// `on_register` runs under the slot lock before anyone else can see the
    /// handle, so a concurrent stop always observes whatever it attaches.
    pub fn try_register(
        &self,
        tenant: &TenantId,
        ticket: Ticket,
        handle: Arc<SessionHandle>,
        on_register: impl FnOnce(&Arc<SessionHandle>),
    ) -> bool {
        let Some(slot) = self.existing(tenant) else {
            return false;
        };
        let mut guard = lock(&slot);

        match &guard.slot {
            Slot::Opening { ticket: held, .. } if *held == ticket => {}
            _ => {
                debug!(
                    "Registration of {} attempt {} rejected: reservation gone",
                    tenant, ticket.attempt
                );
                return false;
            }
        }

        on_register(&handle);
        let previous = std::mem::replace(
            &mut guard.slot,
            Slot::Active {
                handle: handle.clone(),
                connected: false,
            },
        );
        if let Slot::Opening { outcome, .. } = previous {
            outcome.send_replace(Some(Ok(handle)));
        }
        true
    }

    /// Release a reservation whose open failed, telling any waiters why
    pub fn abandon(&self, tenant: &TenantId, ticket: Ticket, message: String) {
        let Some(slot) = self.existing(tenant) else {
            return;
        };
        let mut guard = lock(&slot);

        if matches!(&guard.slot, Slot::Opening { ticket: held, .. } if *held == ticket) {
            if let Slot::Opening { outcome, .. } = std::mem::replace(&mut guard.slot, Slot::Vacant)
            {
                outcome.send_replace(Some(Err(message)));
            }
        }
    }

    /// The registered handle, live or not
    pub fn get(&self, tenant: &TenantId) -> Option<Arc<SessionHandle>> {
        self.entry(tenant).handle
    }

    pub fn entry(&self, tenant: &TenantId) -> RegistryEntry {
        let Some(slot) = self.existing(tenant) else {
            return RegistryEntry::default();
        };
        let guard = lock(&slot);
        match &guard.slot {
            Slot::Vacant => RegistryEntry {
                attempts: guard.attempts,
                ..RegistryEntry::default()
            },
            Slot::Opening { .. } => RegistryEntry {
                opening: true,
                attempts: guard.attempts,
                ..RegistryEntry::default()
            },
            Slot::Active { handle, connected } => RegistryEntry {
                handle: Some(handle.clone()),
                connected: *connected,
                opening: false,
                attempts: guard.attempts,
            },
        }
    }

    /// Run `f` with the connected flag of the current handle, if `handle_id` is still current.
    /// Returns whether it ran.
    pub fn update_current(
        &self,
        tenant: &TenantId,
        handle_id: Uuid,
        f: impl FnOnce(&mut bool),
    ) -> bool {
        let Some(slot) = self.existing(tenant) else {
            return false;
        };
        let mut guard = lock(&slot);
        match &mut guard.slot {
            Slot::Active { handle, connected } if handle.id() == handle_id => {
                f(connected);
                true
            }
            _ => false,
        }
    }

    pub fn is_current(&self, tenant: &TenantId, handle_id: Uuid) -> bool {
        self.update_current(tenant, handle_id, |_| {})
    }

    /// Mark the current handle as connected, running `on_connected` under the slot lock
    pub fn mark_connected(
        &self,
        tenant: &TenantId,
        handle_id: Uuid,
        on_connected: impl FnOnce(),
    ) -> bool {
        self.update_current(tenant, handle_id, |connected| {
            *connected = true;
            on_connected();
        })
    }

    /// Unconditionally clear the tenant's slot, cancelling any in-flight reservation.
    ///
    /// `on_clear` runs under the slot lock, so nothing registered afterwards is affected.
    pub fn remove(&self, tenant: &TenantId, on_clear: impl FnOnce()) -> Option<Arc<SessionHandle>> {
        let Some(slot) = self.existing(tenant) else {
            on_clear();
            return None;
        };
        let mut guard = lock(&slot);
        on_clear();
        match std::mem::replace(&mut guard.slot, Slot::Vacant) {
            Slot::Active { handle, .. } => Some(handle),
            Slot::Opening { ticket, .. } => {
                debug!("Cancelled in-flight start of {} (attempt {})", tenant, ticket.attempt);
                None
            }
            Slot::Vacant => None,
        }
    }

    /// Remove the handle only if it is still the one identified by `handle_id`.
    ///
    /// `on_removed` runs under the slot lock, and only when the handle was removed.
    pub fn remove_if(
        &self,
        tenant: &TenantId,
        handle_id: Uuid,
        on_removed: impl FnOnce(),
    ) -> Option<Arc<SessionHandle>> {
        let slot = self.existing(tenant)?;
        let mut guard = lock(&slot);
        match &guard.slot {
            Slot::Active { handle, .. } if handle.id() == handle_id => {}
            _ => return None,
        }
        on_removed();
        match std::mem::replace(&mut guard.slot, Slot::Vacant) {
            Slot::Active { handle, .. } => Some(handle),
            _ => None,
        }
    }

    /// The tenant's credential storage gate, if the tenant has a slot
    pub fn storage_gate(&self, tenant: &TenantId) -> Option<StorageGate> {
        let slot = self.existing(tenant)?;
        let gate = lock(&slot).storage.clone();
        Some(gate)
    }

    /// Drop a vacant slot entirely, resetting its attempt counter.
    ///
    /// Slots that are opening, active or mid credential write are kept.
    pub fn forget(&self, tenant: &TenantId) -> bool {
        let mut tenants = self.tenants.write().unwrap_or_else(PoisonError::into_inner);
        let idle = tenants.get(tenant).is_some_and(|slot| {
            let guard = lock(slot);
            let writing = guard.storage.try_lock().is_err();
            matches!(guard.slot, Slot::Vacant) && !writing
        });
        if idle {
            tenants.remove(tenant);
            debug!("Forgot registry slot of {}", tenant);
        }
        idle
    }

    /// Tenants currently holding a handle or an in-flight reservation
    pub fn tenants(&self) -> Vec<TenantId> {
        let tenants = self.tenants.read().unwrap_or_else(PoisonError::into_inner);
        tenants
            .iter()
            .filter(|(_, slot)| !matches!(lock(slot).slot, Slot::Vacant))
            .map(|(tenant, _)| tenant.clone())
            .collect()
    }
}
