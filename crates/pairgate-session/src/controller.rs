//! Lifecycle controller
//!
//! Drives each tenant through `Offline -> Starting -> {AwaitingScan | Connected}`
//! and back, applies the reconnection policy on transport closes, and provides
//! the administrative operations (restart, wipe, disconnect).
//!
//! All registry and artifact mutation goes through here. Request handlers and
//! transport callbacks race on the same tenant; the registry's per-tenant
//! reservation makes `start` dedup atomic without holding a lock across the
//! transport open, and every event is checked against the handle that produced
//! it so late events from a torn-down connection are ignored.

use crate::artifact::{ArtifactCache, PairingArtifact};
use crate::credentials::{CredentialStore, Credentials};
use crate::registry::{Reservation, SessionHandle, SessionRegistry, StartOutcome, Ticket};
use crate::transport::{OpenedTransport, Transport, TransportEvent};
use futures::future::{join_all, BoxFuture, FutureExt};
use pairgate_core::{CloseReason, Config, ConnectionState, Error, Result, StopReason, TenantId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Externally visible summary of one tenant
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub tenant: TenantId,
    pub state: ConnectionState,
    /// Liveness probe of the registered handle, false when there is none
    pub alive: bool,
    /// Number of start attempts made for this tenant
    pub attempt: u64,
    pub last_close: Option<CloseReason>,
    pub reconnect_pending: bool,
}

/// A scheduled restart after a non-terminal close
struct PendingReconnect {
    seq: u64,
    task: JoinHandle<()>,
}

struct Inner {
    config: Config,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    registry: SessionRegistry,
    artifacts: ArtifactCache,
    reconnects: Mutex<HashMap<TenantId, PendingReconnect>>,
    last_close: Mutex<HashMap<TenantId, CloseReason>>,
    reconnect_seq: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-tenant session lifecycle manager
#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<Inner>,
}

impl LifecycleController {
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                credentials,
                registry: SessionRegistry::new(),
                artifacts: ArtifactCache::new(),
                reconnects: Mutex::new(HashMap::new()),
                last_close: Mutex::new(HashMap::new()),
                reconnect_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Start a session for `tenant`, or return the live one
    pub async fn start(&self, tenant: &TenantId) -> Result<Arc<SessionHandle>> {
        self.inner.start(tenant).await
    }

    /// Graceful, idempotent stop; never fails from the caller's point of view
    pub async fn stop(&self, tenant: &TenantId, reason: StopReason) {
        self.inner.stop(tenant, reason).await
    }

    /// Stop and start again with the same credentials
    pub async fn restart(&self, tenant: &TenantId) -> Result<Arc<SessionHandle>> {
        info!("Tenant {}: restart requested", tenant);
        self.inner.stop(tenant, StopReason::Restart).await;
        self.inner.start(tenant).await
    }

    /// Stop, purge stored credentials, and start a fresh pairing
    pub async fn wipe(&self, tenant: &TenantId) -> Result<Arc<SessionHandle>> {
        info!("Tenant {}: wipe requested", tenant);
        self.inner.stop(tenant, StopReason::Wipe).await;
        self.inner.purge_credentials(tenant).await?;
        lock(&self.inner.last_close).remove(tenant);
        info!("Tenant {}: credentials purged", tenant);
        self.inner.start(tenant).await
    }

    /// Stop without restarting
    pub async fn disconnect(&self, tenant: &TenantId) {
        info!("Tenant {}: disconnect requested", tenant);
        self.inner.stop(tenant, StopReason::Disconnect).await
    }

    /// Derived connection state; observing an expired artifact evicts it
    pub fn state(&self, tenant: &TenantId) -> ConnectionState {
        self.inner.state(tenant)
    }

    pub fn snapshot(&self, tenant: &TenantId) -> SessionSnapshot {
        let entry = self.inner.registry.entry(tenant);
        SessionSnapshot {
            tenant: tenant.clone(),
            state: self.inner.state(tenant),
            alive: entry.handle.as_ref().is_some_and(|h| h.is_live()),
            attempt: entry.attempts,
            last_close: lock(&self.inner.last_close).get(tenant).copied(),
            reconnect_pending: lock(&self.inner.reconnects).contains_key(tenant),
        }
    }

    /// The outstanding pairing artifact, if still valid
    pub fn artifact(&self, tenant: &TenantId) -> Option<PairingArtifact> {
        self.inner.artifacts.get(tenant)
    }

    /// Drop every expired artifact, including those of tenants nobody polls
    pub fn purge_expired_artifacts(&self) -> usize {
        let purged = self.inner.artifacts.purge_expired();
        if purged > 0 {
            debug!("Purged {} expired pairing artifact(s)", purged);
        }
        purged
    }

    /// Poll the derived state until it is no longer pending or `timeout` elapses
    pub async fn wait_for_artifact_or_connection(
        &self,
        tenant: &TenantId,
        timeout: Duration,
    ) -> ConnectionState {
        let deadline = Instant::now() + timeout;
        let poll = self.inner.config.artifact_poll_interval;

        loop {
            let state = self.inner.state(tenant);
            let now = Instant::now();
            if !state.is_pending() || now >= deadline {
                debug!("Tenant {}: wait finished in state {}", tenant, state);
                return state;
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// Deliver a text message through the tenant's connection
    pub async fn send_text(&self, tenant: &TenantId, to: &str, text: &str) -> Result<()> {
        match self.inner.state(tenant) {
            ConnectionState::Connected => {}
            ConnectionState::Starting | ConnectionState::Reconnecting => {
                return Err(Error::TransientDisconnect(tenant.clone()));
            }
            ConnectionState::AwaitingScan | ConnectionState::Offline => {
                let last = lock(&self.inner.last_close).get(tenant).copied();
                return Err(match last {
                    Some(reason) if reason.is_terminal() => Error::from_terminal_close(tenant, reason),
                    _ => Error::NotConnected(tenant.clone()),
                });
            }
        }

        let handle = self
            .inner
            .registry
            .get(tenant)
            .ok_or_else(|| Error::NotConnected(tenant.clone()))?;
        handle
            .connection()
            .send_text(to, text)
            .await
            .map_err(|e| Error::transport_unavailable(tenant, e.to_string()))
    }

    /// Tenants with a registered handle, an in-flight start or a pending reconnect
    pub fn tenants(&self) -> Vec<TenantId> {
        let mut tenants = self.inner.registry.tenants();
        for tenant in lock(&self.inner.reconnects).keys() {
            if !tenants.contains(tenant) {
                tenants.push(tenant.clone());
            }
        }
        tenants.sort();
        tenants
    }

    /// Stop every tenant concurrently
    pub async fn shutdown(&self) {
        let tenants = self.tenants();
        info!("Stopping {} session(s)", tenants.len());
        join_all(
            tenants
                .iter()
                .map(|tenant| self.inner.stop(tenant, StopReason::Shutdown)),
        )
        .await;
    }
}

impl Inner {
    async fn start(self: &Arc<Self>, tenant: &TenantId) -> Result<Arc<SessionHandle>> {
        match self.registry.reserve(tenant) {
            Reservation::Existing(handle) => {
                debug!("Tenant {}: session already live (attempt {})", tenant, handle.attempt());
                Ok(handle)
            }
            Reservation::InFlight(outcome) => self.join_in_flight(tenant, outcome).await,
            Reservation::Granted { ticket, stale } => {
                // Detached so a caller that goes away cannot strand the reservation
                let inner = Arc::clone(self);
                let owned = tenant.clone();
                let opening =
                    tokio::spawn(async move { inner.open_reserved(&owned, ticket, stale).await });
                match opening.await {
                    Ok(result) => result,
                    Err(e) => {
                        self.registry.abandon(tenant, ticket, e.to_string());
                        Err(Error::transport_unavailable(tenant, e.to_string()))
                    }
                }
            }
        }
    }

    /// Open a connection for a granted reservation and register it
    async fn open_reserved(
        self: &Arc<Self>,
        tenant: &TenantId,
        ticket: Ticket,
        stale: Option<Arc<SessionHandle>>,
    ) -> Result<Arc<SessionHandle>> {
        if let Some(stale) = stale {
            warn!(
                "Tenant {}: handle from attempt {} is no longer live, replacing it",
                tenant,
                stale.attempt()
            );
            self.artifacts.clear(tenant);
            self.teardown(&stale, false).await;
        }

        // Starting now makes any scheduled retry redundant
        self.cancel_reconnect(tenant);
        info!("Tenant {}: starting session (attempt {})", tenant, ticket.attempt());

        let credentials = match self.credentials.load(tenant).await {
            Ok(credentials) => credentials,
            Err(e) => {
                let message = e.to_string();
                warn!("Tenant {}: cannot load credentials: {}", tenant, message);
                self.registry.abandon(tenant, ticket, message.clone());
                return Err(Error::transport_unavailable(tenant, message));
            }
        };

        let opened = tokio::time::timeout(
            self.config.connect_timeout,
            self.transport.open(tenant, credentials.clone()),
        )
        .await;
        let OpenedTransport { connection, events } = match opened {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                let message = e.to_string();
                warn!("Tenant {}: transport open failed: {}", tenant, message);
                self.registry.abandon(tenant, ticket, message.clone());
                return Err(Error::transport_unavailable(tenant, message));
            }
            Err(_) => {
                let message = format!("connect timed out after {:?}", self.config.connect_timeout);
                warn!("Tenant {}: {}", tenant, message);
                self.registry.abandon(tenant, ticket, message.clone());
                return Err(Error::transport_unavailable(tenant, message));
            }
        };

        let handle = Arc::new(SessionHandle::new(
            tenant.clone(),
            ticket.attempt(),
            connection,
            credentials.clone(),
        ));

        let registered = self.registry.try_register(tenant, ticket, handle.clone(), |handle| {
            handle.attach_dispatcher(tokio::spawn(dispatch_events(
                Arc::downgrade(self),
                tenant.clone(),
                handle.id(),
                credentials,
                events,
            )));
        });
        if !registered {
            info!(
                "Tenant {}: attempt {} superseded by a concurrent stop, discarding connection",
                tenant,
                ticket.attempt()
            );
            self.teardown(&handle, false).await;
            return Err(Error::Superseded(tenant.clone()));
        }

        debug!("Tenant {}: registered handle {}", tenant, handle.id());
        Ok(handle)
    }

    async fn join_in_flight(
        &self,
        tenant: &TenantId,
        mut outcome: watch::Receiver<StartOutcome>,
    ) -> Result<Arc<SessionHandle>> {
        debug!("Tenant {}: joining in-flight start", tenant);
        let outcome = match outcome.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Ok(handle)) => Ok(handle),
            Some(Err(message)) => Err(Error::transport_unavailable(tenant, message)),
            None => Err(Error::Superseded(tenant.clone())),
        }
    }

    async fn stop(&self, tenant: &TenantId, reason: StopReason) {
        let cancelled = self.cancel_reconnect(tenant);
        // Synchronous removal: a reconnect firing after this sees a clean slate
        let removed = self.registry.remove(tenant, || self.artifacts.clear(tenant));

        match removed {
            Some(handle) => {
                info!(
                    "Tenant {}: stopping session (attempt {}, reason {})",
                    tenant,
                    handle.attempt(),
                    reason
                );
                self.teardown(&handle, reason.logs_out()).await;
            }
            None if cancelled => info!("Tenant {}: cancelled pending reconnect ({})", tenant, reason),
            None => debug!("Tenant {}: already offline ({})", tenant, reason),
        }

        if reason.releases_tenant() && self.registry.forget(tenant) {
            lock(&self.last_close).remove(tenant);
        }
    }

    /// Purge stored credentials once no write for the tenant is in progress
    async fn purge_credentials(&self, tenant: &TenantId) -> Result<()> {
        let gate = self.registry.storage_gate(tenant);
        let _writing = match &gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };
        self.credentials.purge(tenant).await?;
        Ok(())
    }

    /// Persist credentials on behalf of the current handle.
    ///
    /// The write runs detached and holds the tenant's storage gate until it lands.
    async fn persist_credentials(&self, tenant: &TenantId, handle_id: Uuid, credentials: &Credentials) {
        let Some(gate) = self.registry.storage_gate(tenant) else {
            return;
        };
        let writing = gate.lock_owned().await;
        if !self.registry.is_current(tenant, handle_id) {
            debug!("Tenant {}: skipping credential save from superseded handle", tenant);
            return;
        }

        let store = Arc::clone(&self.credentials);
        let owned = tenant.clone();
        let credentials = credentials.clone();
        let write = tokio::spawn(async move {
            let _writing = writing;
            store.save(&owned, &credentials).await
        });
        match write.await {
            Ok(Ok(())) => debug!("Tenant {}: credentials saved", tenant),
            Ok(Err(e)) => warn!("Tenant {}: failed to save credentials: {}", tenant, e),
            Err(e) => warn!("Tenant {}: credential save task failed: {}", tenant, e),
        }
    }

    /// Best-effort close; failures are logged and swallowed
    async fn teardown(&self, handle: &SessionHandle, logout: bool) {
        handle.abort_dispatcher();
        let tenant = handle.tenant();
        let limit = self.config.teardown_timeout;

        if logout {
            match tokio::time::timeout(limit, handle.connection().logout()).await {
                Ok(Ok(())) => debug!("Tenant {}: logged out", tenant),
                Ok(Err(e)) => warn!("Tenant {}: logout failed: {}", tenant, e),
                Err(_) => warn!("Tenant {}: logout timed out", tenant),
            }
        }

        match tokio::time::timeout(limit, handle.connection().close()).await {
            Ok(Ok(())) => debug!("Tenant {}: transport closed", tenant),
            Ok(Err(e)) => warn!("Tenant {}: transport close failed: {}", tenant, e),
            Err(_) => warn!("Tenant {}: transport close timed out", tenant),
        }
    }

    fn state(&self, tenant: &TenantId) -> ConnectionState {
        let entry = self.registry.entry(tenant);
        let live = entry.handle.as_ref().is_some_and(|h| h.is_live());

        if entry.connected && live {
            return ConnectionState::Connected;
        }
        if self.artifacts.get(tenant).is_some() {
            return ConnectionState::AwaitingScan;
        }
        if entry.opening || live {
            return ConnectionState::Starting;
        }
        // A dead handle still registered, or a retry waiting on its timer
        if entry.handle.is_some() || lock(&self.reconnects).contains_key(tenant) {
            return ConnectionState::Reconnecting;
        }
        ConnectionState::Offline
    }

    async fn handle_event(
        self: &Arc<Self>,
        tenant: &TenantId,
        handle_id: Uuid,
        credentials: &Credentials,
        event: TransportEvent,
    ) {
        match event {
            TransportEvent::Artifact(payload) => {
                let ttl = self.config.artifact_ttl;
                let stored = self.registry.update_current(tenant, handle_id, |_| {
                    self.artifacts.put(tenant, payload, ttl);
                });
                if stored {
                    info!("Tenant {}: pairing artifact issued (valid ~{}s)", tenant, ttl.as_secs());
                } else {
                    debug!("Tenant {}: dropping artifact from superseded handle", tenant);
                }
            }
            TransportEvent::Opened => {
                let current = self
                    .registry
                    .mark_connected(tenant, handle_id, || self.artifacts.clear(tenant));
                if current {
                    lock(&self.last_close).remove(tenant);
                    info!("Tenant {}: connected", tenant);
                }
            }
            TransportEvent::CredentialsChanged => {
                self.persist_credentials(tenant, handle_id, credentials).await
            }
            TransportEvent::Closed(reason) => self.handle_close(tenant, handle_id, reason),
        }
    }

    fn handle_close(self: &Arc<Self>, tenant: &TenantId, handle_id: Uuid, reason: CloseReason) {
        let Some(handle) = self
            .registry
            .remove_if(tenant, handle_id, || self.artifacts.clear(tenant))
        else {
            debug!("Tenant {}: ignoring close ({}) from superseded handle", tenant, reason);
            return;
        };
        lock(&self.last_close).insert(tenant.clone(), reason);

        if reason.is_terminal() {
            warn!(
                "Tenant {}: connection closed ({}, code {}), not retrying; wipe required",
                tenant,
                reason,
                reason.code()
            );
        } else {
            info!(
                "Tenant {}: connection closed ({}) on attempt {}, reconnecting in {:?}",
                tenant,
                reason,
                handle.attempt(),
                self.config.reconnect_backoff
            );
            self.schedule_reconnect(tenant);
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, tenant: &TenantId) {
        let seq = self.reconnect_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut reconnects = lock(&self.reconnects);
        let task = tokio::spawn(reconnect(
            Arc::downgrade(self),
            tenant.clone(),
            seq,
            self.config.reconnect_backoff,
        ));
        if let Some(previous) = reconnects.insert(tenant.clone(), PendingReconnect { seq, task }) {
            previous.task.abort();
        }
    }

    /// Take ownership of the pending reconnect if it is still the one numbered `seq`
    fn claim_reconnect(&self, tenant: &TenantId, seq: u64) -> bool {
        let mut reconnects = lock(&self.reconnects);
        match reconnects.get(tenant) {
            Some(pending) if pending.seq == seq => {
                reconnects.remove(tenant);
                true
            }
            _ => false,
        }
    }

    fn cancel_reconnect(&self, tenant: &TenantId) -> bool {
        match lock(&self.reconnects).remove(tenant) {
            Some(pending) => {
                pending.task.abort();
                true
            }
            None => false,
        }
    }
}

/// Consume one handle's event stream until it closes
async fn dispatch_events(
    inner: Weak<Inner>,
    tenant: TenantId,
    handle_id: Uuid,
    credentials: Credentials,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let closed = matches!(event, TransportEvent::Closed(_));
        inner.handle_event(&tenant, handle_id, &credentials, event).await;
        if closed {
            break;
        }
    }
    debug!("Tenant {}: event stream of handle {} ended", tenant, handle_id);
}

/// Timer body of a scheduled reconnect.
///
/// Boxed so the future type does not recurse through `start`.
fn reconnect(inner: Weak<Inner>, tenant: TenantId, seq: u64, backoff: Duration) -> BoxFuture<'static, ()> {
    async move {
        tokio::time::sleep(backoff).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.claim_reconnect(&tenant, seq) {
            debug!("Tenant {}: reconnect {} abandoned", tenant, seq);
            return;
        }
        if inner.registry.get(&tenant).is_some_and(|h| h.is_live()) {
            debug!("Tenant {}: already re-registered, skipping reconnect", tenant);
            return;
        }
        match inner.start(&tenant).await {
            Ok(handle) => debug!("Tenant {}: reconnect started attempt {}", tenant, handle.attempt()),
            Err(e) => warn!("Tenant {}: reconnect failed: {}", tenant, e),
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{MemoryCredentialStore, StorageResult};
    use crate::scripted::{Script, ScriptedTransport, TransportCall};
    use async_trait::async_trait;
    use serde_json::json;

    const BACKOFF: Duration = Duration::from_millis(1500);

    struct Fixture {
        controller: LifecycleController,
        transport: Arc<ScriptedTransport>,
        store: Arc<MemoryCredentialStore>,
    }

    fn config() -> Config {
        Config::new()
            .with_reconnect_backoff(BACKOFF)
            .with_artifact_wait(Duration::from_secs(5), Duration::from_millis(50))
    }

    fn fixture(fallback: Script) -> Fixture {
        fixture_with(config(), fallback)
    }

    fn fixture_with(config: Config, fallback: Script) -> Fixture {
        let transport = Arc::new(ScriptedTransport::new(fallback));
        let store = Arc::new(MemoryCredentialStore::new());
        let controller = LifecycleController::new(config, transport.clone(), store.clone());
        Fixture {
            controller,
            transport,
            store,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_starts_open_once() {
        let f = fixture(Script::new().open_delay(ms(100)));
        let alice = TenantId::new("alice");

        let starts = (0..8).map(|_| f.controller.start(&alice));
        let handles: Vec<_> = join_all(starts).await.into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(f.transport.open_count(&alice), 1);
        assert!(handles.iter().all(|h| h.id() == handles[0].id()));

        // Later starts are deduplicated against the live handle
        let again = f.controller.start(&alice).await.unwrap();
        assert_eq!(again.id(), handles[0].id());
        assert_eq!(f.transport.open_count(&alice), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_open_registers_nothing() {
        let f = fixture(Script::new());
        let alice = TenantId::new("alice");
        f.transport.push_script(&alice, Script::failing("network down"));

        let result = f.controller.start(&alice).await;
        assert!(matches!(result, Err(Error::TransportUnavailable { .. })));
        assert_eq!(f.controller.state(&alice), ConnectionState::Offline);
        assert!(f.controller.tenants().is_empty());

        // Nothing half-registered blocks the next attempt
        f.controller.start(&alice).await.unwrap();
        assert_eq!(f.transport.open_count(&alice), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_registers_nothing() {
        let f = fixture_with(config().with_connect_timeout(ms(500)), Script::new());
        let alice = TenantId::new("alice");
        f.transport
            .push_script(&alice, Script::new().open_delay(Duration::from_secs(10)));

        let started = Instant::now();
        let result = f.controller.start(&alice).await;
        assert!(matches!(result, Err(Error::TransportUnavailable { .. })));
        assert!(started.elapsed() >= ms(500));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(f.controller.state(&alice), ConnectionState::Offline);
        assert!(f.controller.tenants().is_empty());

        f.controller.start(&alice).await.unwrap();
        assert_eq!(f.transport.open_count(&alice), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_survives_failing_teardown() {
        let f = fixture(Script::new());
        let alice = TenantId::new("alice");
        f.transport.push_script(
            &alice,
            Script::new()
                .opened_at(ms(10))
                .failing_logout("link lost")
                .hanging_close(),
        );
        f.controller.start(&alice).await.unwrap();
        tokio::time::sleep(ms(20)).await;
        assert_eq!(f.controller.state(&alice), ConnectionState::Connected);

        let started = Instant::now();
        f.controller.stop(&alice, StopReason::Wipe).await;
        assert!(started.elapsed() >= f.controller.config().teardown_timeout);
        assert_eq!(f.controller.state(&alice), ConnectionState::Offline);
        assert!(f.controller.tenants().is_empty());

        let calls = f.transport.calls();
        assert!(calls.contains(&TransportCall::Logout(alice.clone())));
        assert!(calls.contains(&TransportCall::Close(alice.clone())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let f = fixture(Script::new().artifact_at(ms(10), "QR"));
        let alice = TenantId::new("alice");
        f.controller.start(&alice).await.unwrap();
        tokio::time::sleep(ms(20)).await;
        assert_eq!(f.controller.state(&alice), ConnectionState::AwaitingScan);

        f.controller.stop(&alice, StopReason::Disconnect).await;
        let calls_after_first = f.transport.calls();
        f.controller.stop(&alice, StopReason::Disconnect).await;

        assert_eq!(f.transport.calls(), calls_after_first);
        assert_eq!(f.controller.state(&alice), ConnectionState::Offline);
        assert!(f.controller.artifact(&alice).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logged_out_close_is_terminal() {
        let f = fixture(Script::new().opened_at(ms(10)).closed_at(ms(100), CloseReason::LoggedOut));
        let alice = TenantId::new("alice");
        f.controller.start(&alice).await.unwrap();

        tokio::time::sleep(ms(200)).await;
        assert_eq!(f.controller.state(&alice), ConnectionState::Offline);
        assert!(!f.controller.snapshot(&alice).reconnect_pending);

        tokio::time::sleep(BACKOFF * 4).await;
        assert_eq!(f.transport.open_count(&alice), 1);

        let err = f.controller.send_text(&alice, "5511", "hi").await.unwrap_err();
        assert!(matches!(err, Error::LoggedOut(_)));
        assert_eq!(f.controller.snapshot(&alice).last_close, Some(CloseReason::LoggedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_drop_reconnects_once() {
        let f = fixture(Script::new());
        let alice = TenantId::new("alice");
        f.transport.push_script(
            &alice,
            Script::new().opened_at(ms(10)).closed_at(ms(100), CloseReason::ConnectionLost),
        );
        f.transport.push_script(&alice, Script::new().open_delay(ms(300)).opened_at(ms(10)));

        f.controller.start(&alice).await.unwrap();
        tokio::time::sleep(ms(50)).await;
        assert_eq!(f.controller.state(&alice), ConnectionState::Connected);

        tokio::time::sleep(ms(100)).await;
        assert_eq!(f.controller.state(&alice), ConnectionState::Reconnecting);
        assert!(f.controller.snapshot(&alice).reconnect_pending);
        assert!(matches!(
            f.controller.send_text(&alice, "5511", "hi").await,
            Err(Error::TransientDisconnect(_))
        ));

        // Backoff elapses: the retry is opening (slow open keeps it in Starting)
        tokio::time::sleep(BACKOFF).await;
        assert_eq!(f.controller.state(&alice), ConnectionState::Starting);

        tokio::time::sleep(ms(500)).await;
        assert_eq!(f.controller.state(&alice), ConnectionState::Connected);
        assert_eq!(f.transport.open_count(&alice), 2);

        tokio::time::sleep(BACKOFF * 4).await;
        assert_eq!(f.transport.open_count(&alice), 2);
        assert_eq!(f.controller.snapshot(&alice).attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_awaiting_scan_reconnects() {
        let f = fixture(Script::new());
        let alice = TenantId::new("alice");
        f.transport.push_script(
            &alice,
            Script::new()
                .artifact_at(ms(10), "FIRST")
                .closed_at(ms(100), CloseReason::ConnectionLost),
        );
        f.transport.push_script(
            &alice,
            Script::new().open_delay(ms(100)).artifact_at(ms(10), "SECOND"),
        );

        f.controller.start(&alice).await.unwrap();
        tokio::time::sleep(ms(50)).await;
        assert_eq!(f.controller.state(&alice), ConnectionState::AwaitingScan);

        tokio::time::sleep(ms(100)).await;
        assert_eq!(f.controller.state(&alice), ConnectionState::Reconnecting);
        assert!(f.controller.artifact(&alice).is_none());
        assert!(f.controller.snapshot(&alice).reconnect_pending);

        tokio::time::sleep(BACKOFF).await;
        assert_eq!(f.controller.state(&alice), ConnectionState::Starting);

        tokio::time::sleep(ms(200)).await;
        assert_eq!(f.controller.state(&alice), ConnectionState::AwaitingScan);
        assert_eq!(f.controller.artifact(&alice).unwrap().payload, "SECOND");
        assert_eq!(f.transport.open_count(&alice), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_reconnect() {
        let f = fixture(Script::new());
        let alice = TenantId::new("alice");
        f.transport.push_script(
            &alice,
            Script::new().opened_at(ms(10)).closed_at(ms(50), CloseReason::ConnectionClosed),
        );

        f.controller.start(&alice).await.unwrap();
        tokio::time::sleep(ms(100)).await;
        assert!(f.controller.snapshot(&alice).reconnect_pending);

        f.controller.disconnect(&alice).await;
        tokio::time::sleep(BACKOFF * 2).await;

        assert_eq!(f.transport.open_count(&alice), 1);
        assert_eq!(f.controller.state(&alice), ConnectionState::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_handle_is_replaced() {
        let f = fixture(Script::new().opened_at(ms(10)));
        let alice = TenantId::new("alice");
        let first = f.controller.start(&alice).await.unwrap();
        tokio::time::sleep(ms(20)).await;
        assert_eq!(f.controller.state(&alice), ConnectionState::Connected);

        // The socket dies without a close event ever arriving
        f.transport.kill(&alice);
        assert_eq!(f.controller.state(&alice), ConnectionState::Reconnecting);

        let second = f.controller.start(&alice).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert!(second.is_live());
        assert_eq!(f.transport.open_count(&alice), 2);
        assert!(f
            .transport
            .calls()
            .contains(&TransportCall::Close(alice.clone())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_death_detected_by_start() {
        let f = fixture(Script::new());
        let alice = TenantId::new("alice");
        f.transport
            .push_script(&alice, Script::new().opened_at(ms(10)).silent_death_at(ms(50)));

        let first = f.controller.start(&alice).await.unwrap();
        tokio::time::sleep(ms(100)).await;
        assert!(!first.is_live());
        assert!(!f.controller.snapshot(&alice).alive);

        let second = f.controller.start(&alice).await.unwrap();
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_qr_then_connected_scenario() {
        let f = fixture(Script::new().artifact_at(ms(50), "XYZ").opened_at(ms(200)));
        let alice = TenantId::new("alice");
        f.controller.start(&alice).await.unwrap();

        tokio::time::sleep(ms(100)).await;
        let state = f
            .controller
            .wait_for_artifact_or_connection(&alice, Duration::from_secs(5))
            .await;
        assert_eq!(state, ConnectionState::AwaitingScan);
        assert_eq!(f.controller.artifact(&alice).unwrap().payload, "XYZ");

        tokio::time::sleep(ms(200)).await;
        assert_eq!(f.controller.state(&alice), ConnectionState::Connected);
        assert!(f.controller.artifact(&alice).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_when_artifact_arrives() {
        let f = fixture(Script::new().artifact_at(ms(400), "LATE"));
        let alice = TenantId::new("alice");
        f.controller.start(&alice).await.unwrap();

        let started = Instant::now();
        let state = f
            .controller
            .wait_for_artifact_or_connection(&alice, Duration::from_secs(5))
            .await;
        assert_eq!(state, ConnectionState::AwaitingScan);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_bounded() {
        let f = fixture(Script::new());
        let alice = TenantId::new("alice");
        f.controller.start(&alice).await.unwrap();

        let started = Instant::now();
        let state = f
            .controller
            .wait_for_artifact_or_connection(&alice, ms(300))
            .await;
        assert_eq!(state, ConnectionState::Starting);
        assert!(started.elapsed() >= ms(300));
        assert!(started.elapsed() < ms(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_artifact_expiry_returns_to_starting() {
        let f = fixture(Script::new().artifact_at(ms(0), "QR"));
        let alice = TenantId::new("alice");
        f.controller.start(&alice).await.unwrap();
        tokio::time::sleep(ms(10)).await;
        assert_eq!(f.controller.state(&alice), ConnectionState::AwaitingScan);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(f.controller.artifact(&alice).is_none());
        assert_ne!(f.controller.state(&alice), ConnectionState::AwaitingScan);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_artifacts() {
        let f = fixture(Script::new().artifact_at(ms(0), "QR"));
        let alice = TenantId::new("alice");
        f.controller.start(&alice).await.unwrap();
        tokio::time::sleep(ms(10)).await;

        assert_eq!(f.controller.purge_expired_artifacts(), 0);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.controller.purge_expired_artifacts(), 1);
        assert!(f.controller.artifact(&alice).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wipe_purges_once_and_restarts_once() {
        let f = fixture(Script::new().opened_at(ms(10)));
        let bob = TenantId::new("bob");
        f.store.insert(&bob, json!({ "me": "old" }));

        let first = f.controller.start(&bob).await.unwrap();
        tokio::time::sleep(ms(20)).await;
        assert_eq!(f.controller.state(&bob), ConnectionState::Connected);

        let second = f.controller.wipe(&bob).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert!(!first.is_live());
        assert_eq!(f.store.purge_count(), 1);
        assert_eq!(f.transport.open_count(&bob), 2);
        assert!(second.credentials().is_empty());

        let calls = f.transport.calls();
        let logout = calls.iter().position(|c| *c == TransportCall::Logout(bob.clone())).unwrap();
        let reopen = calls.iter().rposition(|c| *c == TransportCall::Open(bob.clone())).unwrap();
        assert!(logout < reopen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wipe_clears_artifact_before_new_start() {
        let f = fixture(Script::new());
        let bob = TenantId::new("bob");
        f.transport.push_script(&bob, Script::new().artifact_at(ms(0), "OLD"));
        f.transport.push_script(&bob, Script::new().artifact_at(ms(500), "NEW"));

        f.controller.start(&bob).await.unwrap();
        tokio::time::sleep(ms(10)).await;
        assert_eq!(f.controller.artifact(&bob).unwrap().payload, "OLD");

        f.controller.wipe(&bob).await.unwrap();
        assert!(f.controller.artifact(&bob).is_none());

        tokio::time::sleep(ms(600)).await;
        assert_eq!(f.controller.artifact(&bob).unwrap().payload, "NEW");
    }

    /// Writes land on a background task, the way a blocking filesystem write does
    struct DetachedWriteStore {
        inner: Arc<MemoryCredentialStore>,
        delay: Duration,
    }

    #[async_trait]
    impl CredentialStore for DetachedWriteStore {
        async fn load(&self, tenant: &TenantId) -> StorageResult<Credentials> {
            self.inner.load(tenant).await
        }

        async fn save(&self, tenant: &TenantId, credentials: &Credentials) -> StorageResult<()> {
            let inner = self.inner.clone();
            let tenant = tenant.clone();
            let credentials = credentials.clone();
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.save(&tenant, &credentials).await
            })
            .await
            .unwrap()
        }

        async fn purge(&self, tenant: &TenantId) -> StorageResult<()> {
            self.inner.purge(tenant).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wipe_waits_for_credential_save_in_flight() {
        let memory = Arc::new(MemoryCredentialStore::new());
        let store = Arc::new(DetachedWriteStore {
            inner: memory.clone(),
            delay: ms(500),
        });
        let transport = Arc::new(ScriptedTransport::new(Script::new()));
        let bob = TenantId::new("bob");
        transport.push_script(&bob, Script::new().credentials_changed_at(ms(10)).opened_at(ms(20)));
        let controller = LifecycleController::new(config(), transport, store);

        controller.start(&bob).await.unwrap();
        tokio::time::sleep(ms(100)).await;
        assert_eq!(memory.save_count(), 0);

        let started = Instant::now();
        controller.wipe(&bob).await.unwrap();
        assert!(started.elapsed() >= ms(400));
        assert_eq!(memory.save_count(), 1);
        assert_eq!(memory.purge_count(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(memory.get(&bob).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_keeps_credentials() {
        let f = fixture(Script::new().credentials_changed_at(ms(5)).opened_at(ms(10)));
        let alice = TenantId::new("alice");
        f.controller.start(&alice).await.unwrap();
        tokio::time::sleep(ms(20)).await;
        assert_eq!(f.store.save_count(), 1);

        f.controller.restart(&alice).await.unwrap();
        assert_eq!(f.store.purge_count(), 0);
        assert!(f.store.get(&alice).is_some());
        assert!(!f.transport.calls().contains(&TransportCall::Logout(alice.clone())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_open_supersedes_start() {
        let f = fixture(Script::new().open_delay(ms(200)));
        let alice = TenantId::new("alice");

        let controller = f.controller.clone();
        let tenant = alice.clone();
        let pending = tokio::spawn(async move { controller.start(&tenant).await });
        tokio::time::sleep(ms(50)).await;
        assert_eq!(f.controller.state(&alice), ConnectionState::Starting);

        f.controller.disconnect(&alice).await;
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(Error::Superseded(_))));
        assert_eq!(f.controller.state(&alice), ConnectionState::Offline);
        assert!(f.transport.calls().contains(&TransportCall::Close(alice.clone())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_caller_does_not_strand_start() {
        let f = fixture(Script::new().open_delay(ms(200)));
        let alice = TenantId::new("alice");

        let abandoned = tokio::time::timeout(ms(50), f.controller.start(&alice)).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(ms(300)).await;
        let handle = f.controller.start(&alice).await.unwrap();
        assert_eq!(handle.attempt(), 1);
        assert_eq!(f.transport.open_count(&alice), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_connection() {
        let f = fixture(Script::new().opened_at(ms(10)));
        let alice = TenantId::new("alice");

        assert!(matches!(
            f.controller.send_text(&alice, "5511", "hi").await,
            Err(Error::NotConnected(_))
        ));

        f.controller.start(&alice).await.unwrap();
        tokio::time::sleep(ms(20)).await;
        f.controller.send_text(&alice, "5511", "hi").await.unwrap();
        assert!(f.transport.calls().contains(&TransportCall::Send {
            tenant: alice.clone(),
            to: "5511".to_string(),
            text: "hi".to_string(),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tenants_are_isolated() {
        let f = fixture(Script::new().opened_at(ms(10)));
        let alice = TenantId::new("alice");
        let bob = TenantId::new("bob");
        f.controller.start(&alice).await.unwrap();
        f.controller.start(&bob).await.unwrap();
        tokio::time::sleep(ms(20)).await;

        f.controller.disconnect(&alice).await;
        assert_eq!(f.controller.state(&alice), ConnectionState::Offline);
        assert_eq!(f.controller.state(&bob), ConnectionState::Connected);
        assert_eq!(f.controller.tenants(), vec![bob.clone()]);

        f.controller.shutdown().await;
        assert!(f.controller.tenants().is_empty());
        assert_eq!(f.controller.state(&bob), ConnectionState::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_releases_tenant() {
        let f = fixture(Script::new().opened_at(ms(10)));
        let alice = TenantId::new("alice");
        f.transport.push_script(
            &alice,
            Script::new().opened_at(ms(10)).closed_at(ms(50), CloseReason::LoggedOut),
        );

        f.controller.start(&alice).await.unwrap();
        tokio::time::sleep(ms(100)).await;
        assert_eq!(f.controller.snapshot(&alice).last_close, Some(CloseReason::LoggedOut));
        assert_eq!(f.controller.snapshot(&alice).attempt, 1);

        f.controller.disconnect(&alice).await;
        let snapshot = f.controller.snapshot(&alice);
        assert_eq!(snapshot.attempt, 0);
        assert!(snapshot.last_close.is_none());
        assert!(f.controller.inner.registry.storage_gate(&alice).is_none());

        // A restart keeps the slot; the next start counts from scratch
        let handle = f.controller.start(&alice).await.unwrap();
        assert_eq!(handle.attempt(), 1);
        tokio::time::sleep(ms(20)).await;
        f.controller.restart(&alice).await.unwrap();
        assert_eq!(f.controller.snapshot(&alice).attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_of_unknown_tenant_is_offline() {
        let f = fixture(Script::new());
        let ghost = TenantId::new("ghost");
        let snapshot = f.controller.snapshot(&ghost);
        assert_eq!(snapshot.state, ConnectionState::Offline);
        assert!(!snapshot.alive);
        assert_eq!(snapshot.attempt, 0);
    }
}
