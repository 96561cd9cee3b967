//! Scripted in-process transport
//!
//! Replays a timed list of events per connection attempt and records every
//! call made against it. Tests queue one [`Script`] per expected attempt; the
//! binary uses it as a demo transport that issues a QR payload and reports the
//! device as paired after a delay.

use crate::credentials::Credentials;
use crate::transport::{OpenedTransport, Transport, TransportConnection, TransportError, TransportEvent};
use async_trait::async_trait;
use pairgate_core::{CloseReason, TenantId};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// A single scripted action, relative to the moment `open` returned
#[derive(Debug, Clone)]
enum Step {
    Emit(TransportEvent),
    /// Die without emitting `Closed`, as a crashed socket would
    GoSilent,
}

/// Behaviour of one connection attempt
#[derive(Debug, Clone, Default)]
pub struct Script {
    open_delay: Duration,
    failure: Option<String>,
    logout_failure: Option<String>,
    close_hangs: bool,
    steps: Vec<(Duration, Step)>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// An attempt whose `open` fails
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::default()
        }
    }

    /// Make `open` itself take this long
    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Make `logout` on this attempt's connection fail
    pub fn failing_logout(mut self, message: impl Into<String>) -> Self {
        self.logout_failure = Some(message.into());
        self
    }

    /// Make `close` on this attempt's connection never return
    pub fn hanging_close(mut self) -> Self {
        self.close_hangs = true;
        self
    }

    pub fn artifact_at(self, at: Duration, payload: impl Into<String>) -> Self {
        self.emit_at(at, TransportEvent::Artifact(payload.into()))
    }

    pub fn opened_at(self, at: Duration) -> Self {
        self.emit_at(at, TransportEvent::Opened)
    }

    pub fn closed_at(self, at: Duration, reason: CloseReason) -> Self {
        self.emit_at(at, TransportEvent::Closed(reason))
    }

    pub fn credentials_changed_at(self, at: Duration) -> Self {
        self.emit_at(at, TransportEvent::CredentialsChanged)
    }

    /// Stop being live at `at` without ever reporting a close
    pub fn silent_death_at(mut self, at: Duration) -> Self {
        self.steps.push((at, Step::GoSilent));
        self
    }

    fn emit_at(mut self, at: Duration, event: TransportEvent) -> Self {
        self.steps.push((at, Step::Emit(event)));
        self
    }
}

/// Calls recorded by the scripted transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Open(TenantId),
    Logout(TenantId),
    Close(TenantId),
    Send { tenant: TenantId, to: String, text: String },
}

type ScriptFactory = Box<dyn Fn(&TenantId) -> Script + Send + Sync>;

#[derive(Default)]
struct ConnState {
    live: AtomicBool,
    closed: AtomicBool,
}

/// [`Transport`] driven by scripts
pub struct ScriptedTransport {
    queued: Mutex<HashMap<TenantId, VecDeque<Script>>>,
    fallback: ScriptFactory,
    calls: Arc<Mutex<Vec<TransportCall>>>,
    connections: Mutex<HashMap<TenantId, Vec<Arc<ConnState>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedTransport {
    /// Attempts without a queued script use `fallback`
    pub fn new(fallback: Script) -> Self {
        Self::with_factory(move |_| fallback.clone())
    }

    /// Attempts without a queued script are built by `factory`
    pub fn with_factory(factory: impl Fn(&TenantId) -> Script + Send + Sync + 'static) -> Self {
        Self {
            queued: Mutex::new(HashMap::new()),
            fallback: Box::new(factory),
            calls: Arc::new(Mutex::new(Vec::new())),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Demo behaviour: a fresh QR payload every `refresh`, paired after `scan_delay`
    pub fn demo(scan_delay: Duration, refresh: Duration) -> Self {
        Self::with_factory(move |tenant| {
            let mut script = Script::new().credentials_changed_at(Duration::ZERO);
            let mut at = Duration::ZERO;
            while at < scan_delay {
                let payload = format!("pairgate:{}:{}", tenant, uuid::Uuid::new_v4());
                script = script.artifact_at(at, payload);
                at += refresh;
            }
            script.opened_at(scan_delay)
        })
    }

    /// Queue the script for the next attempt of `tenant`
    pub fn push_script(&self, tenant: &TenantId, script: Script) {
        lock(&self.queued)
            .entry(tenant.clone())
            .or_default()
            .push_back(script);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.calls).clone()
    }

    pub fn open_count(&self, tenant: &TenantId) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| matches!(call, TransportCall::Open(t) if t == tenant))
            .count()
    }

    /// Silently kill the most recent connection of `tenant`
    pub fn kill(&self, tenant: &TenantId) {
        if let Some(state) = lock(&self.connections).get(tenant).and_then(|c| c.last()) {
            state.live.store(false, Ordering::SeqCst);
        }
    }

    fn next_script(&self, tenant: &TenantId) -> Script {
        let queued = lock(&self.queued)
            .get_mut(tenant)
            .and_then(VecDeque::pop_front);
        queued.unwrap_or_else(|| (self.fallback)(tenant))
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(
        &self,
        tenant: &TenantId,
        credentials: Credentials,
    ) -> Result<OpenedTransport, TransportError> {
        lock(&self.calls).push(TransportCall::Open(tenant.clone()));
        let script = self.next_script(tenant);

        if !script.open_delay.is_zero() {
            tokio::time::sleep(script.open_delay).await;
        }
        if let Some(message) = script.failure {
            return Err(TransportError::Unreachable(message));
        }

        let state = Arc::new(ConnState::default());
        state.live.store(true, Ordering::SeqCst);
        lock(&self.connections)
            .entry(tenant.clone())
            .or_default()
            .push(state.clone());

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(play(
            tenant.clone(),
            script.steps,
            state.clone(),
            credentials,
            tx,
        ));

        Ok(OpenedTransport {
            connection: Box::new(ScriptedConnection {
                tenant: tenant.clone(),
                state,
                calls: self.calls.clone(),
                logout_failure: script.logout_failure,
                close_hangs: script.close_hangs,
            }),
            events: rx,
        })
    }
}

async fn play(
    tenant: TenantId,
    mut steps: Vec<(Duration, Step)>,
    state: Arc<ConnState>,
    credentials: Credentials,
    tx: mpsc::Sender<TransportEvent>,
) {
    steps.sort_by_key(|(at, _)| *at);
    let started = Instant::now();
    let mut revision = 0u64;

    for (at, step) in steps {
        tokio::time::sleep_until(started + at).await;
        if state.closed.load(Ordering::SeqCst) || !state.live.load(Ordering::SeqCst) {
            break;
        }
        match step {
            Step::GoSilent => {
                debug!("Scripted connection for {} died silently", tenant);
                state.live.store(false, Ordering::SeqCst);
                break;
            }
            Step::Emit(event) => {
                match &event {
                    TransportEvent::Closed(_) => state.live.store(false, Ordering::SeqCst),
                    TransportEvent::CredentialsChanged => {
                        revision += 1;
                        credentials.update(|doc| {
                            *doc = json!({ "tenant": tenant.as_str(), "revision": revision });
                        });
                    }
                    _ => {}
                }
                let terminal = matches!(event, TransportEvent::Closed(_));
                if tx.send(event).await.is_err() || terminal {
                    break;
                }
            }
        }
    }
}

struct ScriptedConnection {
    tenant: TenantId,
    state: Arc<ConnState>,
    calls: Arc<Mutex<Vec<TransportCall>>>,
    logout_failure: Option<String>,
    close_hangs: bool,
}

#[async_trait]
impl TransportConnection for ScriptedConnection {
    fn is_live(&self) -> bool {
        self.state.live.load(Ordering::SeqCst)
    }

    async fn logout(&self) -> Result<(), TransportError> {
        lock(&self.calls).push(TransportCall::Logout(self.tenant.clone()));
        if let Some(message) = &self.logout_failure {
            return Err(TransportError::Unreachable(message.clone()));
        }
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        lock(&self.calls).push(TransportCall::Close(self.tenant.clone()));
        if self.close_hangs {
            std::future::pending::<()>().await;
        }
        self.state.live.store(false, Ordering::SeqCst);
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_text(&self, to: &str, text: &str) -> Result<(), TransportError> {
        if !self.is_live() {
            return Err(TransportError::Closed);
        }
        lock(&self.calls).push(TransportCall::Send {
            tenant: self.tenant.clone(),
            to: to.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }
}
