//! HTTP request handlers
//!
//! Session endpoints take the tenant from the `tenant` query parameter (or the
//! legacy `userId`); administrative endpoints take it from a JSON body.

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{header, request::Parts, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use pairgate_core::{CloseReason, ConnectionState, Error, TenantId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::qr;
use crate::state::AppState;

type ApiResult<T> = Result<T, ApiError>;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        // Session API
        .route("/api/connect", get(connect_handler))
        .route("/api/qr", get(qr_handler))
        .route("/api/status", get(status_handler))
        .route("/api/send", post(send_handler))
        // Administrative API
        .route("/api/restart", post(restart_handler))
        .route("/api/wipe", post(wipe_handler))
        .route("/api/disconnect", post(disconnect_handler))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ));

    Router::new()
        .route("/", get(index_handler))
        .route("/healthz", get(health_handler))
        .merge(api)
        .layer(cors_layer(&state))
        .with_state(state)
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let origins = state.origins.clone();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _parts: &Parts| origins.allows_header(origin),
        ))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("apikey"),
            HeaderName::from_static("prefer"),
        ])
}

/// Plain-text banner
async fn index_handler(State(state): State<Arc<AppState>>) -> String {
    format!("{} v{} online", state.service, env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub timestamp: DateTime<Utc>,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        timestamp: Utc::now(),
    })
}

/// Tenant selector for the session endpoints
#[derive(Debug, Deserialize)]
pub struct TenantQuery {
    #[serde(alias = "userId")]
    tenant: Option<String>,
}

impl TenantQuery {
    fn tenant(&self) -> ApiResult<TenantId> {
        Ok(TenantId::parse(self.tenant.as_deref())?)
    }
}

// ============================================================================
// Session API Handlers
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub ok: bool,
    pub started: bool,
    pub tenant: TenantId,
    pub attempt: u64,
}

/// Start (or confirm) the tenant's session
async fn connect_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Json<ConnectResponse>> {
    let tenant = query.tenant()?;
    let handle = state.controller.start(&tenant).await?;

    Ok(Json(ConnectResponse {
        ok: true,
        started: true,
        tenant,
        attempt: handle.attempt(),
    }))
}

/// Response for QR retrieval
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrResponse {
    pub ok: bool,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    /// PNG data URL of the artifact
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
    /// Seconds remaining until the artifact expires
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<DateTime<Utc>>,
}

/// Start the session if needed, then wait briefly for a QR or a connection
///
/// Answers `connected`, `qr` with the artifact, or 404 `offline` when neither
/// shows up within the artifact wait timeout.
async fn qr_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Response> {
    let tenant = query.tenant()?;
    let controller = &state.controller;
    controller.start(&tenant).await?;

    let current = controller
        .wait_for_artifact_or_connection(&tenant, state.config.artifact_wait_timeout)
        .await;
    let artifact = match current {
        ConnectionState::Connected => {
            return Ok(Json(QrResponse {
                ok: true,
                status: "connected",
                ..QrResponse::default()
            })
            .into_response());
        }
        ConnectionState::AwaitingScan => controller.artifact(&tenant),
        _ => None,
    };

    let Some(artifact) = artifact else {
        debug!("Tenant {}: no pairing artifact available ({})", tenant, current);
        let body = QrResponse {
            ok: false,
            status: "offline",
            ..QrResponse::default()
        };
        return Ok((StatusCode::NOT_FOUND, Json(body)).into_response());
    };

    let image = match qr::data_url(&artifact.payload) {
        Ok(url) => Some(url),
        Err(e) => {
            warn!("Tenant {}: failed to render QR code: {}", tenant, e);
            None
        }
    };

    Ok(Json(QrResponse {
        ok: true,
        status: "qr",
        qr: image,
        ttl_seconds: Some(artifact.ttl_seconds()),
        expires_in: Some(artifact.remaining().as_secs()),
        issued_at: Some(artifact.issued_at),
        artifact: Some(artifact.payload),
    })
    .into_response())
}

/// Response for status checks
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub ok: bool,
    pub service: String,
    pub tenant: TenantId,
    /// One of `connected`, `qr`, `reconnecting`, `offline`
    pub status: &'static str,
    pub alive: bool,
    pub attempt: u64,
    pub last_close: Option<CloseReason>,
    pub timestamp: DateTime<Utc>,
}

/// Report the tenant's state without side effects
async fn status_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Json<StatusResponse>> {
    let tenant = query.tenant()?;
    let snapshot = state.controller.snapshot(&tenant);

    Ok(Json(StatusResponse {
        ok: true,
        service: state.service.clone(),
        tenant,
        status: snapshot.state.as_api_status(),
        alive: snapshot.alive,
        attempt: snapshot.attempt,
        last_close: snapshot.last_close,
        timestamp: Utc::now(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    #[serde(alias = "userId")]
    tenant: Option<String>,
    to: String,
    message: String,
}

/// Deliver a text message; requires a connected session
async fn send_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SendRequest>, JsonRejection>,
) -> ApiResult<Json<ActionResponse>> {
    let Json(request) = payload.map_err(|rejection| Error::InvalidRequest(rejection.body_text()))?;
    let tenant = TenantId::parse(request.tenant.as_deref())?;
    state
        .controller
        .send_text(&tenant, &request.to, &request.message)
        .await?;
    debug!("Tenant {}: message sent to {}", tenant, request.to);
    Ok(Json(ActionResponse::new(tenant, "send")))
}

// ============================================================================
// Administrative Handlers
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TenantRequest {
    #[serde(alias = "userId")]
    tenant: Option<String>,
}

impl TenantRequest {
    /// A missing or unreadable body carries no tenant
    fn tenant_of(payload: Option<Json<Self>>) -> ApiResult<TenantId> {
        let tenant = payload.and_then(|Json(request)| request.tenant);
        Ok(TenantId::parse(tenant.as_deref())?)
    }
}

/// Outcome of an operation on a tenant
#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub ok: bool,
    pub tenant: TenantId,
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u64>,
}

impl ActionResponse {
    fn new(tenant: TenantId, action: &'static str) -> Self {
        Self {
            ok: true,
            tenant,
            action,
            attempt: None,
        }
    }

    fn with_attempt(mut self, attempt: u64) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

async fn restart_handler(
    State(state): State<Arc<AppState>>,
    payload: Option<Json<TenantRequest>>,
) -> ApiResult<Json<ActionResponse>> {
    let tenant = TenantRequest::tenant_of(payload)?;
    let handle = state.controller.restart(&tenant).await?;
    info!("Tenant {}: restarted (attempt {})", tenant, handle.attempt());
    Ok(Json(ActionResponse::new(tenant, "restart").with_attempt(handle.attempt())))
}

async fn wipe_handler(
    State(state): State<Arc<AppState>>,
    payload: Option<Json<TenantRequest>>,
) -> ApiResult<Json<ActionResponse>> {
    let tenant = TenantRequest::tenant_of(payload)?;
    let handle = state.controller.wipe(&tenant).await?;
    info!("Tenant {}: wiped (attempt {})", tenant, handle.attempt());
    Ok(Json(ActionResponse::new(tenant, "wipe").with_attempt(handle.attempt())))
}

async fn disconnect_handler(
    State(state): State<Arc<AppState>>,
    payload: Option<Json<TenantRequest>>,
) -> ApiResult<Json<ActionResponse>> {
    let tenant = TenantRequest::tenant_of(payload)?;
    state.controller.disconnect(&tenant).await;
    Ok(Json(ActionResponse::new(tenant, "disconnect")))
}
