//! pairgate Server - Axum-based HTTP API
//!
//! This crate exposes the session lifecycle over HTTP: connect, QR retrieval,
//! status and the administrative operations.

pub mod cors;
pub mod error;
pub mod http;
pub mod qr;
pub mod state;

pub use cors::OriginPolicy;
pub use error::ApiError;
pub use http::create_router;
pub use state::AppState;
