//! pairgate Core - Shared types and error definitions
//!
//! This crate provides the foundational types used across all pairgate components.

pub mod config;
pub mod error;
pub mod state;
pub mod tenant;

pub use config::Config;
pub use error::{Error, Result};
pub use state::{CloseReason, ConnectionState, StopReason};
pub use tenant::TenantId;
