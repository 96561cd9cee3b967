//! Connection state and close/stop reasons shared by the controller and the API

use serde::{Deserialize, Serialize};
use std::fmt;

/// Derived per-tenant connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Offline,
    /// A handle is registered (or opening) but has neither connected nor issued an artifact
    Starting,
    /// Not connected, with a non-expired pairing artifact outstanding
    AwaitingScan,
    Connected,
    /// Between a non-terminal close and the next start
    Reconnecting,
}

impl ConnectionState {
    /// Value reported by the status endpoint
    pub fn as_api_status(&self) -> &'static str {
        match self {
            ConnectionState::Connected => "connected",
            ConnectionState::AwaitingScan => "qr",
            ConnectionState::Starting | ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Offline => "offline",
        }
    }

    /// Whether a bounded wait for an artifact should keep polling
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ConnectionState::Starting | ConnectionState::Reconnecting | ConnectionState::Offline
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Offline => "offline",
            ConnectionState::Starting => "starting",
            ConnectionState::AwaitingScan => "awaiting_scan",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Normalized reason attached to a transport close event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    LoggedOut,
    Forbidden,
    ConnectionLost,
    ConnectionClosed,
    ConnectionReplaced,
    BadSession,
    ServiceUnavailable,
    RestartRequired,
    Other(u16),
}

impl CloseReason {
    /// Map a transport status code to a close reason
    pub fn from_code(code: u16) -> Self {
        match code {
            401 => CloseReason::LoggedOut,
            403 => CloseReason::Forbidden,
            408 => CloseReason::ConnectionLost,
            428 => CloseReason::ConnectionClosed,
            440 => CloseReason::ConnectionReplaced,
            500 => CloseReason::BadSession,
            503 => CloseReason::ServiceUnavailable,
            515 => CloseReason::RestartRequired,
            other => CloseReason::Other(other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            CloseReason::LoggedOut => 401,
            CloseReason::Forbidden => 403,
            CloseReason::ConnectionLost => 408,
            CloseReason::ConnectionClosed => 428,
            CloseReason::ConnectionReplaced => 440,
            CloseReason::BadSession => 500,
            CloseReason::ServiceUnavailable => 503,
            CloseReason::RestartRequired => 515,
            CloseReason::Other(code) => *code,
        }
    }

    /// The stored credential is permanently invalid; only a wipe recovers
    pub fn is_terminal(&self) -> bool {
        matches!(self, CloseReason::LoggedOut | CloseReason::Forbidden)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::LoggedOut => "logged_out",
            CloseReason::Forbidden => "forbidden",
            CloseReason::ConnectionLost => "connection_lost",
            CloseReason::ConnectionClosed => "connection_closed",
            CloseReason::ConnectionReplaced => "connection_replaced",
            CloseReason::BadSession => "bad_session",
            CloseReason::ServiceUnavailable => "service_unavailable",
            CloseReason::RestartRequired => "restart_required",
            CloseReason::Other(code) => return write!(f, "other({})", code),
        };
        f.write_str(s)
    }
}

/// Why an administrative stop was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Restart,
    Wipe,
    Disconnect,
    Shutdown,
}

impl StopReason {
    /// Only a wipe unlinks the device
    pub fn logs_out(&self) -> bool {
        matches!(self, StopReason::Wipe)
    }

    /// The tenant is not coming back; its registry slot and last close are dropped
    pub fn releases_tenant(&self) -> bool {
        matches!(self, StopReason::Disconnect | StopReason::Shutdown)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Restart => "restart",
            StopReason::Wipe => "wipe",
            StopReason::Disconnect => "disconnect",
            StopReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}
