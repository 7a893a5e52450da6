//! Connection status and the public-facing shapes reported for sessions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one session's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    /// Transport is opening, or a reconnect is waiting out its backoff.
    Connecting,
    /// A login code is waiting to be scanned.
    QrReady,
    Connected,
    Disconnected,
    /// The last background open attempt failed.
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::QrReady => "qrReady",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account identity reported by the transport once the connection opens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub jid: Option<String>,
    pub name: Option<String>,
}

/// Answer to a status query. Unknown sessions get [`StatusSnapshot::unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub status: ConnectionStatus,
    pub pending_qr: Option<String>,
    pub jid: Option<String>,
    pub name: Option<String>,
    pub is_ready: bool,
}

impl StatusSnapshot {
    pub fn unknown() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            pending_qr: None,
            jid: None,
            name: None,
            is_ready: false,
        }
    }
}

/// One entry of the active-session listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub status: ConnectionStatus,
    pub has_qr: bool,
    pub is_ready: bool,
    /// Seconds since the current connecting attempt began.
    pub age_secs: u64,
    pub reconnect_attempts: u32,
}

/// Aggregate counts over the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCounts {
    pub total: usize,
    pub connected: usize,
    pub connecting: usize,
    pub qr_ready: usize,
}

/// A committed status transition, as sent to the status mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub session_id: String,
    pub status: ConnectionStatus,
}

impl StatusChange {
    pub fn new(session_id: impl Into<String>, status: ConnectionStatus) -> Self {
        Self {
            session_id: session_id.into(),
            status,
        }
    }
}
