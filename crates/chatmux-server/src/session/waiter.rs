//! Caller-side wait for a session to either need a login code or connect.

use super::manager::{ConnectionManager, StartOutcome};
use chatmux_core::{ConnectionStatus, SessionResult, StatusSnapshot};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

pub const DEFAULT_LOGIN_WAIT: Duration = Duration::from_secs(90);

/// How far a login got before the wait resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum LoginProgress {
    Connected {
        jid: Option<String>,
        name: Option<String>,
    },
    QrReady {
        code: String,
    },
    /// The record was removed or errored before it became usable.
    Failed {
        status: ConnectionStatus,
    },
    StillConnecting,
}

impl LoginProgress {
    fn from_snapshot(snap: StatusSnapshot) -> Option<Self> {
        match snap.status {
            ConnectionStatus::Connected => Some(LoginProgress::Connected {
                jid: snap.jid,
                name: snap.name,
            }),
            ConnectionStatus::QrReady => snap.pending_qr.map(|code| LoginProgress::QrReady { code }),
            ConnectionStatus::Disconnected | ConnectionStatus::Error => {
                Some(LoginProgress::Failed { status: snap.status })
            }
            ConnectionStatus::Connecting => None,
        }
    }
}

/// Start `session_id` and wait up to `timeout` for it to produce a login code
/// or connect.
pub async fn await_login(
    manager: &Arc<ConnectionManager>,
    session_id: &str,
    timeout: Duration,
) -> SessionResult<LoginProgress> {
    // Subscribe before starting so no transition is missed.
    let mut changes = manager.subscribe();
    let outcome = manager.start(session_id, None).await?;
    if let StartOutcome::Existing(_) = outcome {
        return Ok(LoginProgress::from_snapshot(manager.status(session_id).await)
            .unwrap_or(LoginProgress::StillConnecting));
    }
    if let Some(progress) = LoginProgress::from_snapshot(manager.status(session_id).await) {
        return Ok(progress);
    }

    let wait = async {
        loop {
            match changes.recv().await {
                Ok(change) if change.session_id == session_id => {
                    if change.status == ConnectionStatus::Connecting {
                        continue;
                    }
                    let snap = manager.status(session_id).await;
                    if let Some(progress) = LoginProgress::from_snapshot(snap) {
                        return progress;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(session_id, skipped, "login wait lagged, re-reading status");
                    if let Some(progress) =
                        LoginProgress::from_snapshot(manager.status(session_id).await)
                    {
                        return progress;
                    }
                }
                Err(RecvError::Closed) => return LoginProgress::StillConnecting,
            }
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(progress) => Ok(progress),
        Err(_) => {
            debug!(session_id, timeout_secs = timeout.as_secs(), "login wait timed out");
            Ok(LoginProgress::StillConnecting)
        }
    }
}
