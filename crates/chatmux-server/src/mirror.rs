//! Status mirror adapters and the worker that feeds them.
//!
//! Status changes are pushed in commit order onto an unbounded channel; a
//! single worker drains it and calls the mirror. Mirror failures are logged
//! and never reach the manager.

use async_trait::async_trait;
use chatmux_core::{ConnectionStatus, SessionError, SessionResult, StatusChange, StatusMirror};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Spawn the mirror worker and return the sender the manager writes to.
pub fn spawn_worker(mirror: Arc<dyn StatusMirror>) -> mpsc::UnboundedSender<StatusChange> {
    let (tx, mut rx) = mpsc::unbounded_channel::<StatusChange>();
    tokio::spawn(async move {
        while let Some(change) = rx.recv().await {
            if let Err(e) = mirror.update(&change.session_id, change.status).await {
                warn!(
                    session_id = %change.session_id,
                    status = %change.status,
                    error = %e,
                    "status mirror update failed"
                );
            }
        }
        debug!("status mirror worker stopped");
    });
    tx
}

/// Mirror that only logs. Used when no external record store is configured.
pub struct LogMirror;

#[async_trait]
impl StatusMirror for LogMirror {
    async fn update(&self, session_id: &str, status: ConnectionStatus) -> SessionResult<()> {
        info!(session_id, status = %status, "session status");
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody<'a> {
    session_id: &'a str,
    status: ConnectionStatus,
}

/// POSTs `{sessionId, status}` as JSON to a fixed URL.
pub struct HttpMirror {
    client: reqwest::Client,
    url: String,
}

impl HttpMirror {
    pub fn new(url: impl Into<String>, timeout: Duration) -> SessionResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SessionError::Mirror(format!("http client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl StatusMirror for HttpMirror {
    async fn update(&self, session_id: &str, status: ConnectionStatus) -> SessionResult<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(&StatusBody { session_id, status })
            .send()
            .await
            .map_err(|e| SessionError::Mirror(format!("POST {}: {e}", self.url)))?;

        if !resp.status().is_success() {
            return Err(SessionError::Mirror(format!(
                "POST {} returned {}",
                self.url,
                resp.status()
            )));
        }
        Ok(())
    }
}

/// Mirror that records every update, for tests.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingMirror {
    updates: std::sync::Mutex<Vec<StatusChange>>,
    fail_first: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl RecordingMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` updates before recording anything.
    pub fn failing(n: usize) -> Self {
        Self {
            fail_first: std::sync::atomic::AtomicUsize::new(n),
            ..Self::default()
        }
    }

    pub fn statuses(&self, session_id: &str) -> Vec<ConnectionStatus> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.session_id == session_id)
            .map(|c| c.status)
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl StatusMirror for RecordingMirror {
    async fn update(&self, session_id: &str, status: ConnectionStatus) -> SessionResult<()> {
        use std::sync::atomic::Ordering;
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(SessionError::Mirror("record store unavailable".into()));
        }
        self.updates
            .lock()
            .unwrap()
            .push(StatusChange::new(session_id, status));
        Ok(())
    }
}
