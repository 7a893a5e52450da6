//! Delayed-task queue for reconnects.
//!
//! Each scheduled entry sleeps on the tokio clock and then delivers a
//! [`ReconnectDue`] to the manager's driver. Because it runs on tokio time,
//! tests can drive it with a paused clock.
//!
//! Operations never await, so the manager calls them while it still holds the
//! registry lock for the transition that created or removed the timer.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// A reconnect whose backoff has elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectDue {
    pub session_id: String,
    /// Epoch of the record when the reconnect was scheduled.
    pub epoch: u64,
}

pub struct ReconnectScheduler {
    due_tx: mpsc::UnboundedSender<ReconnectDue>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ReconnectScheduler {
    /// Create a scheduler and the receiver that yields due reconnects.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ReconnectDue>) {
        let (due_tx, due_rx) = mpsc::unbounded_channel();
        (
            Self {
                due_tx,
                timers: Mutex::new(HashMap::new()),
            },
            due_rx,
        )
    }

    /// Schedule a reconnect for `session_id` after `delay`, replacing any
    /// timer already pending for it.
    pub fn schedule(&self, session_id: &str, epoch: u64, delay: Duration) {
        let due = ReconnectDue {
            session_id: session_id.to_string(),
            epoch,
        };
        let tx = self.due_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(due);
        });

        let mut timers = self.timers();
        if let Some(previous) = timers.insert(session_id.to_string(), timer) {
            previous.abort();
        }
        debug!(session_id, epoch, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
    }

    /// Drop the pending timer for a session, if any.
    pub fn cancel(&self, session_id: &str) -> bool {
        let mut timers = self.timers();
        match timers.remove(session_id) {
            Some(timer) => {
                let pending = !timer.is_finished();
                timer.abort();
                pending
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let mut timers = self.timers();
        for (_, timer) in timers.drain() {
            timer.abort();
        }
    }

    /// Number of timers that have not fired yet.
    pub fn pending(&self) -> usize {
        self.timers().values().filter(|t| !t.is_finished()).count()
    }

    /// Timers tracked per session, fired or not.
    #[cfg(test)]
    pub fn tracked(&self) -> usize {
        self.timers().len()
    }

    // Every mutation is a single insert or remove, so a poisoned map is intact.
    fn timers(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
