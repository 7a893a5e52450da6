//! Scriptable in-process transport for tests.

use async_trait::async_trait;
use chatmux_core::{
    CredentialMaterial, EventSink, ProtocolTransport, SessionError, SessionResult, TransportEvent,
    TransportHandle,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct MockHandle {
    ended: AtomicBool,
    end_delay: Duration,
    sent: Mutex<Vec<Value>>,
}

impl MockHandle {
    fn new(end_delay: Duration) -> Self {
        Self {
            ended: AtomicBool::new(false),
            end_delay,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportHandle for MockHandle {
    async fn send(&self, payload: Value) -> SessionResult<Value> {
        if self.is_ended() {
            return Err(SessionError::Transport("connection ended".into()));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(payload);
        Ok(json!({ "status": "sent", "seq": sent.len() }))
    }

    async fn end(&self) -> SessionResult<()> {
        if !self.end_delay.is_zero() {
            tokio::time::sleep(self.end_delay).await;
        }
        self.ended.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct Opened {
    session_id: String,
    credentials: CredentialMaterial,
    sink: EventSink,
    handle: Arc<MockHandle>,
}

#[derive(Default)]
struct MockState {
    opened: Vec<Opened>,
    fail_opens: bool,
    open_delay: Duration,
    end_delay: Duration,
    script: Vec<TransportEvent>,
}

/// Records every open and lets tests push events into a connection.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_opens(&self, fail: bool) {
        self.state.lock().unwrap().fail_opens = fail;
    }

    /// Make each open take `delay` on the tokio clock.
    pub fn set_open_delay(&self, delay: Duration) {
        self.state.lock().unwrap().open_delay = delay;
    }

    /// Make `end` on handles opened from now on take `delay`.
    pub fn set_end_delay(&self, delay: Duration) {
        self.state.lock().unwrap().end_delay = delay;
    }

    /// Events emitted by every subsequent open right after it succeeds.
    pub fn set_open_script(&self, events: Vec<TransportEvent>) {
        self.state.lock().unwrap().script = events;
    }

    pub fn open_count(&self, session_id: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.opened.iter().filter(|o| o.session_id == session_id).count()
    }

    /// Emit on the session's most recent connection.
    pub fn emit(&self, session_id: &str, event: TransportEvent) -> bool {
        let state = self.state.lock().unwrap();
        state
            .opened
            .iter()
            .rev()
            .find(|o| o.session_id == session_id)
            .is_some_and(|o| o.sink.emit(event))
    }

    /// Emit on the session's `index`-th connection (0 = first).
    pub fn emit_to(&self, session_id: &str, index: usize, event: TransportEvent) -> bool {
        let state = self.state.lock().unwrap();
        state
            .opened
            .iter()
            .filter(|o| o.session_id == session_id)
            .nth(index)
            .is_some_and(|o| o.sink.emit(event))
    }

    pub fn latest(&self, session_id: &str) -> Option<Arc<MockHandle>> {
        let state = self.state.lock().unwrap();
        state
            .opened
            .iter()
            .rev()
            .find(|o| o.session_id == session_id)
            .map(|o| o.handle.clone())
    }

    pub fn last_credentials(&self, session_id: &str) -> Option<CredentialMaterial> {
        let state = self.state.lock().unwrap();
        state
            .opened
            .iter()
            .rev()
            .find(|o| o.session_id == session_id)
            .map(|o| o.credentials.clone())
    }
}

#[async_trait]
impl ProtocolTransport for MockTransport {
    async fn open(
        &self,
        session_id: &str,
        credentials: CredentialMaterial,
        events: EventSink,
    ) -> SessionResult<Arc<dyn TransportHandle>> {
        let delay = self.state.lock().unwrap().open_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if state.fail_opens {
            return Err(SessionError::TransportInit("mock transport unavailable".into()));
        }
        for event in &state.script {
            events.emit(event.clone());
        }
        let handle = Arc::new(MockHandle::new(state.end_delay));
        state.opened.push(Opened {
            session_id: session_id.to_string(),
            credentials,
            sink: events,
            handle: handle.clone(),
        });
        Ok(handle)
    }
}
