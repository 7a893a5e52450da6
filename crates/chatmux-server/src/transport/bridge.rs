//! WebSocket bridge to a protocol sidecar.
//!
//! The chat protocol library runs out of process. Each connection attempt opens
//! one WebSocket to the sidecar and exchanges JSON text frames tagged by `type`:
//!
//! - out: `hello {sessionId, credentials}`, `send {requestId, payload}`, `end`
//! - in: `qr {code}`, `connecting`, `open {jid, name}`,
//!   `close {code, reason, loggedOut?}`, `creds {material}`,
//!   `sent {requestId, result}`, `failed {requestId, message}`
//!
//! Losing the socket without a `close` frame is reported as a transient close.

use async_trait::async_trait;
use chatmux_core::{
    AccountInfo, CloseCause, CredentialMaterial, EventSink, ProtocolTransport, SessionError,
    SessionResult, TransportEvent, TransportHandle,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = Arc<Mutex<SplitSink<WsStream, Message>>>;
type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<SessionResult<Value>>>>>;

/// Frames sent to the sidecar.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Outgoing<'a> {
    #[serde(rename_all = "camelCase")]
    Hello {
        session_id: &'a str,
        credentials: &'a CredentialMaterial,
    },
    #[serde(rename = "send", rename_all = "camelCase")]
    Request { request_id: u64, payload: &'a Value },
    End,
}

/// Frames received from the sidecar.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Incoming {
    Qr {
        code: String,
    },
    Connecting,
    Open {
        #[serde(default)]
        jid: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Close {
        #[serde(default)]
        code: Option<u16>,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        logged_out: Option<bool>,
    },
    Creds {
        material: Value,
    },
    #[serde(rename_all = "camelCase")]
    Sent {
        request_id: u64,
        #[serde(default)]
        result: Value,
    },
    #[serde(rename_all = "camelCase")]
    Failed { request_id: u64, message: String },
}

/// A decoded inbound frame.
#[derive(Debug, PartialEq)]
enum Inbound {
    Event(TransportEvent),
    Reply { request_id: u64, result: Result<Value, String> },
}

fn encode(frame: &Outgoing<'_>) -> SessionResult<String> {
    Ok(serde_json::to_string(frame)?)
}

fn decode(text: &str) -> SessionResult<Inbound> {
    let frame: Incoming = serde_json::from_str(text)?;
    Ok(match frame {
        Incoming::Qr { code } => Inbound::Event(TransportEvent::Qr(code)),
        Incoming::Connecting => Inbound::Event(TransportEvent::Connecting),
        Incoming::Open { jid, name } => {
            Inbound::Event(TransportEvent::Open(AccountInfo { jid, name }))
        }
        Incoming::Close {
            code,
            reason,
            logged_out,
        } => Inbound::Event(TransportEvent::Close(CloseCause {
            code,
            reason,
            logged_out,
        })),
        Incoming::Creds { material } => {
            Inbound::Event(TransportEvent::CredentialsUpdated(CredentialMaterial(material)))
        }
        Incoming::Sent { request_id, result } => Inbound::Reply {
            request_id,
            result: Ok(result),
        },
        Incoming::Failed {
            request_id,
            message,
        } => Inbound::Reply {
            request_id,
            result: Err(message),
        },
    })
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Sidecar WebSocket URL, e.g. `ws://127.0.0.1:8787/session`.
    pub url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

/// [`ProtocolTransport`] that talks to the sidecar over WebSocket.
pub struct BridgeTransport {
    config: BridgeConfig,
}

impl BridgeTransport {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ProtocolTransport for BridgeTransport {
    async fn open(
        &self,
        session_id: &str,
        credentials: CredentialMaterial,
        events: EventSink,
    ) -> SessionResult<Arc<dyn TransportHandle>> {
        let (ws_stream, _response) =
            tokio::time::timeout(self.config.connect_timeout, connect_async(self.config.url.as_str()))
                .await
                .map_err(|_| {
                    SessionError::TransportInit(format!(
                        "bridge connect to {} timed out",
                        self.config.url
                    ))
                })?
                .map_err(|e| SessionError::TransportInit(format!("bridge connect error: {e}")))?;

        debug!(session_id, url = %self.config.url, "bridge connected");
        let (mut ws_sink, ws_read) = ws_stream.split();

        let hello = encode(&Outgoing::Hello {
            session_id,
            credentials: &credentials,
        })?;
        ws_sink
            .send(Message::Text(hello.into()))
            .await
            .map_err(|e| SessionError::TransportInit(format!("bridge hello failed: {e}")))?;

        let sink: WsSink = Arc::new(Mutex::new(ws_sink));
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let ended = Arc::new(AtomicBool::new(false));

        tokio::spawn(dispatch_loop(
            session_id.to_string(),
            ws_read,
            sink.clone(),
            events,
            pending.clone(),
            ended.clone(),
        ));

        Ok(Arc::new(BridgeHandle {
            session_id: session_id.to_string(),
            sink,
            pending,
            next_request: AtomicU64::new(1),
            request_timeout: self.config.request_timeout,
            ended,
        }))
    }
}

/// Route inbound frames until the socket goes away.
async fn dispatch_loop(
    session_id: String,
    mut ws_read: SplitStream<WsStream>,
    sink: WsSink,
    events: EventSink,
    pending: PendingReplies,
    ended: Arc<AtomicBool>,
) {
    let mut close_reported = false;
    while let Some(msg) = ws_read.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                debug!(session_id = %session_id, "bridge close frame received");
                break;
            }
            Ok(Message::Ping(payload)) => {
                let mut sink = sink.lock().await;
                let _ = sink.send(Message::Pong(payload)).await;
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "bridge read error");
                break;
            }
        };

        match decode(&text) {
            Ok(Inbound::Event(event)) => {
                let is_close = matches!(event, TransportEvent::Close(_));
                if !events.emit(event) {
                    debug!(session_id = %session_id, "event receiver gone");
                }
                if is_close {
                    close_reported = true;
                    break;
                }
            }
            Ok(Inbound::Reply { request_id, result }) => {
                let waiter = pending.lock().await.remove(&request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(result.map_err(SessionError::Transport));
                    }
                    None => debug!(session_id = %session_id, request_id, "reply for unknown request"),
                }
            }
            Err(e) => warn!(session_id = %session_id, error = %e, "invalid bridge frame"),
        }
    }

    ended.store(true, Ordering::SeqCst);
    // Dropping the senders fails every outstanding request.
    pending.lock().await.clear();

    if !close_reported {
        info!(session_id = %session_id, "bridge connection lost");
        events.emit(TransportEvent::Close(CloseCause::connection_lost(
            "bridge connection lost",
        )));
    }
}

struct BridgeHandle {
    session_id: String,
    sink: WsSink,
    pending: PendingReplies,
    next_request: AtomicU64,
    request_timeout: Duration,
    ended: Arc<AtomicBool>,
}

impl BridgeHandle {
    async fn write(&self, frame: &Outgoing<'_>) -> SessionResult<()> {
        let text = encode(frame)?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| SessionError::Transport(format!("bridge write error: {e}")))
    }
}

#[async_trait]
impl TransportHandle for BridgeHandle {
    async fn send(&self, payload: Value) -> SessionResult<Value> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(SessionError::Transport("bridge connection closed".into()));
        }
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        if let Err(e) = self
            .write(&Outgoing::Request {
                request_id,
                payload: &payload,
            })
            .await
        {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::Transport(
                "bridge connection closed before reply".into(),
            )),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                debug!(session_id = %self.session_id, request_id, "bridge request timed out");
                Err(SessionError::Timeout)
            }
        }
    }

    async fn end(&self) -> SessionResult<()> {
        if self.ended.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Best effort: the sidecar may already be gone.
        let _ = self.write(&Outgoing::End).await;
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    #[test]
    fn hello_frame_shape() {
        let creds = CredentialMaterial(json!({"me": {"id": "1"}}));
        let text = encode(&Outgoing::Hello {
            session_id: "S1",
            credentials: &creds,
        })
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"type": "hello", "sessionId": "S1", "credentials": {"me": {"id": "1"}}})
        );

        let end: Value = serde_json::from_str(&encode(&Outgoing::End).unwrap()).unwrap();
        assert_eq!(end, json!({"type": "end"}));
    }

    #[test]
    fn decodes_lifecycle_frames() {
        assert_eq!(
            decode(r#"{"type":"qr","code":"2@abc"}"#).unwrap(),
            Inbound::Event(TransportEvent::Qr("2@abc".into()))
        );
        assert_eq!(
            decode(r#"{"type":"connecting"}"#).unwrap(),
            Inbound::Event(TransportEvent::Connecting)
        );
        assert_eq!(
            decode(r#"{"type":"open","jid":"1@s.whatsapp.net"}"#).unwrap(),
            Inbound::Event(TransportEvent::Open(AccountInfo {
                jid: Some("1@s.whatsapp.net".into()),
                name: None
            }))
        );
        assert_eq!(
            decode(r#"{"type":"close","code":401,"reason":"logged out","loggedOut":true}"#)
                .unwrap(),
            Inbound::Event(TransportEvent::Close(CloseCause::logged_out("logged out")))
        );
        assert_eq!(
            decode(r#"{"type":"creds","material":{"k":1}}"#).unwrap(),
            Inbound::Event(TransportEvent::CredentialsUpdated(CredentialMaterial(
                json!({"k": 1})
            )))
        );
    }

    #[test]
    fn decodes_replies() {
        assert_eq!(
            decode(r#"{"type":"sent","requestId":7,"result":{"id":"ABC"}}"#).unwrap(),
            Inbound::Reply {
                request_id: 7,
                result: Ok(json!({"id": "ABC"}))
            }
        );
        assert_eq!(
            decode(r#"{"type":"failed","requestId":8,"message":"not on whatsapp"}"#).unwrap(),
            Inbound::Reply {
                request_id: 8,
                result: Err("not on whatsapp".into())
            }
        );
    }

    #[test]
    fn rejects_unknown_frames() {
        assert!(decode(r#"{"type":"presence"}"#).is_err());
        assert!(decode("not json").is_err());
    }

    /// One-connection fake sidecar: checks the hello, announces a login code,
    /// answers one send, then drops the socket.
    async fn fake_sidecar(listener: TcpListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let hello = ws.next().await.unwrap().unwrap();
        let hello: Value = serde_json::from_str(hello.to_text().unwrap()).unwrap();
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["sessionId"], "S1");

        let qr = json!({"type": "qr", "code": "2@xyz"}).to_string();
        ws.send(Message::Text(qr.into())).await.unwrap();

        let send = ws.next().await.unwrap().unwrap();
        let send: Value = serde_json::from_str(send.to_text().unwrap()).unwrap();
        assert_eq!(send["type"], "send");
        let reply = json!({
            "type": "sent",
            "requestId": send["requestId"],
            "result": {"echo": send["payload"]}
        })
        .to_string();
        ws.send(Message::Text(reply.into())).await.unwrap();
        drop(ws);
    }

    #[tokio::test]
    async fn end_to_end_with_fake_sidecar() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sidecar = tokio::spawn(fake_sidecar(listener));

        let transport = BridgeTransport::new(BridgeConfig {
            url: format!("ws://{addr}"),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
        });
        let (sink, mut events) = EventSink::channel();
        let handle = transport
            .open("S1", CredentialMaterial::fresh(), sink)
            .await
            .unwrap();

        assert_eq!(events.recv().await, Some(TransportEvent::Qr("2@xyz".into())));

        let result = handle.send(json!({"text": "hi"})).await.unwrap();
        assert_eq!(result, json!({"echo": {"text": "hi"}}));

        sidecar.await.unwrap();
        match events.recv().await {
            Some(TransportEvent::Close(cause)) => {
                assert!(!transport.is_permanent_cause(&cause));
            }
            other => panic!("expected close, got {other:?}"),
        }
        assert!(handle.send(json!({})).await.is_err());
        handle.end().await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_sidecar_is_init_error() {
        let transport = BridgeTransport::new(BridgeConfig {
            url: "ws://127.0.0.1:9".into(),
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
        });
        let (sink, _events) = EventSink::channel();
        let err = transport
            .open("S1", CredentialMaterial::fresh(), sink)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::TransportInit(_)));
    }
}
