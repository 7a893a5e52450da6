//! Line-oriented operator console.
//!
//! Reads one command per line and writes one JSON object per line.

use crate::session::{await_login, ConnectionManager, QrCallback, SweepPolicy};
use chatmux_core::{SessionError, SessionResult};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

const HELP: &[&str] = &[
    "start <id>",
    "wait <id> [secs]",
    "status <id>",
    "send <id> <json>",
    "close <id>",
    "force-cleanup <id>",
    "reset-retries <id>",
    "restart <id>",
    "delete <id>",
    "list",
    "counts",
    "sweep",
    "close-all",
    "help",
    "quit",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start(String),
    Wait { session_id: String, secs: Option<u64> },
    Status(String),
    Send { session_id: String, payload: Value },
    Close(String),
    ForceCleanup(String),
    ResetRetries(String),
    Restart(String),
    Delete(String),
    List,
    Counts,
    Sweep,
    CloseAll,
    Help,
    Quit,
}

/// Parse one input line. Blank lines and `#` comments yield `None`.
pub fn parse(line: &str) -> SessionResult<Option<Command>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    let id = |usage: &str| -> SessionResult<String> {
        let id = rest.split_whitespace().next().unwrap_or("");
        if id.is_empty() {
            return Err(SessionError::Other(format!("usage: {usage}")));
        }
        Ok(id.to_string())
    };

    let cmd = match verb {
        "start" => Command::Start(id("start <id>")?),
        "wait" => {
            let mut parts = rest.split_whitespace();
            let session_id = parts
                .next()
                .ok_or_else(|| SessionError::Other("usage: wait <id> [secs]".into()))?
                .to_string();
            let secs = parts
                .next()
                .map(|s| {
                    s.parse::<u64>()
                        .map_err(|_| SessionError::Other(format!("invalid seconds: {s}")))
                })
                .transpose()?;
            Command::Wait { session_id, secs }
        }
        "status" => Command::Status(id("status <id>")?),
        "send" => {
            let (session_id, payload) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| SessionError::Other("usage: send <id> <json>".into()))?;
            Command::Send {
                session_id: session_id.to_string(),
                payload: serde_json::from_str(payload.trim())?,
            }
        }
        "close" => Command::Close(id("close <id>")?),
        "force-cleanup" => Command::ForceCleanup(id("force-cleanup <id>")?),
        "reset-retries" => Command::ResetRetries(id("reset-retries <id>")?),
        "restart" => Command::Restart(id("restart <id>")?),
        "delete" => Command::Delete(id("delete <id>")?),
        "list" => Command::List,
        "counts" => Command::Counts,
        "sweep" => Command::Sweep,
        "close-all" => Command::CloseAll,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(SessionError::Other(format!("unknown command: {other}"))),
    };
    Ok(Some(cmd))
}

pub struct Console {
    manager: Arc<ConnectionManager>,
    sweep_policy: SweepPolicy,
    login_wait: Duration,
}

impl Console {
    pub fn new(manager: Arc<ConnectionManager>, sweep_policy: SweepPolicy, login_wait: Duration) -> Self {
        Self {
            manager,
            sweep_policy,
            login_wait,
        }
    }

    pub async fn execute(&self, cmd: Command) -> SessionResult<Value> {
        let m = &self.manager;
        let value = match cmd {
            Command::Start(id) => {
                let qr_id = id.clone();
                let on_qr: QrCallback = Arc::new(move |code: &str| {
                    info!(session_id = %qr_id, code, "scan this login code");
                });
                let outcome = m.start(&id, Some(on_qr)).await?;
                json!({
                    "sessionId": id,
                    "outcome": outcome.label(),
                    "status": m.status(&id).await,
                })
            }
            Command::Wait { session_id, secs } => {
                let timeout = secs.map(Duration::from_secs).unwrap_or(self.login_wait);
                let progress = await_login(m, &session_id, timeout).await?;
                json!({ "sessionId": session_id, "login": progress })
            }
            Command::Status(id) => json!({ "sessionId": id, "status": m.status(&id).await }),
            Command::Send {
                session_id,
                payload,
            } => {
                let result = m.send(&session_id, payload).await?;
                json!({ "sessionId": session_id, "result": result })
            }
            Command::Close(id) => json!({ "sessionId": id, "closed": m.close(&id).await }),
            Command::ForceCleanup(id) => {
                json!({ "sessionId": id, "cleaned": m.force_cleanup(&id).await })
            }
            Command::ResetRetries(id) => {
                json!({ "sessionId": id, "reset": m.reset_reconnect_attempts(&id).await })
            }
            Command::Restart(id) => {
                m.restart(&id).await?;
                json!({ "sessionId": id, "restarted": true })
            }
            Command::Delete(id) => {
                m.delete(&id).await?;
                json!({ "sessionId": id, "deleted": true })
            }
            Command::List => json!({ "sessions": m.list_active().await }),
            Command::Counts => json!(m.counts().await),
            Command::Sweep => json!({ "evicted": m.sweep(&self.sweep_policy).await }),
            Command::CloseAll => json!({ "closed": m.force_close_all().await }),
            Command::Help => json!({ "commands": HELP }),
            Command::Quit => json!({ "bye": true }),
        };
        Ok(value)
    }

    /// Serve commands until `quit` or end of input.
    pub async fn run<R, W>(&self, input: R, mut output: W) -> SessionResult<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            let reply = match parse(&line) {
                Ok(None) => continue,
                Ok(Some(cmd)) => {
                    let quit = cmd == Command::Quit;
                    let reply = self.execute(cmd).await.unwrap_or_else(|e| error_reply(&e));
                    if quit {
                        write_line(&mut output, &reply).await?;
                        return Ok(());
                    }
                    reply
                }
                Err(e) => error_reply(&e),
            };
            write_line(&mut output, &reply).await?;
        }
        debug!("console input closed");
        Ok(())
    }
}

fn error_reply(e: &SessionError) -> Value {
    json!({ "error": e.to_string(), "retryable": e.is_retryable() })
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, value: &Value) -> SessionResult<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await?;
    Ok(())
}
