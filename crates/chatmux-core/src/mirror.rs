//! Status mirror capability: the external record store that reflects session status.

use crate::error::SessionResult;
use crate::status::ConnectionStatus;
use async_trait::async_trait;

#[async_trait]
pub trait StatusMirror: Send + Sync {
    /// Record the new status of a session. Callers log failures and move on.
    async fn update(&self, session_id: &str, status: ConnectionStatus) -> SessionResult<()>;
}
