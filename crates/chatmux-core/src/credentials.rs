//! Credential store capability.

use crate::error::SessionResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Opaque per-session credential material. `Null` means nothing has been
/// stored yet and the transport should start a fresh login.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialMaterial(pub serde_json::Value);

impl CredentialMaterial {
    pub fn fresh() -> Self {
        Self(serde_json::Value::Null)
    }

    pub fn is_fresh(&self) -> bool {
        self.0.is_null()
    }
}

/// Durable storage for credential material, keyed by session id.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load stored material, or fresh material if none exists.
    async fn load_or_init(&self, session_id: &str) -> SessionResult<CredentialMaterial>;

    /// Persist material reported by the transport.
    async fn save(&self, session_id: &str, material: &CredentialMaterial) -> SessionResult<()>;

    /// Forget stored material so the next login starts fresh.
    async fn clear(&self, session_id: &str) -> SessionResult<()>;

    /// Remove everything stored for the session.
    async fn remove(&self, session_id: &str) -> SessionResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_material_is_null() {
        assert!(CredentialMaterial::fresh().is_fresh());
        assert!(CredentialMaterial::default().is_fresh());
        let m = CredentialMaterial(serde_json::json!({"me": {"id": "1@s"}}));
        assert!(!m.is_fresh());
    }

    #[test]
    fn material_is_transparent_json() {
        let m = CredentialMaterial(serde_json::json!({"k": 1}));
        assert_eq!(serde_json::to_string(&m).unwrap(), r#"{"k":1}"#);
    }
}
