//! File-backed credential store.
//!
//! Material for each session lives at `<root>/<session_id>/creds.json`.

use async_trait::async_trait;
use chatmux_core::{CredentialMaterial, CredentialStore, SessionError, SessionResult};
use std::path::PathBuf;
use tracing::debug;

const CREDS_FILE: &str = "creds.json";

pub struct FileCredentialStore {
    root: PathBuf,
}

impl FileCredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn session_dir(&self, session_id: &str) -> SessionResult<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.root.join(session_id))
    }
}

/// Session ids become directory names, so they must be a single path component.
fn validate_session_id(session_id: &str) -> SessionResult<()> {
    let bad = session_id.is_empty()
        || session_id == "."
        || session_id.contains("..")
        || session_id.contains('/')
        || session_id.contains('\\')
        || session_id.contains('\0');
    if bad {
        return Err(SessionError::InvalidSessionId(session_id.to_string()));
    }
    Ok(())
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load_or_init(&self, session_id: &str) -> SessionResult<CredentialMaterial> {
        let path = self.session_dir(session_id)?.join(CREDS_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                SessionError::Credentials(format!("corrupt {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(session_id, "no stored credentials, starting fresh");
                Ok(CredentialMaterial::fresh())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, session_id: &str, material: &CredentialMaterial) -> SessionResult<()> {
        let dir = self.session_dir(session_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).await?;
        }

        let bytes = serde_json::to_vec_pretty(material)?;
        let tmp = dir.join(format!("{CREDS_FILE}.tmp"));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, dir.join(CREDS_FILE)).await?;
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> SessionResult<()> {
        let path = self.session_dir(session_id)?.join(CREDS_FILE);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, session_id: &str) -> SessionResult<()> {
        let dir = self.session_dir(session_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: std::sync::Mutex<std::collections::HashMap<String, CredentialMaterial>>,
}

#[cfg(test)]
impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<CredentialMaterial> {
        self.entries.lock().unwrap().get(session_id).cloned()
    }
}

#[cfg(test)]
#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load_or_init(&self, session_id: &str) -> SessionResult<CredentialMaterial> {
        let mut entries = self.entries.lock().unwrap();
        Ok(entries.entry(session_id.to_string()).or_default().clone())
    }

    async fn save(&self, session_id: &str, material: &CredentialMaterial) -> SessionResult<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(session_id.to_string(), material.clone());
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> SessionResult<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(session_id.to_string(), CredentialMaterial::fresh());
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> SessionResult<()> {
        self.entries.lock().unwrap().remove(session_id);
        Ok(())
    }
}
