use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Credentials for the signed-in user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Process-wide session state, mirrored to disk when a path is configured
#[derive(Debug, Clone)]
pub struct SessionStore {
    current: Arc<RwLock<Option<Session>>>,
    path: Option<PathBuf>,
}

impl SessionStore {
    pub fn in_memory(session: Option<Session>) -> Self {
        Self {
            current: Arc::new(RwLock::new(session)),
            path: None,
        }
    }

    pub fn default_path() -> PathBuf {
        let data_dir = dirs::data_local_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
            .unwrap_or_else(|| PathBuf::from(".local"));

        data_dir.join("roomchat").join("session.json")
    }

    /// Open the session file at `path`. A missing file means signed out.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let session = match fs::read_to_string(&path).await {
            Ok(content) => Some(
                serde_json::from_str(&content)
                    .with_context(|| format!("Invalid session file {}", path.display()))?,
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e).with_context(|| format!("Cannot read {}", path.display())),
        };

        Ok(Self {
            current: Arc::new(RwLock::new(session)),
            path: Some(path),
        })
    }

    pub async fn current(&self) -> Option<Session> {
        self.current.read().await.clone()
    }

    pub async fn is_signed_in(&self) -> bool {
        self.current.read().await.is_some()
    }

    pub async fn user_id(&self) -> Option<String> {
        self.current.read().await.as_ref().map(|s| s.user_id.clone())
    }

    pub async fn access_token(&self) -> Option<String> {
        self.current.read().await.as_ref().map(|s| s.access_token.clone())
    }

    pub async fn refresh_token(&self) -> Option<String> {
        self.current
            .read()
            .await
            .as_ref()
            .and_then(|s| s.refresh_token.clone())
    }

    pub async fn set(&self, session: Session) {
        *self.current.write().await = Some(session.clone());
        self.persist(Some(&session)).await;
    }

    /// Store a refreshed credential. Keeps the old refresh token unless a new one is issued.
    pub async fn update_tokens(&self, access_token: &str, refresh_token: Option<&str>) {
        let updated = {
            let mut current = self.current.write().await;
            let Some(session) = current.as_mut() else {
                return;
            };
            session.access_token = access_token.to_string();
            if let Some(token) = refresh_token {
                session.refresh_token = Some(token.to_string());
            }
            session.clone()
        };
        self.persist(Some(&updated)).await;
    }

    pub async fn clear(&self) {
        *self.current.write().await = None;
        self.persist(None).await;
    }

    async fn persist(&self, session: Option<&Session>) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = write_session(path, session).await {
            warn!(path = %path.display(), error = %e, "Failed to persist session");
        }
    }
}

async fn write_session(path: &Path, session: Option<&Session>) -> Result<()> {
    match session {
        Some(session) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(path, serde_json::to_vec_pretty(session)?).await?;
            debug!(path = %path.display(), "Session saved");
        }
        None => match fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "Session file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session {
            user_id: "u1".into(),
            access_token: "a1".into(),
            refresh_token: Some("r1".into()),
        }
    }

    #[tokio::test]
    async fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");

        let store = SessionStore::open(&path).await.unwrap();
        assert!(!store.is_signed_in().await);

        store.set(session()).await;
        store.update_tokens("a2", None).await;

        let reopened = SessionStore::open(&path).await.unwrap();
        let loaded = reopened.current().await.unwrap();
        assert_eq!(loaded.access_token, "a2");
        assert_eq!(loaded.refresh_token.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let store = SessionStore::open(&path).await.unwrap();
        store.set(session()).await;
        assert!(path.exists());

        store.clear().await;
        assert!(!path.exists());
        assert!(store.access_token().await.is_none());
        // Clearing twice is harmless
        store.clear().await;
    }

    #[tokio::test]
    async fn update_without_session_is_ignored() {
        let store = SessionStore::in_memory(None);
        store.update_tokens("a", Some("r")).await;
        assert!(store.current().await.is_none());
    }
}
