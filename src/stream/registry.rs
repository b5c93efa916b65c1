//! Keyed collection of open camera sessions

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::session::{CameraSession, SessionDeps, SessionStatus};
use crate::config::{CameraConfig, DiagnosticsConfig};
use crate::error::{AppError, Result};
use crate::metrics::MetricsSnapshot;

/// Sessions keyed by [`CameraConfig::key`]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<CameraSession>>>,
    deps: SessionDeps,
}

impl SessionRegistry {
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            deps,
        }
    }

    /// Open and start a session for `config` at wall position `index`.
    ///
    /// Disabled cameras are refused. An already open camera is returned
    /// as is, with its position updated.
    pub async fn open(&self, config: CameraConfig, index: usize) -> Result<Arc<CameraSession>> {
        if config.disabled {
            return Err(AppError::Config(format!(
                "camera '{}' is disabled",
                config.display_name()
            )));
        }
        let key = config.key().to_string();

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&key) {
            debug!("[{}] Already open", key);
            existing.set_index(index);
            return Ok(existing.clone());
        }

        let session = CameraSession::open(config, index, &self.deps).await;
        sessions.insert(key.clone(), session.clone());
        info!("[{}] Session opened at position {} ({} total)", key, index, sessions.len());
        Ok(session)
    }

    pub async fn get(&self, key: &str) -> Option<Arc<CameraSession>> {
        self.sessions.read().await.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Close and forget one session
    pub async fn close(&self, key: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(key)
            .ok_or_else(|| AppError::NotFound(format!("camera '{}'", key)))?;
        session.close().await;
        Ok(())
    }

    /// Close every session
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        if sessions.is_empty() {
            return;
        }
        info!("Closing {} sessions", sessions.len());
        join_all(sessions.iter().map(|s| s.close())).await;
    }

    /// Restart the session open under `key` with an edited configuration.
    ///
    /// When the edit changes the camera's key, the old session is closed
    /// and a new one opened in its wall position.
    pub async fn restart_with(&self, key: &str, config: CameraConfig, reason: &str) -> Result<()> {
        let session = self
            .get(key)
            .await
            .ok_or_else(|| AppError::NotFound(format!("camera '{}'", key)))?;
        if config.key() == key {
            session.restart_with(config, reason).await;
            return Ok(());
        }

        info!("[{}] Now known as '{}' ({})", key, config.key(), reason);
        let index = session.index();
        self.close(key).await?;
        self.open(config, index).await.map(|_| ())
    }

    /// Reconnect all running sessions after the host wakes up
    pub async fn on_resume_from_sleep(&self) {
        let sessions = self.all().await;
        info!("Resumed from sleep, reconnecting {} sessions", sessions.len());
        join_all(sessions.iter().map(|s| s.on_resume_from_sleep())).await;
    }

    /// Change overlay switches; sessions pick them up on their next start
    pub async fn set_diagnostics(&self, diagnostics: DiagnosticsConfig) {
        for session in self.all().await {
            session.set_diagnostics(diagnostics);
        }
    }

    /// Take a metrics sample from every session, in wall order
    pub async fn sample_all(&self) -> Vec<(String, MetricsSnapshot)> {
        self.all()
            .await
            .into_iter()
            .map(|s| (s.key().to_string(), s.sample_metrics()))
            .collect()
    }

    /// Latest snapshot of every session without taking a new sample
    pub async fn snapshots(&self) -> Vec<(String, MetricsSnapshot)> {
        self.all()
            .await
            .into_iter()
            .map(|s| (s.key().to_string(), s.metrics()))
            .collect()
    }

    /// Status of every session, in wall order
    pub async fn statuses(&self) -> Vec<SessionStatus> {
        self.all().await.into_iter().map(|s| s.status()).collect()
    }

    async fn all(&self) -> Vec<Arc<CameraSession>> {
        let mut sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.index());
        sessions
    }
}
