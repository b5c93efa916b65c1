use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a JSON file
///
/// Uses `ArcSwap` for lock-free reads; writers persist first and only then
/// publish the new value.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    cache: Arc<ArcSwap<AppConfig>>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    /// Keys of cameras whose records differ from the previous revision
    pub cameras: Vec<String>,
}

impl ConfigStore {
    /// Open the store, loading the file if it exists
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config = Self::load_file(&path).await?;
        let (change_tx, _) = broadcast::channel(16);

        Ok(Self {
            path,
            cache: Arc::new(ArcSwap::from_pointee(config)),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
            change_tx,
        })
    }

    /// Default settings path: `<config dir>/camwall/settings.json`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("camwall")
            .join("settings.json")
    }

    async fn load_file(path: &Path) -> Result<AppConfig> {
        match tokio::fs::read(path).await {
            Ok(data) => {
                let config: AppConfig = serde_json::from_slice(&data)?;
                info!(
                    "Loaded {} camera(s) from {}",
                    config.cameras.len(),
                    path.display()
                );
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                Ok(AppConfig::default())
            }
            Err(e) => Err(AppError::Config(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Get current configuration (lock-free, zero-copy)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply a modification, persist it atomically, then publish it
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let _guard = self.write_lock.lock().await;

        let previous = self.cache.load_full();
        let mut config = (*previous).clone();
        f(&mut config);

        self.persist(&config).await?;

        let changed = changed_cameras(&previous, &config);
        self.cache.store(Arc::new(config));
        let _ = self.change_tx.send(ConfigChange { cameras: changed });
        Ok(())
    }

    /// Re-read the backing file after an outside edit and publish what
    /// changed. A file that fails to parse leaves the current value alone.
    pub async fn reload(&self) -> Result<ConfigChange> {
        let _guard = self.write_lock.lock().await;

        let config = Self::load_file(&self.path).await?;
        let previous = self.cache.load_full();
        let change = ConfigChange {
            cameras: changed_cameras(&previous, &config),
        };
        self.cache.store(Arc::new(config));
        if !change.cameras.is_empty() {
            let _ = self.change_tx.send(change.clone());
        }
        Ok(change)
    }

    /// Replace the whole configuration
    pub async fn set(&self, config: AppConfig) -> Result<()> {
        self.update(move |c| *c = config).await
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    async fn persist(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec_pretty(config)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Saved config to {}", self.path.display());
        Ok(())
    }
}

fn changed_cameras(old: &AppConfig, new: &AppConfig) -> Vec<String> {
    let mut keys: Vec<String> = new
        .cameras
        .iter()
        .filter(|cam| old.camera(cam.key()) != Some(*cam))
        .map(|cam| cam.key().to_string())
        .collect();
    keys.extend(
        old.cameras
            .iter()
            .filter(|cam| new.camera(cam.key()).is_none())
            .map(|cam| cam.key().to_string()),
    );
    keys
}
