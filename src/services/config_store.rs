use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, UpdateError};
use crate::utils::file::write_atomic;

/// Persistent launcher settings the engine reads its install path from.
pub trait ConfigStore: Send + Sync {
    fn install_path(&self) -> Option<PathBuf>;
    fn set_install_path(&self, path: PathBuf) -> Result<()>;
    fn is_setup_completed(&self) -> bool;
    fn mark_setup_completed(&self) -> Result<()>;

    fn last_update_check(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn record_update_check(&self, _at: DateTime<Utc>) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LauncherConfig {
    #[serde(default)]
    pub install_path: String,
    #[serde(default)]
    pub setup_completed: bool,
    #[serde(default)]
    pub last_update_check: Option<DateTime<Utc>>,
}

impl LauncherConfig {
    fn install_path(&self) -> Option<PathBuf> {
        let trimmed = self.install_path.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(PathBuf::from(trimmed))
        }
    }
}

fn lock_config(config: &Mutex<LauncherConfig>) -> Result<MutexGuard<'_, LauncherConfig>> {
    config
        .lock()
        .map_err(|_| UpdateError::Config("config lock poisoned".to_string()))
}

/// JSON document on disk; every mutation is written through immediately.
pub struct JsonFileConfigStore {
    path: PathBuf,
    config: Mutex<LauncherConfig>,
}

impl JsonFileConfigStore {
    /// Loads `path`, falling back to defaults when the file is missing or unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let config = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<LauncherConfig>(&bytes) {
                Ok(config) => {
                    tracing::debug!(
                        "loaded launcher config from {} (install_path={:?}, setup_completed={})",
                        path.display(),
                        config.install_path,
                        config.setup_completed
                    );
                    config
                }
                Err(err) => {
                    tracing::warn!(
                        "launcher config at {} is invalid, using defaults: {}",
                        path.display(),
                        err
                    );
                    LauncherConfig::default()
                }
            },
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("failed to read launcher config {}: {}", path.display(), err);
                }
                LauncherConfig::default()
            }
        };
        Self {
            path,
            config: Mutex::new(config),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Result<LauncherConfig> {
        Ok(lock_config(&self.config)?.clone())
    }

    fn update(&self, apply: impl FnOnce(&mut LauncherConfig)) -> Result<()> {
        let mut guard = lock_config(&self.config)?;
        apply(&mut guard);
        let payload = serde_json::to_vec_pretty(&*guard)
            .map_err(|err| UpdateError::Config(format!("serialize config: {err}")))?;
        write_atomic(&self.path, &payload)?;
        tracing::debug!("launcher config saved to {}", self.path.display());
        Ok(())
    }
}

impl ConfigStore for JsonFileConfigStore {
    fn install_path(&self) -> Option<PathBuf> {
        lock_config(&self.config).ok()?.install_path()
    }

    fn set_install_path(&self, path: PathBuf) -> Result<()> {
        self.update(|config| config.install_path = path.to_string_lossy().to_string())
    }

    fn is_setup_completed(&self) -> bool {
        lock_config(&self.config)
            .map(|config| config.setup_completed)
            .unwrap_or(false)
    }

    fn mark_setup_completed(&self) -> Result<()> {
        self.update(|config| config.setup_completed = true)
    }

    fn last_update_check(&self) -> Option<DateTime<Utc>> {
        lock_config(&self.config).ok()?.last_update_check
    }

    fn record_update_check(&self, at: DateTime<Utc>) -> Result<()> {
        self.update(|config| config.last_update_check = Some(at))
    }
}

#[derive(Default)]
pub struct MemoryConfigStore {
    config: Mutex<LauncherConfig>,
}

impl MemoryConfigStore {
    pub fn with_install_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config: Mutex::new(LauncherConfig {
                install_path: path.into().to_string_lossy().to_string(),
                ..LauncherConfig::default()
            }),
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn install_path(&self) -> Option<PathBuf> {
        lock_config(&self.config).ok()?.install_path()
    }

    fn set_install_path(&self, path: PathBuf) -> Result<()> {
        lock_config(&self.config)?.install_path = path.to_string_lossy().to_string();
        Ok(())
    }

    fn is_setup_completed(&self) -> bool {
        lock_config(&self.config)
            .map(|config| config.setup_completed)
            .unwrap_or(false)
    }

    fn mark_setup_completed(&self) -> Result<()> {
        lock_config(&self.config)?.setup_completed = true;
        Ok(())
    }

    fn last_update_check(&self) -> Option<DateTime<Utc>> {
        lock_config(&self.config).ok()?.last_update_check
    }

    fn record_update_check(&self, at: DateTime<Utc>) -> Result<()> {
        lock_config(&self.config)?.last_update_check = Some(at);
        Ok(())
    }
}
