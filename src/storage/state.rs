use std::path::PathBuf;

use chrono::NaiveDate;
use tokio::fs;
use tracing::{info, warn};

use crate::types::{AppConfig, ConfigUpdate};

use super::models::PersistedState;
use super::{DurableSink, PathLayout, SinkResult};

/// Local JSON file holding the cycle counters for crash recovery.
///
/// All operations are best-effort: failures are logged, never returned.
#[derive(Clone, Debug)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub async fn save(&self, state: &PersistedState) {
        let json = match serde_json::to_vec(state) {
            Ok(json) => json,
            Err(err) => {
                warn!(target: "storage", error = %err, "failed to serialize state");
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent).await;
        }
        if let Err(err) = fs::write(&self.path, json).await {
            warn!(target: "storage", error = %err, path = %self.path.display(), "failed to save state");
        }
    }

    /// Load state written earlier on `today`. A file from any other day is deleted, not merged.
    pub async fn load(&self, today: NaiveDate) -> Option<PersistedState> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(target: "storage", error = %err, "failed to read state");
                return None;
            }
        };

        let state: PersistedState = match serde_json::from_slice(&bytes) {
            Ok(state) => state,
            Err(err) => {
                warn!(target: "storage", error = %err, "discarding unreadable state file");
                self.discard().await;
                return None;
            }
        };

        if state.day != today {
            info!(
                target: "storage",
                saved_day = %state.day,
                today = %today,
                "discarding state from another day"
            );
            self.discard().await;
            return None;
        }

        info!(target: "storage", polls = state.poll_count, "restored state from today");
        Some(state)
    }

    pub async fn discard(&self) {
        if let Err(err) = fs::remove_file(&self.path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(target: "storage", error = %err, "failed to delete state file");
            }
        }
    }
}

/// Runtime configuration persisted locally (fast cache) and to the durable sink.
#[derive(Clone, Debug)]
pub struct ConfigStore {
    local_path: PathBuf,
}

impl ConfigStore {
    pub fn new(local_path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: local_path.into(),
        }
    }

    pub async fn save(&self, cfg: &AppConfig, sink: &dyn DurableSink) {
        let text = match cfg.to_toml() {
            Ok(text) => text,
            Err(err) => {
                warn!(target: "config", error = %err, "failed to serialize runtime config");
                return;
            }
        };

        match fs::write(&self.local_path, text.as_bytes()).await {
            Ok(()) => info!(target: "config", path = %self.local_path.display(), "runtime config saved locally"),
            Err(err) => warn!(target: "config", error = %err, "failed to save runtime config locally"),
        }

        if !sink.is_enabled() {
            return;
        }
        let path = PathLayout::from_config(cfg).runtime_config_path();
        match sink.put(&path, "application/toml", text.into_bytes()).await {
            Ok(()) => info!(target: "config", path = %path, "runtime config saved to storage"),
            Err(err) => warn!(target: "config", error = %err, "failed to save runtime config to storage"),
        }
    }

    /// Overlay the persisted runtime config on `base`: the durable copy first, the local file otherwise.
    pub async fn overlay(&self, base: &AppConfig, sink: &dyn DurableSink) -> AppConfig {
        if sink.is_enabled() {
            let path = PathLayout::from_config(base).runtime_config_path();
            match read_remote(sink, &path).await {
                Ok(Some(saved)) => {
                    info!(target: "config", path = %path, "runtime config overlaid from storage");
                    return base.merged(&ConfigUpdate::from(&saved));
                }
                Ok(None) => info!(target: "config", "no runtime config in storage"),
                Err(err) => warn!(target: "config", error = %err, "failed to load runtime config from storage"),
            }
        }

        match fs::read_to_string(&self.local_path).await {
            Ok(text) => match toml::from_str::<AppConfig>(&text) {
                Ok(saved) => {
                    info!(target: "config", "runtime config overlaid from local cache");
                    base.merged(&ConfigUpdate::from(&saved))
                }
                Err(err) => {
                    warn!(target: "config", error = %err, "ignoring unreadable local runtime config");
                    base.clone()
                }
            },
            Err(_) => base.clone(),
        }
    }
}

async fn read_remote(sink: &dyn DurableSink, path: &str) -> SinkResult<Option<AppConfig>> {
    let Some(bytes) = sink.get(path).await? else {
        return Ok(None);
    };
    let text = String::from_utf8_lossy(&bytes);
    match toml::from_str::<AppConfig>(&text) {
        Ok(cfg) => Ok(Some(cfg)),
        Err(err) => {
            warn!(target: "config", error = %err, "ignoring unreadable runtime config in storage");
            Ok(None)
        }
    }
}
