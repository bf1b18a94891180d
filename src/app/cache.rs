use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::app::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedDevice {
    pub model: String,
    pub platform_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct CacheFile {
    saved_at: DateTime<Utc>,
    #[serde(default)]
    devices: BTreeMap<String, CachedDevice>,
}

/// Best-effort local record of id → model/version, overwritten wholesale on each save.
#[derive(Debug, Clone)]
pub struct DeviceCache {
    path: PathBuf,
}

impl DeviceCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing or unreadable cache is an empty cache.
    pub fn load(&self, trace_id: &str) -> BTreeMap<String, CachedDevice> {
        if !self.path.exists() {
            return BTreeMap::new();
        }
        let parsed = fs::read_to_string(&self.path)
            .map_err(|err| err.to_string())
            .and_then(|raw| serde_json::from_str::<CacheFile>(&raw).map_err(|err| err.to_string()));
        match parsed {
            Ok(file) => file.devices,
            Err(err) => {
                warn!(
                    trace_id = %trace_id,
                    path = %self.path.display(),
                    error = %err,
                    "ignoring unreadable device cache"
                );
                BTreeMap::new()
            }
        }
    }

    pub fn save(
        &self,
        devices: &BTreeMap<String, CachedDevice>,
        trace_id: &str,
    ) -> Result<(), AppError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::system(format!("Failed to create cache dir: {err}"), trace_id)
            })?;
        }
        let file = CacheFile {
            saved_at: Utc::now(),
            devices: devices.clone(),
        };
        let payload = serde_json::to_string_pretty(&file).map_err(|err| {
            AppError::system(format!("Failed to serialize device cache: {err}"), trace_id)
        })?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, payload)
            .map_err(|err| AppError::system(format!("Failed to write device cache: {err}"), trace_id))?;
        fs::rename(&staging, &self.path)
            .map_err(|err| AppError::system(format!("Failed to replace device cache: {err}"), trace_id))?;
        Ok(())
    }
}
