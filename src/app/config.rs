use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::error::AppError;

pub const CONFIG_PATH_ENV: &str = "PHONE_FARM_CONFIG_PATH";
const CONFIG_FILE_NAME: &str = ".phone_farm_config.json";
const BACKUP_FILE_NAME: &str = ".phone_farm_config.backup.json";
const DATA_DIR_NAME: &str = ".phone_farm";
const CACHE_FILE_NAME: &str = "device_cache.json";

/// Hard ceiling on simultaneous connection attempts, whatever the config says.
pub const MAX_CONCURRENT_CONNECTIONS: usize = 50;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdbSettings {
    pub command_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionSettings {
    pub max_concurrent_connections: usize,
    pub default_fast_mode: bool,
    /// Consecutive scan misses tolerated before a connected device is dropped.
    pub miss_grace_scans: u32,
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_concurrent_connections: MAX_CONCURRENT_CONNECTIONS,
            default_fast_mode: true,
            miss_grace_scans: 0,
            connect_timeout_secs: 5,
        }
    }
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutSettings {
    pub property_probe_secs: u64,
    pub shell_secs: u64,
    pub uninstall_secs: u64,
    pub install_secs: u64,
    pub launch_secs: u64,
    pub enumerate_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            property_probe_secs: 2,
            shell_secs: 10,
            uninstall_secs: 30,
            install_secs: 120,
            launch_secs: 5,
            enumerate_secs: 10,
        }
    }
}

impl TimeoutSettings {
    pub fn property_probe(&self) -> Duration {
        Duration::from_secs(self.property_probe_secs)
    }

    pub fn shell(&self) -> Duration {
        Duration::from_secs(self.shell_secs)
    }

    pub fn uninstall(&self) -> Duration {
        Duration::from_secs(self.uninstall_secs)
    }

    pub fn install(&self) -> Duration {
        Duration::from_secs(self.install_secs)
    }

    pub fn launch(&self) -> Duration {
        Duration::from_secs(self.launch_secs)
    }

    pub fn enumerate(&self) -> Duration {
        Duration::from_secs(self.enumerate_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ParallelSettings {
    pub install: usize,
    pub configure: usize,
    pub bloatware_removal: usize,
    pub command: usize,
}

impl Default for ParallelSettings {
    fn default() -> Self {
        Self {
            install: 30,
            configure: 25,
            bloatware_removal: 20,
            command: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub path: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FarmConfig {
    #[serde(default)]
    pub adb: AdbSettings,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub parallel: ParallelSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default = "default_apks_dir")]
    pub apks_dir: String,
    /// Packages the cleanup features never touch, on top of the built-in policy.
    #[serde(default = "default_keep_packages")]
    pub keep_packages: Vec<String>,
}

fn default_apks_dir() -> String {
    "apks".to_string()
}

fn default_keep_packages() -> Vec<String> {
    vec![
        "com.zhiliaoapp.musically".to_string(),
        "com.scheler.superproxy".to_string(),
    ]
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            adb: AdbSettings::default(),
            connection: ConnectionSettings::default(),
            timeouts: TimeoutSettings::default(),
            parallel: ParallelSettings::default(),
            cache: CacheSettings::default(),
            logging: LoggingSettings::default(),
            apks_dir: default_apks_dir(),
            keep_packages: default_keep_packages(),
        }
    }
}

impl FarmConfig {
    pub fn cache_path(&self) -> PathBuf {
        if self.cache.path.trim().is_empty() {
            data_dir().join(CACHE_FILE_NAME)
        } else {
            PathBuf::from(self.cache.path.trim())
        }
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

pub fn data_dir() -> PathBuf {
    home_dir().join(DATA_DIR_NAME)
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    home_dir().join(CONFIG_FILE_NAME)
}

pub fn backup_config_path() -> PathBuf {
    let path = config_path();
    path.with_file_name(BACKUP_FILE_NAME)
}

pub fn load_config(trace_id: &str) -> Result<FarmConfig, AppError> {
    load_config_from_path(&config_path(), trace_id)
}

pub fn save_config(config: &FarmConfig, trace_id: &str) -> Result<(), AppError> {
    save_config_to_path(config, &config_path(), &backup_config_path(), trace_id)
}

pub fn load_config_from_path(path: &Path, trace_id: &str) -> Result<FarmConfig, AppError> {
    if !path.exists() {
        return Ok(FarmConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), trace_id))?;
    let config: FarmConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::validation(format!("Failed to parse config: {err}"), trace_id))?;
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &FarmConfig,
    path: &Path,
    backup_path: &Path,
    trace_id: &str,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(config).map_err(|err| {
        AppError::system(format!("Failed to serialize config: {err}"), trace_id)
    })?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), trace_id))?;
    Ok(())
}

pub fn validate_config(mut config: FarmConfig) -> FarmConfig {
    let connection_defaults = ConnectionSettings::default();
    let timeout_defaults = TimeoutSettings::default();
    let parallel_defaults = ParallelSettings::default();

    if config.connection.max_concurrent_connections == 0
        || config.connection.max_concurrent_connections > MAX_CONCURRENT_CONNECTIONS
    {
        config.connection.max_concurrent_connections = MAX_CONCURRENT_CONNECTIONS;
    }
    if config.connection.connect_timeout_secs == 0 {
        config.connection.connect_timeout_secs = connection_defaults.connect_timeout_secs;
    }
    if config.connection.miss_grace_scans > 10 {
        config.connection.miss_grace_scans = 10;
    }

    let timeouts = &mut config.timeouts;
    for (value, fallback) in [
        (&mut timeouts.property_probe_secs, timeout_defaults.property_probe_secs),
        (&mut timeouts.shell_secs, timeout_defaults.shell_secs),
        (&mut timeouts.uninstall_secs, timeout_defaults.uninstall_secs),
        (&mut timeouts.install_secs, timeout_defaults.install_secs),
        (&mut timeouts.launch_secs, timeout_defaults.launch_secs),
        (&mut timeouts.enumerate_secs, timeout_defaults.enumerate_secs),
    ] {
        if *value == 0 {
            *value = fallback;
        }
    }

    let parallel = &mut config.parallel;
    for (value, fallback) in [
        (&mut parallel.install, parallel_defaults.install),
        (&mut parallel.configure, parallel_defaults.configure),
        (&mut parallel.bloatware_removal, parallel_defaults.bloatware_removal),
        (&mut parallel.command, parallel_defaults.command),
    ] {
        if *value == 0 {
            *value = fallback;
        }
    }

    if config.logging.log_level.trim().is_empty() {
        config.logging.log_level = LoggingSettings::default().log_level;
    }
    if config.apks_dir.trim().is_empty() {
        config.apks_dir = default_apks_dir();
    }
    config
}
