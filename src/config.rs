use crate::{Result, VesselError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VesselConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub ui: UiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Root of the hypervisor REST API, e.g. `http://localhost:8081/api`.
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    /// WebSocket endpoint for push events. Push updates are disabled when unset.
    #[serde(default)]
    pub events_url: Option<String>,
    #[serde(default = "default_api_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Extra attempts for idempotent reads. Control requests are never retried.
    #[serde(default = "default_api_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_api_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiConfig {
    #[serde(default = "default_ui_auto_refresh")]
    pub auto_refresh: bool,
    #[serde(default = "default_ui_refresh_interval_seconds")]
    pub refresh_interval_seconds: u64,
    /// Ask before actions that do not strictly need it (start, resume, reboot, pause).
    #[serde(default = "default_ui_confirm_instance_actions")]
    pub confirm_instance_actions: bool,
    #[serde(default = "default_ui_notification_history")]
    pub notification_history: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            events_url: None,
            request_timeout_secs: default_api_request_timeout_secs(),
            retry_attempts: default_api_retry_attempts(),
            retry_backoff_ms: default_api_retry_backoff_ms(),
        }
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            auto_refresh: default_ui_auto_refresh(),
            refresh_interval_seconds: default_ui_refresh_interval_seconds(),
            confirm_instance_actions: default_ui_confirm_instance_actions(),
            notification_history: default_ui_notification_history(),
        }
    }
}

fn default_api_base_url() -> String {
    "http://localhost:8081/api".to_string()
}

fn default_api_request_timeout_secs() -> u64 {
    10
}

fn default_api_retry_attempts() -> u32 {
    2
}

fn default_api_retry_backoff_ms() -> u64 {
    250
}

fn default_ui_auto_refresh() -> bool {
    true
}

fn default_ui_refresh_interval_seconds() -> u64 {
    5
}

fn default_ui_confirm_instance_actions() -> bool {
    true
}

fn default_ui_notification_history() -> usize {
    200
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl UiConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds.max(1))
    }
}

impl VesselConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: VesselConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let config: VesselConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| VesselError::ConfigError(format!("failed to serialize config: {}", e)))?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// `~/.config/vessel/Vessel.toml` on Linux.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("vessel").join("Vessel.toml"))
    }
}

// Parse memory string like "1Gi", "512Mi", "2G" to bytes
pub fn parse_memory_to_bytes(memory_str: &str) -> Result<u64> {
    let memory_str = memory_str.trim();

    if memory_str.is_empty() {
        return Err(VesselError::ConfigError("empty size".to_string()));
    }

    let (number_part, multiplier) = if let Some(n) = memory_str.strip_suffix("Gi") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = memory_str.strip_suffix("Mi") {
        (n, 1024 * 1024)
    } else if let Some(n) = memory_str.strip_suffix('G') {
        (n, 1000 * 1000 * 1000)
    } else if let Some(n) = memory_str.strip_suffix('M') {
        (n, 1000 * 1000)
    } else {
        (memory_str, 1)
    };

    let number: u64 = number_part
        .trim()
        .parse()
        .map_err(|_| VesselError::ConfigError(format!("invalid size '{}'", memory_str)))?;

    number
        .checked_mul(multiplier)
        .ok_or_else(|| VesselError::ConfigError(format!("size '{}' is too large", memory_str)))
}

/// Size for the create form, in whole GiB (rounded up). Bare numbers are already GiB.
pub fn parse_size_to_gib(size_str: &str) -> Result<u64> {
    const GIB: u64 = 1024 * 1024 * 1024;

    let trimmed = size_str.trim();
    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        return trimmed
            .parse()
            .map_err(|_| VesselError::ConfigError(format!("invalid size '{}'", trimmed)));
    }

    let bytes = parse_memory_to_bytes(trimmed)?;
    Ok(bytes.div_ceil(GIB))
}
