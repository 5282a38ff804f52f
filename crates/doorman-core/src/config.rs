use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::engine::DEFAULT_CONFIDENCE_THRESHOLD;

/// Environment variable naming an optional TOML config file.
pub const CONFIG_FILE_ENV: &str = "DOORMAN_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{0} must be set to use the operator channel")]
    Missing(&'static str),
}

/// Process configuration.
///
/// Loaded once at startup from defaults, an optional TOML file named by
/// `DOORMAN_CONFIG`, then `DOORMAN_*` environment overrides. Treated as
/// immutable for the rest of the process lifetime.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Frames discarded after opening the camera (AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Root for the identity store and the face image directories.
    pub data_dir: PathBuf,
    /// Maximum encoding distance for a positive match.
    pub confidence_threshold: f32,
    /// Minimum time between detection cycles that found a face.
    pub cooldown_secs: u64,
    /// How long the door stays unlocked per grant.
    pub unlock_secs: u64,
    /// BCM GPIO pin driving the lock relay.
    pub relay_gpio_pin: u32,
    /// Relay module energizes on a low level (the common opto-isolated boards).
    pub relay_active_low: bool,
    /// How long an unanswered approval request stays actionable.
    pub pending_retention_secs: u64,
    /// Photo delivery attempts per alert.
    pub alert_attempts: u32,
    /// Base delay for linear alert retry backoff.
    pub alert_retry_delay_secs: u64,
    pub telegram_token: Option<String>,
    /// Operator chat that receives alerts.
    pub admin_chat_id: Option<i64>,
    pub telegram_api_url: String,
    /// Long-poll timeout for inbound operator events.
    pub poll_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("doorman");

        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            warmup_frames: 5,
            model_dir: PathBuf::from("/usr/share/doorman/models"),
            data_dir,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            cooldown_secs: 2,
            unlock_secs: 10,
            relay_gpio_pin: 17,
            relay_active_low: true,
            pending_retention_secs: 3600,
            alert_attempts: 3,
            alert_retry_delay_secs: 2,
            telegram_token: None,
            admin_chat_id: None,
            telegram_api_url: "https://api.telegram.org".to_string(),
            poll_timeout_secs: 50,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("camera_device", &self.camera_device)
            .field("camera_width", &self.camera_width)
            .field("camera_height", &self.camera_height)
            .field("warmup_frames", &self.warmup_frames)
            .field("model_dir", &self.model_dir)
            .field("data_dir", &self.data_dir)
            .field("confidence_threshold", &self.confidence_threshold)
            .field("cooldown_secs", &self.cooldown_secs)
            .field("unlock_secs", &self.unlock_secs)
            .field("relay_gpio_pin", &self.relay_gpio_pin)
            .field("relay_active_low", &self.relay_active_low)
            .field("pending_retention_secs", &self.pending_retention_secs)
            .field("alert_attempts", &self.alert_attempts)
            .field("alert_retry_delay_secs", &self.alert_retry_delay_secs)
            .field("telegram_token", &self.telegram_token.as_ref().map(|_| "[REDACTED]"))
            .field("admin_chat_id", &self.admin_chat_id)
            .field("telegram_api_url", &self.telegram_api_url)
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .finish()
    }
}

impl Config {
    /// Load configuration: defaults, then `DOORMAN_CONFIG`, then `DOORMAN_*`.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `DOORMAN_*` overrides looked up through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("DOORMAN_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        override_parsed(&lookup, "DOORMAN_CAMERA_WIDTH", &mut self.camera_width)?;
        override_parsed(&lookup, "DOORMAN_CAMERA_HEIGHT", &mut self.camera_height)?;
        override_parsed(&lookup, "DOORMAN_WARMUP_FRAMES", &mut self.warmup_frames)?;
        if let Some(v) = lookup("DOORMAN_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("DOORMAN_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        override_parsed(&lookup, "DOORMAN_CONFIDENCE_THRESHOLD", &mut self.confidence_threshold)?;
        override_parsed(&lookup, "DOORMAN_COOLDOWN_SECS", &mut self.cooldown_secs)?;
        override_parsed(&lookup, "DOORMAN_UNLOCK_SECS", &mut self.unlock_secs)?;
        override_parsed(&lookup, "DOORMAN_RELAY_GPIO_PIN", &mut self.relay_gpio_pin)?;
        if let Some(v) = lookup("DOORMAN_RELAY_ACTIVE_LOW") {
            self.relay_active_low = v != "0";
        }
        override_parsed(&lookup, "DOORMAN_PENDING_RETENTION_SECS", &mut self.pending_retention_secs)?;
        override_parsed(&lookup, "DOORMAN_ALERT_ATTEMPTS", &mut self.alert_attempts)?;
        override_parsed(&lookup, "DOORMAN_ALERT_RETRY_DELAY_SECS", &mut self.alert_retry_delay_secs)?;
        if let Some(v) = lookup("DOORMAN_TELEGRAM_TOKEN") {
            self.telegram_token = Some(v);
        }
        if let Some(v) = lookup("DOORMAN_ADMIN_CHAT_ID") {
            let id = v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "DOORMAN_ADMIN_CHAT_ID",
                value: v.clone(),
            })?;
            self.admin_chat_id = Some(id);
        }
        if let Some(v) = lookup("DOORMAN_TELEGRAM_API_URL") {
            self.telegram_api_url = v;
        }
        override_parsed(&lookup, "DOORMAN_POLL_TIMEOUT_SECS", &mut self.poll_timeout_secs)?;
        Ok(())
    }

    /// Bot token and operator chat, both required by the daemon.
    pub fn telegram(&self) -> Result<(&str, i64), ConfigError> {
        let token = self
            .telegram_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::Missing("DOORMAN_TELEGRAM_TOKEN"))?;
        let chat = self
            .admin_chat_id
            .ok_or(ConfigError::Missing("DOORMAN_ADMIN_CHAT_ID"))?;
        Ok((token, chat))
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("face_database.json")
    }

    /// One reference image per identity, named by identity.
    pub fn known_faces_dir(&self) -> PathBuf {
        self.data_dir.join("known_faces")
    }

    /// Timestamped crops of faces awaiting a decision.
    pub fn unknown_faces_dir(&self) -> PathBuf {
        self.data_dir.join("unknown_faces")
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn unlock_hold(&self) -> Duration {
        Duration::from_secs(self.unlock_secs)
    }

    pub fn pending_retention(&self) -> Duration {
        Duration::from_secs(self.pending_retention_secs)
    }

    pub fn alert_retry_delay(&self) -> Duration {
        Duration::from_secs(self.alert_retry_delay_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

fn override_parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = lookup(key) {
        *slot = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value })?;
    }
    Ok(())
}
