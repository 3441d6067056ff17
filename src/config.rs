use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::media::FacingMode;

pub const CONFIG_FILE: &str = "tryon_config.toml";

/// Environment variable holding the backend service key.
pub const BACKEND_KEY_ENV: &str = "TRYON_SUPABASE_KEY";

/// Environment variable holding the vision service key (optional when a proxy is used).
pub const VISION_KEY_ENV: &str = "TRYON_VISION_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub camera: CameraConfig,
    pub validation: ValidationConfig,
    pub backend: BackendConfig,
    pub observe: ObserveConfig,
    pub upload: UploadConfig,
    pub paths: PathConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraBackendKind {
    Rpicam,
    Virtual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub backend: CameraBackendKind,
    pub default_facing: FacingMode,
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub min_width: u32,
    pub min_height: u32,
    pub low_width: u32,
    pub low_height: u32,
    pub fallback_width: u32,
    pub fallback_height: u32,
    pub jpeg_quality: u8,
    pub playback_retries: u32,
    pub playback_backoff_ms: u64,
    pub allow_opposite_facing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub require_front_facing: bool,
    pub max_pan_degrees: f32,
    pub max_tilt_degrees: f32,
    pub max_roll_degrees: f32,
    pub subject_labels: Vec<String>,
    pub garment_labels: Vec<String>,
    pub disallowed_labels: Vec<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub url: String,
    pub bucket: String,
    pub sessions_table: String,
    pub dresses_table: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObserveStrategy {
    Poll,
    Push,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserveConfig {
    pub strategy: ObserveStrategy,
    pub poll_interval_ms: u64,
    /// Upper bound on how long a session is observed. Absent means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wait_secs: Option<u64>,
    pub heartbeat_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub max_file_bytes: u64,
    pub accepted_extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    pub capture_dir: PathBuf,
    pub preview_dir: PathBuf,
    pub config_file: PathBuf,
}

fn default_request_timeout() -> u64 {
    30
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: CameraBackendKind::Rpicam,
            default_facing: FacingMode::User,
            ideal_width: 1280,
            ideal_height: 720,
            min_width: 640,
            min_height: 480,
            low_width: 640,
            low_height: 480,
            fallback_width: 640,
            fallback_height: 480,
            jpeg_quality: 90,
            playback_retries: 3,
            playback_backoff_ms: 200,
            allow_opposite_facing: false,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "https://vision.googleapis.com/v1/images:annotate".to_string(),
            require_front_facing: true,
            max_pan_degrees: 35.0,
            max_tilt_degrees: 25.0,
            max_roll_degrees: 35.0,
            subject_labels: strings(&[
                "baby", "infant", "child", "toddler", "kid", "girl", "person", "human",
            ]),
            garment_labels: strings(&["dress", "clothing", "apparel", "garment", "outfit"]),
            disallowed_labels: strings(&[
                "dog", "cat", "pet", "animal", "toy", "doll", "adult", "man", "woman",
            ]),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:54321".to_string(),
            bucket: "tryon-images".to_string(),
            sessions_table: "tryon_sessions".to_string(),
            dresses_table: "dress_options".to_string(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for ObserveConfig {
    fn default() -> Self {
        Self {
            strategy: ObserveStrategy::Poll,
            poll_interval_ms: 3000,
            max_wait_secs: Some(600),
            heartbeat_secs: 25,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 10 * 1024 * 1024,
            accepted_extensions: strings(&["jpg", "jpeg", "png", "gif", "webp", "bmp"]),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera: CameraConfig::default(),
            validation: ValidationConfig::default(),
            backend: BackendConfig::default(),
            observe: ObserveConfig::default(),
            upload: UploadConfig::default(),
            paths: PathConfig {
                capture_dir: PathBuf::from("captures"),
                preview_dir: std::env::temp_dir(),
                config_file: PathBuf::from(CONFIG_FILE),
            },
        }
    }
}

impl ObserveConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_secs.map(Duration::from_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

impl ValidationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = PathBuf::from(CONFIG_FILE);

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            log::info!("Config file not found, creating default configuration");
            let default_config = Self::default();
            default_config.save()?;
            Ok(default_config)
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Self = toml::from_str(&contents)
            .with_context(|| "Failed to parse configuration file")?;

        config.validate()?;
        log::info!("Configuration loaded from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to_file(&self.paths.config_file)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        // Ensure parent directory exists
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create config directory: {}", parent.display())
                })?;
            }
        }

        std::fs::write(path.as_ref(), contents)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        log::info!("Configuration saved to {}", path.as_ref().display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let camera = &self.camera;
        if camera.ideal_width == 0 || camera.ideal_height == 0 {
            return Err(anyhow::anyhow!("Invalid ideal camera resolution"));
        }
        if camera.low_width == 0 || camera.low_height == 0 {
            return Err(anyhow::anyhow!("Invalid low camera resolution"));
        }
        if camera.fallback_width == 0 || camera.fallback_height == 0 {
            return Err(anyhow::anyhow!("Invalid fallback capture resolution"));
        }
        if camera.min_width > camera.ideal_width || camera.min_height > camera.ideal_height {
            return Err(anyhow::anyhow!("Minimum camera resolution exceeds ideal resolution"));
        }
        if camera.jpeg_quality == 0 || camera.jpeg_quality > 100 {
            return Err(anyhow::anyhow!("Invalid JPEG quality: {}", camera.jpeg_quality));
        }

        let validation = &self.validation;
        if validation.subject_labels.is_empty() || validation.garment_labels.is_empty() {
            return Err(anyhow::anyhow!("Required label sets must not be empty"));
        }
        for threshold in [
            validation.max_pan_degrees,
            validation.max_tilt_degrees,
            validation.max_roll_degrees,
        ] {
            if !(0.0..=180.0).contains(&threshold) {
                return Err(anyhow::anyhow!("Invalid face angle threshold: {}", threshold));
            }
        }

        if self.observe.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("Invalid poll interval"));
        }
        if self.observe.max_wait_secs == Some(0) {
            return Err(anyhow::anyhow!("Invalid observation bound"));
        }
        if self.observe.heartbeat_secs == 0 {
            return Err(anyhow::anyhow!("Invalid realtime heartbeat interval"));
        }
        if self.validation.request_timeout_secs == 0 || self.backend.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Request timeouts must be at least one second"));
        }
        if self.upload.max_file_bytes == 0 {
            return Err(anyhow::anyhow!("Invalid maximum upload size"));
        }

        Ok(())
    }

    pub fn create_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.paths.capture_dir).with_context(|| {
            format!("Failed to create capture directory: {}", self.paths.capture_dir.display())
        })?;

        log::info!("Created necessary directories");
        Ok(())
    }

    /// Service key for the session backend, taken from the environment only.
    pub fn backend_key() -> Result<String> {
        std::env::var(BACKEND_KEY_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .with_context(|| format!("{} is not set", BACKEND_KEY_ENV))
    }

    /// Vision key, if any. A server-side proxy endpoint needs none.
    pub fn vision_key() -> Option<String> {
        std::env::var(VISION_KEY_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

// Configuration builder for easier setup
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn camera_backend(mut self, backend: CameraBackendKind) -> Self {
        self.config.camera.backend = backend;
        self
    }

    pub fn facing(mut self, facing: FacingMode) -> Self {
        self.config.camera.default_facing = facing;
        self
    }

    pub fn ideal_resolution(mut self, width: u32, height: u32) -> Self {
        self.config.camera.ideal_width = width;
        self.config.camera.ideal_height = height;
        self
    }

    pub fn jpeg_quality(mut self, quality: u8) -> Self {
        self.config.camera.jpeg_quality = quality;
        self
    }

    pub fn backend_url(mut self, url: &str) -> Self {
        self.config.backend.url = url.to_string();
        self
    }

    pub fn vision_endpoint(mut self, endpoint: &str) -> Self {
        self.config.validation.endpoint = endpoint.to_string();
        self
    }

    pub fn validation_enabled(mut self, enabled: bool) -> Self {
        self.config.validation.enabled = enabled;
        self
    }

    pub fn strategy(mut self, strategy: ObserveStrategy) -> Self {
        self.config.observe.strategy = strategy;
        self
    }

    pub fn max_wait_secs(mut self, secs: Option<u64>) -> Self {
        self.config.observe.max_wait_secs = secs;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// Environment-specific configuration presets
impl Config {
    /// Laptop development: synthetic camera, local backend, no vision calls.
    pub fn development_desktop() -> Self {
        Config {
            camera: CameraConfig {
                backend: CameraBackendKind::Virtual,
                ..Default::default()
            },
            validation: ValidationConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Booth kiosk on a Pi with the rear camera and realtime updates.
    pub fn kiosk() -> Self {
        Config {
            camera: CameraConfig {
                default_facing: FacingMode::Environment,
                allow_opposite_facing: true,
                ..Default::default()
            },
            observe: ObserveConfig {
                strategy: ObserveStrategy::Push,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
