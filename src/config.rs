//! Application Configuration
//!
//! Settings for every component, loaded from a TOML file. Each section
//! falls back to its defaults so a partial file is valid.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingSettings,
    pub storage: StorageSettings,
    pub dedupe: DedupeSettings,
    pub session: SessionSettings,
    pub coordinator: CoordinatorSettings,
    pub signals: SignalSettings,
    pub jobs: JobSettings,
    pub direction: DirectionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Used when RUST_LOG is not set
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub database_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeSettings {
    pub retention_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub request_timeout_ms: u64,
    /// Frames kept by the debug capture ring (debug builds only)
    pub capture_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub ping_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalSettings {
    pub ttl_min_secs: i64,
    pub ttl_max_secs: i64,
    pub ttl_default_secs: i64,
    pub max_content_chars: usize,
    pub fade_duration_ms: i64,
    pub entrance_duration_ms: i64,
    /// Grid size used to coarsen locations before they leave the device
    pub privacy_radius_m: f64,
    pub blocked_terms: Vec<String>,
    pub cloud_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    pub cleanup_interval_secs: u64,
    pub refresh_interval_secs: u64,
    pub countdown_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectionSettings {
    pub window_secs: i64,
    pub sectors: usize,
    pub decay_half_life_secs: f64,
    pub min_samples: usize,
    pub noise_floor_dbm: f64,
    pub spread_full_scale_db: f64,
}

impl AppConfig {
    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: AppConfig = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file if one was given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let signals = &self.signals;
        if signals.ttl_min_secs <= 0 {
            bail!("signals.ttl_min_secs must be greater than 0");
        }
        if signals.ttl_min_secs >= signals.ttl_max_secs {
            bail!("signals.ttl_min_secs must be below signals.ttl_max_secs");
        }
        if signals.ttl_default_secs < signals.ttl_min_secs
            || signals.ttl_default_secs > signals.ttl_max_secs
        {
            bail!("signals.ttl_default_secs must lie within the ttl bounds");
        }
        if signals.max_content_chars == 0 {
            bail!("signals.max_content_chars must be greater than 0");
        }
        if signals.fade_duration_ms <= 0 {
            bail!("signals.fade_duration_ms must be greater than 0");
        }
        if !signals.privacy_radius_m.is_finite() || signals.privacy_radius_m <= 0.0 {
            bail!("signals.privacy_radius_m must be greater than 0");
        }
        if signals.cloud_timeout_ms == 0 {
            bail!("signals.cloud_timeout_ms must be greater than 0");
        }
        if self.jobs.cleanup_interval_secs == 0
            || self.jobs.refresh_interval_secs == 0
            || self.jobs.countdown_interval_ms == 0
        {
            bail!("job intervals must be greater than 0");
        }
        if self.session.capture_capacity == 0 {
            bail!("session.capture_capacity must be greater than 0");
        }
        if self.session.request_timeout_ms == 0 {
            bail!("session.request_timeout_ms must be greater than 0");
        }
        if self.dedupe.retention_secs == 0 {
            bail!("dedupe.retention_secs must be greater than 0");
        }
        if self.direction.sectors == 0 || self.direction.min_samples == 0 {
            bail!("direction.sectors and direction.min_samples must be greater than 0");
        }
        if self.direction.spread_full_scale_db <= 0.0 {
            bail!("direction.spread_full_scale_db must be positive");
        }
        if self.direction.window_secs <= 0 {
            bail!("direction.window_secs must be greater than 0");
        }
        let half_life = self.direction.decay_half_life_secs;
        if !half_life.is_finite() || half_life <= 0.0 {
            bail!("direction.decay_half_life_secs must be greater than 0");
        }
        Ok(())
    }
}

impl SessionSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl CoordinatorSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

impl SignalSettings {
    pub fn fade_duration(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.fade_duration_ms)
    }

    pub fn entrance_duration(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.entrance_duration_ms)
    }

    pub fn cloud_timeout(&self) -> Duration {
        Duration::from_millis(self.cloud_timeout_ms)
    }
}

impl DedupeSettings {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs as i64)
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("meshsignal.db"),
        }
    }
}

impl Default for DedupeSettings {
    fn default() -> Self {
        Self {
            retention_secs: 24 * 60 * 60,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            capture_capacity: 256,
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 8_000,
            ping_timeout_ms: 3_000,
        }
    }
}

impl Default for SignalSettings {
    fn default() -> Self {
        Self {
            ttl_min_secs: 60,
            ttl_max_secs: 24 * 60 * 60,
            ttl_default_secs: 60 * 60,
            max_content_chars: 280,
            fade_duration_ms: 2_000,
            entrance_duration_ms: 1_000,
            privacy_radius_m: 500.0,
            blocked_terms: Vec::new(),
            cloud_timeout_ms: 10_000,
        }
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 60,
            refresh_interval_secs: 30,
            countdown_interval_ms: 1_000,
        }
    }
}

impl Default for DirectionSettings {
    fn default() -> Self {
        Self {
            window_secs: 30,
            sectors: 16,
            decay_half_life_secs: 5.0,
            min_samples: 8,
            noise_floor_dbm: -100.0,
            spread_full_scale_db: 20.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [signals]
            ttl_min_secs = 120

            [jobs]
            refresh_interval_secs = 45
            "#,
        )
        .unwrap();

        assert_eq!(config.signals.ttl_min_secs, 120);
        assert_eq!(config.signals.max_content_chars, 280);
        assert_eq!(config.jobs.refresh_interval_secs, 45);
        assert_eq!(config.jobs.countdown_interval_ms, 1_000);
        assert_eq!(config.dedupe.retention_secs, 86_400);
        config.validate().unwrap();
    }

    #[test]
    fn inverted_ttl_bounds_are_rejected() {
        let mut config = AppConfig::default();
        config.signals.ttl_min_secs = config.signals.ttl_max_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_half_life_is_rejected() {
        let mut config = AppConfig::default();
        config.direction.decay_half_life_secs = 0.0;
        assert!(config.validate().is_err());

        config.direction.decay_half_life_secs = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_direction_window_is_rejected() {
        let mut config = AppConfig::default();
        config.direction.window_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn negative_privacy_radius_is_rejected() {
        let mut config = AppConfig::default();
        config.signals.privacy_radius_m = -25.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("privacy_radius_m"));
    }

    #[test]
    fn zero_cloud_timeout_is_rejected() {
        let mut config = AppConfig::default();
        config.signals.cloud_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshsignal.toml");
        std::fs::write(&path, "[logging]\nlevel = \"debug\"\n").unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.logging.level, "debug");
    }
}
