//! fleetbox-node configuration
//!
//! Loaded from the TOML config file; every key has a compiled default so a
//! missing file still yields a runnable node. Command-line flags are applied
//! on top in `main`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use fleetbox_common::time::millis_to_duration;

/// Node configuration, one struct per TOML section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Data root; overridden by `--root-folder` / `FLEETBOX_ROOT_FOLDER`
    pub root_folder: Option<String>,
    pub device: DeviceConfig,
    pub server: ServerConfig,
    pub download: DownloadConfig,
    pub playback: PlaybackConfig,
    pub schedule: ScheduleConfig,
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device token reported in every status message
    pub token: String,
    /// Base URL of the media library; track remote paths are joined onto it
    pub media_base_url: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            token: "unprovisioned".to_string(),
            media_base_url: "http://localhost:3000/media".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 5780,
        }
    }
}

/// Download scheduler, governor and fetcher tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub max_concurrent_downloads: usize,
    /// 0 = unlimited
    pub max_bytes_per_second: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Random jitter added to each backoff, 0..=this
    pub retry_jitter_ms: u64,
    /// Delay before a failed job is queued again
    pub requeue_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub initial_chunk_bytes: u64,
    pub min_chunk_bytes: u64,
    pub max_chunk_bytes: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            max_bytes_per_second: 0,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            retry_jitter_ms: 1000,
            requeue_delay_ms: 5000,
            request_timeout_secs: 30,
            initial_chunk_bytes: 1024 * 1024,
            min_chunk_bytes: 256 * 1024,
            max_chunk_bytes: 2 * 1024 * 1024,
        }
    }
}

impl DownloadConfig {
    pub fn requeue_delay(&self) -> Duration {
        millis_to_duration(self.requeue_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Sequencer cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub tick_ms: u64,
    pub preload_poll_ms: u64,
    pub preload_timeout_ms: u64,
    /// Used until a volume has been persisted
    pub default_volume: f32,
    /// Interval of the deviceStatus / playbackStatus heartbeat
    pub status_interval_secs: u64,
    /// Play history rows kept; older rows are pruned
    pub history_limit: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            tick_ms: 50,
            preload_poll_ms: 500,
            preload_timeout_ms: 10_000,
            default_volume: 0.5,
            status_interval_secs: 5,
            history_limit: 5000,
        }
    }
}

impl PlaybackConfig {
    pub fn tick(&self) -> Duration {
        millis_to_duration(self.tick_ms)
    }

    pub fn preload_poll(&self) -> Duration {
        millis_to_duration(self.preload_poll_ms)
    }

    pub fn preload_timeout(&self) -> Duration {
        millis_to_duration(self.preload_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub check_interval_secs: u64,
    /// Consecutive errors before a schedule falls back for good
    pub max_errors: u32,
    /// Delay before retrying a schedule after a single error
    pub retry_delay_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 10,
            max_errors: 3,
            retry_delay_secs: 30,
        }
    }
}

impl ScheduleConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Media library reachability check
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub check_interval_ms: u64,
    /// A ping slower than this counts as offline
    pub timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 5000,
            timeout_ms: 3000,
        }
    }
}

impl NetworkConfig {
    pub fn check_interval(&self) -> Duration {
        millis_to_duration(self.check_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        millis_to_duration(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// EnvFilter directive; `RUST_LOG` wins when set
    pub level: Option<String>,
}

impl NodeConfig {
    /// Load from an explicit path or the platform default location
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: NodeConfig = fleetbox_common::config::load_toml(path)
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall the engine
    pub fn validate(&self) -> Result<()> {
        let d = &self.download;
        if d.max_concurrent_downloads == 0 {
            return Err(Error::Config(
                "download.max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if d.min_chunk_bytes == 0 || d.min_chunk_bytes > d.max_chunk_bytes {
            return Err(Error::Config(format!(
                "download chunk bounds invalid: min {} max {}",
                d.min_chunk_bytes, d.max_chunk_bytes
            )));
        }
        if self.playback.tick_ms == 0 || self.playback.tick_ms >= 100 {
            return Err(Error::Config(
                "playback.tick_ms must be between 1 and 99".to_string(),
            ));
        }
        if self.schedule.max_errors == 0 {
            return Err(Error::Config("schedule.max_errors must be at least 1".to_string()));
        }
        if self.network.check_interval_ms == 0 {
            return Err(Error::Config(
                "network.check_interval_ms must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.playback.default_volume) {
            return Err(Error::Config(
                "playback.default_volume must be within 0.0-1.0".to_string(),
            ));
        }
        Ok(())
    }
}
