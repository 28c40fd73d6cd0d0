//! Pipeline configuration
//!
//! Loaded from a TOML file; every field has a default so partial files work.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceChatConfig {
    pub audio: AudioSettings,
    pub playback: PlaybackSettings,
    pub device: DeviceSettings,
    pub codec: CodecSettings,
}

/// Capture side settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Rate everything is converted to before it leaves the capture engine
    pub target_sample_rate: u32,
    /// Only mono is supported
    pub target_channels: u16,
    pub buffer_duration_secs: f32,
    /// Samples per outbound chunk
    pub chunk_size: usize,
    /// Consumer sleep when less than a chunk is buffered
    pub consumer_backoff_ms: u64,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            target_sample_rate: constants::DEFAULT_SAMPLE_RATE,
            target_channels: constants::DEFAULT_CHANNELS,
            buffer_duration_secs: constants::DEFAULT_BUFFER_SECONDS,
            chunk_size: constants::DEFAULT_CHUNK_SIZE,
            consumer_backoff_ms: constants::CONSUMER_BACKOFF_MS,
        }
    }
}

impl AudioSettings {
    pub fn consumer_backoff(&self) -> Duration {
        Duration::from_millis(self.consumer_backoff_ms)
    }
}

/// Playback side settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    /// Samples that must be buffered before a stream is drained
    pub min_chunk: usize,
    /// Most samples drained from one stream per tick
    pub max_chunk: usize,
    pub tick_interval_ms: u64,
    /// Idle time after which a stream is removed
    pub stream_timeout_secs: f32,
    pub buffer_duration_secs: f32,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            min_chunk: constants::MIN_PLAYBACK_CHUNK,
            max_chunk: constants::MAX_PLAYBACK_CHUNK,
            tick_interval_ms: constants::DEFAULT_TICK_INTERVAL_MS,
            stream_timeout_secs: constants::DEFAULT_STREAM_TIMEOUT_SECS,
            buffer_duration_secs: constants::DEFAULT_BUFFER_SECONDS,
        }
    }
}

impl PlaybackSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Falls back to the default timeout if the configured value is not a
    /// usable duration
    pub fn stream_timeout(&self) -> Duration {
        Duration::try_from_secs_f32(self.stream_timeout_secs)
            .ok()
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or_else(|| Duration::from_secs_f32(constants::DEFAULT_STREAM_TIMEOUT_SECS))
    }
}

/// Device monitoring settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Enumeration interval for the polling monitor
    pub poll_interval_ms: u64,
    /// Delay before capture restarts after a device reconnects
    pub restart_delay_ms: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            restart_delay_ms: constants::DEFAULT_RESTART_DELAY_MS,
        }
    }
}

impl DeviceSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

/// Opus voice codec settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecSettings {
    pub bitrate: u32,
    pub vbr: bool,
    /// In-band forward error correction
    pub fec: bool,
    /// Expected packet loss percentage, tunes FEC
    pub packet_loss_perc: u8,
}

impl Default for CodecSettings {
    fn default() -> Self {
        Self {
            bitrate: constants::DEFAULT_VOICE_BITRATE,
            vbr: true,
            fec: true,
            packet_loss_perc: 10,
        }
    }
}

impl VoiceChatConfig {
    /// Read and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as TOML, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Per-user config file location, if a home directory is known
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "voice-pipeline").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load the per-user config, falling back to defaults if it is missing
    /// or unreadable
    pub fn load_or_default() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }

        match Self::load(&path) {
            Ok(config) => {
                tracing::info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!("Ignoring config at {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let audio = &self.audio;
        if audio.target_sample_rate == 0 {
            return Err(Error::Config("audio.target_sample_rate must be non-zero".into()));
        }
        if audio.target_channels != 1 {
            return Err(Error::Config(format!(
                "audio.target_channels must be 1 (mono), got {}",
                audio.target_channels
            )));
        }
        if audio.chunk_size == 0 {
            return Err(Error::Config("audio.chunk_size must be non-zero".into()));
        }
        check_secs("audio.buffer_duration_secs", audio.buffer_duration_secs, constants::MAX_BUFFER_SECONDS)?;

        let playback = &self.playback;
        if playback.min_chunk == 0 || playback.max_chunk == 0 {
            return Err(Error::Config("playback chunk sizes must be non-zero".into()));
        }
        if playback.min_chunk > playback.max_chunk {
            return Err(Error::Config(format!(
                "playback.min_chunk ({}) exceeds playback.max_chunk ({})",
                playback.min_chunk, playback.max_chunk
            )));
        }
        if playback.tick_interval_ms == 0 {
            return Err(Error::Config("playback.tick_interval_ms must be non-zero".into()));
        }
        check_secs(
            "playback.stream_timeout_secs",
            playback.stream_timeout_secs,
            constants::MAX_STREAM_TIMEOUT_SECS,
        )?;
        check_secs(
            "playback.buffer_duration_secs",
            playback.buffer_duration_secs,
            constants::MAX_BUFFER_SECONDS,
        )?;

        if self.device.poll_interval_ms == 0 {
            return Err(Error::Config("device.poll_interval_ms must be non-zero".into()));
        }
        if self.codec.packet_loss_perc > 100 {
            return Err(Error::Config("codec.packet_loss_perc must be 0-100".into()));
        }

        Ok(())
    }
}

/// Seconds must be positive, finite and at most `max`
fn check_secs(name: &str, value: f32, max: f32) -> Result<()> {
    if value > 0.0 && value <= max {
        Ok(())
    } else {
        Err(Error::Config(format!("{} must be in (0, {}] seconds, got {}", name, max, value)))
    }
}
