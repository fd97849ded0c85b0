//! Application configuration.
//!
//! Loaded from a TOML file at startup. Every field has a sensible default,
//! so both binaries run without a config file present.

use std::path::PathBuf;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Network settings shared by sender and receiver
    pub net: NetConfig,
    /// Audio format and codec settings
    pub audio: AudioConfig,
    /// Sender-side settings
    pub sender: SenderConfig,
    /// Receiver-side settings
    pub receiver: ReceiverConfig,
}

/// Network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Base UDP port. Stream packets arrive here; control rides on +1,
    /// discovery probes on +2.
    pub base_port: u16,
    /// Keep-alive ping interval in seconds
    pub keep_alive_secs: u64,
    /// Listeners silent for longer than this are pruned
    pub stale_secs: u64,
    /// Receivers re-announce themselves at this interval in seconds
    pub hello_refresh_secs: u64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            base_port: crate::constants::DEFAULT_STREAM_PORT,
            keep_alive_secs: 3,
            stale_secs: 30,
            hello_refresh_secs: 15,
        }
    }
}

/// Audio format and codec settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count
    pub channels: u16,
    /// Opus bitrate in bits per second
    pub bitrate: u32,
    /// Codec frame duration in milliseconds
    pub frame_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::constants::DEFAULT_SAMPLE_RATE,
            channels: crate::constants::DEFAULT_CHANNELS,
            bitrate: crate::constants::DEFAULT_BITRATE,
            frame_ms: 10,
        }
    }
}

impl AudioConfig {
    /// Samples per codec frame per channel
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }

    /// Interleaved i16 samples per codec frame across all channels
    pub fn frame_len(&self) -> usize {
        self.frame_samples() * self.channels as usize
    }
}

/// Sender-side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Capture device id (None = system default input)
    pub device_id: Option<String>,
    /// Service name advertised to discovery probes
    pub service_name: String,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            service_name: "lancast".into(),
        }
    }
}

/// Receiver-side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Playback device id (None = system default output)
    pub device_id: Option<String>,
    /// Display name announced in the Hello packet
    pub name: String,
    /// Jitter buffer capacity in encoded frames
    pub jitter_capacity: usize,
    /// Frames buffered before playback starts
    pub preroll_frames: usize,
    /// Milliseconds without decoded output before the decoder drops
    /// from framed to raw mode
    pub stall_ms: u64,
    /// Pause after a decoder error before resuming, in milliseconds
    pub error_backoff_ms: u64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            name: "receiver".into(),
            jitter_capacity: crate::constants::JITTER_CAPACITY,
            preroll_frames: crate::constants::JITTER_PREROLL,
            stall_ms: 500,
            error_backoff_ms: 10,
        }
    }
}

impl AppConfig {
    /// Default config file location for this platform.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "lancast").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Loads the configuration from the platform config directory.
    /// Returns defaults when no file exists yet.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Loads the configuration from an explicit path.
    /// Returns defaults when the file does not exist.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(Error::Config(format!("{}: {}", path.display(), e))),
        }
    }

    /// Writes the configuration to the platform config directory.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path()
            .ok_or_else(|| Error::Config("no config directory for this platform".into()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents =
            toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(&path, contents)?;
        Ok(())
    }

    /// Port stream packets travel on
    pub fn stream_port(&self) -> u16 {
        self.net.base_port
    }

    /// Port control packets travel on
    pub fn control_port(&self) -> u16 {
        self.net.base_port + 1
    }

    /// Port discovery probes travel on
    pub fn discovery_port(&self) -> u16 {
        self.net.base_port + 2
    }
}
