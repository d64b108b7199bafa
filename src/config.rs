//! Bridge configuration
//!
//! Loaded from a TOML file. Every section has defaults so a missing file or
//! a partial file is fine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::audio::buffer::PlcStrategy;
use crate::constants;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub sender: SenderConfig,
    pub jitter: JitterConfig,
    pub receiver: ReceiverConfig,
    pub speech: SpeechConfig,
    pub spatial: SpatialConfig,
    pub whisper: WhisperConfig,
    pub network: NetworkConfig,
    pub control: ControlConfig,
}

/// Tick scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Mixing worker threads (1 = mix on the scheduler thread)
    pub threads: usize,
    /// Member count at which mixing is spread over the worker pool
    pub parallel_threshold: usize,
    /// One scheduler for all conferences instead of one per conference
    pub single_sender: bool,
    /// Conference media used when none is requested
    pub default_media: String,
    /// Give every pair of members a private mix, for load testing
    pub force_private_mix: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            parallel_threshold: 32,
            single_sender: true,
            default_media: constants::DEFAULT_MEDIA_PREFERENCE.to_string(),
            force_private_mix: false,
        }
    }
}

/// Jitter buffer settings, in packets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterConfig {
    /// Packets buffered before playout starts
    pub min_size: usize,
    /// Packets held before the oldest is dropped
    pub max_size: usize,
    /// What to play when a packet is missing
    pub plc: PlcStrategy,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 8,
            plc: PlcStrategy::Silence,
        }
    }
}

/// Inbound call handling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Seconds without RTP and RTCP before a SIP call is cancelled (0 disables)
    pub rtp_timeout_secs: u64,
    /// DTMF key that confirms a join
    pub join_confirmation_key: String,
    /// Unexpected payloads tolerated before a media-less call is cancelled
    pub bad_payload_threshold: u64,
    /// Run in-band DTMF detection and mute the tone
    pub dtmf_detection: bool,
    /// Publish detected keys as conference events
    pub forward_dtmf_keys: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            rtp_timeout_secs: 60,
            join_confirmation_key: constants::DEFAULT_JOIN_CONFIRMATION_KEY.to_string(),
            bad_payload_threshold: constants::BAD_PAYLOAD_CANCEL_THRESHOLD,
            dtmf_detection: true,
            forward_dtmf_keys: true,
        }
    }
}

/// Speech detector tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Mean absolute sample level counted as speech
    pub power_threshold: f64,
    /// Consecutive loud frames before speaking starts
    pub attack_frames: u32,
    /// Consecutive quiet frames before speaking stops
    pub hangover_frames: u32,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            power_threshold: 300.0,
            attack_frames: 2,
            hangover_frames: 15,
        }
    }
}

/// Global spatial audio tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialConfig {
    /// How quickly volume drops with distance
    pub falloff: f64,
    /// Volume floor for distant sources
    pub min_volume: f64,
    /// Echo delay for sources behind the listener, in milliseconds
    pub echo_delay_ms: f64,
    /// Echo level relative to the direct signal
    pub echo_volume: f64,
    /// Gain applied to sources behind the listener
    pub behind_volume: f64,
    /// Largest inter-aural delay, in milliseconds
    pub max_interaural_delay_ms: f64,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            falloff: 0.9,
            min_volume: 0.15,
            echo_delay_ms: 8.0,
            echo_volume: 0.2,
            behind_volume: 0.7,
            max_interaural_delay_ms: 0.63,
        }
    }
}

/// Whisper group defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhisperConfig {
    /// Attenuation of a newly created group
    pub default_attenuation: f64,
    /// Whether new groups sum their whisperers into a common mix
    pub common_mix_by_default: bool,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            default_attenuation: 0.13,
            common_mix_by_default: true,
        }
    }
}

/// RTP socket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: String,
    pub rtp_port: u16,
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            rtp_port: constants::DEFAULT_RTP_PORT,
            recv_buffer_size: 1024 * 1024,
            send_buffer_size: 1024 * 1024,
        }
    }
}

/// HTTP control API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            http_port: constants::DEFAULT_CONTROL_PORT,
        }
    }
}

impl BridgeConfig {
    /// Default config file location, `bridge.toml` in the platform config dir
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "conference-bridge", "bridge")
            .map(|dirs| dirs.config_dir().join("bridge.toml"))
    }

    /// Load from `path`, or from the default location if it exists.
    /// Falls back to defaults when no file is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path().filter(|p| p.exists()),
        };

        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(&path)?;
                let config = Self::from_toml(&text)?;
                tracing::info!("Loaded configuration from {}", path.display());
                config
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Self::default()
            }
        };

        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the mixing engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.sender.threads == 0 {
            return Err(Error::Config("sender.threads must be at least 1".into()));
        }
        if self.jitter.max_size == 0 || self.jitter.min_size > self.jitter.max_size {
            return Err(Error::Config(format!(
                "jitter sizes invalid: min {} max {}",
                self.jitter.min_size, self.jitter.max_size
            )));
        }
        if !(0.0..=1.0).contains(&self.whisper.default_attenuation) {
            return Err(Error::Config(format!(
                "whisper.default_attenuation {} not in 0..=1",
                self.whisper.default_attenuation
            )));
        }
        let media = self
            .sender
            .default_media
            .parse::<crate::protocol::MediaInfo>()
            .map_err(|e| Error::Config(e.to_string()))?;
        let tick_ms = media.packet_period().as_secs_f64() * 1000.0;
        if self.spatial.echo_delay_ms < 0.0 || self.spatial.echo_delay_ms > tick_ms {
            return Err(Error::Config(
                "spatial.echo_delay_ms must fit inside one tick".into(),
            ));
        }
        if self.spatial.max_interaural_delay_ms < 0.0
            || self.spatial.max_interaural_delay_ms > tick_ms
        {
            return Err(Error::Config(
                "spatial.max_interaural_delay_ms must fit inside one tick".into(),
            ));
        }
        Ok(())
    }

    /// Tick period: one packet of the default conference media
    pub fn tick(&self) -> std::time::Duration {
        self.sender
            .default_media
            .parse::<crate::protocol::MediaInfo>()
            .map(|media| media.packet_period())
            .unwrap_or(std::time::Duration::from_millis(constants::TICK_MS))
    }
}
