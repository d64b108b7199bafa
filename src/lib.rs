//! # Conference Bridge
//!
//! Real-time multi-party audio conference bridge. Every 20 ms the bridge
//! collects one frame of audio from each member, builds a personalised
//! mix for every listener (everyone minus themselves, shaped by whisper
//! groups and private mixes) and sends it back out over RTP.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                       Network (network::udp)                             │
//! │        RTP in ──► demux by remote address ──► Conference::receive         │
//! └─────────────────────────────────────┬────────────────────────────────────┘
//!                                       │
//!                                       ▼
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                 Member Receiver (conference::receiver)                   │
//! │   RTP parse ─► decrypt ─► decode ─► resample ─► DTMF ─► jitter buffer    │
//! └─────────────────────────────────────┬────────────────────────────────────┘
//!                                       │ one frame per tick
//!                                       ▼
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │              Conference Sender tick (conference::scheduler)              │
//! │                                                                          │
//! │  Armed ─► Collecting ─► Mixing ─► Dispatching ─► Invalidating ─► Armed   │
//! │              │             │           │                                 │
//! │              ▼             ▼           ▼                                 │
//! │   member contributions  MixManager   MemberSender                        │
//! │   whisper group sums    per member   encode + RTP                        │
//! └─────────────────────────────────────┬────────────────────────────────────┘
//!                                       │
//!                                       ▼
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                    Transport (network::Transport)                        │
//! │                   RTP out ──► member remote address                      │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Topology changes (join, leave, whisper, attenuation, mute) are applied
//! under the per-conference lock. Private mixes are queued in a batch and
//! applied once at the start of each tick.

pub mod audio;
pub mod codec;
pub mod conference;
pub mod config;
pub mod control;
pub mod error;
pub mod mixer;
pub mod network;
pub mod protocol;
pub mod treatment;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Length of one mixing tick in milliseconds
    pub const TICK_MS: u64 = 20;

    /// Default conference media preference
    pub const DEFAULT_MEDIA_PREFERENCE: &str = "PCMU/8000/1";

    /// Largest value a mixed sample may take on the wire
    pub const MAX_SAMPLE: i32 = i16::MAX as i32;

    /// Smallest value a mixed sample may take on the wire
    pub const MIN_SAMPLE: i32 = i16::MIN as i32;

    /// Default DTMF key a call must press before it hears the conference
    pub const DEFAULT_JOIN_CONFIRMATION_KEY: &str = "1";

    /// Prefix of the transient group a call waits in before confirming
    pub const INITIAL_WHISPER_GROUP_PREFIX: &str = "initial-";

    /// Ticks without media before per-call detectors are reset
    pub const NO_DATA_TICKS_BEFORE_RESET: u32 = 3;

    /// Unexpected payloads tolerated before a media-less call is cancelled
    pub const BAD_PAYLOAD_CANCEL_THRESHOLD: u64 = 1000;

    /// Default RTP telephone-event payload
    pub const DEFAULT_TELEPHONE_EVENT_PAYLOAD: u8 = 101;

    /// Default UDP port for RTP
    pub const DEFAULT_RTP_PORT: u16 = 5060;

    /// Default HTTP port for the control API
    pub const DEFAULT_CONTROL_PORT: u16 = 8080;

    /// Maximum packet size for UDP
    pub const MAX_PACKET_SIZE: usize = 1472; // MTU - IP/UDP headers
}
