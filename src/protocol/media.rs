//! Media descriptions
//!
//! A conference runs at one sample rate and channel count. Members may use a
//! different payload; the receiver and sender resample at the edges.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::TICK_MS;
use crate::error::{CodecError, ConferenceError};

/// Sample encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// G.711 mu-law
    Pcmu,
    /// 16-bit signed linear, network byte order
    Linear,
    Opus,
}

impl Encoding {
    fn name(&self) -> &'static str {
        match self {
            Encoding::Pcmu => "PCMU",
            Encoding::Linear => "PCM",
            Encoding::Opus => "OPUS",
        }
    }
}

/// Payload, encoding, rate and channel count of a media stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaInfo {
    pub payload: u8,
    pub encoding: Encoding,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Known payloads. Dynamic numbers follow the bridge's own offer.
const SUPPORTED_MEDIA: &[MediaInfo] = &[
    MediaInfo::new(0, Encoding::Pcmu, 8000, 1),
    MediaInfo::new(10, Encoding::Linear, 44100, 2),
    MediaInfo::new(11, Encoding::Linear, 44100, 1),
    MediaInfo::new(102, Encoding::Linear, 8000, 1),
    MediaInfo::new(103, Encoding::Linear, 8000, 2),
    MediaInfo::new(104, Encoding::Linear, 16000, 1),
    MediaInfo::new(105, Encoding::Linear, 16000, 2),
    MediaInfo::new(106, Encoding::Linear, 32000, 1),
    MediaInfo::new(107, Encoding::Linear, 32000, 2),
    MediaInfo::new(108, Encoding::Linear, 48000, 1),
    MediaInfo::new(109, Encoding::Linear, 48000, 2),
    MediaInfo::new(111, Encoding::Opus, 48000, 2),
    MediaInfo::new(112, Encoding::Opus, 48000, 1),
];

impl MediaInfo {
    pub const fn new(payload: u8, encoding: Encoding, sample_rate: u32, channels: u16) -> Self {
        Self {
            payload,
            encoding,
            sample_rate,
            channels,
        }
    }

    /// Look up a payload number
    pub fn from_payload(payload: u8) -> Result<Self, CodecError> {
        SUPPORTED_MEDIA
            .iter()
            .find(|m| m.payload == payload)
            .copied()
            .ok_or(CodecError::UnsupportedPayload(payload))
    }

    /// Find the payload for an encoding, rate and channel count
    pub fn find(encoding: Encoding, sample_rate: u32, channels: u16) -> Option<Self> {
        SUPPORTED_MEDIA
            .iter()
            .find(|m| m.encoding == encoding && m.sample_rate == sample_rate && m.channels == channels)
            .copied()
    }

    /// Audio carried by one packet. The mixing tick runs at this period.
    pub fn packet_period(&self) -> Duration {
        Duration::from_millis(TICK_MS)
    }

    /// Interleaved samples in one tick
    pub fn samples_per_packet(&self) -> usize {
        self.frames_per_packet() * self.channels as usize
    }

    /// Samples per channel in one tick
    pub fn frames_per_packet(&self) -> usize {
        (self.sample_rate as u128 * self.packet_period().as_millis() / 1000) as usize
    }
}

impl fmt::Display for MediaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.encoding.name(), self.sample_rate, self.channels)
    }
}

/// Parses preferences such as `PCMU/8000/1` or `PCM/16000/2`
impl FromStr for MediaInfo {
    type Err = ConferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConferenceError::InvalidMediaPreference(s.to_string());

        let mut parts = s.trim().split('/');
        let encoding = match parts.next().map(|p| p.to_ascii_uppercase()).as_deref() {
            Some("PCMU") => Encoding::Pcmu,
            Some("PCM") | Some("L16") => Encoding::Linear,
            Some("OPUS") => Encoding::Opus,
            _ => return Err(invalid()),
        };
        let sample_rate: u32 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let channels: u16 = match parts.next() {
            Some(p) => p.parse().map_err(|_| invalid())?,
            None => 1,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }

        Self::find(encoding, sample_rate, channels).ok_or_else(invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_preference() {
        let media: MediaInfo = "PCMU/8000/1".parse().unwrap();
        assert_eq!(media.payload, 0);
        assert_eq!(media.samples_per_packet(), 160);

        let media: MediaInfo = "pcm/16000/2".parse().unwrap();
        assert_eq!(media.encoding, Encoding::Linear);
        assert_eq!(media.samples_per_packet(), 640);
        assert_eq!(media.frames_per_packet(), 320);
        assert_eq!(media.to_string(), "PCM/16000/2");
        assert_eq!(media.packet_period(), Duration::from_millis(20));
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!("G729/8000/1".parse::<MediaInfo>().is_err());
        assert!("PCMU/11025/1".parse::<MediaInfo>().is_err());
        assert!("PCMU".parse::<MediaInfo>().is_err());
        assert!("PCMU/8000/1/x".parse::<MediaInfo>().is_err());
    }

    #[test]
    fn test_from_payload() {
        assert_eq!(MediaInfo::from_payload(111).unwrap().encoding, Encoding::Opus);
        assert!(MediaInfo::from_payload(99).is_err());
    }
}
