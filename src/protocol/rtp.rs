//! RTP packet handling
//!
//! Framing goes through the `rtp` crate, as re-exported by `webrtc`.
//! Payload classification and RFC 2833 telephone events live here, next to
//! the outgoing sequencer.

use bytes::Bytes;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc_util::{Marshal, Unmarshal};

use crate::error::NetworkError;

pub const RTP_VERSION: u8 = 2;

/// RFC 3389 comfort noise
pub const COMFORT_NOISE_PAYLOAD: u8 = 13;

/// Comfort noise as sent by some broken endpoints
pub const BROKEN_COMFORT_NOISE_PAYLOAD: u8 = 19;

/// Sent by some phones between talk spurts, silently ignored
pub const IGNORED_PAYLOAD: u8 = 18;

/// Comfort noise level sent when a member's mix is silent (-dBov)
pub const DEFAULT_COMFORT_NOISE_LEVEL: u8 = 62;

/// Parsed RTP fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Parse a packet, returning the header and its payload. CSRCs,
    /// header extensions and padding are skipped.
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), NetworkError> {
        let mut rest = data;
        let header = Header::unmarshal(&mut rest)
            .map_err(|e| NetworkError::InvalidPacket(e.to_string()))?;
        if header.version != RTP_VERSION {
            return Err(NetworkError::InvalidPacket(format!("RTP version {}", header.version)));
        }

        let payload = if header.padding {
            let padding = rest.last().copied().unwrap_or(0) as usize;
            if padding == 0 || padding > rest.len() {
                return Err(NetworkError::InvalidPacket(format!(
                    "padding {} exceeds payload",
                    padding
                )));
            }
            &rest[..rest.len() - padding]
        } else {
            rest
        };

        Ok((Self::from(&header), payload))
    }

    /// Serialize header followed by `payload`
    pub fn to_packet(&self, payload: &[u8]) -> Result<Bytes, NetworkError> {
        let packet = Packet {
            header: Header::from(self),
            payload: Bytes::copy_from_slice(payload),
        };
        packet
            .marshal()
            .map_err(|e| NetworkError::InvalidPacket(e.to_string()))
    }
}

impl From<&Header> for RtpHeader {
    fn from(header: &Header) -> Self {
        Self {
            marker: header.marker,
            payload_type: header.payload_type,
            sequence: header.sequence_number,
            timestamp: header.timestamp,
            ssrc: header.ssrc,
        }
    }
}

impl From<&RtpHeader> for Header {
    fn from(header: &RtpHeader) -> Self {
        Header {
            version: RTP_VERSION,
            marker: header.marker,
            payload_type: header.payload_type,
            sequence_number: header.sequence,
            timestamp: header.timestamp,
            ssrc: header.ssrc,
            ..Default::default()
        }
    }
}

/// How the receiver treats an incoming payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Media,
    ComfortNoise,
    TelephoneEvent,
    Ignored,
    Unexpected,
}

/// Classify a payload against the negotiated media and telephone-event payloads
pub fn classify(payload_type: u8, media_payload: u8, telephone_event_payload: u8) -> PacketKind {
    match payload_type {
        pt if pt == media_payload => PacketKind::Media,
        pt if pt == telephone_event_payload => PacketKind::TelephoneEvent,
        COMFORT_NOISE_PAYLOAD | BROKEN_COMFORT_NOISE_PAYLOAD => PacketKind::ComfortNoise,
        IGNORED_PAYLOAD => PacketKind::Ignored,
        _ => PacketKind::Unexpected,
    }
}

/// RFC 2833 telephone event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelephoneEvent {
    pub event: u8,
    pub end: bool,
    pub volume: u8,
    pub duration: u16,
}

impl TelephoneEvent {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 4 {
            return None;
        }
        Some(Self {
            event: payload[0],
            end: payload[1] & 0x80 != 0,
            volume: payload[1] & 0x3f,
            duration: u16::from_be_bytes([payload[2], payload[3]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        let duration = self.duration.to_be_bytes();
        [
            self.event,
            ((self.end as u8) << 7) | (self.volume & 0x3f),
            duration[0],
            duration[1],
        ]
    }

    /// DTMF key for events 0-15
    pub fn key(&self) -> Option<char> {
        match self.event {
            0..=9 => char::from_digit(self.event as u32, 10),
            10 => Some('*'),
            11 => Some('#'),
            12 => Some('A'),
            13 => Some('B'),
            14 => Some('C'),
            15 => Some('D'),
            _ => None,
        }
    }
}

/// Outgoing sequence, timestamp and marker state for one member
#[derive(Debug, Clone)]
pub struct RtpSequencer {
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
    mark_next: bool,
}

impl RtpSequencer {
    pub fn new(ssrc: u32) -> Self {
        Self {
            sequence: 0,
            timestamp: 0,
            ssrc,
            mark_next: true,
        }
    }

    /// Header for the next packet. `frames` advances the timestamp.
    pub fn next_header(&mut self, payload_type: u8, frames: u32) -> RtpHeader {
        let header = RtpHeader {
            marker: self.mark_next,
            payload_type,
            sequence: self.sequence,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
        };
        self.mark_next = false;
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(frames);
        header
    }

    /// Set MARK on the next packet, after a silence period
    pub fn mark_next(&mut self) {
        self.mark_next = true;
    }

    /// Advance the timestamp across a gap without sending
    pub fn skip(&mut self, frames: u32) {
        self.timestamp = self.timestamp.wrapping_add(frames);
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = RtpHeader {
            marker: true,
            payload_type: 0,
            sequence: 65535,
            timestamp: 123_456,
            ssrc: 0xdead_beef,
        };
        let packet = header.to_packet(&[1, 2, 3]).unwrap();
        assert_eq!(packet.len(), 15);
        assert_eq!(packet[0] >> 6, RTP_VERSION);
        let (parsed, payload) = RtpHeader::parse(&packet).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[test]
    fn test_parse_skips_extension() {
        let mut packet = vec![0x80 | 0x10, 102, 0, 5, 0, 0, 0, 0, 0, 0, 0, 1];
        packet.extend_from_slice(&[0xbe, 0xde, 0, 1]); // one-byte extension, one word
        packet.extend_from_slice(&[0x10, 0xaa, 0, 0]);
        packet.extend_from_slice(&[4, 4, 4]);

        let (header, payload) = RtpHeader::parse(&packet).unwrap();
        assert_eq!(header.sequence, 5);
        assert_eq!(payload, &[4, 4, 4]);
    }

    #[test]
    fn test_parse_skips_csrc_and_padding() {
        let mut packet = vec![0x80 | 0x20 | 0x01, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];
        packet.extend_from_slice(&[9, 9, 9, 9]); // CSRC
        packet.extend_from_slice(&[7, 7]);
        packet.extend_from_slice(&[0, 2]); // two bytes of padding

        let (_, payload) = RtpHeader::parse(&packet).unwrap();
        assert_eq!(payload, &[7, 7]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(RtpHeader::parse(&[0x80, 0]).is_err());
        assert!(RtpHeader::parse(&[0x40; 12]).is_err());
        // Padding longer than the payload
        assert!(RtpHeader::parse(&[0xa0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1, 7, 9]).is_err());
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(0, 0, 101), PacketKind::Media);
        assert_eq!(classify(101, 0, 101), PacketKind::TelephoneEvent);
        assert_eq!(classify(13, 0, 101), PacketKind::ComfortNoise);
        assert_eq!(classify(19, 0, 101), PacketKind::ComfortNoise);
        assert_eq!(classify(18, 0, 101), PacketKind::Ignored);
        assert_eq!(classify(8, 0, 101), PacketKind::Unexpected);
    }

    #[test]
    fn test_telephone_event() {
        let event = TelephoneEvent {
            event: 11,
            end: true,
            volume: 10,
            duration: 800,
        };
        let parsed = TelephoneEvent::parse(&event.to_bytes()).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.key(), Some('#'));
    }

    #[test]
    fn test_sequencer_marks_after_silence() {
        let mut seq = RtpSequencer::new(1);
        let first = seq.next_header(0, 160);
        assert!(first.marker);
        let second = seq.next_header(0, 160);
        assert!(!second.marker);
        assert_eq!(second.timestamp, 160);

        seq.mark_next();
        let third = seq.next_header(0, 160);
        assert!(third.marker);
        assert_eq!(third.sequence, 2);
    }
}
