//! Opus encoder wrapper
//!
//! Encodes one 20 ms frame of conference mix per call.

use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use crate::error::CodecError;
use crate::protocol::MediaInfo;

/// Bitrate used for a mono voice stream; stereo doubles it
const VOICE_BITRATE: i32 = 32_000;

/// Opus encoder wrapper with telephony settings
pub struct OpusEncoder {
    encoder: Encoder,
    channels: u16,
    frame_size: usize,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    /// Reused i16 staging buffer
    pcm: Vec<i16>,
}

impl OpusEncoder {
    pub fn new(media: &MediaInfo) -> Result<Self, CodecError> {
        let channels = match media.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            n => {
                return Err(CodecError::EncoderInit(format!(
                    "Unsupported channel count: {}",
                    n
                )))
            }
        };

        let mut encoder = Encoder::new(media.sample_rate, channels, Application::Voip)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(VOICE_BITRATE * media.channels as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        // Conference audio crosses lossy links; let the far end recover
        encoder
            .set_inband_fec(true)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;

        Ok(Self {
            encoder,
            channels: media.channels,
            frame_size: media.frames_per_packet(),
            // Max Opus frame is about 1275 bytes
            encode_buffer: vec![0u8; 4000],
            pcm: Vec::with_capacity(media.samples_per_packet()),
        })
    }

    /// Encode one frame of interleaved samples, already clipped to i16 range
    pub fn encode(&mut self, samples: &[i32]) -> Result<Bytes, CodecError> {
        if samples.len() != self.samples_per_frame() {
            return Err(CodecError::InvalidFrameSize(samples.len()));
        }

        self.pcm.clear();
        self.pcm
            .extend(samples.iter().map(|&s| s.clamp(i16::MIN as i32, i16::MAX as i32) as i16));

        let size = self
            .encoder
            .encode(&self.pcm, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }

    pub fn reset(&mut self) -> Result<(), CodecError> {
        self.encoder
            .reset_state()
            .map_err(|e| CodecError::EncoderInit(e.to_string()))
    }

    /// Total samples per frame, all channels
    pub fn samples_per_frame(&self) -> usize {
        self.frame_size * self.channels as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding() {
        let media = MediaInfo::from_payload(111).unwrap();
        let mut encoder = OpusEncoder::new(&media).unwrap();
        assert_eq!(encoder.samples_per_frame(), 1920);

        let encoded = encoder.encode(&vec![0; 1920]).unwrap();
        assert!(!encoded.is_empty());
        assert!(encoded.len() < 1920 * 2);

        encoder.reset().unwrap();
        assert!(!encoder.encode(&vec![0; 1920]).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_wrong_frame_size() {
        let media = MediaInfo::from_payload(112).unwrap();
        let mut encoder = OpusEncoder::new(&media).unwrap();
        assert!(matches!(
            encoder.encode(&[0; 100]),
            Err(CodecError::InvalidFrameSize(100))
        ));
    }
}
