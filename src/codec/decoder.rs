//! Opus decoder wrapper
//!
//! Provides Opus decoding with packet loss concealment.

use opus::{Channels, Decoder};

use crate::error::CodecError;
use crate::protocol::MediaInfo;

/// Opus decoder wrapper
pub struct OpusDecoder {
    decoder: Decoder,
    channels: u16,
    /// Interleaved samples in one packet, the length concealment produces
    samples_per_packet: usize,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<i16>,
}

impl OpusDecoder {
    pub fn new(media: &MediaInfo) -> Result<Self, CodecError> {
        let opus_channels = match media.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            n => {
                return Err(CodecError::DecoderInit(format!(
                    "Unsupported channel count: {}",
                    n
                )))
            }
        };

        let decoder = Decoder::new(media.sample_rate, opus_channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        Ok(Self {
            decoder,
            channels: media.channels,
            samples_per_packet: media.samples_per_packet(),
            // 120ms at 48kHz stereo
            decode_buffer: vec![0i16; 48000 * 2 * 120 / 1000],
        })
    }

    /// Decode an Opus packet to interleaved samples
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<i32>, CodecError> {
        let samples = self
            .decoder
            .decode(data, &mut self.decode_buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        Ok(self.collect(samples))
    }

    /// Generate one packet of concealment samples for a lost packet. The
    /// output buffer length sets how much audio the decoder invents.
    pub fn decode_plc(&mut self) -> Result<Vec<i32>, CodecError> {
        let samples = self
            .decoder
            .decode(&[], &mut self.decode_buffer[..self.samples_per_packet], false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        Ok(self.collect(samples))
    }

    pub fn reset(&mut self) -> Result<(), CodecError> {
        self.decoder
            .reset_state()
            .map_err(|e| CodecError::DecoderInit(e.to_string()))
    }

    fn collect(&self, frames: usize) -> Vec<i32> {
        let total = frames * self.channels as usize;
        self.decode_buffer[..total].iter().map(|&s| s as i32).collect()
    }
}
