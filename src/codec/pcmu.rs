//! G.711 mu-law

use bytes::Bytes;

use super::Codec;
use crate::error::CodecError;
use crate::protocol::MediaInfo;

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// Compress one linear sample to mu-law
pub fn linear_to_ulaw(sample: i32) -> u8 {
    let mut s = sample.clamp(i16::MIN as i32, i16::MAX as i32);
    let sign = if s < 0 {
        s = -s;
        0x80
    } else {
        0
    };
    s = s.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && s & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (s >> (exponent + 3)) & 0x0f;

    !(sign | (exponent << 4) | mantissa) as u8
}

/// Expand one mu-law byte to a linear sample
pub fn ulaw_to_linear(byte: u8) -> i32 {
    let u = !byte;
    let exponent = ((u >> 4) & 0x07) as i32;
    let mantissa = (u & 0x0f) as i32;
    let sample = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if u & 0x80 != 0 {
        -sample
    } else {
        sample
    }
}

/// Stateless mu-law codec
pub struct PcmuCodec {
    media: MediaInfo,
}

impl PcmuCodec {
    pub fn new(media: MediaInfo) -> Self {
        Self { media }
    }
}

impl Codec for PcmuCodec {
    fn media(&self) -> &MediaInfo {
        &self.media
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i32>, CodecError> {
        Ok(payload.iter().map(|&b| ulaw_to_linear(b)).collect())
    }

    fn encode(&mut self, samples: &[i32]) -> Result<Bytes, CodecError> {
        Ok(samples.iter().map(|&s| linear_to_ulaw(s)).collect::<Vec<u8>>().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence() {
        assert_eq!(linear_to_ulaw(0), 0xff);
        assert_eq!(ulaw_to_linear(0xff), 0);
    }

    #[test]
    fn test_companding_error_is_bounded() {
        for sample in (-32000..32000).step_by(97) {
            let decoded = ulaw_to_linear(linear_to_ulaw(sample));
            // Quantization step grows with magnitude, at most 1/16 of the value
            let tolerance = (sample.abs() / 16).max(8);
            assert!(
                (decoded - sample).abs() <= tolerance,
                "{} decoded as {}",
                sample,
                decoded
            );
        }
    }

    #[test]
    fn test_extremes_clip() {
        assert_eq!(ulaw_to_linear(linear_to_ulaw(100_000)), 32124);
        assert_eq!(ulaw_to_linear(linear_to_ulaw(-100_000)), -32124);
    }
}
