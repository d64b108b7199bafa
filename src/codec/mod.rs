//! Payload codecs
//!
//! Every member gets its own codec instance for the payload it negotiated.
//! Samples cross this boundary as interleaved `i32` in the i16 range.

pub mod decoder;
pub mod encoder;
pub mod linear;
pub mod pcmu;

pub use decoder::OpusDecoder;
pub use encoder::OpusEncoder;
pub use linear::LinearCodec;
pub use pcmu::PcmuCodec;

use bytes::Bytes;

use crate::error::CodecError;
use crate::protocol::{Encoding, MediaInfo};

/// Encode and decode one member's payload
pub trait Codec: Send {
    fn media(&self) -> &MediaInfo;

    /// Decode a payload to interleaved samples at the payload's rate
    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i32>, CodecError>;

    /// Encode one frame of interleaved samples
    fn encode(&mut self, samples: &[i32]) -> Result<Bytes, CodecError>;

    /// Samples to play in place of a lost packet, if the codec can conceal
    fn conceal(&mut self) -> Option<Vec<i32>> {
        None
    }

    fn reset(&mut self) {}
}

/// Opus encoder and decoder pair
pub struct OpusCodec {
    media: MediaInfo,
    encoder: OpusEncoder,
    decoder: OpusDecoder,
}

impl OpusCodec {
    pub fn new(media: MediaInfo) -> Result<Self, CodecError> {
        Ok(Self {
            encoder: OpusEncoder::new(&media)?,
            decoder: OpusDecoder::new(&media)?,
            media,
        })
    }
}

impl Codec for OpusCodec {
    fn media(&self) -> &MediaInfo {
        &self.media
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i32>, CodecError> {
        self.decoder.decode(payload)
    }

    fn encode(&mut self, samples: &[i32]) -> Result<Bytes, CodecError> {
        self.encoder.encode(samples)
    }

    fn conceal(&mut self) -> Option<Vec<i32>> {
        self.decoder.decode_plc().ok()
    }

    fn reset(&mut self) {
        if let Err(e) = self.decoder.reset().and_then(|_| self.encoder.reset()) {
            tracing::warn!("Opus reset failed: {}", e);
        }
    }
}

/// Create a codec for a negotiated payload
pub fn create(media: &MediaInfo) -> Result<Box<dyn Codec>, CodecError> {
    Ok(match media.encoding {
        Encoding::Pcmu => Box::new(PcmuCodec::new(*media)),
        Encoding::Linear => Box::new(LinearCodec::new(*media)),
        Encoding::Opus => Box::new(OpusCodec::new(*media)?),
    })
}
