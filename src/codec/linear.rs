//! 16-bit linear PCM in network byte order

use bytes::{BufMut, Bytes, BytesMut};

use super::Codec;
use crate::error::CodecError;
use crate::protocol::MediaInfo;

pub struct LinearCodec {
    media: MediaInfo,
}

impl LinearCodec {
    pub fn new(media: MediaInfo) -> Self {
        Self { media }
    }
}

impl Codec for LinearCodec {
    fn media(&self) -> &MediaInfo {
        &self.media
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i32>, CodecError> {
        if payload.len() % 2 != 0 {
            return Err(CodecError::InvalidFrameSize(payload.len()));
        }
        Ok(payload
            .chunks_exact(2)
            .map(|pair| i16::from_be_bytes([pair[0], pair[1]]) as i32)
            .collect())
    }

    fn encode(&mut self, samples: &[i32]) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(samples.len() * 2);
        for &s in samples {
            buf.put_i16(s.clamp(i16::MIN as i32, i16::MAX as i32) as i16);
        }
        Ok(buf.freeze())
    }
}
