//! Audio processing used by members and mixes

pub mod buffer;
pub mod dtmf;
pub mod pcm;
pub mod resample;
pub mod spatial;
pub mod speech;

pub use buffer::{JitterBuffer, JitterBufferStats, PlcStrategy};
pub use dtmf::DtmfDetector;
pub use resample::Resampler;
pub use spatial::Spatializer;
pub use speech::SpeechDetector;
