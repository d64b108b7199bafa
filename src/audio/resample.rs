//! Sample rate and channel conversion between a member's payload and the
//! conference media.
//!
//! Wraps rubato's `SincFixedIn<f32>`. Input arrives one tick at a time;
//! output is queued so every call returns exactly one tick at the target
//! rate, with the filter delay showing up as leading silence.

use rubato::{
    Resampler as _, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
    WindowFunction,
};
use std::collections::VecDeque;

use super::pcm;
use crate::error::CodecError;
use crate::protocol::MediaInfo;

pub struct Resampler {
    from: MediaInfo,
    to: MediaInfo,
    /// Absent when only the channel count differs
    inner: Option<SincFixedIn<f32>>,
    /// Per-channel output not yet handed out
    pending: Vec<VecDeque<f32>>,
}

impl Resampler {
    pub fn new(from: MediaInfo, to: MediaInfo) -> Result<Self, CodecError> {
        let channels = to.channels as usize;
        let inner = if from.sample_rate != to.sample_rate {
            let ratio = to.sample_rate as f64 / from.sample_rate as f64;
            let params = SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };
            let resampler =
                SincFixedIn::new(ratio, 2.0, params, from.frames_per_packet(), channels)
                    .map_err(|e| CodecError::ResamplerInit(e.to_string()))?;
            Some(resampler)
        } else {
            None
        };

        Ok(Self {
            from,
            to,
            inner,
            pending: vec![VecDeque::new(); channels],
        })
    }

    /// True when `from` and `to` differ in rate or channels
    pub fn is_needed(from: &MediaInfo, to: &MediaInfo) -> bool {
        from.sample_rate != to.sample_rate || from.channels != to.channels
    }

    /// Convert one tick of interleaved samples
    pub fn process(&mut self, samples: &[i32]) -> Result<Vec<i32>, CodecError> {
        let remixed = pcm::remix_channels(samples, self.from.channels, self.to.channels);

        let Some(inner) = self.inner.as_mut() else {
            return Ok(pcm::fit_length(remixed, self.to.samples_per_packet()));
        };

        let channels = self.to.channels as usize;
        let in_frames = self.from.frames_per_packet();
        let mut planar = vec![vec![0f32; in_frames]; channels];
        for (i, frame) in remixed.chunks_exact(channels).take(in_frames).enumerate() {
            for (ch, &s) in frame.iter().enumerate() {
                planar[ch][i] = s as f32 / 32768.0;
            }
        }

        let output = inner
            .process(&planar, None)
            .map_err(|e| CodecError::ResampleFailed(e.to_string()))?;

        for (queue, channel) in self.pending.iter_mut().zip(output) {
            queue.extend(channel);
        }

        let out_frames = self.to.frames_per_packet();
        let mut out = Vec::with_capacity(out_frames * channels);
        let available = self.pending[0].len();
        if available < out_frames {
            // Filter delay on the first ticks
            out.resize((out_frames - available) * channels, 0);
        }
        for _ in 0..out_frames.min(available) {
            for queue in self.pending.iter_mut() {
                let s = queue.pop_front().unwrap_or(0.0);
                out.push(pcm::clip((s * 32768.0).round() as i32));
            }
        }

        Ok(out)
    }

    /// Drop filter state, after a gap in the input
    pub fn reset(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.reset();
        }
        for queue in self.pending.iter_mut() {
            queue.clear();
        }
    }

    pub fn from_media(&self) -> &MediaInfo {
        &self.from
    }

    pub fn to_media(&self) -> &MediaInfo {
        &self.to
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_only_conversion() {
        let from = MediaInfo::from_payload(102).unwrap(); // 8000 mono
        let to = MediaInfo::from_payload(103).unwrap(); // 8000 stereo
        let mut resampler = Resampler::new(from, to).unwrap();

        let out = resampler.process(&vec![7; 160]).unwrap();
        assert_eq!(out.len(), 320);
        assert!(out.iter().all(|&s| s == 7));
    }

    #[test]
    fn test_rate_conversion_frame_size() {
        let from = MediaInfo::from_payload(102).unwrap(); // 8000 mono
        let to = MediaInfo::from_payload(105).unwrap(); // 16000 stereo
        let mut resampler = Resampler::new(from, to).unwrap();

        for _ in 0..10 {
            let out = resampler.process(&vec![1000; 160]).unwrap();
            assert_eq!(out.len(), to.samples_per_packet());
        }
    }

    #[test]
    fn test_settles_to_input_level() {
        let from = MediaInfo::from_payload(104).unwrap(); // 16000 mono
        let to = MediaInfo::from_payload(102).unwrap(); // 8000 mono
        let mut resampler = Resampler::new(from, to).unwrap();

        let mut last = Vec::new();
        for _ in 0..20 {
            last = resampler.process(&vec![8000; 320]).unwrap();
        }
        let mid = last[80];
        assert!((mid - 8000).abs() < 400, "settled at {}", mid);
    }
}
