//! Spatial placement of one source in a listener's mix
//!
//! Position comes from [`SpatialValues`]: front/back, left/right and
//! up/down in `-1..=1`, plus a volume. Distance lowers the level, sources
//! behind the listener are quieter and get a short echo, and in stereo the
//! far ear hears the source later and softer. Delays reach back into the
//! source's previous frame.

use crate::config::SpatialConfig;
use crate::mixer::SpatialValues;
use crate::protocol::MediaInfo;

#[derive(Debug, Clone)]
pub struct Spatializer {
    config: SpatialConfig,
    sample_rate: u32,
    channels: usize,
}

impl Spatializer {
    pub fn new(config: SpatialConfig, media: &MediaInfo) -> Self {
        Self {
            config,
            sample_rate: media.sample_rate,
            channels: media.channels.max(1) as usize,
        }
    }

    fn ms_to_frames(&self, ms: f64) -> usize {
        (ms * self.sample_rate as f64 / 1000.0).round() as usize
    }

    /// Place `current` according to `values`. Output has the same layout as
    /// the input; attenuation is applied by the caller.
    pub fn apply(&self, current: &[i32], previous: Option<&[i32]>, values: &SpatialValues) -> Vec<i32> {
        let ch = self.channels;
        let mono = downmix(current, ch);
        let prev_mono = previous.map(|p| downmix(p, ch)).unwrap_or_default();

        // Frame `f` of the source, negative indexes reach into the previous tick
        let source = |f: isize| -> f64 {
            if f >= 0 {
                mono.get(f as usize).copied().unwrap_or(0.0)
            } else {
                let back = prev_mono.len() as isize + f;
                if back >= 0 {
                    prev_mono[back as usize]
                } else {
                    0.0
                }
            }
        };

        let fb = values.front_back().clamp(-1.0, 1.0);
        let lr = values.left_right().clamp(-1.0, 1.0);
        let ud = values.up_down().clamp(-1.0, 1.0);

        let distance = (fb * fb + lr * lr + ud * ud).sqrt().min(1.0);
        let mut gain = values.volume() * (1.0 - self.config.falloff * distance).max(self.config.min_volume);

        let behind = fb < 0.0;
        if behind {
            gain *= self.config.behind_volume;
        }
        let echo_delay = self.ms_to_frames(self.config.echo_delay_ms) as isize;
        let echo_gain = if behind { gain * self.config.echo_volume } else { 0.0 };

        let at = |f: isize, g: f64, delay: isize| -> f64 {
            let mut v = g * source(f - delay);
            if echo_gain != 0.0 {
                v += echo_gain * source(f - delay - echo_delay);
            }
            v
        };

        let frames = mono.len();
        let mut out = Vec::with_capacity(frames * ch);

        if ch == 1 {
            for f in 0..frames as isize {
                out.push(at(f, gain, 0).round() as i32);
            }
            return out;
        }

        let itd = (self.ms_to_frames(self.config.max_interaural_delay_ms) as f64 * lr.abs()).round() as isize;
        let far_gain = gain * (1.0 - self.config.falloff * lr.abs()).max(self.config.min_volume);
        // Positive left/right is to the listener's right, so the left ear is far
        let left_is_far = lr > 0.0;

        for f in 0..frames as isize {
            let near = at(f, gain, 0).round() as i32;
            let far = at(f, far_gain, itd).round() as i32;
            let (left, right) = if left_is_far { (far, near) } else { (near, far) };
            out.push(left);
            out.push(right);
            // Extra channels carry the centre signal
            for _ in 2..ch {
                out.push(near);
            }
        }
        out
    }
}

fn downmix(samples: &[i32], channels: usize) -> Vec<f64> {
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().map(|&s| s as f64).sum::<f64>() / channels as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spatializer(payload: u8) -> Spatializer {
        Spatializer::new(SpatialConfig::default(), &MediaInfo::from_payload(payload).unwrap())
    }

    #[test]
    fn test_neutral_is_identity_scaled_by_volume() {
        let s = spatializer(102);
        let input: Vec<i32> = (0..160).map(|i| i * 10).collect();

        let out = s.apply(&input, None, &SpatialValues::neutral(1.0));
        assert_eq!(out, input);

        let out = s.apply(&input, None, &SpatialValues::neutral(0.5));
        assert_eq!(out[100], 500);
    }

    #[test]
    fn test_hard_right_in_stereo() {
        let s = spatializer(103);
        let input = vec![1000; 320];
        let prev = vec![0; 320];

        let out = s.apply(&input, Some(&prev), &SpatialValues::new(0.0, 1.0, 0.0, 1.0));
        let left = out[0];
        let right = out[1];
        assert!(right > 0);
        assert_eq!(left, 0, "far ear is still in the silent previous frame");

        let late_left = out[2 * 100];
        let late_right = out[2 * 100 + 1];
        assert!(late_left > 0 && late_left < late_right);
    }

    #[test]
    fn test_behind_is_quieter() {
        let s = spatializer(102);
        let input = vec![1000; 160];

        let front = s.apply(&input, Some(&input), &SpatialValues::new(0.5, 0.0, 0.0, 1.0));
        let back = s.apply(&input, Some(&input), &SpatialValues::new(-0.5, 0.0, 0.0, 1.0));
        assert!(back[80] < front[80]);
        assert!(back[80] > 0);
    }
}
