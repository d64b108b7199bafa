//! Integer PCM helpers
//!
//! Mixing happens in `i32` so sums of many members cannot overflow; values
//! are clipped to the i16 range only when a listener's mix is finished.

use crate::constants::{MAX_SAMPLE, MIN_SAMPLE};

/// Clip one sample to the i16 range
#[inline]
pub fn clip(sample: i32) -> i32 {
    sample.clamp(MIN_SAMPLE, MAX_SAMPLE)
}

pub fn clip_in_place(samples: &mut [i32]) {
    for s in samples.iter_mut() {
        *s = clip(*s);
    }
}

/// `acc += weight * data`, element-wise over the shorter of the two
#[inline]
pub fn add_weighted(acc: &mut [i32], data: &[i32], weight: f64) {
    if weight == 1.0 {
        for (a, &s) in acc.iter_mut().zip(data) {
            *a = a.saturating_add(s);
        }
    } else if weight == -1.0 {
        for (a, &s) in acc.iter_mut().zip(data) {
            *a = a.saturating_sub(s);
        }
    } else {
        for (a, &s) in acc.iter_mut().zip(data) {
            *a = a.saturating_add((s as f64 * weight) as i32);
        }
    }
}

/// Scale in place and clip
pub fn adjust_volume(samples: &mut [i32], volume: f64) {
    if volume == 1.0 {
        return;
    }
    for s in samples.iter_mut() {
        *s = clip((*s as f64 * volume) as i32);
    }
}

/// Convert between channel counts. Mono is duplicated, extra channels are averaged.
pub fn remix_channels(samples: &[i32], from: u16, to: u16) -> Vec<i32> {
    if from == to || from == 0 || to == 0 {
        return samples.to_vec();
    }
    let from = from as usize;
    let to = to as usize;

    let mut out = Vec::with_capacity(samples.len() / from * to);
    for frame in samples.chunks_exact(from) {
        if to == 1 {
            let sum: i64 = frame.iter().map(|&s| s as i64).sum();
            out.push((sum / from as i64) as i32);
        } else if from == 1 {
            out.extend(std::iter::repeat(frame[0]).take(to));
        } else {
            let sum: i64 = frame.iter().map(|&s| s as i64).sum();
            let avg = (sum / from as i64) as i32;
            out.extend(std::iter::repeat(avg).take(to));
        }
    }
    out
}

/// Pad with silence or truncate to exactly `len` samples
pub fn fit_length(mut samples: Vec<i32>, len: usize) -> Vec<i32> {
    samples.resize(len, 0);
    samples
}

/// Mean absolute level
pub fn average_level(samples: &[i32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|&s| (s as f64).abs()).sum::<f64>() / samples.len() as f64
}

pub fn is_silence(samples: &[i32]) -> bool {
    samples.iter().all(|&s| s == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip() {
        assert_eq!(clip(40_000), 32767);
        assert_eq!(clip(-40_000), -32768);
        assert_eq!(clip(123), 123);
    }

    #[test]
    fn test_add_weighted() {
        let mut acc = vec![10, 10, 10];
        add_weighted(&mut acc, &[1, 2, 3], 1.0);
        assert_eq!(acc, vec![11, 12, 13]);
        add_weighted(&mut acc, &[1, 2, 3], -1.0);
        assert_eq!(acc, vec![10, 10, 10]);
        add_weighted(&mut acc, &[10, 20], 0.5);
        assert_eq!(acc, vec![15, 20, 10]);
    }

    #[test]
    fn test_remix() {
        assert_eq!(remix_channels(&[1, 2], 1, 2), vec![1, 1, 2, 2]);
        assert_eq!(remix_channels(&[2, 4, 6, 8], 2, 1), vec![3, 7]);
    }

    #[test]
    fn test_adjust_volume_clips() {
        let mut samples = vec![20_000, -100];
        adjust_volume(&mut samples, 2.0);
        assert_eq!(samples, vec![32767, -200]);
    }
}
