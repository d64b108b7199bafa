//! In-band DTMF detection
//!
//! Goertzel filters on the eight DTMF frequencies. A key is confirmed after
//! two consecutive frames carry the same tone pair and is reported when the
//! tone stops. While any candidate tone is present the receiver mutes the
//! member so the tone does not leak into the conference.

const LOW_FREQS: [f64; 4] = [697.0, 770.0, 852.0, 941.0];
const HIGH_FREQS: [f64; 4] = [1209.0, 1336.0, 1477.0, 1633.0];

const KEYS: [[char; 4]; 4] = [
    ['1', '2', '3', 'A'],
    ['4', '5', '6', 'B'],
    ['7', '8', '9', 'C'],
    ['*', '0', '#', 'D'],
];

/// Frames a tone must last before it counts as a key
const MIN_TONE_FRAMES: u32 = 2;
/// Share of frame energy the two tones must carry
const MIN_TONE_SHARE: f64 = 0.75;
/// Each tone's minimum share, bounds the twist
const MIN_SINGLE_SHARE: f64 = 0.1;
/// Strongest tone in a group over the runner-up
const MIN_PEAK_RATIO: f64 = 4.0;
/// Quieter frames are ignored
const MIN_LEVEL: f64 = 100.0;

#[derive(Debug, Clone)]
pub struct DtmfDetector {
    channels: usize,
    low_coeffs: [f64; 4],
    high_coeffs: [f64; 4],
    candidate: Option<char>,
    candidate_frames: u32,
    /// Confirmed key still sounding
    confirmed: Option<char>,
}

impl DtmfDetector {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        let coeff = |f: f64| 2.0 * (2.0 * std::f64::consts::PI * f / sample_rate as f64).cos();
        Self {
            channels: channels.max(1) as usize,
            low_coeffs: LOW_FREQS.map(coeff),
            high_coeffs: HIGH_FREQS.map(coeff),
            candidate: None,
            candidate_frames: 0,
            confirmed: None,
        }
    }

    /// Feed one frame. Returns a key once its tone has ended.
    pub fn process(&mut self, samples: &[i32]) -> Option<char> {
        let mono: Vec<f64> = samples
            .chunks_exact(self.channels)
            .map(|frame| frame.iter().map(|&s| s as f64).sum::<f64>() / self.channels as f64)
            .collect();

        let key = self.detect(&mono);

        if key.is_some() && key == self.candidate {
            self.candidate_frames += 1;
            if self.candidate_frames >= MIN_TONE_FRAMES {
                self.confirmed = key;
            }
            return None;
        }

        // Tone changed or stopped
        let finished = self.confirmed.take();
        self.candidate = key;
        self.candidate_frames = u32::from(key.is_some());
        finished
    }

    /// A DTMF-like tone is sounding in the latest frame
    pub fn tone_present(&self) -> bool {
        self.candidate.is_some()
    }

    /// Input stopped; report a key whose tone never saw its end
    pub fn no_data_received(&mut self) -> Option<char> {
        self.candidate = None;
        self.candidate_frames = 0;
        self.confirmed.take()
    }

    pub fn reset(&mut self) {
        self.candidate = None;
        self.candidate_frames = 0;
        self.confirmed = None;
    }

    fn detect(&self, x: &[f64]) -> Option<char> {
        let n = x.len();
        if n == 0 {
            return None;
        }
        let mean_level = x.iter().map(|s| s.abs()).sum::<f64>() / n as f64;
        if mean_level < MIN_LEVEL {
            return None;
        }

        // A pure tone at a filter frequency normalizes to 1.0
        let energy: f64 = x.iter().map(|s| s * s).sum();
        let scale = n as f64 * energy / 2.0;

        let low = self.low_coeffs.map(|c| goertzel(x, c) / scale);
        let high = self.high_coeffs.map(|c| goertzel(x, c) / scale);

        let (row, row_power) = peak(&low)?;
        let (col, col_power) = peak(&high)?;

        if row_power < MIN_SINGLE_SHARE || col_power < MIN_SINGLE_SHARE {
            return None;
        }
        if row_power + col_power < MIN_TONE_SHARE {
            return None;
        }
        Some(KEYS[row][col])
    }
}

/// Index and power of the dominant bin, if it clearly dominates
fn peak(powers: &[f64; 4]) -> Option<(usize, f64)> {
    let mut best = 0;
    for i in 1..4 {
        if powers[i] > powers[best] {
            best = i;
        }
    }
    let runner_up = powers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != best)
        .map(|(_, p)| *p)
        .fold(0.0, f64::max);

    if powers[best] < runner_up * MIN_PEAK_RATIO {
        return None;
    }
    Some((best, powers[best]))
}

fn goertzel(x: &[f64], coeff: f64) -> f64 {
    let (mut s1, mut s2) = (0.0, 0.0);
    for &sample in x {
        let s0 = sample + coeff * s1 - s2;
        s2 = s1;
        s1 = s0;
    }
    s1 * s1 + s2 * s2 - coeff * s1 * s2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(low: f64, high: f64, offset: usize) -> Vec<i32> {
        (offset..offset + 160)
            .map(|i| {
                let t = i as f64 / 8000.0;
                let v = (2.0 * std::f64::consts::PI * low * t).sin()
                    + (2.0 * std::f64::consts::PI * high * t).sin();
                (v * 6000.0) as i32
            })
            .collect()
    }

    #[test]
    fn test_detects_key_on_tone_end() {
        let mut dtmf = DtmfDetector::new(8000, 1);

        assert_eq!(dtmf.process(&tone(697.0, 1209.0, 0)), None);
        assert!(dtmf.tone_present());
        assert_eq!(dtmf.process(&tone(697.0, 1209.0, 160)), None);
        assert_eq!(dtmf.process(&tone(697.0, 1209.0, 320)), None);
        assert_eq!(dtmf.process(&vec![0; 160]), Some('1'));
        assert!(!dtmf.tone_present());
    }

    #[test]
    fn test_pound_key() {
        let mut dtmf = DtmfDetector::new(8000, 1);
        dtmf.process(&tone(941.0, 1477.0, 0));
        dtmf.process(&tone(941.0, 1477.0, 160));
        assert_eq!(dtmf.no_data_received(), Some('#'));
    }

    #[test]
    fn test_ignores_single_tone() {
        let mut dtmf = DtmfDetector::new(8000, 1);
        let sine: Vec<i32> = (0..160)
            .map(|i| ((2.0 * std::f64::consts::PI * 440.0 * i as f64 / 8000.0).sin() * 8000.0) as i32)
            .collect();
        for _ in 0..4 {
            assert_eq!(dtmf.process(&sine), None);
        }
        assert!(!dtmf.tone_present());
    }

    #[test]
    fn test_single_frame_blip_is_not_a_key() {
        let mut dtmf = DtmfDetector::new(8000, 1);
        dtmf.process(&tone(770.0, 1336.0, 0));
        assert_eq!(dtmf.process(&vec![0; 160]), None);
    }
}
