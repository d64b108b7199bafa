//! Level-based speech detection
//!
//! `Quiet -> Speaking` after `attack_frames` loud frames in a row,
//! `Speaking -> Quiet` after `hangover_frames` quiet frames in a row.

use super::pcm;
use crate::config::SpeechConfig;

#[derive(Debug, Clone)]
pub struct SpeechDetector {
    threshold: f64,
    attack_frames: u32,
    hangover_frames: u32,
    speaking: bool,
    loud_frames: u32,
    quiet_frames: u32,
}

impl SpeechDetector {
    pub fn new(config: &SpeechConfig) -> Self {
        Self {
            threshold: config.power_threshold,
            attack_frames: config.attack_frames.max(1),
            hangover_frames: config.hangover_frames.max(1),
            speaking: false,
            loud_frames: 0,
            quiet_frames: 0,
        }
    }

    /// Feed one frame. Returns the new state when it changes.
    pub fn process(&mut self, samples: &[i32]) -> Option<bool> {
        if pcm::average_level(samples) >= self.threshold {
            self.loud_frames += 1;
            self.quiet_frames = 0;
        } else {
            self.quiet_frames += 1;
            self.loud_frames = 0;
        }

        if !self.speaking && self.loud_frames >= self.attack_frames {
            self.speaking = true;
            return Some(true);
        }
        if self.speaking && self.quiet_frames >= self.hangover_frames {
            self.speaking = false;
            return Some(false);
        }
        None
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Back to quiet. Returns true if the member was speaking.
    pub fn reset(&mut self) -> bool {
        let was_speaking = self.speaking;
        self.speaking = false;
        self.loud_frames = 0;
        self.quiet_frames = 0;
        was_speaking
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> SpeechDetector {
        SpeechDetector::new(&SpeechConfig {
            power_threshold: 100.0,
            attack_frames: 2,
            hangover_frames: 3,
        })
    }

    #[test]
    fn test_attack_and_hangover() {
        let mut speech = detector();
        let loud = vec![1000; 160];
        let quiet = vec![0; 160];

        assert_eq!(speech.process(&loud), None);
        assert_eq!(speech.process(&loud), Some(true));
        assert_eq!(speech.process(&quiet), None);
        assert_eq!(speech.process(&quiet), None);
        assert_eq!(speech.process(&loud), None, "hangover restarts");
        for _ in 0..2 {
            assert_eq!(speech.process(&quiet), None);
        }
        assert_eq!(speech.process(&quiet), Some(false));
    }

    #[test]
    fn test_reset_reports_previous_state() {
        let mut speech = detector();
        speech.process(&vec![1000; 160]);
        speech.process(&vec![1000; 160]);
        assert!(speech.reset());
        assert!(!speech.is_speaking());
        assert!(!speech.reset());
    }
}
