//! Audio treatments: tones and prerecorded clips played into a conference,
//! to a single member, or in place of a member's input.
//!
//! A [`TreatmentManager`] plays a FIFO queue of [`TreatmentPlayer`]s and
//! publishes one frame per tick, so it can sit in a mix like any other
//! contribution source.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::constants::TICK_MS;
use crate::mixer::{Contribution, ContributionSlots, ContributionSource};
use crate::protocol::MediaInfo;

/// Produces treatment audio one tick at a time
pub trait TreatmentPlayer: Send {
    fn name(&self) -> &str;

    /// Next `samples` interleaved samples, `None` once finished
    fn next_frame(&mut self, samples: usize) -> Option<Vec<i32>>;
}

/// Sine tone, optionally limited in length
pub struct Tone {
    name: String,
    amplitude: f64,
    step: f64,
    phase: f64,
    channels: usize,
    /// Ticks left to play, `None` plays until stopped
    remaining_ticks: Option<u64>,
}

impl Tone {
    pub fn new(frequency: f64, amplitude: f64, duration: Option<Duration>, media: &MediaInfo) -> Self {
        Self {
            name: format!("tone:{}", frequency),
            amplitude,
            step: 2.0 * std::f64::consts::PI * frequency / media.sample_rate as f64,
            phase: 0.0,
            channels: media.channels.max(1) as usize,
            remaining_ticks: duration.map(|d| (d.as_millis() as u64).div_ceil(TICK_MS)),
        }
    }
}

impl TreatmentPlayer for Tone {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_frame(&mut self, samples: usize) -> Option<Vec<i32>> {
        if let Some(remaining) = self.remaining_ticks.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }

        let mut frame = Vec::with_capacity(samples);
        for _ in 0..samples / self.channels {
            let v = (self.amplitude * self.phase.sin()).round() as i32;
            self.phase = (self.phase + self.step) % (2.0 * std::f64::consts::PI);
            frame.extend(std::iter::repeat(v).take(self.channels));
        }
        Some(frame)
    }
}

/// Prerecorded PCM at conference media
pub struct PcmClip {
    name: String,
    samples: Arc<[i32]>,
    position: usize,
    repeat: bool,
}

impl PcmClip {
    pub fn new(name: impl Into<String>, samples: impl Into<Arc<[i32]>>, repeat: bool) -> Self {
        Self {
            name: name.into(),
            samples: samples.into(),
            position: 0,
            repeat,
        }
    }
}

impl TreatmentPlayer for PcmClip {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_frame(&mut self, samples: usize) -> Option<Vec<i32>> {
        if self.samples.is_empty() {
            return None;
        }
        if self.position >= self.samples.len() {
            if !self.repeat {
                return None;
            }
            self.position = 0;
        }

        let end = (self.position + samples).min(self.samples.len());
        let mut frame = self.samples[self.position..end].to_vec();
        self.position = end;
        // Short final frame is padded with silence
        frame.resize(samples, 0);
        Some(frame)
    }
}

#[derive(Default)]
struct TreatmentState {
    current: Option<Box<dyn TreatmentPlayer>>,
    queue: VecDeque<Box<dyn TreatmentPlayer>>,
    paused: bool,
    /// Names of treatments finished since the last `take_finished`
    finished: Vec<String>,
}

/// FIFO of treatments publishing one frame per tick
pub struct TreatmentManager {
    id: String,
    samples_per_packet: usize,
    state: Mutex<TreatmentState>,
    slots: Mutex<ContributionSlots>,
}

impl TreatmentManager {
    pub fn new(id: impl Into<String>, samples_per_packet: usize) -> Self {
        Self {
            id: id.into(),
            samples_per_packet,
            state: Mutex::new(TreatmentState::default()),
            slots: Mutex::new(ContributionSlots::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a treatment behind whatever is playing
    pub fn enqueue(&self, player: Box<dyn TreatmentPlayer>) {
        tracing::debug!("{}: queued treatment {}", self.id, player.name());
        self.state.lock().queue.push_back(player);
    }

    /// Stop the current treatment and drop the queue
    pub fn stop_all(&self) {
        let mut state = self.state.lock();
        state.current = None;
        state.queue.clear();
    }

    pub fn pause(&self, paused: bool) {
        self.state.lock().paused = paused;
    }

    /// Nothing playing and nothing queued
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.current.is_none() && state.queue.is_empty()
    }

    pub fn take_finished(&self) -> Vec<String> {
        std::mem::take(&mut self.state.lock().finished)
    }

    /// Pull the next frame, moving on through the queue as players finish
    pub fn next_frame(&self) -> Option<Vec<i32>> {
        let mut state = self.state.lock();
        if state.paused {
            return None;
        }

        loop {
            if state.current.is_none() {
                state.current = state.queue.pop_front();
            }
            let player = state.current.as_mut()?;
            if let Some(frame) = player.next_frame(self.samples_per_packet) {
                return Some(frame);
            }

            let name = player.name().to_string();
            tracing::debug!("{}: treatment {} done", self.id, name);
            state.finished.push(name);
            state.current = None;
        }
    }
}

impl ContributionSource for TreatmentManager {
    fn source_id(&self) -> String {
        self.id.clone()
    }

    fn save_current_contribution(&self) {
        if self.slots.lock().is_valid() {
            return;
        }
        let frame = self.next_frame().map(Contribution::from);
        self.slots.lock().publish(frame);
    }

    fn current_contribution(&self) -> Option<Contribution> {
        self.slots.lock().current()
    }

    fn previous_contribution(&self) -> Option<Contribution> {
        self.slots.lock().previous()
    }

    fn contribution_is_in_common_mix(&self) -> bool {
        false
    }

    fn invalidate_current_contribution(&self) {
        self.slots.lock().rotate();
    }
}

impl std::fmt::Debug for TreatmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreatmentManager").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media() -> MediaInfo {
        MediaInfo::from_payload(102).unwrap()
    }

    #[test]
    fn test_tone_length() {
        let mut tone = Tone::new(440.0, 1000.0, Some(Duration::from_millis(50)), &media());
        let mut ticks = 0;
        while let Some(frame) = tone.next_frame(160) {
            assert_eq!(frame.len(), 160);
            ticks += 1;
        }
        assert_eq!(ticks, 3);
    }

    #[test]
    fn test_clip_pads_last_frame() {
        let mut clip = PcmClip::new("clip", vec![5; 200], false);
        assert_eq!(clip.next_frame(160).unwrap(), vec![5; 160]);
        let last = clip.next_frame(160).unwrap();
        assert_eq!(&last[..40], &[5; 40]);
        assert_eq!(&last[40..], &[0; 120]);
        assert!(clip.next_frame(160).is_none());
    }

    #[test]
    fn test_queue_plays_in_order() {
        let manager = TreatmentManager::new("t", 4);
        manager.enqueue(Box::new(PcmClip::new("first", vec![1; 4], false)));
        manager.enqueue(Box::new(PcmClip::new("second", vec![2; 8], false)));

        assert_eq!(manager.next_frame().unwrap(), vec![1; 4]);
        assert_eq!(manager.next_frame().unwrap(), vec![2; 4]);
        assert_eq!(manager.take_finished(), vec!["first".to_string()]);
        assert_eq!(manager.next_frame().unwrap(), vec![2; 4]);
        assert!(manager.next_frame().is_none());
        assert!(manager.is_idle());
        assert_eq!(manager.take_finished(), vec!["second".to_string()]);
    }

    #[test]
    fn test_contribution_saved_once_per_tick() {
        let manager = TreatmentManager::new("t", 4);
        manager.enqueue(Box::new(PcmClip::new("clip", vec![1, 1, 1, 1, 2, 2, 2, 2], false)));

        manager.save_current_contribution();
        manager.save_current_contribution();
        assert_eq!(&*manager.current_contribution().unwrap(), &[1, 1, 1, 1]);

        manager.invalidate_current_contribution();
        manager.save_current_contribution();
        assert_eq!(&*manager.current_contribution().unwrap(), &[2, 2, 2, 2]);
        assert_eq!(&*manager.previous_contribution().unwrap(), &[1, 1, 1, 1]);
    }
}
