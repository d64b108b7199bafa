//! Jitter buffer for inbound RTP
//!
//! Absorbs network jitter and reordering for one member. Frames are stored
//! in slots indexed by RTP sequence number and played out in sequence
//! order, one per tick.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// What to play in place of a missing packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlcStrategy {
    /// Play nothing
    #[default]
    Silence,
    /// Replay the last good frame
    RepeatLast,
    /// Replay the last good frame at half level per consecutive loss
    Fade,
}

/// Consecutive losses concealed before falling silent
const MAX_CONCEALED: usize = 3;

/// Decoded frame waiting for playout
#[derive(Debug, Clone)]
struct Slot {
    sequence: u16,
    samples: Vec<i32>,
}

/// Jitter buffer for packet reordering
pub struct JitterBuffer {
    /// Buffer slots indexed by sequence modulo capacity
    slots: Vec<Option<Slot>>,
    /// Capacity (power of 2)
    capacity: usize,
    /// Mask for fast modulo
    mask: usize,
    /// Next sequence to play, unset until the first packet
    next_sequence: Option<u16>,
    /// Packets buffered before playout starts
    min_size: usize,
    /// Packets held before the oldest is dropped
    max_size: usize,
    plc: PlcStrategy,
    /// Playout has started since the last underrun
    primed: bool,
    /// Last played frame, kept for concealment
    last_frame: Option<Vec<i32>>,
    consecutive_losses: usize,
    /// Current buffer level
    level: AtomicUsize,
    received: AtomicUsize,
    lost: AtomicUsize,
    late: AtomicUsize,
    /// Frames dropped because the buffer overflowed
    dropped: AtomicUsize,
    concealed: AtomicUsize,
}

impl JitterBuffer {
    pub fn new(min_size: usize, max_size: usize, plc: PlcStrategy) -> Self {
        let max_size = max_size.max(1);
        let capacity = (max_size * 2).next_power_of_two().max(16);

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Self {
            slots,
            capacity,
            mask: capacity - 1,
            next_sequence: None,
            min_size: min_size.min(max_size),
            max_size,
            plc,
            primed: false,
            last_frame: None,
            consecutive_losses: 0,
            level: AtomicUsize::new(0),
            received: AtomicUsize::new(0),
            lost: AtomicUsize::new(0),
            late: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            concealed: AtomicUsize::new(0),
        }
    }

    /// Insert a decoded frame. Returns false if it was late or a duplicate.
    pub fn insert(&mut self, sequence: u16, samples: Vec<i32>) -> bool {
        let next = *self.next_sequence.get_or_insert(sequence);

        let ahead = sequence.wrapping_sub(next) as i16;
        let distance = (ahead as i32).unsigned_abs() as usize;
        if ahead < 0 && distance <= self.capacity {
            self.late.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        if distance >= self.capacity {
            // Sender jumped or restarted; start over from this packet
            self.resync(next, sequence);
        }

        let index = (sequence as usize) & self.mask;
        if self.slots[index].as_ref().is_some_and(|s| s.sequence == sequence) {
            self.late.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.slots[index] = Some(Slot { sequence, samples });
        self.received.fetch_add(1, Ordering::Relaxed);
        let level = self.level.fetch_add(1, Ordering::Relaxed) + 1;

        if level > self.max_size {
            self.drop_oldest();
        }

        true
    }

    /// Frame for this tick. `None` means nothing to play.
    pub fn pop(&mut self) -> Option<Vec<i32>> {
        self.pop_with(|| None)
    }

    /// Like [`pop`](Self::pop), but a lost packet is first offered to
    /// `conceal_loss`, normally the codec's own concealment. The configured
    /// strategy covers losses it declines.
    pub fn pop_with<F>(&mut self, conceal_loss: F) -> Option<Vec<i32>>
    where
        F: FnOnce() -> Option<Vec<i32>>,
    {
        let level = self.level.load(Ordering::Relaxed);
        if level == 0 {
            self.primed = false;
            return None;
        }

        if !self.primed {
            if level < self.min_size {
                return None;
            }
            self.primed = true;
            self.skip_to_buffered();
        }

        let next = self.next_sequence?;
        let index = (next as usize) & self.mask;
        self.next_sequence = Some(next.wrapping_add(1));

        match self.slots[index].take() {
            Some(slot) if slot.sequence == next => {
                self.level.fetch_sub(1, Ordering::Relaxed);
                self.consecutive_losses = 0;
                if self.plc != PlcStrategy::Silence {
                    self.last_frame = Some(slot.samples.clone());
                }
                Some(slot.samples)
            }
            other => {
                // A stale slot from a wrapped sequence is not this packet
                if other.is_some() {
                    self.level.fetch_sub(1, Ordering::Relaxed);
                }
                self.lost.fetch_add(1, Ordering::Relaxed);
                self.conceal(conceal_loss)
            }
        }
    }

    fn conceal<F>(&mut self, conceal_loss: F) -> Option<Vec<i32>>
    where
        F: FnOnce() -> Option<Vec<i32>>,
    {
        self.consecutive_losses += 1;
        if self.consecutive_losses > MAX_CONCEALED {
            return None;
        }
        if let Some(frame) = conceal_loss() {
            self.concealed.fetch_add(1, Ordering::Relaxed);
            return Some(frame);
        }

        let last = self.last_frame.as_ref()?;
        let frame = match self.plc {
            PlcStrategy::Silence => return None,
            PlcStrategy::RepeatLast => last.clone(),
            PlcStrategy::Fade => {
                let shift = self.consecutive_losses as u32;
                last.iter().map(|&s| s >> shift).collect()
            }
        };
        self.concealed.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    fn drop_oldest(&mut self) {
        let Some(mut next) = self.next_sequence else {
            return;
        };
        for _ in 0..self.capacity {
            let index = (next as usize) & self.mask;
            next = next.wrapping_add(1);
            if self.slots[index].take().is_some() {
                self.level.fetch_sub(1, Ordering::Relaxed);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        self.next_sequence = Some(next);
    }

    /// After an underrun, start playout at the oldest buffered packet
    /// instead of counting the gap as loss
    fn skip_to_buffered(&mut self) {
        let Some(mut next) = self.next_sequence else {
            return;
        };
        for _ in 0..self.capacity {
            let index = (next as usize) & self.mask;
            if self.slots[index].as_ref().is_some_and(|s| s.sequence == next) {
                self.next_sequence = Some(next);
                return;
            }
            next = next.wrapping_add(1);
        }
    }

    fn resync(&mut self, expected: u16, sequence: u16) {
        tracing::debug!(
            "Jitter buffer resync, expected {} got {}",
            expected,
            sequence
        );
        let level = self.level.load(Ordering::Relaxed);
        self.dropped.fetch_add(level, Ordering::Relaxed);
        self.clear_slots();
        self.next_sequence = Some(sequence);
        self.primed = false;
    }

    fn clear_slots(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.level.store(0, Ordering::Relaxed);
    }

    /// Discard buffered audio but keep sequence tracking
    pub fn flush(&mut self) {
        let level = self.level.load(Ordering::Relaxed);
        if let Some(next) = self.next_sequence {
            self.next_sequence = Some(next.wrapping_add(level as u16));
        }
        self.clear_slots();
        self.primed = false;
        self.last_frame = None;
        self.consecutive_losses = 0;
    }

    /// Forget everything, including the expected sequence
    pub fn reset(&mut self) {
        self.clear_slots();
        self.next_sequence = None;
        self.primed = false;
        self.last_frame = None;
        self.consecutive_losses = 0;
    }

    pub fn len(&self) -> usize {
        self.level.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> JitterBufferStats {
        JitterBufferStats {
            level: self.level.load(Ordering::Relaxed),
            capacity: self.capacity,
            received: self.received.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            late: self.late.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            concealed: self.concealed.load(Ordering::Relaxed),
        }
    }
}

/// Jitter buffer statistics
#[derive(Debug, Clone, Serialize)]
pub struct JitterBufferStats {
    pub level: usize,
    pub capacity: usize,
    pub received: usize,
    pub lost: usize,
    pub late: usize,
    pub dropped: usize,
    pub concealed: usize,
}

impl JitterBufferStats {
    pub fn loss_rate(&self) -> f32 {
        if self.received == 0 {
            0.0
        } else {
            self.lost as f32 / (self.received + self.lost) as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(v: i32) -> Vec<i32> {
        vec![v; 4]
    }

    #[test]
    fn test_reorders() {
        let mut jitter = JitterBuffer::new(3, 8, PlcStrategy::Silence);

        jitter.insert(100, frame(0));
        jitter.insert(102, frame(2));
        assert!(jitter.pop().is_none(), "not primed yet");
        jitter.insert(101, frame(1));

        assert_eq!(jitter.pop().unwrap()[0], 0);
        assert_eq!(jitter.pop().unwrap()[0], 1);
        assert_eq!(jitter.pop().unwrap()[0], 2);
        assert!(jitter.pop().is_none());
    }

    #[test]
    fn test_late_and_duplicate() {
        let mut jitter = JitterBuffer::new(1, 8, PlcStrategy::Silence);
        assert!(jitter.insert(10, frame(1)));
        assert!(!jitter.insert(10, frame(1)));
        jitter.pop();
        assert!(!jitter.insert(9, frame(1)));
        assert_eq!(jitter.stats().late, 2);
    }

    #[test]
    fn test_sequence_wrap() {
        let mut jitter = JitterBuffer::new(1, 8, PlcStrategy::Silence);
        jitter.insert(65535, frame(1));
        jitter.insert(0, frame(2));
        assert_eq!(jitter.pop().unwrap()[0], 1);
        assert_eq!(jitter.pop().unwrap()[0], 2);
    }

    #[test]
    fn test_loss_concealment() {
        let mut jitter = JitterBuffer::new(1, 8, PlcStrategy::Fade);
        jitter.insert(1, frame(400));
        jitter.insert(3, frame(9));

        assert_eq!(jitter.pop().unwrap()[0], 400);
        assert_eq!(jitter.pop().unwrap()[0], 200, "faded repeat");
        assert_eq!(jitter.pop().unwrap()[0], 9);

        let stats = jitter.stats();
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.concealed, 1);
    }

    #[test]
    fn test_codec_concealment_comes_first() {
        let mut jitter = JitterBuffer::new(1, 8, PlcStrategy::RepeatLast);
        jitter.insert(1, frame(400));
        jitter.insert(4, frame(9));

        let played = jitter.pop_with(|| panic!("nothing was lost"));
        assert_eq!(played.unwrap()[0], 400);
        assert_eq!(jitter.pop_with(|| Some(frame(-7))).unwrap()[0], -7);
        assert_eq!(jitter.pop_with(|| None).unwrap()[0], 400, "strategy covers the rest");
        assert_eq!(jitter.pop().unwrap()[0], 9);

        let stats = jitter.stats();
        assert_eq!(stats.lost, 2);
        assert_eq!(stats.concealed, 2);
    }

    #[test]
    fn test_silence_plc_returns_none() {
        let mut jitter = JitterBuffer::new(1, 8, PlcStrategy::Silence);
        jitter.insert(1, frame(5));
        jitter.insert(3, frame(6));
        jitter.pop();
        assert!(jitter.pop().is_none());
        assert_eq!(jitter.pop().unwrap()[0], 6);
    }

    #[test]
    fn test_underrun_resumes_at_next_packet() {
        let mut jitter = JitterBuffer::new(1, 8, PlcStrategy::Silence);
        jitter.insert(1, frame(1));
        assert_eq!(jitter.pop().unwrap()[0], 1);
        assert!(jitter.pop().is_none());

        // Nothing for sequence 2, the sender went quiet
        jitter.insert(3, frame(3));
        assert_eq!(jitter.pop().unwrap()[0], 3);
        assert_eq!(jitter.stats().lost, 0);
    }

    #[test]
    fn test_sequence_restart_resyncs() {
        let mut jitter = JitterBuffer::new(1, 8, PlcStrategy::Silence);
        for seq in 30000..30006u16 {
            jitter.insert(seq, frame(1));
            assert!(jitter.pop().is_some());
        }

        // Sender restarted far behind where we were
        let mut heard = 0;
        for seq in 100..600u16 {
            assert!(jitter.insert(seq, frame(2)), "seq {} rejected", seq);
            if jitter.pop().is_some_and(|f| f[0] == 2) {
                heard += 1;
            }
        }
        assert_eq!(heard, 500);
        assert_eq!(jitter.stats().late, 0);
    }

    #[test]
    fn test_small_backward_step_is_late() {
        let mut jitter = JitterBuffer::new(1, 8, PlcStrategy::Silence);
        for seq in 50..60u16 {
            jitter.insert(seq, frame(1));
            jitter.pop();
        }
        assert!(!jitter.insert(55, frame(1)));
        assert_eq!(jitter.stats().late, 1);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut jitter = JitterBuffer::new(1, 2, PlcStrategy::Silence);
        jitter.insert(1, frame(1));
        jitter.insert(2, frame(2));
        jitter.insert(3, frame(3));

        assert_eq!(jitter.len(), 2);
        assert_eq!(jitter.pop().unwrap()[0], 2);
        assert_eq!(jitter.stats().dropped, 1);
    }

    #[test]
    fn test_flush_keeps_sequence() {
        let mut jitter = JitterBuffer::new(1, 8, PlcStrategy::Silence);
        jitter.insert(1, frame(1));
        jitter.insert(2, frame(2));
        jitter.flush();
        assert!(jitter.is_empty());
        assert!(!jitter.insert(2, frame(2)), "flushed packets stay late");
        assert!(jitter.insert(3, frame(3)));
        assert_eq!(jitter.pop().unwrap()[0], 3);
    }
}
