//! Outbound media for one member
//!
//! Takes the member's mixed frame each tick, applies output volume,
//! converts to the member's payload and hands an RTP packet to the
//! registered transport. A tick with no mix sends one comfort noise packet
//! at the start of the silence period and nothing after it.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::events::{ConferenceEvent, EventBus};
use super::{CallId, CallParticipant, MemberLifecycle};
use crate::audio::{pcm, Resampler};
use crate::codec::{self, Codec};
use crate::error::{CodecError, MemberError};
use crate::network::{PacketCipher, Transport};
use crate::protocol::rtp::{RtpSequencer, COMFORT_NOISE_PAYLOAD, DEFAULT_COMFORT_NOISE_LEVEL};
use crate::protocol::MediaInfo;

struct SenderState {
    conference_media: MediaInfo,
    media: Option<MediaInfo>,
    codec: Option<Box<dyn Codec>>,
    resampler: Option<Resampler>,
    sequencer: RtpSequencer,
    output_volume: f64,
    /// Comfort noise already sent for the current silence
    in_silence: bool,
}

#[derive(Debug, Default)]
struct SenderCounters {
    packets: AtomicU64,
    bytes: AtomicU64,
    comfort_noise: AtomicU64,
    not_ready: AtomicU64,
    send_errors: AtomicU64,
}

/// Sender counters
#[derive(Debug, Clone, Serialize)]
pub struct SenderStats {
    pub packets: u64,
    pub bytes: u64,
    pub comfort_noise: u64,
    pub not_ready: u64,
    pub send_errors: u64,
}

pub struct MemberSender {
    call_id: CallId,
    conference_id: RwLock<String>,
    send_payload: u8,
    lifecycle: Arc<MemberLifecycle>,
    events: Arc<EventBus>,
    state: Mutex<SenderState>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    cipher: RwLock<Option<Arc<dyn PacketCipher>>>,
    counters: SenderCounters,
}

impl MemberSender {
    pub fn new(
        participant: &CallParticipant,
        conference_id: &str,
        conference_media: MediaInfo,
        lifecycle: Arc<MemberLifecycle>,
        events: Arc<EventBus>,
    ) -> Self {
        let ssrc = uuid::Uuid::new_v4().as_u128() as u32;
        Self {
            call_id: participant.call_id.clone(),
            conference_id: RwLock::new(conference_id.to_string()),
            send_payload: participant.send_payload(),
            lifecycle,
            events,
            state: Mutex::new(SenderState {
                conference_media,
                media: None,
                codec: None,
                resampler: None,
                sequencer: RtpSequencer::new(ssrc),
                output_volume: participant.output_volume,
                in_silence: false,
            }),
            transport: RwLock::new(None),
            cipher: RwLock::new(None),
            counters: SenderCounters::default(),
        }
    }

    /// Set up encoding for the payload the member expects
    pub fn initialize(&self) -> Result<(), MemberError> {
        let media = MediaInfo::from_payload(self.send_payload)
            .map_err(|_| MemberError::InvalidPayload(self.send_payload))?;
        let mut state = self.state.lock();
        Self::configure(&mut state, media)?;
        tracing::info!("Call {} sending {}", self.call_id, media);
        Ok(())
    }

    fn configure(state: &mut SenderState, media: MediaInfo) -> Result<(), CodecError> {
        state.codec = Some(codec::create(&media)?);
        state.resampler = if Resampler::is_needed(&state.conference_media, &media) {
            Some(Resampler::new(state.conference_media, media)?)
        } else {
            None
        };
        state.media = Some(media);
        Ok(())
    }

    /// Follow the member into another conference, whose media may differ
    pub fn reinitialize(&self, conference_id: &str, conference_media: MediaInfo) -> Result<(), MemberError> {
        *self.conference_id.write() = conference_id.to_string();
        let mut state = self.state.lock();
        state.conference_media = conference_media;
        if let Some(media) = state.media {
            Self::configure(&mut state, media)?;
        }
        state.sequencer.mark_next();
        Ok(())
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn register_transport(&self, transport: Arc<dyn Transport>) {
        tracing::debug!("Call {} transport registered", self.call_id);
        *self.transport.write() = Some(transport);
    }

    pub fn unregister_transport(&self) {
        tracing::debug!("Call {} transport unregistered", self.call_id);
        *self.transport.write() = None;
    }

    pub fn set_cipher(&self, cipher: Option<Arc<dyn PacketCipher>>) {
        *self.cipher.write() = cipher;
    }

    /// Initialized, has somewhere to send, and not ended
    pub fn is_ready(&self) -> bool {
        !self.lifecycle.is_done()
            && !self.lifecycle.is_cancelled()
            && self.transport.read().is_some()
            && self.state.lock().codec.is_some()
    }

    pub fn set_output_volume(&self, volume: f64) {
        self.state.lock().output_volume = volume;
    }

    pub fn output_volume(&self) -> f64 {
        self.state.lock().output_volume
    }

    /// Send one tick of conference-rate audio, or comfort noise for `None`.
    /// Returns true if a packet went out.
    pub fn send_data(&self, data: Option<&[i32]>) -> bool {
        let Some(transport) = self.transport.read().clone() else {
            self.counters.not_ready.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        if self.lifecycle.is_done() || self.lifecycle.is_cancelled() {
            return false;
        }

        let Some(data) = data else {
            return self.send_comfort_noise_with(transport.as_ref());
        };

        let packet = match self.build_media_packet(data) {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                self.counters.not_ready.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            Err(e) => {
                self.cancel(e);
                return false;
            }
        };

        let len = packet.len() as u64;
        match transport.send(&self.call_id, packet) {
            Ok(()) => {
                self.counters.packets.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes.fetch_add(len, Ordering::Relaxed);
                tracing::trace!("Call {} sent {} bytes", self.call_id, len);
                true
            }
            Err(e) => {
                let errors = self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                if errors % 1000 == 0 {
                    tracing::warn!("Call {} send failed: {}", self.call_id, e);
                }
                false
            }
        }
    }

    fn build_media_packet(&self, data: &[i32]) -> Result<Option<Bytes>, MemberError> {
        let mut state = self.state.lock();
        let Some(media) = state.media else {
            return Ok(None);
        };

        let mut frame = data.to_vec();
        pcm::adjust_volume(&mut frame, state.output_volume);

        let frame = match state.resampler.as_mut() {
            Some(resampler) => resampler.process(&frame)?,
            None => pcm::fit_length(frame, media.samples_per_packet()),
        };

        let payload = match state.codec.as_mut() {
            Some(codec) => codec.encode(&frame)?,
            None => return Ok(None),
        };

        state.in_silence = false;
        let header = state
            .sequencer
            .next_header(media.payload, media.frames_per_packet() as u32);
        drop(state);

        self.encrypt(header.to_packet(&payload)?).map(Some)
    }

    fn encrypt(&self, packet: Bytes) -> Result<Bytes, MemberError> {
        match self.cipher.read().as_ref() {
            Some(cipher) => cipher
                .encrypt(&packet)
                .map(Bytes::from)
                .map_err(|e| MemberError::Encrypt(e.to_string())),
            None => Ok(packet),
        }
    }

    /// Signal silence to the member. Only the first tick of a silence
    /// period produces a packet.
    pub fn send_comfort_noise(&self) -> bool {
        match self.transport.read().clone() {
            Some(transport) => self.send_comfort_noise_with(transport.as_ref()),
            None => false,
        }
    }

    fn send_comfort_noise_with(&self, transport: &dyn Transport) -> bool {
        let mut state = self.state.lock();
        let Some(media) = state.media else {
            return false;
        };
        let frames = media.frames_per_packet() as u32;

        if state.in_silence {
            state.sequencer.skip(frames);
            return false;
        }
        state.in_silence = true;
        // The next talk spurt starts a fresh encoder
        if let Some(codec) = state.codec.as_mut() {
            codec.reset();
        }

        let header = state.sequencer.next_header(COMFORT_NOISE_PAYLOAD, frames);
        state.sequencer.mark_next();
        drop(state);

        let packet = match header
            .to_packet(&[DEFAULT_COMFORT_NOISE_LEVEL])
            .map_err(MemberError::from)
            .and_then(|packet| self.encrypt(packet))
        {
            Ok(packet) => packet,
            Err(e) => {
                self.cancel(e);
                return false;
            }
        };

        match transport.send_comfort_noise(&self.call_id, packet) {
            Ok(()) => {
                self.counters.comfort_noise.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Call {} comfort noise failed: {}", self.call_id, e);
                false
            }
        }
    }

    fn cancel(&self, error: MemberError) {
        let reason = error.to_string();
        if self.lifecycle.request_cancel(reason.clone()) {
            tracing::error!("Call {} cancelled: {}", self.call_id, reason);
            self.events.publish(ConferenceEvent::CallCancelled {
                conference: self.conference_id.read().clone(),
                call_id: self.call_id.clone(),
                reason,
            });
        }
    }

    pub fn end(&self) {
        self.unregister_transport();
        let mut state = self.state.lock();
        state.codec = None;
        state.resampler = None;
    }

    pub fn stats(&self) -> SenderStats {
        SenderStats {
            packets: self.counters.packets.load(Ordering::Relaxed),
            bytes: self.counters.bytes.load(Ordering::Relaxed),
            comfort_noise: self.counters.comfort_noise.load(Ordering::Relaxed),
            not_ready: self.counters.not_ready.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for MemberSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemberSender")
            .field("call_id", &self.call_id)
            .field("payload", &self.send_payload)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryTransport;
    use crate::protocol::RtpHeader;

    fn sender(payload: u8) -> (MemberSender, Arc<MemoryTransport>) {
        let participant = CallParticipant::new("a", "6001").with_payload(payload);
        let sender = MemberSender::new(
            &participant,
            "conf",
            MediaInfo::from_payload(102).unwrap(),
            Arc::new(MemberLifecycle::default()),
            Arc::new(EventBus::new()),
        );
        sender.initialize().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        sender.register_transport(transport.clone());
        (sender, transport)
    }

    #[test]
    fn test_not_ready_without_transport() {
        let participant = CallParticipant::new("a", "6001").with_payload(102);
        let sender = MemberSender::new(
            &participant,
            "conf",
            MediaInfo::from_payload(102).unwrap(),
            Arc::new(MemberLifecycle::default()),
            Arc::new(EventBus::new()),
        );
        sender.initialize().unwrap();
        assert!(!sender.is_ready());
        assert!(!sender.send_data(Some(&[0; 160])));
        assert_eq!(sender.stats().not_ready, 1);
    }

    #[test]
    fn test_media_packet_sequence_and_volume() {
        let (sender, transport) = sender(102);
        sender.set_output_volume(2.0);
        assert!(sender.send_data(Some(&[100; 160])));
        assert!(sender.send_data(Some(&[100; 160])));

        let sent = transport.take(&CallId::from("a"));
        let (first, payload) = RtpHeader::parse(&sent.media[0]).unwrap();
        let (second, _) = RtpHeader::parse(&sent.media[1]).unwrap();
        assert!(first.marker);
        assert!(!second.marker);
        assert_eq!(second.sequence, first.sequence.wrapping_add(1));
        assert_eq!(second.timestamp, first.timestamp.wrapping_add(160));
        assert_eq!(i16::from_be_bytes([payload[0], payload[1]]), 200);
    }

    #[test]
    fn test_comfort_noise_once_per_silence() {
        let (sender, transport) = sender(0);
        let a = CallId::from("a");

        assert!(sender.send_data(None));
        assert!(!sender.send_data(None));
        assert!(!sender.send_data(None));
        assert_eq!(transport.comfort_noise_count(&a), 1);

        assert!(sender.send_data(Some(&[0; 160])));
        let sent = transport.take(&a);
        let (header, _) = RtpHeader::parse(&sent.media[0]).unwrap();
        assert!(header.marker);

        assert!(sender.send_data(None));
        assert_eq!(transport.comfort_noise_count(&a), 1);
        assert_eq!(sender.stats().comfort_noise, 2);
    }
}
