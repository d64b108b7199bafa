//! Inbound media for one member
//!
//! ```text
//! RTP ─► decrypt ─► classify ─► decode ─► resample ─► forward ─► DTMF ─► jitter
//!                                                                          │
//!                    tick: jitter pop ─► mute gate ─► speech ─► volume ─► contribution
//! ```
//!
//! Packet handling runs on the network thread; contributions are saved on
//! the scheduler thread. Failures that make the call unusable request
//! cancellation through the member lifecycle and never propagate further.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use super::events::{ConferenceEvent, EventBus};
use super::{CallId, CallParticipant, MemberLifecycle, MemberSender, MuteFlags, WhisperGroup};
use crate::audio::{pcm, DtmfDetector, JitterBuffer, JitterBufferStats, Resampler, SpeechDetector};
use crate::codec::{self, Codec};
use crate::config::BridgeConfig;
use crate::constants::NO_DATA_TICKS_BEFORE_RESET;
use crate::error::{CodecError, MemberError};
use crate::mixer::{Contribution, ContributionSlots, ContributionSource};
use crate::network::PacketCipher;
use crate::protocol::rtp::{self, PacketKind, RtpHeader, TelephoneEvent};
use crate::protocol::MediaInfo;
use crate::treatment::TreatmentManager;

struct ReceiverState {
    conference_media: MediaInfo,
    /// Negotiated inbound media, unset until initialized
    media: Option<MediaInfo>,
    telephone_event_payload: u8,
    codec: Option<Box<dyn Codec>>,
    resampler: Option<Resampler>,
    speech: SpeechDetector,
    dtmf: DtmfDetector,
    /// Muted while a DTMF tone is sounding
    auto_muted: bool,
    join_confirmation_received: bool,
    created_at: Instant,
    last_rtp_at: Option<Instant>,
    last_rtcp_at: Option<Instant>,
    media_packets: u64,
    last_media_packets: u64,
    no_data_ticks: u32,
    bad_payloads: u64,
    /// Timestamp of the last telephone event already reported
    last_event_timestamp: Option<u32>,
    /// Drop every Nth media packet, 0 to keep all
    drop_packets: u32,
    /// Stream source of the last packet
    last_ssrc: Option<u32>,
    input_volume: f64,
}

#[derive(Debug, Default)]
struct ReceiverCounters {
    packets: AtomicU64,
    media_packets: AtomicU64,
    comfort_noise: AtomicU64,
    telephone_events: AtomicU64,
    invalid: AtomicU64,
    unexpected: AtomicU64,
    dropped: AtomicU64,
    contributions: AtomicU64,
}

/// Receiver counters and jitter statistics
#[derive(Debug, Clone, Serialize)]
pub struct ReceiverStats {
    pub packets: u64,
    pub media_packets: u64,
    pub comfort_noise: u64,
    pub telephone_events: u64,
    pub invalid: u64,
    pub unexpected: u64,
    pub dropped: u64,
    pub contributions: u64,
    pub jitter: JitterBufferStats,
}

pub struct MemberReceiver {
    call_id: CallId,
    conference_id: RwLock<String>,
    participant: CallParticipant,
    config: Arc<BridgeConfig>,
    mute: Arc<MuteFlags>,
    lifecycle: Arc<MemberLifecycle>,
    events: Arc<EventBus>,
    whisper_group: RwLock<Option<Arc<WhisperGroup>>>,
    state: Mutex<ReceiverState>,
    jitter: Mutex<JitterBuffer>,
    slots: Mutex<ContributionSlots>,
    forward: Mutex<Vec<Weak<MemberSender>>>,
    input_treatment: Mutex<Option<Arc<TreatmentManager>>>,
    cipher: RwLock<Option<Arc<dyn PacketCipher>>>,
    counters: ReceiverCounters,
}

impl MemberReceiver {
    pub fn new(
        participant: CallParticipant,
        conference_id: &str,
        conference_media: MediaInfo,
        config: Arc<BridgeConfig>,
        mute: Arc<MuteFlags>,
        lifecycle: Arc<MemberLifecycle>,
        events: Arc<EventBus>,
    ) -> Self {
        let jitter = JitterBuffer::new(config.jitter.min_size, config.jitter.max_size, config.jitter.plc);
        let state = ReceiverState {
            conference_media,
            media: None,
            telephone_event_payload: participant.telephone_event_payload,
            codec: None,
            resampler: None,
            speech: SpeechDetector::new(&config.speech),
            dtmf: DtmfDetector::new(conference_media.sample_rate, conference_media.channels),
            auto_muted: false,
            join_confirmation_received: !participant.join_confirmation,
            created_at: Instant::now(),
            last_rtp_at: None,
            last_rtcp_at: None,
            media_packets: 0,
            last_media_packets: 0,
            no_data_ticks: 0,
            bad_payloads: 0,
            last_event_timestamp: None,
            drop_packets: 0,
            last_ssrc: None,
            input_volume: participant.input_volume,
        };

        Self {
            call_id: participant.call_id.clone(),
            conference_id: RwLock::new(conference_id.to_string()),
            participant,
            config,
            mute,
            lifecycle,
            events,
            whisper_group: RwLock::new(None),
            state: Mutex::new(state),
            jitter: Mutex::new(jitter),
            slots: Mutex::new(ContributionSlots::default()),
            forward: Mutex::new(Vec::new()),
            input_treatment: Mutex::new(None),
            cipher: RwLock::new(None),
            counters: ReceiverCounters::default(),
        }
    }

    /// Set up decoding for the member's negotiated payload
    pub fn initialize(&self) -> Result<(), MemberError> {
        let payload = self.participant.receive_payload;
        let media = MediaInfo::from_payload(payload).map_err(|_| MemberError::InvalidPayload(payload))?;

        let mut state = self.state.lock();
        self.configure(&mut state, media)?;
        tracing::info!(
            "Call {} receiving {} into conference {} at {}",
            self.call_id,
            media,
            self.conference_id.read(),
            state.conference_media
        );
        Ok(())
    }

    fn configure(&self, state: &mut ReceiverState, media: MediaInfo) -> Result<(), MemberError> {
        state.codec = Some(codec::create(&media)?);
        state.resampler = if Resampler::is_needed(&media, &state.conference_media) {
            Some(Resampler::new(media, state.conference_media)?)
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
        state.dtmf = DtmfDetector::new(conference_media.sample_rate, conference_media.channels);
        if let Some(media) = state.media {
            self.configure(&mut state, media)?;
        }
        drop(state);
        self.jitter.lock().reset();
        self.slots.lock().clear();
        Ok(())
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn participant(&self) -> &CallParticipant {
        &self.participant
    }

    pub fn whisper_group(&self) -> Option<Arc<WhisperGroup>> {
        self.whisper_group.read().clone()
    }

    pub fn set_whisper_group(&self, group: Option<Arc<WhisperGroup>>) {
        if let Some(g) = &group {
            tracing::debug!("Call {} now whispering in {}", self.call_id, g.id());
        }
        *self.whisper_group.write() = group;
    }

    pub fn set_cipher(&self, cipher: Option<Arc<dyn PacketCipher>>) {
        *self.cipher.write() = cipher;
    }

    /// Handle one packet from the network
    pub fn receive(&self, data: &[u8]) {
        if self.lifecycle.is_done() || self.lifecycle.is_cancelled() {
            return;
        }
        self.counters.packets.fetch_add(1, Ordering::Relaxed);

        let cipher = self.cipher.read().clone();
        let decrypted;
        let data = match cipher {
            Some(cipher) => match cipher.decrypt(data) {
                Ok(plain) => {
                    decrypted = plain;
                    decrypted.as_slice()
                }
                Err(e) => {
                    self.cancel(MemberError::Decrypt(e.to_string()));
                    return;
                }
            },
            None => data,
        };

        let (header, payload) = match RtpHeader::parse(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.counters.invalid.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Call {} invalid packet: {}", self.call_id, e);
                return;
            }
        };

        let mut state = self.state.lock();
        state.last_rtp_at = Some(Instant::now());

        if state.last_ssrc.replace(header.ssrc).is_some_and(|ssrc| ssrc != header.ssrc) {
            tracing::info!("Call {} stream source changed to {:#x}", self.call_id, header.ssrc);
            self.jitter.lock().reset();
        }

        let Some(media) = state.media else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        match rtp::classify(header.payload_type, media.payload, state.telephone_event_payload) {
            PacketKind::Media => {}
            PacketKind::ComfortNoise => {
                self.counters.comfort_noise.fetch_add(1, Ordering::Relaxed);
                return;
            }
            PacketKind::TelephoneEvent => {
                self.counters.telephone_events.fetch_add(1, Ordering::Relaxed);
                self.handle_telephone_event(&mut state, &header, payload);
                return;
            }
            PacketKind::Ignored => return,
            PacketKind::Unexpected => {
                self.handle_unexpected_payload(&mut state, header.payload_type, media.payload);
                return;
            }
        }

        state.media_packets += 1;
        self.counters.media_packets.fetch_add(1, Ordering::Relaxed);

        if state.drop_packets > 0 && state.media_packets % state.drop_packets as u64 == 0 {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let samples = match self.decode(&mut state, payload) {
            Ok(samples) => samples,
            Err(e) => {
                drop(state);
                self.cancel(e.into());
                return;
            }
        };

        self.forward_data(&samples);

        if self.participant.dtmf_suppression && self.config.receiver.dtmf_detection {
            let key = state.dtmf.process(&samples);
            if state.dtmf.tone_present() {
                if !state.auto_muted {
                    tracing::debug!("Call {} auto-muted for DTMF", self.call_id);
                    state.auto_muted = true;
                    self.flush_contributions();
                }
            } else {
                state.auto_muted = false;
            }
            if let Some(key) = key {
                self.process_dtmf_key(&mut state, key);
            }
            if state.auto_muted {
                return;
            }
        }

        if !state.join_confirmation_received {
            return;
        }

        self.jitter.lock().insert(header.sequence, samples);
    }

    fn decode(&self, state: &mut ReceiverState, payload: &[u8]) -> Result<Vec<i32>, CodecError> {
        let spp = state.conference_media.samples_per_packet();
        let codec = state
            .codec
            .as_mut()
            .ok_or_else(|| CodecError::DecoderInit("codec not initialized".into()))?;
        let decoded = codec.decode(payload)?;

        match state.resampler.as_mut() {
            Some(resampler) => resampler.process(&decoded),
            None => Ok(pcm::fit_length(decoded, spp)),
        }
    }

    fn handle_unexpected_payload(&self, state: &mut ReceiverState, payload: u8, expected: u8) {
        state.bad_payloads += 1;
        self.counters.unexpected.fetch_add(1, Ordering::Relaxed);

        if state.bad_payloads == 1 || state.bad_payloads % 1000 == 0 {
            tracing::warn!(
                "Call {} unexpected payload {}, expected {} ({} so far)",
                self.call_id,
                payload,
                expected,
                state.bad_payloads
            );
        }

        if state.bad_payloads >= self.config.receiver.bad_payload_threshold && state.media_packets == 0 {
            self.cancel(MemberError::BadPayloadStream(state.bad_payloads));
        }
    }

    fn handle_telephone_event(&self, state: &mut ReceiverState, header: &RtpHeader, payload: &[u8]) {
        let Some(event) = TelephoneEvent::parse(payload) else {
            return;
        };
        // End packets are repeated; report each event once
        if !event.end || state.last_event_timestamp == Some(header.timestamp) {
            return;
        }
        state.last_event_timestamp = Some(header.timestamp);

        if let Some(key) = event.key() {
            self.process_dtmf_key(state, key);
        }
    }

    fn process_dtmf_key(&self, state: &mut ReceiverState, key: char) {
        tracing::info!("Call {} DTMF key {}", self.call_id, key);

        if !state.join_confirmation_received {
            if self.config.receiver.join_confirmation_key.contains(key) {
                tracing::info!("Call {} join confirmed", self.call_id);
                state.join_confirmation_received = true;
                self.lifecycle.confirm_join();
            }
            return;
        }

        if self.config.receiver.forward_dtmf_keys {
            self.events.publish(ConferenceEvent::DtmfKey {
                conference: self.conference_id.read().clone(),
                call_id: self.call_id.clone(),
                key: key.to_string(),
            });
        }
    }

    /// Copy inbound audio straight to listening members
    fn forward_data(&self, samples: &[i32]) {
        let mut forward = self.forward.lock();
        if forward.is_empty() {
            return;
        }
        forward.retain(|sender| match sender.upgrade() {
            Some(sender) => {
                sender.send_data(Some(samples));
                true
            }
            None => false,
        });
    }

    pub fn add_forward_member(&self, sender: &Arc<MemberSender>) {
        let mut forward = self.forward.lock();
        forward.retain(|s| s.strong_count() > 0);
        if !forward.iter().any(|s| s.ptr_eq(&Arc::downgrade(sender))) {
            forward.push(Arc::downgrade(sender));
        }
    }

    pub fn remove_forward_member(&self, sender: &Arc<MemberSender>) {
        let target = Arc::downgrade(sender);
        self.forward.lock().retain(|s| !s.ptr_eq(&target));
    }

    /// RTCP from this member counts as a keepalive
    pub fn note_rtcp_report(&self) {
        self.state.lock().last_rtcp_at = Some(Instant::now());
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

    /// Once per tick. Returns false once the call is cancelled or dead.
    pub fn check_packets_received(&self, now: Instant) -> bool {
        if self.lifecycle.is_cancelled() {
            return false;
        }

        let mut state = self.state.lock();
        if self.call_is_dead(&state, now) {
            let timeout = self.config.receiver.rtp_timeout_secs;
            drop(state);
            self.cancel(MemberError::Timeout(timeout));
            return false;
        }

        let last = state.last_media_packets;
        state.last_media_packets = state.media_packets;
        if last != state.media_packets {
            state.no_data_ticks = 0;
            return true;
        }

        state.no_data_ticks += 1;
        if state.no_data_ticks != NO_DATA_TICKS_BEFORE_RESET {
            return true;
        }

        // Detectors should see the silence
        if let Some(codec) = state.codec.as_mut() {
            codec.reset();
        }
        if let Some(resampler) = state.resampler.as_mut() {
            resampler.reset();
        }
        if state.speech.reset() {
            self.speaking_changed(false);
        }
        if let Some(key) = state.dtmf.no_data_received() {
            tracing::debug!("Call {} silence ends DTMF {}", self.call_id, key);
            self.process_dtmf_key(&mut state, key);
        }
        state.auto_muted = false;
        true
    }

    fn call_is_dead(&self, state: &ReceiverState, now: Instant) -> bool {
        let timeout = self.config.receiver.rtp_timeout_secs;
        if timeout == 0 || !self.participant.is_sip_addressed() {
            return false;
        }
        let timeout = Duration::from_secs(timeout);

        let rtp_elapsed = now.saturating_duration_since(state.last_rtp_at.unwrap_or(state.created_at));
        let rtcp_elapsed = now.saturating_duration_since(state.last_rtcp_at.unwrap_or(state.created_at));
        if rtp_elapsed < timeout || rtcp_elapsed < timeout {
            return false;
        }

        tracing::warn!(
            "Call {} silent for {:?} (RTP) and {:?} (RTCP)",
            self.call_id,
            rtp_elapsed,
            rtcp_elapsed
        );
        true
    }

    fn speaking_changed(&self, speaking: bool) {
        self.events.publish(ConferenceEvent::SpeakingChanged {
            conference: self.conference_id.read().clone(),
            call_id: self.call_id.clone(),
            speaking,
        });
    }

    /// Contribution gating. Self-mute and DTMF auto-mute always apply;
    /// conference mute and silence apply while whispering in the
    /// conference group, whisper-group mute in any other group.
    fn is_muted(&self, auto_muted: bool) -> bool {
        if auto_muted || self.mute.muted() {
            return true;
        }
        match self.whisper_group.read().as_ref() {
            None => true,
            Some(group) if group.is_conference_group() => {
                self.mute.conference_muted() || self.mute.conference_silenced()
            }
            Some(_) => self.mute.whisper_group_muted(),
        }
    }

    /// Save this tick's contribution, reporting failures to the caller
    pub fn try_save_current_contribution(&self) -> Result<(), MemberError> {
        if self.slots.lock().is_valid() {
            return Ok(());
        }
        if self.lifecycle.is_done() {
            self.slots.lock().publish(None);
            return Ok(());
        }

        let spp = self.state.lock().conference_media.samples_per_packet();

        let treatment = self.input_treatment.lock().clone();
        let frame = match treatment {
            Some(treatment) => match treatment.next_frame() {
                Some(frame) if frame.len() != spp => {
                    self.slots.lock().publish(None);
                    return Err(CodecError::InvalidFrameSize(frame.len()).into());
                }
                Some(frame) => {
                    // Keep the network input drained while it is replaced
                    self.jitter.lock().pop();
                    Some(frame)
                }
                None => {
                    tracing::debug!("Call {} input treatment done", self.call_id);
                    *self.input_treatment.lock() = None;
                    self.pop_network_frame()
                }
            },
            None => self.pop_network_frame(),
        };

        let mut state = self.state.lock();
        let contribution = match frame {
            None => None,
            Some(frame) if self.is_muted(state.auto_muted) => {
                if self.participant.voice_detection_while_muted {
                    if let Some(speaking) = state.speech.process(&frame) {
                        self.speaking_changed(speaking);
                    }
                }
                None
            }
            Some(mut frame) => {
                if let Some(speaking) = state.speech.process(&frame) {
                    self.speaking_changed(speaking);
                }
                pcm::adjust_volume(&mut frame, state.input_volume);
                Some(Contribution::from(frame))
            }
        };
        drop(state);

        if contribution.is_some() {
            self.counters.contributions.fetch_add(1, Ordering::Relaxed);
        }
        self.slots.lock().publish(contribution);
        Ok(())
    }

    /// Next frame from the jitter buffer. The codec conceals a lost packet
    /// when it can.
    fn pop_network_frame(&self) -> Option<Vec<i32>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let spp = state.conference_media.samples_per_packet();
        let codec = &mut state.codec;
        let resampler = &mut state.resampler;

        self.jitter.lock().pop_with(|| {
            let concealed = codec.as_mut()?.conceal()?;
            match resampler.as_mut() {
                Some(resampler) => resampler.process(&concealed).ok(),
                None => Some(pcm::fit_length(concealed, spp)),
            }
        })
    }

    /// Drop stale audio, before switching whisper groups
    pub fn flush_contributions(&self) {
        self.jitter.lock().flush();
        self.slots.lock().clear_current();
    }

    pub fn set_muted(&self, muted: bool) {
        tracing::info!("Call {} mute is now {}", self.call_id, muted);
        self.mute.set_muted(muted);
        self.reset_speech_on_mute(muted);
    }

    pub fn set_whisper_group_muted(&self, muted: bool) {
        tracing::info!("Call {} whisper group mute is now {}", self.call_id, muted);
        self.mute.set_whisper_group_muted(muted);
        if muted {
            self.flush_contributions();
        }
        self.reset_speech_on_mute(muted);
    }

    fn reset_speech_on_mute(&self, muted: bool) {
        let was_speaking = self.state.lock().speech.reset();
        if muted && was_speaking {
            self.speaking_changed(false);
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.state.lock().speech.is_speaking()
    }

    pub fn set_input_volume(&self, volume: f64) {
        self.state.lock().input_volume = volume;
    }

    pub fn input_volume(&self) -> f64 {
        self.state.lock().input_volume
    }

    /// Discard every `nth` media packet to exercise loss concealment.
    /// Zero turns dropping off.
    pub fn set_drop_packets(&self, nth: u32) {
        if nth > 0 {
            tracing::info!("Call {} dropping every {} packets", self.call_id, nth);
        }
        self.state.lock().drop_packets = nth;
    }

    /// Replace network input with a treatment until it finishes
    pub fn start_input_treatment(&self, treatment: Arc<TreatmentManager>) {
        *self.input_treatment.lock() = Some(treatment);
    }

    pub fn stop_input_treatment(&self) {
        if let Some(treatment) = self.input_treatment.lock().take() {
            treatment.stop_all();
        }
    }

    /// Confirm the join without waiting for the key
    pub fn confirm_join(&self) {
        let mut state = self.state.lock();
        if !state.join_confirmation_received {
            state.join_confirmation_received = true;
            self.lifecycle.confirm_join();
        }
    }

    pub fn join_confirmation_received(&self) -> bool {
        self.state.lock().join_confirmation_received
    }

    /// Release everything the receiver holds
    pub fn end(&self) {
        *self.whisper_group.write() = None;
        self.forward.lock().clear();
        self.stop_input_treatment();
        self.jitter.lock().reset();
        self.slots.lock().clear();
        let mut state = self.state.lock();
        state.codec = None;
        state.resampler = None;
    }

    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            packets: self.counters.packets.load(Ordering::Relaxed),
            media_packets: self.counters.media_packets.load(Ordering::Relaxed),
            comfort_noise: self.counters.comfort_noise.load(Ordering::Relaxed),
            telephone_events: self.counters.telephone_events.load(Ordering::Relaxed),
            invalid: self.counters.invalid.load(Ordering::Relaxed),
            unexpected: self.counters.unexpected.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            contributions: self.counters.contributions.load(Ordering::Relaxed),
            jitter: self.jitter.lock().stats(),
        }
    }
}

impl ContributionSource for MemberReceiver {
    fn source_id(&self) -> String {
        self.call_id.to_string()
    }

    fn save_current_contribution(&self) {
        if let Err(e) = self.try_save_current_contribution() {
            tracing::warn!("Call {} contribution skipped: {}", self.call_id, e);
        }
    }

    fn current_contribution(&self) -> Option<Contribution> {
        self.slots.lock().current()
    }

    fn previous_contribution(&self) -> Option<Contribution> {
        self.slots.lock().previous()
    }

    fn contribution_is_in_common_mix(&self) -> bool {
        self.whisper_group
            .read()
            .as_ref()
            .is_some_and(|g| g.has_common_mix())
    }

    fn invalidate_current_contribution(&self) {
        self.slots.lock().rotate();
    }
}

impl std::fmt::Debug for MemberReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemberReceiver")
            .field("call_id", &self.call_id)
            .field("conference", &*self.conference_id.read())
            .finish()
    }
}
