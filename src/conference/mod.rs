//! Conferences, their members and the tick scheduler
//!
//! - [`whisper`]: whisper groups and their common mixes
//! - [`receiver`]: inbound media for one member
//! - [`sender`]: outbound media for one member
//! - [`member`]: one call, its mix and its topology rules
//! - [`manager`]: one conference and its topology lock
//! - [`registry`]: all conferences and the private-mix batch
//! - [`scheduler`]: the 20 ms mixing tick

pub mod events;
pub mod manager;
pub mod member;
pub mod receiver;
pub mod registry;
pub mod scheduler;
pub mod sender;
pub mod whisper;

pub use events::{ConferenceEvent, EventBus};
pub use manager::{Conference, ConferenceStatus};
pub use member::{ConferenceMember, MemberStatus};
pub use receiver::{MemberReceiver, ReceiverStats};
pub use registry::ConferenceRegistry;
pub use scheduler::{ConferenceSender, SenderHandle, SenderScope, SenderState, TickReport};
pub use sender::{MemberSender, SenderStats};
pub use whisper::WhisperGroup;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::constants::DEFAULT_TELEPHONE_EVENT_PAYLOAD;

/// Handle to a joined member
pub type MemberHandle = Arc<ConferenceMember>;

/// Identifier of one call
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random identifier for calls created without one
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Everything the bridge knows about a call when it joins
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallParticipant {
    pub call_id: CallId,
    /// `sip:` or `tel:` address, or any label
    pub phone_number: String,
    pub name: Option<String>,
    /// Group to whisper in on join
    pub whisper_group: Option<String>,
    /// Payload the member sends
    pub receive_payload: u8,
    /// Payload the member expects, defaults to `receive_payload`
    pub send_payload: Option<u8>,
    pub telephone_event_payload: u8,
    /// Hold in a private group until the confirmation key is pressed
    pub join_confirmation: bool,
    /// Keep running speech detection while muted
    pub voice_detection_while_muted: bool,
    /// Mute in-band DTMF tones
    pub dtmf_suppression: bool,
    /// Playback-only member: its input is a treatment and it hears nothing
    pub input_treatment: bool,
    pub muted: bool,
    pub conference_muted: bool,
    pub conference_silenced: bool,
    pub input_volume: f64,
    pub output_volume: f64,
    /// Where the member's RTP comes from
    pub remote_address: Option<SocketAddr>,
}

impl Default for CallParticipant {
    fn default() -> Self {
        Self {
            call_id: CallId::generate(),
            phone_number: String::new(),
            name: None,
            whisper_group: None,
            receive_payload: 0,
            send_payload: None,
            telephone_event_payload: DEFAULT_TELEPHONE_EVENT_PAYLOAD,
            join_confirmation: false,
            voice_detection_while_muted: false,
            dtmf_suppression: true,
            input_treatment: false,
            muted: false,
            conference_muted: false,
            conference_silenced: false,
            input_volume: 1.0,
            output_volume: 1.0,
            remote_address: None,
        }
    }
}

impl CallParticipant {
    pub fn new(call_id: impl Into<CallId>, phone_number: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            phone_number: phone_number.into(),
            ..Self::default()
        }
    }

    pub fn with_payload(mut self, payload: u8) -> Self {
        self.receive_payload = payload;
        self.send_payload = Some(payload);
        self
    }

    /// Only SIP and tel calls are subject to the RTP timeout
    pub fn is_sip_addressed(&self) -> bool {
        self.phone_number.contains("sip:") || self.phone_number.contains("tel:")
    }

    pub fn send_payload(&self) -> u8 {
        self.send_payload.unwrap_or(self.receive_payload)
    }
}

/// Mute flags shared by a member's receiver and mix rules
#[derive(Debug, Default)]
pub struct MuteFlags {
    /// Member muted themself
    muted: AtomicBool,
    /// Member neither speaks to nor hears the conference
    conference_muted: AtomicBool,
    /// Member hears only its whisper group
    conference_silenced: AtomicBool,
    /// Member's voice is kept out of its whisper group
    whisper_group_muted: AtomicBool,
}

impl MuteFlags {
    pub fn from_participant(p: &CallParticipant) -> Self {
        Self {
            muted: AtomicBool::new(p.muted),
            conference_muted: AtomicBool::new(p.conference_muted),
            conference_silenced: AtomicBool::new(p.conference_silenced),
            whisper_group_muted: AtomicBool::new(false),
        }
    }

    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    pub fn conference_muted(&self) -> bool {
        self.conference_muted.load(Ordering::Acquire)
    }

    pub fn set_conference_muted(&self, muted: bool) {
        self.conference_muted.store(muted, Ordering::Release);
    }

    pub fn conference_silenced(&self) -> bool {
        self.conference_silenced.load(Ordering::Acquire)
    }

    pub fn set_conference_silenced(&self, silenced: bool) {
        self.conference_silenced.store(silenced, Ordering::Release);
    }

    pub fn whisper_group_muted(&self) -> bool {
        self.whisper_group_muted.load(Ordering::Acquire)
    }

    pub fn set_whisper_group_muted(&self, muted: bool) {
        self.whisper_group_muted.store(muted, Ordering::Release);
    }
}

/// Lifecycle shared by a member's parts. Cancellation is requested from
/// media threads and carried out by the scheduler under the conference lock.
#[derive(Debug, Default)]
pub struct MemberLifecycle {
    done: AtomicBool,
    migrating: AtomicBool,
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    /// Join confirmation key seen, waiting to be applied
    join_confirmed: AtomicBool,
}

impl MemberLifecycle {
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Returns true the first time only
    pub fn mark_done(&self) -> bool {
        !self.done.swap(true, Ordering::AcqRel)
    }

    pub fn is_migrating(&self) -> bool {
        self.migrating.load(Ordering::Acquire)
    }

    pub fn set_migrating(&self, migrating: bool) {
        self.migrating.store(migrating, Ordering::Release);
    }

    /// Ask for the call to be ended. Returns true the first time only.
    pub fn request_cancel(&self, reason: impl Into<String>) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.reason.lock() = Some(reason.into());
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    pub fn confirm_join(&self) {
        self.join_confirmed.store(true, Ordering::Release);
    }

    /// Take a pending join confirmation
    pub fn take_join_confirmation(&self) -> bool {
        self.join_confirmed.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sip_addressing() {
        assert!(CallParticipant::new("a", "sip:alice@example.com").is_sip_addressed());
        assert!(CallParticipant::new("b", "tel:+15551234").is_sip_addressed());
        assert!(!CallParticipant::new("c", "6001").is_sip_addressed());
    }

    #[test]
    fn test_cancel_once() {
        let lifecycle = MemberLifecycle::default();
        assert!(lifecycle.request_cancel("timeout"));
        assert!(!lifecycle.request_cancel("again"));
        assert_eq!(lifecycle.cancel_reason().as_deref(), Some("timeout"));
        assert!(lifecycle.mark_done());
        assert!(!lifecycle.mark_done());
    }

    #[test]
    fn test_participant_defaults_from_json() {
        let p: CallParticipant = serde_json::from_str(r#"{"phone_number":"sip:x@y"}"#).unwrap();
        assert!(!p.call_id.as_str().is_empty());
        assert_eq!(p.telephone_event_payload, 101);
        assert_eq!(p.send_payload(), 0);
        assert_eq!(p.input_volume, 1.0);
    }
}
