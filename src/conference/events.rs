//! Conference notifications
//!
//! Fan-out of [`ConferenceEvent`]s to any number of subscribers over
//! crossbeam channels. Disconnected subscribers are pruned on the next send.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;

use super::CallId;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConferenceEvent {
    ConferenceStarted { conference: String },
    ConferenceEnded { conference: String },
    MemberJoined { conference: String, call_id: CallId },
    MemberLeft { conference: String, call_id: CallId, reason: Option<String> },
    JoinConfirmed { conference: String, call_id: CallId },
    SpeakingChanged { conference: String, call_id: CallId, speaking: bool },
    DtmfKey { conference: String, call_id: CallId, key: String },
    WhisperGroupChanged { conference: String, call_id: CallId, group: String },
    TreatmentDone { conference: String, call_id: Option<CallId>, treatment: String },
    CallCancelled { conference: String, call_id: CallId, reason: String },
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<ConferenceEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<ConferenceEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: ConferenceEvent) {
        tracing::trace!("event {:?}", event);
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
