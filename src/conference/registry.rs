//! All conferences in the process
//!
//! The registry is created once and handed to the scheduler and the
//! control plane. It owns the private-mix batch shared by every
//! conference, the event bus and the scheduler threads.

use crossbeam_channel::Receiver;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::events::{ConferenceEvent, EventBus};
use super::manager::Conference;
use super::scheduler::{ConferenceSender, SenderHandle, SenderScope};
use super::{CallId, CallParticipant, MemberHandle};
use crate::config::BridgeConfig;
use crate::error::ConferenceError;
use crate::mixer::{PrivateMixBatch, PrivateMixStats, SpatialValues};
use crate::protocol::MediaInfo;

/// Wakes parked schedulers when a member joins
#[derive(Default)]
pub struct Wakeup {
    /// Bumped by every notification
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Wakeup {
    pub fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Wait for a notification or the timeout, unless `ready` already
    /// holds. `ready` runs under the guard `notify` takes, so a
    /// notification can't slip in between the check and the wait.
    pub fn wait_unless(&self, timeout: Duration, ready: impl FnOnce() -> bool) {
        let mut generation = self.generation.lock();
        if ready() {
            return;
        }
        let seen = *generation;
        let deadline = Instant::now() + timeout;
        while *generation == seen {
            if self.cond.wait_until(&mut generation, deadline).timed_out() {
                break;
            }
        }
    }
}

pub struct ConferenceRegistry {
    config: Arc<BridgeConfig>,
    conferences: DashMap<String, Arc<Conference>>,
    private_mixes: Arc<PrivateMixBatch>,
    events: Arc<EventBus>,
    wakeup: Arc<Wakeup>,
    /// Running schedulers, keyed by scope
    senders: Mutex<Vec<(SenderScope, SenderHandle)>>,
    running: Mutex<bool>,
}

impl ConferenceRegistry {
    pub fn new(config: Arc<BridgeConfig>) -> Self {
        Self {
            config,
            conferences: DashMap::new(),
            private_mixes: Arc::new(PrivateMixBatch::new()),
            events: Arc::new(EventBus::new()),
            wakeup: Arc::new(Wakeup::default()),
            senders: Mutex::new(Vec::new()),
            running: Mutex::new(false),
        }
    }

    pub fn config(&self) -> &Arc<BridgeConfig> {
        &self.config
    }

    pub fn subscribe(&self) -> Receiver<ConferenceEvent> {
        self.events.subscribe()
    }

    pub fn private_mix_stats(&self) -> PrivateMixStats {
        self.private_mixes.stats()
    }

    /// Create a conference. `media` defaults to the configured preference.
    pub fn create_conference(
        self: &Arc<Self>,
        id: &str,
        media: Option<&str>,
        permanent: bool,
    ) -> Result<Arc<Conference>, ConferenceError> {
        let preference = media.unwrap_or(&self.config.sender.default_media);
        let media = preference
            .parse::<MediaInfo>()
            .map_err(|_| ConferenceError::InvalidMediaPreference(preference.to_string()))?;

        let conference = match self.conferences.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ConferenceError::ConferenceExists(id.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let conference = Arc::new(Conference::attached(
                    id.to_string(),
                    media,
                    permanent,
                    self.config.clone(),
                    self.private_mixes.clone(),
                    self.events.clone(),
                    self.wakeup.clone(),
                ));
                entry.insert(conference.clone());
                conference
            }
        };

        self.events.publish(ConferenceEvent::ConferenceStarted {
            conference: id.to_string(),
        });
        if *self.running.lock() && !self.config.sender.single_sender {
            self.spawn_sender(SenderScope::Conference(id.to_string()));
        }
        Ok(conference)
    }

    pub fn get_or_create(self: &Arc<Self>, id: &str, media: Option<&str>) -> Result<Arc<Conference>, ConferenceError> {
        if let Some(conference) = self.conferences.get(id) {
            return Ok(conference.clone());
        }
        match self.create_conference(id, media, false) {
            Err(ConferenceError::ConferenceExists(_)) => self.find(id),
            other => other,
        }
    }

    pub fn find(&self, id: &str) -> Result<Arc<Conference>, ConferenceError> {
        self.conferences
            .get(id)
            .map(|c| c.clone())
            .ok_or_else(|| ConferenceError::NoSuchConference(id.to_string()))
    }

    /// End every member and drop the conference
    pub fn remove(&self, id: &str) -> Result<(), ConferenceError> {
        let (_, conference) = self
            .conferences
            .remove(id)
            .ok_or_else(|| ConferenceError::NoSuchConference(id.to_string()))?;
        conference.end_all("conference ended");

        let scope = SenderScope::Conference(id.to_string());
        let handle = {
            let mut senders = self.senders.lock();
            senders
                .iter()
                .position(|(s, _)| *s == scope)
                .map(|i| senders.remove(i).1)
        };
        if let Some(mut handle) = handle {
            handle.stop();
        }

        tracing::info!("Conference {} ended", id);
        self.events.publish(ConferenceEvent::ConferenceEnded {
            conference: id.to_string(),
        });
        Ok(())
    }

    /// Conferences sorted by id
    pub fn conferences(&self) -> Vec<Arc<Conference>> {
        let mut conferences: Vec<_> = self.conferences.iter().map(|c| c.value().clone()).collect();
        conferences.sort_by(|a, b| a.id().cmp(b.id()));
        conferences
    }

    /// Conferences a scheduler with `scope` drives
    pub fn conferences_in(&self, scope: &SenderScope) -> Vec<Arc<Conference>> {
        match scope {
            SenderScope::All => self.conferences(),
            SenderScope::Conference(id) => self.find(id).into_iter().collect(),
        }
    }

    pub fn member_conference(&self, call_id: &CallId) -> Option<Arc<Conference>> {
        self.conferences
            .iter()
            .find(|c| c.has_member(call_id))
            .map(|c| c.value().clone())
    }

    pub fn member_count(&self, scope: &SenderScope) -> usize {
        self.conferences_in(scope).iter().map(|c| c.member_count()).sum()
    }

    pub fn join(&self, conference_id: &str, participant: CallParticipant) -> Result<MemberHandle, ConferenceError> {
        if let Some(existing) = self.member_conference(&participant.call_id) {
            return Err(ConferenceError::MemberExists(format!(
                "{} in {}",
                participant.call_id,
                existing.id()
            )));
        }
        self.find(conference_id)?.join(participant)
    }

    /// Remove a call, dropping its conference if it was the last member of
    /// a non-permanent one
    pub fn leave(&self, call_id: &CallId, reason: Option<String>) -> Result<(), ConferenceError> {
        let conference = self
            .member_conference(call_id)
            .ok_or_else(|| ConferenceError::NoSuchMember(call_id.to_string()))?;
        conference.leave(call_id, reason)?;
        self.remove_if_idle(&conference);
        Ok(())
    }

    fn remove_if_idle(&self, conference: &Conference) {
        if conference.is_permanent() || conference.member_count() > 0 {
            return;
        }
        if let Err(e) = self.remove(conference.id()) {
            tracing::debug!("Conference {} already removed: {}", conference.id(), e);
        }
    }

    pub fn set_private_mix(&self, requester: &CallId, target: &CallId, values: SpatialValues) -> Result<(), ConferenceError> {
        let conference = self
            .member_conference(requester)
            .ok_or_else(|| ConferenceError::NoSuchMember(requester.to_string()))?;
        conference.set_private_mix(requester, target, values)
    }

    /// Drain and apply pending private mixes for conferences in `scope`.
    /// Returns how many requests were applied.
    pub fn apply_private_mixes(&self, scope: &SenderScope) -> usize {
        let forced = self.config.sender.force_private_mix;
        let requests = match scope {
            SenderScope::All => self.private_mixes.drain(),
            SenderScope::Conference(id) => {
                let Ok(conference) = self.find(id) else {
                    return 0;
                };
                let members: HashSet<CallId> = conference.call_ids().into_iter().collect();
                self.private_mixes.drain_where(|requester| members.contains(requester))
            }
        };

        let mut applied = 0;
        for request in &requests {
            let Some(conference) = self.member_conference(&request.requester) else {
                tracing::debug!("Private mix from {} dropped, call gone", request.requester);
                continue;
            };
            if conference.apply_private_mix(request, forced) {
                applied += 1;
            }
        }
        applied
    }

    /// Move a call into another conference
    pub fn transfer_member(&self, call_id: &CallId, to: &str) -> Result<MemberHandle, ConferenceError> {
        let target = self.find(to)?;
        let source = self
            .member_conference(call_id)
            .ok_or_else(|| ConferenceError::NoSuchMember(call_id.to_string()))?;
        if source.id() == target.id() {
            return source.member(call_id);
        }

        tracing::info!("Transferring {} from {} to {}", call_id, source.id(), to);
        let member = source.detach(call_id)?;
        target.attach(member.clone())?;
        self.remove_if_idle(&source);
        Ok(member)
    }

    pub fn migrate(&self, old: &CallId, new: &CallId) -> Result<(), ConferenceError> {
        let conference = self
            .member_conference(old)
            .ok_or_else(|| ConferenceError::NoSuchMember(old.to_string()))?;
        conference.migrate(old, new)
    }

    /// Park until a member joins or the timeout passes. Returns true if
    /// `scope` has members.
    pub fn wait_for_members(&self, scope: &SenderScope, timeout: Duration) -> bool {
        self.wakeup
            .wait_unless(timeout, || self.member_count(scope) > 0);
        self.member_count(scope) > 0
    }

    pub(crate) fn wake(&self) {
        self.wakeup.notify();
    }

    /// Start the tick schedulers: one for everything, or one per conference
    pub fn start_senders(self: &Arc<Self>) {
        {
            let mut running = self.running.lock();
            if *running {
                return;
            }
            *running = true;
        }

        if self.config.sender.single_sender {
            self.spawn_sender(SenderScope::All);
        } else {
            for conference in self.conferences() {
                self.spawn_sender(SenderScope::Conference(conference.id().to_string()));
            }
        }
    }

    fn spawn_sender(self: &Arc<Self>, scope: SenderScope) {
        let sender = ConferenceSender::new(self.clone(), scope.clone());
        match sender.spawn() {
            Ok(handle) => self.senders.lock().push((scope, handle)),
            Err(e) => tracing::error!("Failed to start sender for {:?}: {}", scope, e),
        }
    }

    /// Stop schedulers and end every conference
    pub fn shutdown(&self) {
        *self.running.lock() = false;
        let senders = std::mem::take(&mut *self.senders.lock());
        for (_, mut handle) in senders {
            handle.stop();
        }

        for conference in self.conferences() {
            if let Err(e) = self.remove(conference.id()) {
                tracing::debug!("Conference {} already removed: {}", conference.id(), e);
            }
        }
        tracing::info!("Registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<ConferenceRegistry> {
        let mut config = BridgeConfig::default();
        config.sender.default_media = "PCM/8000/1".into();
        Arc::new(ConferenceRegistry::new(Arc::new(config)))
    }

    fn participant(id: &str) -> CallParticipant {
        CallParticipant::new(id, format!("sip:{}@example.com", id)).with_payload(102)
    }

    #[test]
    fn test_create_find_remove() {
        let registry = registry();
        registry.create_conference("c1", None, false).unwrap();
        assert!(matches!(
            registry.create_conference("c1", None, false),
            Err(ConferenceError::ConferenceExists(_))
        ));
        assert!(matches!(
            registry.create_conference("c2", Some("MP3/8000/1"), false),
            Err(ConferenceError::InvalidMediaPreference(_))
        ));

        assert_eq!(registry.find("c1").unwrap().media().payload, 102);
        registry.remove("c1").unwrap();
        assert!(matches!(registry.find("c1"), Err(ConferenceError::NoSuchConference(_))));
    }

    #[test]
    fn test_last_leave_removes_conference() {
        let registry = registry();
        registry.create_conference("temp", None, false).unwrap();
        registry.create_conference("perm", None, true).unwrap();
        registry.join("temp", participant("a")).unwrap();
        registry.join("perm", participant("b")).unwrap();

        registry.leave(&CallId::from("a"), None).unwrap();
        registry.leave(&CallId::from("b"), None).unwrap();
        assert!(registry.find("temp").is_err());
        assert!(registry.find("perm").is_ok());
    }

    #[test]
    fn test_call_in_one_conference_only() {
        let registry = registry();
        registry.create_conference("c1", None, false).unwrap();
        registry.create_conference("c2", None, false).unwrap();
        registry.join("c1", participant("a")).unwrap();
        assert!(matches!(
            registry.join("c2", participant("a")),
            Err(ConferenceError::MemberExists(_))
        ));
        assert_eq!(registry.member_conference(&CallId::from("a")).unwrap().id(), "c1");
    }

    #[test]
    fn test_transfer_member() {
        let registry = registry();
        registry.create_conference("from", None, true).unwrap();
        registry.create_conference("to", Some("PCM/16000/1"), true).unwrap();
        registry.join("from", participant("a")).unwrap();
        registry.join("from", participant("b")).unwrap();
        let a = CallId::from("a");

        let member = registry.transfer_member(&a, "to").unwrap();
        assert_eq!(registry.member_conference(&a).unwrap().id(), "to");
        assert_eq!(member.whisper_group().unwrap().id(), "to");
        assert_eq!(member.with_mix(|mix| mix.samples_per_packet()), 320);
        assert!(!registry.find("from").unwrap().conference_group().is_member(&a));
    }

    #[test]
    fn test_private_mixes_applied_per_scope() {
        let registry = registry();
        registry.create_conference("c1", None, true).unwrap();
        registry.create_conference("c2", None, true).unwrap();
        for (conf, id) in [("c1", "a"), ("c1", "b"), ("c2", "x"), ("c2", "y")] {
            registry.join(conf, participant(id)).unwrap();
        }
        let values = SpatialValues::neutral(0.5);
        registry.set_private_mix(&CallId::from("a"), &CallId::from("b"), values).unwrap();
        registry.set_private_mix(&CallId::from("x"), &CallId::from("y"), values).unwrap();

        assert_eq!(registry.apply_private_mixes(&SenderScope::Conference("c1".into())), 1);
        assert_eq!(registry.private_mix_stats().pending, 1);
        assert_eq!(registry.apply_private_mixes(&SenderScope::All), 1);

        let a = registry.find("c1").unwrap().member(&CallId::from("a")).unwrap();
        assert!(a.has_private_mix_for(&CallId::from("b")));
    }

    #[test]
    fn test_wait_for_members_times_out() {
        let registry = registry();
        assert!(!registry.wait_for_members(&SenderScope::All, Duration::from_millis(5)));
        registry.create_conference("c1", None, false).unwrap();
        registry.join("c1", participant("a")).unwrap();
        assert!(registry.wait_for_members(&SenderScope::All, Duration::from_millis(5)));
    }

    #[test]
    fn test_join_wakes_parked_waiter() {
        let registry = registry();
        registry.create_conference("c1", None, false).unwrap();

        let joiner = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                registry.join("c1", participant("a")).unwrap();
            })
        };
        let started = Instant::now();
        assert!(registry.wait_for_members(&SenderScope::All, Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(10));
        joiner.join().unwrap();
    }

    #[test]
    fn test_wakeup_skips_wait_when_ready() {
        let wakeup = Wakeup::default();
        let started = Instant::now();
        wakeup.wait_unless(Duration::from_secs(30), || true);
        assert!(started.elapsed() < Duration::from_secs(10));

        let waker = Arc::new(Wakeup::default());
        let parked = {
            let waker = waker.clone();
            std::thread::spawn(move || {
                let started = Instant::now();
                waker.wait_unless(Duration::from_secs(30), || false);
                started.elapsed()
            })
        };
        while !parked.is_finished() {
            waker.notify();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(parked.join().unwrap() < Duration::from_secs(10));
    }
}
