//! One conference
//!
//! A [`Conference`] owns its members and whisper groups behind a single
//! lock. Every topology change (join, leave, whisper, attenuation, group
//! changes, mute) holds that lock for its whole duration; the tick path
//! only takes short snapshots of it.

use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use super::events::{ConferenceEvent, EventBus};
use super::member::{ConferenceMember, MemberStatus};
use super::registry::Wakeup;
use super::{CallId, CallParticipant, MemberHandle, WhisperGroup};
use crate::config::BridgeConfig;
use crate::constants::INITIAL_WHISPER_GROUP_PREFIX;
use crate::error::ConferenceError;
use crate::mixer::{PrivateMixBatch, PrivateMixRequest, SpatialValues};
use crate::network::{PacketCipher, Transport};
use crate::protocol::MediaInfo;
use crate::treatment::TreatmentPlayer;

/// Topology guarded by the conference lock
pub(crate) struct ConferenceState {
    pub(crate) id: String,
    pub(crate) members: Vec<MemberHandle>,
    pub(crate) groups: Vec<Arc<WhisperGroup>>,
    pub(crate) conference_group: Arc<WhisperGroup>,
    pub(crate) samples_per_packet: usize,
    pub(crate) private_mixes: Arc<PrivateMixBatch>,
    pub(crate) events: Arc<EventBus>,
}

impl ConferenceState {
    pub(crate) fn find_member(&self, call_id: &CallId) -> Option<MemberHandle> {
        self.members.iter().find(|m| m.call_id() == call_id).cloned()
    }

    pub(crate) fn find_group(&self, id: &str) -> Option<Arc<WhisperGroup>> {
        self.groups.iter().find(|g| g.id() == id).cloned()
    }

    /// Unknown groups are created isolated: attenuation 0, transient, locked
    pub(crate) fn find_or_create_group(&mut self, id: &str) -> Arc<WhisperGroup> {
        if let Some(group) = self.find_group(id) {
            return group;
        }
        tracing::info!("Conference {} auto-creating whisper group {}", self.id, id);
        let group = Arc::new(WhisperGroup::isolated(id, self.samples_per_packet));
        self.groups.push(group.clone());
        group
    }

    pub(crate) fn destroy_if_transient_and_empty(&mut self, group: &Arc<WhisperGroup>) {
        if group.is_conference_group() || !group.is_transient() || !group.is_empty() {
            return;
        }
        tracing::info!("Conference {} destroying empty transient group {}", self.id, group.id());
        self.groups.retain(|g| !Arc::ptr_eq(g, group));
        group.clear();
    }

    fn member(&self, call_id: &CallId) -> Result<MemberHandle, ConferenceError> {
        self.find_member(call_id)
            .ok_or_else(|| ConferenceError::NoSuchMember(call_id.to_string()))
    }

    fn group(&self, id: &str) -> Result<Arc<WhisperGroup>, ConferenceError> {
        self.find_group(id)
            .ok_or_else(|| ConferenceError::NoSuchWhisperGroup(id.to_string()))
    }
}

/// Snapshot of one whisper group
#[derive(Debug, Clone, Serialize)]
pub struct WhisperGroupStatus {
    pub id: String,
    pub conference_group: bool,
    pub attenuation: f64,
    pub locked: bool,
    pub transient: bool,
    pub common_mix: bool,
    pub members: Vec<CallId>,
    pub whisperers: Vec<CallId>,
}

impl WhisperGroupStatus {
    fn from_group(group: &WhisperGroup) -> Self {
        Self {
            id: group.id().to_string(),
            conference_group: group.is_conference_group(),
            attenuation: group.attenuation(),
            locked: group.is_locked(),
            transient: group.is_transient(),
            common_mix: group.has_common_mix(),
            members: group.members(),
            whisperers: group.whisperers(),
        }
    }
}

/// Snapshot of a conference for the control plane
#[derive(Debug, Clone, Serialize)]
pub struct ConferenceStatus {
    pub id: String,
    pub media: String,
    pub permanent: bool,
    pub created_at: DateTime<Utc>,
    pub members: Vec<MemberStatus>,
    pub groups: Vec<WhisperGroupStatus>,
}

pub struct Conference {
    id: String,
    media: MediaInfo,
    config: Arc<BridgeConfig>,
    permanent: bool,
    state: Mutex<ConferenceState>,
    private_mixes: Arc<PrivateMixBatch>,
    events: Arc<EventBus>,
    wakeup: Arc<Wakeup>,
    created_at: DateTime<Utc>,
}

impl Conference {
    /// Standalone conference with its own private-mix batch and event bus
    pub fn new(id: impl Into<String>, media_preference: &str, config: Arc<BridgeConfig>) -> Result<Self, ConferenceError> {
        let media = media_preference
            .parse::<MediaInfo>()
            .map_err(|_| ConferenceError::InvalidMediaPreference(media_preference.to_string()))?;
        Ok(Self::attached(
            id.into(),
            media,
            false,
            config,
            Arc::new(PrivateMixBatch::new()),
            Arc::new(EventBus::new()),
            Arc::new(Wakeup::default()),
        ))
    }

    pub(crate) fn attached(
        id: String,
        media: MediaInfo,
        permanent: bool,
        config: Arc<BridgeConfig>,
        private_mixes: Arc<PrivateMixBatch>,
        events: Arc<EventBus>,
        wakeup: Arc<Wakeup>,
    ) -> Self {
        let samples_per_packet = media.samples_per_packet();
        let conference_group = Arc::new(WhisperGroup::conference(
            id.clone(),
            config.whisper.default_attenuation,
            samples_per_packet,
        ));
        conference_group.set_common_mix(config.whisper.common_mix_by_default);

        tracing::info!("Conference {} created with media {}", id, media);
        Self {
            state: Mutex::new(ConferenceState {
                id: id.clone(),
                members: Vec::new(),
                groups: vec![conference_group.clone()],
                conference_group,
                samples_per_packet,
                private_mixes: private_mixes.clone(),
                events: events.clone(),
            }),
            id,
            media,
            config,
            permanent,
            private_mixes,
            events,
            wakeup,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn media(&self) -> MediaInfo {
        self.media
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    pub fn subscribe(&self) -> Receiver<ConferenceEvent> {
        self.events.subscribe()
    }

    pub fn member_count(&self) -> usize {
        self.state.lock().members.len()
    }

    pub fn has_member(&self, call_id: &CallId) -> bool {
        self.state.lock().find_member(call_id).is_some()
    }

    pub fn member(&self, call_id: &CallId) -> Result<MemberHandle, ConferenceError> {
        self.state.lock().member(call_id)
    }

    /// Members in join order
    pub fn members(&self) -> Vec<MemberHandle> {
        self.state.lock().members.clone()
    }

    pub fn call_ids(&self) -> Vec<CallId> {
        self.state.lock().members.iter().map(|m| m.call_id().clone()).collect()
    }

    pub fn groups(&self) -> Vec<Arc<WhisperGroup>> {
        self.state.lock().groups.clone()
    }

    pub fn whisper_group(&self, id: &str) -> Result<Arc<WhisperGroup>, ConferenceError> {
        self.state.lock().group(id)
    }

    pub fn conference_group(&self) -> Arc<WhisperGroup> {
        self.state.lock().conference_group.clone()
    }

    /// Add a call and place it in its starting whisper group
    pub fn join(&self, participant: CallParticipant) -> Result<MemberHandle, ConferenceError> {
        let call_id = participant.call_id.clone();
        let mut state = self.state.lock();
        if state.find_member(&call_id).is_some() {
            return Err(ConferenceError::MemberExists(call_id.to_string()));
        }

        let member = ConferenceMember::new(
            participant,
            &self.id,
            self.media,
            self.config.clone(),
            self.events.clone(),
        )
        .map_err(|e| ConferenceError::MemberInit(call_id.to_string(), e.to_string()))?;
        let member = Arc::new(member);

        tracing::info!(
            "Call {} ({}) joining conference {}",
            call_id,
            member.participant().phone_number,
            self.id
        );
        state.members.push(member.clone());
        self.place(&mut state, &member);

        if self.config.sender.force_private_mix {
            for other in &state.members {
                if other.call_id() == &call_id {
                    continue;
                }
                let values = SpatialValues::neutral(1.0);
                self.private_mixes
                    .set_private_mix(call_id.clone(), other.call_id().clone(), values);
                self.private_mixes
                    .set_private_mix(other.call_id().clone(), call_id.clone(), values);
            }
        }
        drop(state);

        self.events.publish(ConferenceEvent::MemberJoined {
            conference: self.id.clone(),
            call_id,
        });
        self.wakeup.notify();
        Ok(member)
    }

    /// Starting group: the requested one, else the conference group, else a
    /// private initial group while waiting for the join confirmation key
    fn place(&self, state: &mut ConferenceState, member: &MemberHandle) {
        if let Some(id) = member.participant().whisper_group.clone() {
            let group = state.find_or_create_group(&id);
            member.add_call(state, &group);
            member.set_whispering(state, &group);
        }

        if !member.participant().join_confirmation {
            let conference_group = state.conference_group.clone();
            member.add_call(state, &conference_group);
            if member.whisper_group().is_none() {
                member.set_whispering(state, &conference_group);
            }
        }

        if member.whisper_group().is_none() {
            let id = format!("{}{}", INITIAL_WHISPER_GROUP_PREFIX, member.call_id());
            let group = state.find_or_create_group(&id);
            member.add_call(state, &group);
            member.set_whispering(state, &group);
            member.set_initial_group(group);
        }
    }

    /// Remove a call and release its resources
    pub fn leave(&self, call_id: &CallId, reason: Option<String>) -> Result<MemberHandle, ConferenceError> {
        let mut state = self.state.lock();
        let member = self.remove_member(&mut state, call_id, reason)?;
        Ok(member)
    }

    fn remove_member(
        &self,
        state: &mut ConferenceState,
        call_id: &CallId,
        reason: Option<String>,
    ) -> Result<MemberHandle, ConferenceError> {
        let member = state.member(call_id)?;
        state.members.retain(|m| !Arc::ptr_eq(m, &member));
        member.end(state);

        tracing::info!(
            "Call {} left conference {}{}",
            call_id,
            self.id,
            reason.as_deref().map(|r| format!(": {}", r)).unwrap_or_default()
        );
        self.events.publish(ConferenceEvent::MemberLeft {
            conference: self.id.clone(),
            call_id: call_id.clone(),
            reason,
        });
        Ok(member)
    }

    /// Take a member out without ending it, for a transfer
    pub(crate) fn detach(&self, call_id: &CallId) -> Result<MemberHandle, ConferenceError> {
        let mut state = self.state.lock();
        let member = state.member(call_id)?;

        member.remove_all_private_mixes(&state);
        member.leave_groups(&mut state);
        state.members.retain(|m| !Arc::ptr_eq(m, &member));
        for other in &state.members {
            other.receiver().remove_forward_member(member.sender());
        }
        drop(state);

        tracing::info!("Call {} detached from conference {}", call_id, self.id);
        self.events.publish(ConferenceEvent::MemberLeft {
            conference: self.id.clone(),
            call_id: call_id.clone(),
            reason: Some("transferred".to_string()),
        });
        Ok(member)
    }

    /// Take in a member detached from another conference
    pub(crate) fn attach(&self, member: MemberHandle) -> Result<(), ConferenceError> {
        let call_id = member.call_id().clone();
        let mut state = self.state.lock();
        if state.find_member(&call_id).is_some() {
            return Err(ConferenceError::MemberExists(call_id.to_string()));
        }

        if let Err(e) = member.reinitialize(&self.id, self.media) {
            member.end(&mut state);
            return Err(ConferenceError::MemberInit(call_id.to_string(), e.to_string()));
        }

        state.members.push(member.clone());
        self.place(&mut state, &member);
        drop(state);

        tracing::info!("Call {} attached to conference {}", call_id, self.id);
        self.events.publish(ConferenceEvent::MemberJoined {
            conference: self.id.clone(),
            call_id,
        });
        self.wakeup.notify();
        Ok(())
    }

    /// Hand everything `old` has over to `new`, then end `old`
    pub fn migrate(&self, old: &CallId, new: &CallId) -> Result<(), ConferenceError> {
        if old == new {
            return Err(ConferenceError::MemberExists(new.to_string()));
        }
        let mut state = self.state.lock();
        let old_member = state.member(old)?;
        let new_member = state.member(new)?;

        new_member.migrate_from(&mut state, &old_member);
        self.remove_member(&mut state, old, Some("migrated".to_string()))?;
        Ok(())
    }

    pub fn create_whisper_group(&self, id: &str, attenuation: Option<f64>) -> Result<Arc<WhisperGroup>, ConferenceError> {
        let attenuation = attenuation.unwrap_or(self.config.whisper.default_attenuation);
        validate_attenuation(attenuation)?;

        let mut state = self.state.lock();
        if state.find_group(id).is_some() {
            return Err(ConferenceError::WhisperGroupExists(id.to_string()));
        }
        let group = Arc::new(WhisperGroup::new(id, attenuation, state.samples_per_packet));
        group.set_common_mix(self.config.whisper.common_mix_by_default);
        state.groups.push(group.clone());

        tracing::info!("Conference {} created whisper group {} at {}", self.id, id, attenuation);
        Ok(group)
    }

    /// Remove every member from the group, then the group itself
    pub fn destroy_whisper_group(&self, id: &str) -> Result<(), ConferenceError> {
        let mut state = self.state.lock();
        let group = state.group(id)?;
        if group.is_conference_group() {
            return Err(ConferenceError::ConferenceWhisperGroup(id.to_string()));
        }

        for call_id in group.members() {
            if let Some(member) = state.find_member(&call_id) {
                member.remove_call(&mut state, &group);
            }
        }
        state.groups.retain(|g| !Arc::ptr_eq(g, &group));
        group.clear();

        tracing::info!("Conference {} destroyed whisper group {}", self.id, id);
        Ok(())
    }

    pub fn set_attenuation(&self, id: &str, attenuation: f64) -> Result<(), ConferenceError> {
        validate_attenuation(attenuation)?;
        let state = self.state.lock();
        let group = state.group(id)?;
        group.set_attenuation(attenuation);

        for member in &state.members {
            member.attenuate_whisper_groups();
            member.adjust_private_mix_descriptors(&state);
        }
        tracing::info!("Conference {} group {} attenuation {}", self.id, id, attenuation);
        Ok(())
    }

    pub fn set_locked(&self, id: &str, locked: bool) -> Result<(), ConferenceError> {
        let state = self.state.lock();
        state.group(id)?.set_locked(locked);
        Ok(())
    }

    /// A transient group with no members is destroyed right away
    pub fn set_transient(&self, id: &str, transient: bool) -> Result<(), ConferenceError> {
        let mut state = self.state.lock();
        let group = state.group(id)?;
        if group.is_conference_group() {
            return Err(ConferenceError::ConferenceWhisperGroup(id.to_string()));
        }
        group.set_transient(transient);
        state.destroy_if_transient_and_empty(&group);
        Ok(())
    }

    pub fn set_no_common_mix(&self, id: &str, no_common_mix: bool) -> Result<(), ConferenceError> {
        let state = self.state.lock();
        let group = state.group(id)?;
        if group.has_common_mix() != no_common_mix {
            return Ok(());
        }
        group.set_common_mix(!no_common_mix);
        tracing::info!("Conference {} group {} common mix {}", self.id, id, !no_common_mix);

        for member in &state.members {
            if group.is_member(member.call_id()) {
                member.common_mix_changed(&state, &group);
            }
        }
        Ok(())
    }

    /// Add a call to a group, creating an isolated group for unknown ids
    pub fn add_call(&self, group_id: &str, call_id: &CallId) -> Result<(), ConferenceError> {
        let mut state = self.state.lock();
        let member = state.member(call_id)?;
        let group = state.find_or_create_group(group_id);
        if group.is_member(call_id) {
            return Ok(());
        }
        member.add_call(&mut state, &group);
        Ok(())
    }

    pub fn remove_call(&self, group_id: &str, call_id: &CallId) -> Result<(), ConferenceError> {
        let mut state = self.state.lock();
        let group = state.group(group_id)?;
        if group.is_conference_group() {
            return Err(ConferenceError::ConferenceWhisperGroup(group_id.to_string()));
        }
        let member = state.member(call_id)?;
        if !group.is_member(call_id) {
            return Err(ConferenceError::NotAMember {
                call_id: call_id.to_string(),
                group: group_id.to_string(),
            });
        }
        member.remove_call(&mut state, &group);
        Ok(())
    }

    pub fn set_whispering(&self, group_id: &str, call_id: &CallId) -> Result<(), ConferenceError> {
        let mut state = self.state.lock();
        let group = state.group(group_id)?;
        let member = state.member(call_id)?;
        if !group.is_member(call_id) {
            return Err(ConferenceError::NotAMember {
                call_id: call_id.to_string(),
                group: group_id.to_string(),
            });
        }

        if let Some(current) = member.whisper_group() {
            if Arc::ptr_eq(&current, &group) {
                return Ok(());
            }
            if current.is_locked() {
                return Err(ConferenceError::WhisperGroupLocked(current.id().to_string()));
            }
        }
        member.set_whispering(&mut state, &group);
        Ok(())
    }

    pub fn set_muted(&self, call_id: &CallId, muted: bool) -> Result<(), ConferenceError> {
        self.member(call_id)?.receiver().set_muted(muted);
        Ok(())
    }

    pub fn set_conference_muted(&self, call_id: &CallId, muted: bool) -> Result<(), ConferenceError> {
        let state = self.state.lock();
        state.member(call_id)?.set_conference_muted(&state, muted);
        Ok(())
    }

    pub fn set_conference_silenced(&self, call_id: &CallId, silenced: bool) -> Result<(), ConferenceError> {
        let state = self.state.lock();
        state.member(call_id)?.set_conference_silenced(&state, silenced);
        Ok(())
    }

    pub fn set_whisper_group_muted(&self, call_id: &CallId, muted: bool) -> Result<(), ConferenceError> {
        self.member(call_id)?.receiver().set_whisper_group_muted(muted);
        Ok(())
    }

    pub fn set_input_volume(&self, call_id: &CallId, volume: f64) -> Result<(), ConferenceError> {
        validate_volume(volume)?;
        self.member(call_id)?.receiver().set_input_volume(volume);
        Ok(())
    }

    pub fn set_output_volume(&self, call_id: &CallId, volume: f64) -> Result<(), ConferenceError> {
        validate_volume(volume)?;
        self.member(call_id)?.sender().set_output_volume(volume);
        Ok(())
    }

    pub fn set_drop_packets(&self, call_id: &CallId, nth: u32) -> Result<(), ConferenceError> {
        self.member(call_id)?.receiver().set_drop_packets(nth);
        Ok(())
    }

    /// Queue a private mix; it takes effect at the start of the next tick
    pub fn set_private_mix(&self, requester: &CallId, target: &CallId, values: SpatialValues) -> Result<(), ConferenceError> {
        values.validate()?;
        if requester == target {
            return Err(ConferenceError::InvalidPrivateMix(format!(
                "{} cannot have a private mix for itself",
                requester
            )));
        }

        let state = self.state.lock();
        state.member(requester)?;
        state.member(target)?;
        self.private_mixes
            .set_private_mix(requester.clone(), target.clone(), values);
        Ok(())
    }

    /// Apply one drained private-mix request. Returns false if either call
    /// has left.
    pub fn apply_private_mix(&self, request: &PrivateMixRequest, forced: bool) -> bool {
        let state = self.state.lock();
        let (Some(requester), Some(target)) = (
            state.find_member(&request.requester),
            state.find_member(&request.target),
        ) else {
            tracing::debug!(
                "Private mix {} -> {} dropped, call gone",
                request.requester,
                request.target
            );
            return false;
        };
        requester.apply_private_mix(&target, request.values, forced);
        true
    }

    /// Inbound packet from the transport layer
    pub fn receive(&self, call_id: &CallId, data: &[u8]) -> Result<(), ConferenceError> {
        let member = self.member(call_id)?;
        member.receiver().receive(data);
        Ok(())
    }

    pub fn register_transport(&self, call_id: &CallId, transport: Arc<dyn Transport>) -> Result<(), ConferenceError> {
        self.member(call_id)?.sender().register_transport(transport);
        Ok(())
    }

    pub fn unregister_transport(&self, call_id: &CallId) -> Result<(), ConferenceError> {
        self.member(call_id)?.sender().unregister_transport();
        Ok(())
    }

    pub fn set_cipher(&self, call_id: &CallId, cipher: Option<Arc<dyn PacketCipher>>) -> Result<(), ConferenceError> {
        let member = self.member(call_id)?;
        member.receiver().set_cipher(cipher.clone());
        member.sender().set_cipher(cipher);
        Ok(())
    }

    /// Have `listener` hear `speaker` as soon as its packets arrive
    pub fn add_forward_member(&self, speaker: &CallId, listener: &CallId) -> Result<(), ConferenceError> {
        let state = self.state.lock();
        let listener = state.member(listener)?;
        state.member(speaker)?.receiver().add_forward_member(listener.sender());
        Ok(())
    }

    pub fn remove_forward_member(&self, speaker: &CallId, listener: &CallId) -> Result<(), ConferenceError> {
        let state = self.state.lock();
        let listener = state.member(listener)?;
        state.member(speaker)?.receiver().remove_forward_member(listener.sender());
        Ok(())
    }

    /// Play to everyone hearing `group_id`, or the whole conference
    pub fn play_treatment(&self, group_id: Option<&str>, player: Box<dyn TreatmentPlayer>) -> Result<(), ConferenceError> {
        let state = self.state.lock();
        let group = match group_id {
            Some(id) => state.group(id)?,
            None => state.conference_group.clone(),
        };
        tracing::info!("Conference {} playing {} to {}", self.id, player.name(), group.id());
        group.play_treatment(player);
        Ok(())
    }

    /// Play to one member only
    pub fn play_member_treatment(&self, call_id: &CallId, player: Box<dyn TreatmentPlayer>) -> Result<(), ConferenceError> {
        self.member(call_id)?.play_treatment(player);
        Ok(())
    }

    pub fn start_input_treatment(&self, call_id: &CallId, player: Box<dyn TreatmentPlayer>) -> Result<(), ConferenceError> {
        self.member(call_id)?.start_input_treatment(player);
        Ok(())
    }

    pub fn stop_input_treatment(&self, call_id: &CallId) -> Result<(), ConferenceError> {
        self.member(call_id)?.receiver().stop_input_treatment();
        Ok(())
    }

    /// Confirm a join as if the key had been pressed
    pub fn confirm_join(&self, call_id: &CallId) -> Result<(), ConferenceError> {
        self.member(call_id)?.receiver().confirm_join();
        Ok(())
    }

    /// Work done under the conference lock before each tick: liveness,
    /// cancelled calls, join confirmations and finished treatments.
    /// Returns how many members were removed.
    pub fn housekeeping(&self, now: Instant) -> usize {
        let mut state = self.state.lock();

        let mut cancelled = Vec::new();
        for member in &state.members {
            if !member.receiver().check_packets_received(now) || member.lifecycle().is_cancelled() {
                cancelled.push((member.call_id().clone(), member.lifecycle().cancel_reason()));
            }
        }
        for (call_id, reason) in &cancelled {
            if let Err(e) = self.remove_member(&mut state, call_id, reason.clone()) {
                tracing::warn!("Conference {} could not remove {}: {}", self.id, call_id, e);
            }
        }

        let members = state.members.clone();
        for member in &members {
            if member.lifecycle().take_join_confirmation() && member.is_awaiting_confirmation() {
                member.join_confirmed(&mut state);
                self.events.publish(ConferenceEvent::JoinConfirmed {
                    conference: self.id.clone(),
                    call_id: member.call_id().clone(),
                });
            }
        }

        for group in &state.groups {
            for treatment in group.treatments().take_finished() {
                self.events.publish(ConferenceEvent::TreatmentDone {
                    conference: self.id.clone(),
                    call_id: None,
                    treatment,
                });
            }
        }
        for member in &members {
            for treatment in member.take_finished_treatments() {
                self.events.publish(ConferenceEvent::TreatmentDone {
                    conference: self.id.clone(),
                    call_id: Some(member.call_id().clone()),
                    treatment,
                });
            }
        }

        cancelled.len()
    }

    /// End every member, for conference shutdown
    pub(crate) fn end_all(&self, reason: &str) {
        let mut state = self.state.lock();
        for call_id in state.members.iter().map(|m| m.call_id().clone()).collect::<Vec<_>>() {
            if let Err(e) = self.remove_member(&mut state, &call_id, Some(reason.to_string())) {
                tracing::warn!("Conference {} could not remove {}: {}", self.id, call_id, e);
            }
        }
        for group in &state.groups {
            group.clear();
        }
        let conference_group = state.conference_group.clone();
        state.groups = vec![conference_group];
    }

    pub fn member_status(&self, call_id: &CallId) -> Result<MemberStatus, ConferenceError> {
        let state = self.state.lock();
        Ok(state.member(call_id)?.status(&state))
    }

    pub fn status(&self) -> ConferenceStatus {
        let state = self.state.lock();
        ConferenceStatus {
            id: self.id.clone(),
            media: self.media.to_string(),
            permanent: self.permanent,
            created_at: self.created_at,
            members: state.members.iter().map(|m| m.status(&state)).collect(),
            groups: state.groups.iter().map(|g| WhisperGroupStatus::from_group(g)).collect(),
        }
    }
}

fn validate_attenuation(attenuation: f64) -> Result<(), ConferenceError> {
    if !(0.0..=1.0).contains(&attenuation) {
        return Err(ConferenceError::InvalidAttenuation(attenuation));
    }
    Ok(())
}

fn validate_volume(volume: f64) -> Result<(), ConferenceError> {
    if !volume.is_finite() || volume < 0.0 {
        return Err(ConferenceError::InvalidVolume(volume));
    }
    Ok(())
}

impl std::fmt::Debug for Conference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conference")
            .field("id", &self.id)
            .field("media", &self.media)
            .field("permanent", &self.permanent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::SourceKey;

    fn conference() -> Conference {
        Conference::new("conf", "PCM/8000/1", Arc::new(BridgeConfig::default())).unwrap()
    }

    fn join(conf: &Conference, id: &str) -> MemberHandle {
        conf.join(CallParticipant::new(id, format!("sip:{}@example.com", id)).with_payload(102))
            .unwrap()
    }

    fn attenuation_of(member: &MemberHandle, key: &SourceKey) -> Option<f64> {
        member.with_mix(|mix| mix.find(key).map(|md| md.attenuation))
    }

    #[test]
    fn test_join_whispers_in_conference_group() {
        let conf = conference();
        let a = join(&conf, "a");

        assert_eq!(a.whisper_group().unwrap().id(), "conf");
        assert!(conf.conference_group().is_whispering(a.call_id()));
        assert!(a.with_mix(|mix| mix.is_fast_path()));
        assert!(matches!(
            conf.join(CallParticipant::new("a", "sip:a@example.com").with_payload(102)),
            Err(ConferenceError::MemberExists(_))
        ));
    }

    #[test]
    fn test_join_confirmation_waits_in_initial_group() {
        let conf = conference();
        let mut participant = CallParticipant::new("a", "sip:a@example.com").with_payload(102);
        participant.join_confirmation = true;
        let a = conf.join(participant).unwrap();

        let group = a.whisper_group().unwrap();
        assert_eq!(group.id(), "initial-a");
        assert!(group.is_locked());
        assert!(!conf.conference_group().is_member(a.call_id()));

        conf.confirm_join(a.call_id()).unwrap();
        conf.housekeeping(Instant::now());

        assert_eq!(a.whisper_group().unwrap().id(), "conf");
        assert!(conf.whisper_group("initial-a").is_err());
    }

    #[test]
    fn test_whispering_moves_between_groups() {
        let conf = conference();
        let a = join(&conf, "a");
        conf.create_whisper_group("side", Some(0.2)).unwrap();
        conf.add_call("side", a.call_id()).unwrap();

        let side = SourceKey::Group("side".into());
        assert_eq!(attenuation_of(&a, &side), Some(0.2));

        conf.set_whispering("side", a.call_id()).unwrap();
        assert!(conf.whisper_group("side").unwrap().is_whispering(a.call_id()));
        assert!(!conf.conference_group().is_whispering(a.call_id()));
        assert_eq!(attenuation_of(&a, &side), Some(1.0));
        assert_eq!(attenuation_of(&a, &SourceKey::Group("conf".into())), Some(0.13));
    }

    #[test]
    fn test_zero_attenuation_group_silences_others() {
        let conf = conference();
        let a = join(&conf, "a");
        conf.create_whisper_group("g1", Some(0.2)).unwrap();
        conf.create_whisper_group("g2", Some(0.0)).unwrap();
        conf.add_call("g1", a.call_id()).unwrap();
        conf.add_call("g2", a.call_id()).unwrap();

        assert_eq!(a.whisper_group().unwrap().id(), "g2");
        assert_eq!(attenuation_of(&a, &SourceKey::Group("g1".into())), Some(0.0));
        assert_eq!(attenuation_of(&a, &SourceKey::Group("conf".into())), Some(0.0));
    }

    #[test]
    fn test_remove_call_returns_to_conference_group() {
        let conf = conference();
        let a = join(&conf, "a");
        conf.create_whisper_group("side", None).unwrap();
        conf.add_call("side", a.call_id()).unwrap();
        conf.set_whispering("side", a.call_id()).unwrap();

        conf.remove_call("side", a.call_id()).unwrap();
        assert_eq!(a.whisper_group().unwrap().id(), "conf");
        assert!(matches!(
            conf.remove_call("conf", a.call_id()),
            Err(ConferenceError::ConferenceWhisperGroup(_))
        ));
        assert!(matches!(
            conf.remove_call("side", a.call_id()),
            Err(ConferenceError::NotAMember { .. })
        ));
    }

    #[test]
    fn test_auto_created_group_is_isolated_and_destroyed() {
        let conf = conference();
        let a = join(&conf, "a");
        conf.add_call("huddle", a.call_id()).unwrap();

        let huddle = conf.whisper_group("huddle").unwrap();
        assert!(huddle.is_transient() && huddle.is_locked());
        assert_eq!(a.whisper_group().unwrap().id(), "huddle");
        assert!(matches!(
            conf.set_whispering("conf", a.call_id()),
            Err(ConferenceError::WhisperGroupLocked(_))
        ));

        conf.remove_call("huddle", a.call_id()).unwrap();
        assert!(matches!(
            conf.whisper_group("huddle"),
            Err(ConferenceError::NoSuchWhisperGroup(_))
        ));
    }

    #[test]
    fn test_control_errors_leave_state_unchanged() {
        let conf = conference();
        let a = join(&conf, "a");
        let ghost = CallId::from("ghost");

        assert!(matches!(
            conf.set_whispering("nope", a.call_id()),
            Err(ConferenceError::NoSuchWhisperGroup(_))
        ));
        assert!(matches!(conf.set_muted(&ghost, true), Err(ConferenceError::NoSuchMember(_))));
        assert!(matches!(
            conf.set_attenuation("conf", 1.5),
            Err(ConferenceError::InvalidAttenuation(_))
        ));
        assert!(matches!(
            conf.set_private_mix(a.call_id(), &ghost, SpatialValues::neutral(0.5)),
            Err(ConferenceError::NoSuchMember(_))
        ));
        assert!(matches!(
            conf.set_private_mix(a.call_id(), a.call_id(), SpatialValues::neutral(0.5)),
            Err(ConferenceError::InvalidPrivateMix(_))
        ));
        assert!(matches!(
            conf.destroy_whisper_group("conf"),
            Err(ConferenceError::ConferenceWhisperGroup(_))
        ));
        assert_eq!(a.whisper_group().unwrap().id(), "conf");
    }

    #[test]
    fn test_leave_ends_member_once() {
        let conf = conference();
        let a = join(&conf, "a");
        let b = join(&conf, "b");
        let events = conf.subscribe();

        conf.leave(a.call_id(), Some("hangup".into())).unwrap();
        assert!(a.lifecycle().is_done());
        assert_eq!(conf.member_count(), 1);
        assert!(!conf.conference_group().is_member(a.call_id()));
        assert!(matches!(conf.leave(a.call_id(), None), Err(ConferenceError::NoSuchMember(_))));
        assert!(b.with_mix(|mix| mix.is_fast_path()));

        assert!(matches!(
            events.try_recv().unwrap(),
            ConferenceEvent::MemberLeft { reason: Some(_), .. }
        ));
    }

    #[test]
    fn test_no_common_mix_round_trip() {
        let conf = conference();
        let a = join(&conf, "a");
        join(&conf, "b");

        conf.set_no_common_mix("conf", true).unwrap();
        let key = SourceKey::Group("conf".into());
        assert!(a.with_mix(|mix| mix.find(&key).is_none()));
        assert!(a.with_mix(|mix| mix.find(&SourceKey::Member(a.call_id().clone())).is_none()));

        conf.set_no_common_mix("conf", false).unwrap();
        assert!(a.with_mix(|mix| mix.is_fast_path()));
    }

    #[test]
    fn test_migrate_carries_group_and_mute() {
        let conf = conference();
        let old = join(&conf, "old");
        let new = join(&conf, "new");
        conf.create_whisper_group("side", Some(0.3)).unwrap();
        conf.add_call("side", old.call_id()).unwrap();
        conf.set_whispering("side", old.call_id()).unwrap();
        conf.set_muted(old.call_id(), true).unwrap();

        conf.migrate(old.call_id(), new.call_id()).unwrap();
        assert!(old.lifecycle().is_done());
        assert!(!conf.has_member(old.call_id()));
        assert_eq!(new.whisper_group().unwrap().id(), "side");
        assert!(new.mute_flags().muted());
    }

    #[test]
    fn test_migrate_drops_queued_private_mixes() {
        let conf = conference();
        let old = join(&conf, "old");
        let new = join(&conf, "new");
        let other = join(&conf, "other");
        conf.set_private_mix(old.call_id(), other.call_id(), SpatialValues::neutral(0.5))
            .unwrap();
        conf.set_private_mix(other.call_id(), old.call_id(), SpatialValues::neutral(0.5))
            .unwrap();
        conf.set_private_mix(other.call_id(), new.call_id(), SpatialValues::neutral(0.5))
            .unwrap();
        assert_eq!(conf.private_mixes.pending_len(), 3);

        conf.migrate(old.call_id(), new.call_id()).unwrap();
        let pending = conf.private_mixes.drain();
        assert_eq!(pending.len(), 1);
        assert_eq!(&pending[0].requester, other.call_id());
        assert_eq!(&pending[0].target, new.call_id());
    }
}
