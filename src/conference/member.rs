//! One call in a conference
//!
//! A member owns its receiver, its sender and its mix. The topology rules
//! live here: which groups a member hears and at what attenuation, how mute
//! flags shape that, and how private mixes are attenuated as members move
//! between whisper groups.
//!
//! Topology methods take the conference state, so they can only run with
//! the conference lock held. Lock order below that is member topology,
//! then member mix, then whisper group, then contribution slots.
//!
//! Mix rules for a member `m` whispering in group `wg`:
//!
//! - `m` hears `wg` at 1.0 and every other group it belongs to at that
//!   group's attenuation, or at 0 when `wg` itself has attenuation 0
//! - conference mute mutes every group; conference silence mutes every
//!   group but `wg`, and always the conference group
//! - a private mix `m` has for `m1` is heard at 0 if `m` is not in the
//!   group `m1` whispers in, at 1.0 if both whisper in the same group, and
//!   at `wg`'s attenuation otherwise

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use super::events::{ConferenceEvent, EventBus};
use super::manager::ConferenceState;
use super::receiver::{MemberReceiver, ReceiverStats};
use super::sender::{MemberSender, SenderStats};
use super::{CallId, CallParticipant, MemberLifecycle, MuteFlags, WhisperGroup};
use crate::audio::Spatializer;
use crate::config::BridgeConfig;
use crate::error::MemberError;
use crate::mixer::{
    ContributionSource, MixManager, MixSource, MixStatsSnapshot, SourceKey, SpatialValues,
};
use crate::protocol::MediaInfo;
use crate::treatment::{TreatmentManager, TreatmentPlayer};

#[derive(Default)]
struct Topology {
    /// Group the call waits in until it confirms the join
    initial_group: Option<Arc<WhisperGroup>>,
    /// Members holding a private mix for this one
    private_mixes_for_me: HashSet<CallId>,
}

/// Snapshot of one member for the control plane
#[derive(Debug, Clone, Serialize)]
pub struct MemberStatus {
    pub call_id: CallId,
    pub phone_number: String,
    pub name: Option<String>,
    pub whisper_group: Option<String>,
    pub groups: Vec<String>,
    pub muted: bool,
    pub conference_muted: bool,
    pub conference_silenced: bool,
    pub whisper_group_muted: bool,
    pub speaking: bool,
    pub input_volume: f64,
    pub output_volume: f64,
    pub fast_path: bool,
    pub mix: Vec<String>,
    pub private_mixes_for_me: usize,
    pub joined_at: DateTime<Utc>,
    pub receiver: ReceiverStats,
    pub sender: SenderStats,
    pub mixer: MixStatsSnapshot,
}

pub struct ConferenceMember {
    call_id: CallId,
    participant: CallParticipant,
    config: Arc<BridgeConfig>,
    mute: Arc<MuteFlags>,
    lifecycle: Arc<MemberLifecycle>,
    receiver: Arc<MemberReceiver>,
    sender: Arc<MemberSender>,
    mix: Mutex<MixManager>,
    /// Treatments only this member hears
    treatments: Mutex<Arc<TreatmentManager>>,
    topology: Mutex<Topology>,
    /// Mixed frame waiting for dispatch
    outbox: Mutex<Option<Vec<i32>>>,
    joined_at: DateTime<Utc>,
}

impl ConferenceMember {
    /// Build a member and set up its codecs. Fails if the negotiated
    /// payloads cannot be handled.
    pub fn new(
        participant: CallParticipant,
        conference_id: &str,
        media: MediaInfo,
        config: Arc<BridgeConfig>,
        events: Arc<EventBus>,
    ) -> Result<Self, MemberError> {
        let mute = Arc::new(MuteFlags::from_participant(&participant));
        let lifecycle = Arc::new(MemberLifecycle::default());

        let receiver = Arc::new(MemberReceiver::new(
            participant.clone(),
            conference_id,
            media,
            config.clone(),
            mute.clone(),
            lifecycle.clone(),
            events.clone(),
        ));
        receiver.initialize()?;

        let sender = Arc::new(MemberSender::new(
            &participant,
            conference_id,
            media,
            lifecycle.clone(),
            events,
        ));
        sender.initialize()?;

        let call_id = participant.call_id.clone();
        Ok(Self {
            mix: Mutex::new(Self::new_mix(&call_id, &config, &media)),
            treatments: Mutex::new(Self::new_treatments(&call_id, &media)),
            call_id,
            participant,
            config,
            mute,
            lifecycle,
            receiver,
            sender,
            topology: Mutex::new(Topology::default()),
            outbox: Mutex::new(None),
            joined_at: Utc::now(),
        })
    }

    fn new_mix(call_id: &CallId, config: &BridgeConfig, media: &MediaInfo) -> MixManager {
        MixManager::new(
            call_id.clone(),
            media.samples_per_packet(),
            Spatializer::new(config.spatial.clone(), media),
        )
    }

    fn new_treatments(call_id: &CallId, media: &MediaInfo) -> Arc<TreatmentManager> {
        Arc::new(TreatmentManager::new(
            format!("{}-treatments", call_id),
            media.samples_per_packet(),
        ))
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn participant(&self) -> &CallParticipant {
        &self.participant
    }

    pub fn receiver(&self) -> &Arc<MemberReceiver> {
        &self.receiver
    }

    pub fn sender(&self) -> &Arc<MemberSender> {
        &self.sender
    }

    pub fn lifecycle(&self) -> &Arc<MemberLifecycle> {
        &self.lifecycle
    }

    pub fn mute_flags(&self) -> &MuteFlags {
        &self.mute
    }

    /// Group this member is whispering in
    pub fn whisper_group(&self) -> Option<Arc<WhisperGroup>> {
        self.receiver.whisper_group()
    }

    /// Run `f` against this member's mix
    pub fn with_mix<R>(&self, f: impl FnOnce(&MixManager) -> R) -> R {
        f(&self.mix.lock())
    }

    pub fn has_private_mix_for(&self, call_id: &CallId) -> bool {
        self.mix
            .lock()
            .find(&SourceKey::Member(call_id.clone()))
            .is_some_and(|md| md.is_private())
    }

    pub fn private_mixes_for_me(&self) -> Vec<CallId> {
        self.topology.lock().private_mixes_for_me.iter().cloned().collect()
    }

    /// Playback-only members hear nothing
    fn hears(&self, group: &WhisperGroup) -> bool {
        group.has_common_mix() && !self.participant.input_treatment
    }

    /// Start hearing our own audio subtracted from our group, when that
    /// group mixes it in
    pub(crate) fn sync_mix_minus(&self) {
        let wants = self
            .receiver
            .whisper_group()
            .is_some_and(|g| self.hears(&g));
        let key = SourceKey::Member(self.call_id.clone());

        let mut mix = self.mix.lock();
        if wants {
            if mix.find(&key).is_none() {
                mix.add_mix(MixSource::Member(self.receiver.clone()), -1.0);
            }
        } else if mix.find(&key).is_some_and(|md| !md.is_private()) {
            mix.remove_mix(&key);
        }
    }

    pub(crate) fn set_initial_group(&self, group: Arc<WhisperGroup>) {
        self.topology.lock().initial_group = Some(group);
    }

    pub(crate) fn is_awaiting_confirmation(&self) -> bool {
        self.topology.lock().initial_group.is_some()
    }

    /// Join `group` as a listener. A group with zero attenuation is
    /// whispered in straight away so nothing else is heard.
    pub(crate) fn add_call(&self, state: &mut ConferenceState, group: &Arc<WhisperGroup>) {
        group.add_call(&self.call_id);

        let attenuation = group.attenuation();
        if self.hears(group) && attenuation > 0.0 {
            self.mix.lock().add_mix(MixSource::Group(group.clone()), attenuation);
        }

        if attenuation == 0.0 {
            tracing::info!(
                "Call {} entered zero attenuation group {}, whispering now",
                self.call_id,
                group.id()
            );
            self.set_whispering(state, group);
            return;
        }

        self.attenuate_whisper_groups();
    }

    /// Leave `group`, moving back to the conference group if whispering in it
    pub(crate) fn remove_call(&self, state: &mut ConferenceState, group: &Arc<WhisperGroup>) {
        let whispering_here = self
            .receiver
            .whisper_group()
            .is_some_and(|g| Arc::ptr_eq(&g, group));
        if whispering_here {
            let conference_group = state.conference_group.clone();
            self.set_whispering(state, &conference_group);
        }

        group.remove_call(&self.call_id);
        self.mix.lock().remove_mix(&SourceKey::Group(group.id().to_string()));
        state.destroy_if_transient_and_empty(group);
    }

    /// Start whispering in `group`, which the member must already belong to
    pub(crate) fn set_whispering(&self, state: &mut ConferenceState, group: &Arc<WhisperGroup>) {
        let Some(current) = self.receiver.whisper_group() else {
            group.set_whispering(&self.receiver, true);
            self.receiver.set_whisper_group(Some(group.clone()));
            if self.hears(group) {
                self.mix.lock().add_mix(MixSource::Group(group.clone()), 1.0);
            }
            self.finish_whisper_change(state, group);
            return;
        };

        let initial = self.topology.lock().initial_group.take();
        if let Some(initial) = initial {
            tracing::info!("Call {} leaving initial group {}", self.call_id, initial.id());
            self.remove_call(state, &initial);
        }

        let current = self.receiver.whisper_group().unwrap_or(current);
        if Arc::ptr_eq(&current, group) {
            tracing::debug!("Call {} already whispering in {}", self.call_id, group.id());
            return;
        }

        current.set_whispering(&self.receiver, false);
        self.receiver.flush_contributions();

        self.receiver.set_whisper_group(Some(group.clone()));
        group.set_whispering(&self.receiver, true);
        tracing::info!("Call {} now whispering in {}", self.call_id, group.id());

        if self.hears(group) {
            self.mix.lock().add_mix(MixSource::Group(group.clone()), 1.0);
        }
        self.finish_whisper_change(state, group);
    }

    fn finish_whisper_change(&self, state: &ConferenceState, group: &Arc<WhisperGroup>) {
        self.sync_mix_minus();
        self.attenuate_whisper_groups();
        self.adjust_private_mix_descriptors(state);
        state.events.publish(ConferenceEvent::WhisperGroupChanged {
            conference: state.id.clone(),
            call_id: self.call_id.clone(),
            group: group.id().to_string(),
        });
    }

    /// Reapply group attenuation and mute to every group descriptor
    pub(crate) fn attenuate_whisper_groups(&self) {
        let Some(current) = self.receiver.whisper_group() else {
            return;
        };

        let mut mix = self.mix.lock();
        let groups: Vec<Arc<WhisperGroup>> = mix
            .descriptors()
            .iter()
            .filter_map(|md| md.source.as_group().cloned())
            .collect();

        for group in groups {
            let key = SourceKey::Group(group.id().to_string());
            mix.set_muted(&key, self.group_is_muted(&group, &current));

            let attenuation = if Arc::ptr_eq(&group, &current) {
                1.0
            } else if current.attenuation() == 0.0 {
                0.0
            } else {
                group.attenuation()
            };
            mix.set_attenuation(&key, attenuation);
        }

        // Our own audio is only subtracted while our group is heard
        let own = SourceKey::Member(self.call_id.clone());
        if mix.find(&own).is_some_and(|md| !md.is_private()) {
            mix.set_muted(&own, self.group_is_muted(&current, &current));
        }
    }

    fn group_is_muted(&self, group: &Arc<WhisperGroup>, current: &Arc<WhisperGroup>) -> bool {
        if self.mute.conference_muted() {
            return true;
        }
        if !self.mute.conference_silenced() {
            return false;
        }
        !Arc::ptr_eq(group, current) || group.is_conference_group()
    }

    /// Readjust private mixes this member has, and those others have for it
    pub(crate) fn adjust_private_mix_descriptors(&self, state: &ConferenceState) {
        let targets = self.mix.lock().private_mix_targets();
        for target in targets {
            if let Some(m2) = state.find_member(&target) {
                adjust_private_mix(self, &m2);
            }
        }

        for id in self.private_mixes_for_me() {
            if let Some(m1) = state.find_member(&id) {
                adjust_private_mix(&m1, self);
            }
        }
    }

    pub(crate) fn set_conference_muted(&self, state: &ConferenceState, muted: bool) {
        tracing::info!("Call {} conference mute is now {}", self.call_id, muted);
        self.mute.set_conference_muted(muted);
        self.attenuate_whisper_groups();
        self.adjust_private_mix_descriptors(state);
    }

    pub(crate) fn set_conference_silenced(&self, state: &ConferenceState, silenced: bool) {
        tracing::info!("Call {} conference silence is now {}", self.call_id, silenced);
        self.mute.set_conference_silenced(silenced);
        self.attenuate_whisper_groups();
        self.adjust_private_mix_descriptors(state);
    }

    /// `group` gained or lost its common mix
    pub(crate) fn common_mix_changed(&self, state: &ConferenceState, group: &Arc<WhisperGroup>) {
        let key = SourceKey::Group(group.id().to_string());
        let whispering = self
            .receiver
            .whisper_group()
            .is_some_and(|g| Arc::ptr_eq(&g, group));

        {
            let mut mix = self.mix.lock();
            if self.hears(group) {
                if mix.find(&key).is_none() {
                    let attenuation = if whispering { 1.0 } else { group.attenuation() };
                    mix.add_mix(MixSource::Group(group.clone()), attenuation);
                }
            } else {
                mix.remove_mix(&key);
            }
        }
        self.sync_mix_minus();
        self.attenuate_whisper_groups();

        if !whispering {
            return;
        }
        // Reset private mixes for the rest of the group; both values resolve
        // to removal once the batch is applied
        let values = if group.has_common_mix() {
            SpatialValues::neutral(1.0)
        } else {
            SpatialValues::zero()
        };
        for other in group.members() {
            if other != self.call_id {
                state
                    .private_mixes
                    .set_private_mix(self.call_id.clone(), other, values);
            }
        }
    }

    /// Set or remove this member's private mix for `target`. With `forced`
    /// the mix is stored even when it changes nothing.
    pub(crate) fn apply_private_mix(
        &self,
        target: &ConferenceMember,
        values: SpatialValues,
        forced: bool,
    ) {
        let remove = match self.receiver.whisper_group() {
            Some(group) if !group.has_common_mix() => values.is_zero_volume(),
            _ => values.is_nop(1.0),
        };
        if remove && !forced {
            tracing::debug!("Call {} removing private mix for {}", self.call_id, target.call_id);
            self.remove_private_mix(target);
            return;
        }

        if self.lifecycle.is_done() || target.lifecycle.is_done() {
            tracing::debug!("Call {} skipping private mix for ended call", self.call_id);
            return;
        }

        let changed = self
            .mix
            .lock()
            .set_private_mix(MixSource::Member(target.receiver.clone()), values)
            .is_some();
        if !changed {
            tracing::debug!(
                "Call {} private mix for {} already {}",
                self.call_id,
                target.call_id,
                values
            );
            return;
        }
        tracing::info!("Call {} private mix for {} set to {}", self.call_id, target.call_id, values);

        if target.receiver.whisper_group().is_some() {
            adjust_private_mix(self, target);
        }
        target
            .topology
            .lock()
            .private_mixes_for_me
            .insert(self.call_id.clone());
    }

    pub(crate) fn remove_private_mix(&self, target: &ConferenceMember) {
        let key = SourceKey::Member(target.call_id.clone());
        {
            let mut mix = self.mix.lock();
            if mix.find(&key).is_some_and(|md| md.is_private()) {
                mix.remove_mix(&key);
            }
        }
        target.topology.lock().private_mixes_for_me.remove(&self.call_id);
    }

    /// The join confirmation key was pressed
    pub(crate) fn join_confirmed(&self, state: &mut ConferenceState) {
        let conference_group = state.conference_group.clone();
        self.add_call(state, &conference_group);
        self.set_whispering(state, &conference_group);
    }

    /// Take over everything `old` had: mute state, private mixes in both
    /// directions, groups and the group it was whispering in. Applied
    /// synchronously, outside the private-mix batch.
    pub(crate) fn migrate_from(&self, state: &mut ConferenceState, old: &ConferenceMember) {
        tracing::info!("Call {} taking over from {}", self.call_id, old.call_id);
        self.receiver.set_muted(old.mute.muted());

        let old_private: Vec<(CallId, SpatialValues)> = old
            .mix
            .lock()
            .descriptors()
            .iter()
            .filter_map(|md| {
                let values = md.spatial?;
                let receiver = md.source.as_member()?;
                Some((receiver.call_id().clone(), values))
            })
            .filter(|(id, _)| *id != old.call_id && *id != self.call_id)
            .collect();
        for (target, values) in old_private {
            if let Some(target) = state.find_member(&target) {
                self.apply_private_mix(&target, values, false);
                old.remove_private_mix(&target);
            }
        }

        for id in old.private_mixes_for_me() {
            let Some(holder) = state.find_member(&id) else {
                continue;
            };
            let values = holder
                .mix
                .lock()
                .find(&SourceKey::Member(old.call_id.clone()))
                .and_then(|md| md.spatial);
            holder.remove_private_mix(old);
            if let Some(values) = values {
                if holder.call_id != self.call_id {
                    holder.apply_private_mix(self, values, false);
                }
            }
        }

        let groups: Vec<Arc<WhisperGroup>> = state
            .groups
            .iter()
            .filter(|g| g.is_member(&old.call_id))
            .cloned()
            .collect();
        for group in &groups {
            group.remove_call(&old.call_id);
            old.mix.lock().remove_mix(&SourceKey::Group(group.id().to_string()));
            if !group.is_member(&self.call_id) {
                self.add_call(state, group);
            }
        }

        if let Some(group) = old.whisper_group() {
            if group.is_member(&self.call_id) {
                self.set_whispering(state, &group);
            }
        }
        old.receiver.set_whisper_group(None);
        old.lifecycle.set_migrating(true);
    }

    /// Leave every group, without switching whisper groups on the way out
    pub(crate) fn leave_groups(&self, state: &mut ConferenceState) {
        let groups: Vec<Arc<WhisperGroup>> = state
            .groups
            .iter()
            .filter(|g| g.is_member(&self.call_id))
            .cloned()
            .collect();
        for group in groups {
            group.remove_call(&self.call_id);
            state.destroy_if_transient_and_empty(&group);
        }
        self.receiver.set_whisper_group(None);
        self.topology.lock().initial_group = None;
        self.mix.lock().clear();
    }

    /// Remove private mixes in both directions
    pub(crate) fn remove_all_private_mixes(&self, state: &ConferenceState) {
        let targets = self.mix.lock().private_mix_targets();
        for target in targets {
            if let Some(target) = state.find_member(&target) {
                self.remove_private_mix(&target);
            }
        }
        for id in self.private_mixes_for_me() {
            if let Some(holder) = state.find_member(&id) {
                holder.remove_private_mix(self);
            }
        }
        self.topology.lock().private_mixes_for_me.clear();
        state.private_mixes.remove_for(&self.call_id);
    }

    /// Move into another conference, possibly with different media. The
    /// member must already have left its old conference's groups.
    pub(crate) fn reinitialize(&self, conference_id: &str, media: MediaInfo) -> Result<(), MemberError> {
        self.receiver.reinitialize(conference_id, media)?;
        self.sender.reinitialize(conference_id, media)?;
        *self.mix.lock() = Self::new_mix(&self.call_id, &self.config, &media);

        let old = std::mem::replace(&mut *self.treatments.lock(), Self::new_treatments(&self.call_id, &media));
        old.stop_all();
        *self.outbox.lock() = None;
        Ok(())
    }

    /// Release everything. Returns false if already ended.
    pub(crate) fn end(&self, state: &mut ConferenceState) -> bool {
        if !self.lifecycle.mark_done() {
            return false;
        }

        if !self.lifecycle.is_migrating() {
            self.remove_all_private_mixes(state);
        }
        state.private_mixes.remove_for(&self.call_id);
        self.leave_groups(state);
        for other in &state.members {
            other.receiver.remove_forward_member(&self.sender);
        }

        self.treatments.lock().stop_all();
        *self.outbox.lock() = None;
        self.sender.end();
        self.receiver.end();

        let receiver = self.receiver.stats();
        let sender = self.sender.stats();
        tracing::info!(
            "Call {} ended: received {} packets ({} media, {} invalid), sent {} packets ({} comfort noise), jitter lost {} late {}",
            self.call_id,
            receiver.packets,
            receiver.media_packets,
            receiver.invalid,
            sender.packets,
            sender.comfort_noise,
            receiver.jitter.lost,
            receiver.jitter.late
        );
        true
    }

    /// Queue a treatment only this member hears
    pub fn play_treatment(&self, player: Box<dyn TreatmentPlayer>) {
        let treatments = self.treatments.lock().clone();
        treatments.enqueue(player);
        self.mix.lock().add_mix(MixSource::Treatment(treatments), 1.0);
    }

    /// Replace network input with a treatment
    pub fn start_input_treatment(&self, player: Box<dyn TreatmentPlayer>) {
        let treatment = Arc::new(TreatmentManager::new(
            format!("{}-input", self.call_id),
            self.mix.lock().samples_per_packet(),
        ));
        treatment.enqueue(player);
        self.receiver.start_input_treatment(treatment);
    }

    /// Finished member treatments. Drops the treatment from the mix once
    /// nothing is left to play.
    pub(crate) fn take_finished_treatments(&self) -> Vec<String> {
        let treatments = self.treatments.lock().clone();
        let finished = treatments.take_finished();
        if treatments.is_idle() {
            let key = SourceKey::Treatment(treatments.id().to_string());
            let mut mix = self.mix.lock();
            if mix.find(&key).is_some() {
                mix.remove_mix(&key);
            }
        }
        finished
    }

    /// Collecting: this member's input and treatments for the tick
    pub fn save_current_contribution(&self) {
        self.receiver.save_current_contribution();
        self.treatments.lock().save_current_contribution();
    }

    /// Mixing: build this tick's frame
    pub fn mix(&self) {
        let frame = self.mix.lock().mix();
        *self.outbox.lock() = frame;
    }

    /// Dispatching: send the mixed frame, or comfort noise when there is none
    pub fn dispatch(&self) -> bool {
        let frame = self.outbox.lock().take();
        if !self.sender.is_ready() {
            return false;
        }
        self.sender.send_data(frame.as_deref())
    }

    /// Invalidating: rotate this tick's contributions
    pub fn invalidate(&self) {
        self.receiver.invalidate_current_contribution();
        self.treatments.lock().invalidate_current_contribution();
    }

    pub fn status(&self, state: &ConferenceState) -> MemberStatus {
        let groups = state
            .groups
            .iter()
            .filter(|g| g.is_member(&self.call_id))
            .map(|g| g.id().to_string())
            .collect();
        let mix = self.mix.lock();

        MemberStatus {
            call_id: self.call_id.clone(),
            phone_number: self.participant.phone_number.clone(),
            name: self.participant.name.clone(),
            whisper_group: self.whisper_group().map(|g| g.id().to_string()),
            groups,
            muted: self.mute.muted(),
            conference_muted: self.mute.conference_muted(),
            conference_silenced: self.mute.conference_silenced(),
            whisper_group_muted: self.mute.whisper_group_muted(),
            speaking: self.receiver.is_speaking(),
            input_volume: self.receiver.input_volume(),
            output_volume: self.sender.output_volume(),
            fast_path: mix.is_fast_path(),
            mix: mix.descriptors().iter().map(|md| md.to_string()).collect(),
            private_mixes_for_me: self.topology.lock().private_mixes_for_me.len(),
            joined_at: self.joined_at,
            receiver: self.receiver.stats(),
            sender: self.sender.stats(),
            mixer: mix.stats(),
        }
    }
}

/// Attenuate and mute the private mix `m1` has for `m2`
fn adjust_private_mix(m1: &ConferenceMember, m2: &ConferenceMember) {
    let Some(m1_group) = m1.receiver.whisper_group() else {
        return;
    };
    let m2_group = m2
        .receiver
        .whisper_group()
        .filter(|g| g.is_member(&m1.call_id));

    let key = SourceKey::Member(m2.call_id.clone());
    let mut mix = m1.mix.lock();
    if !mix.find(&key).is_some_and(|md| md.is_private()) {
        return;
    }

    let Some(m2_group) = m2_group else {
        tracing::debug!("Call {} not in {}'s group, private mix silenced", m1.call_id, m2.call_id);
        mix.set_attenuation(&key, 0.0);
        return;
    };

    let attenuation = if Arc::ptr_eq(&m1_group, &m2_group) {
        1.0
    } else {
        m1_group.attenuation()
    };
    mix.set_attenuation(&key, attenuation);

    let muted = m1.mute.conference_muted()
        || (m1.mute.conference_silenced() && m2_group.is_conference_group());
    mix.set_muted(&key, muted);
}

impl std::fmt::Debug for ConferenceMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConferenceMember")
            .field("call_id", &self.call_id)
            .field("phone_number", &self.participant.phone_number)
            .finish()
    }
}
