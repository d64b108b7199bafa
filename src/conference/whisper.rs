//! Whisper groups
//!
//! A whisper group is a subset of a conference whose whispering members are
//! summed into one common mix. Every conference has one group holding all
//! members, the conference group. Members belong to any number of groups
//! but whisper in exactly one; others hear a group at its attenuation.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::{CallId, MemberReceiver};
use crate::audio::pcm;
use crate::mixer::{Contribution, ContributionSlots, ContributionSource};
use crate::treatment::{TreatmentManager, TreatmentPlayer};

#[derive(Default)]
struct GroupState {
    /// Calls in the group, in join order
    members: Vec<CallId>,
    /// Receivers whispering in this group
    whisperers: Vec<Arc<MemberReceiver>>,
}

pub struct WhisperGroup {
    id: String,
    conference_group: bool,
    samples_per_packet: usize,
    /// f64 bits, read lock-free from the mixing path
    attenuation: AtomicU64,
    /// Whisperers cannot switch away
    locked: AtomicBool,
    /// Destroyed when the last member leaves
    transient: AtomicBool,
    common_mix: AtomicBool,
    state: Mutex<GroupState>,
    slots: Mutex<ContributionSlots>,
    treatments: Arc<TreatmentManager>,
}

impl WhisperGroup {
    pub fn new(id: impl Into<String>, attenuation: f64, samples_per_packet: usize) -> Self {
        let id = id.into();
        let treatments = Arc::new(TreatmentManager::new(format!("{}-treatments", id), samples_per_packet));
        Self {
            id,
            conference_group: false,
            samples_per_packet,
            attenuation: AtomicU64::new(attenuation.to_bits()),
            locked: AtomicBool::new(false),
            transient: AtomicBool::new(false),
            common_mix: AtomicBool::new(true),
            state: Mutex::new(GroupState::default()),
            slots: Mutex::new(ContributionSlots::default()),
            treatments,
        }
    }

    /// The group every member of a conference belongs to
    pub fn conference(id: impl Into<String>, attenuation: f64, samples_per_packet: usize) -> Self {
        Self {
            conference_group: true,
            ..Self::new(id, attenuation, samples_per_packet)
        }
    }

    /// Auto-created groups isolate their members until they leave
    pub fn isolated(id: impl Into<String>, samples_per_packet: usize) -> Self {
        let group = Self::new(id, 0.0, samples_per_packet);
        group.set_transient(true);
        group.set_locked(true);
        group
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_conference_group(&self) -> bool {
        self.conference_group
    }

    pub fn attenuation(&self) -> f64 {
        f64::from_bits(self.attenuation.load(Ordering::Acquire))
    }

    pub fn set_attenuation(&self, attenuation: f64) {
        self.attenuation.store(attenuation.to_bits(), Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::Release);
    }

    pub fn is_transient(&self) -> bool {
        self.transient.load(Ordering::Acquire)
    }

    pub fn set_transient(&self, transient: bool) {
        self.transient.store(transient, Ordering::Release);
    }

    pub fn has_common_mix(&self) -> bool {
        self.common_mix.load(Ordering::Acquire)
    }

    pub fn set_common_mix(&self, common_mix: bool) {
        self.common_mix.store(common_mix, Ordering::Release);
    }

    /// Returns false if already a member
    pub fn add_call(&self, call_id: &CallId) -> bool {
        let mut state = self.state.lock();
        if state.members.contains(call_id) {
            return false;
        }
        state.members.push(call_id.clone());
        true
    }

    /// Removes membership and any whispering. Returns false if not a member.
    pub fn remove_call(&self, call_id: &CallId) -> bool {
        let mut state = self.state.lock();
        state.whisperers.retain(|r| r.call_id() != call_id);
        let before = state.members.len();
        state.members.retain(|id| id != call_id);
        state.members.len() != before
    }

    pub fn is_member(&self, call_id: &CallId) -> bool {
        self.state.lock().members.contains(call_id)
    }

    pub fn members(&self) -> Vec<CallId> {
        self.state.lock().members.clone()
    }

    pub fn member_count(&self) -> usize {
        self.state.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().members.is_empty()
    }

    pub fn set_whispering(&self, receiver: &Arc<MemberReceiver>, whispering: bool) {
        let mut state = self.state.lock();
        state.whisperers.retain(|r| r.call_id() != receiver.call_id());
        if whispering {
            state.whisperers.push(receiver.clone());
        }
    }

    pub fn is_whispering(&self, call_id: &CallId) -> bool {
        self.state.lock().whisperers.iter().any(|r| r.call_id() == call_id)
    }

    pub fn whisperers(&self) -> Vec<CallId> {
        self.state.lock().whisperers.iter().map(|r| r.call_id().clone()).collect()
    }

    /// Drop all membership, breaking the group/receiver reference cycle
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.members.clear();
        state.whisperers.clear();
        self.slots.lock().clear();
        self.treatments.stop_all();
    }

    /// Queue a treatment heard by everyone hearing this group
    pub fn play_treatment(&self, player: Box<dyn TreatmentPlayer>) {
        self.treatments.enqueue(player);
    }

    pub fn treatments(&self) -> &Arc<TreatmentManager> {
        &self.treatments
    }
}

impl ContributionSource for WhisperGroup {
    fn source_id(&self) -> String {
        self.id.clone()
    }

    /// Sum of every whisperer's contribution plus the group's treatments
    fn save_current_contribution(&self) {
        if self.slots.lock().is_valid() {
            return;
        }

        self.treatments.save_current_contribution();
        if !self.has_common_mix() {
            self.slots.lock().publish(None);
            return;
        }

        let whisperers = self.state.lock().whisperers.clone();
        let mut sum: Option<Vec<i32>> = None;

        let contributions = whisperers
            .iter()
            .filter_map(|r| r.current_contribution())
            .chain(self.treatments.current_contribution());
        for contribution in contributions {
            let acc = sum.get_or_insert_with(|| vec![0; self.samples_per_packet]);
            pcm::add_weighted(acc, &contribution, 1.0);
        }

        self.slots.lock().publish(sum.map(Contribution::from));
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
        self.treatments.invalidate_current_contribution();
    }
}

impl std::fmt::Debug for WhisperGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhisperGroup")
            .field("id", &self.id)
            .field("attenuation", &self.attenuation())
            .field("locked", &self.is_locked())
            .field("transient", &self.is_transient())
            .field("common_mix", &self.has_common_mix())
            .finish()
    }
}
