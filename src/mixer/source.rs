//! Things a listener's mix can draw audio from

use std::fmt;
use std::sync::Arc;

use crate::conference::{CallId, MemberReceiver, WhisperGroup};
use crate::treatment::TreatmentManager;

/// One tick of audio, immutable once published. Values may exceed the
/// i16 range; clipping happens in the listener's mix.
pub type Contribution = Arc<[i32]>;

/// Anything that publishes one contribution per tick
pub trait ContributionSource: Send + Sync {
    fn source_id(&self) -> String;

    /// Compute this tick's contribution. Called once per tick, during collection.
    fn save_current_contribution(&self);

    /// This tick's contribution, `None` when silent
    fn current_contribution(&self) -> Option<Contribution>;

    /// Last tick's contribution, for spatial lookback
    fn previous_contribution(&self) -> Option<Contribution>;

    /// True when this source is already heard through a common group mix
    fn contribution_is_in_common_mix(&self) -> bool;

    /// Rotate current into previous at the end of a tick
    fn invalidate_current_contribution(&self);
}

/// Current/previous contribution pair. Published once per tick, read by
/// any number of listeners.
#[derive(Debug, Default)]
pub struct ContributionSlots {
    current: Option<Contribution>,
    previous: Option<Contribution>,
    /// Current was saved this tick
    valid: bool,
}

impl ContributionSlots {
    pub fn publish(&mut self, contribution: Option<Contribution>) {
        self.current = contribution;
        self.valid = true;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn current(&self) -> Option<Contribution> {
        self.current.clone()
    }

    pub fn previous(&self) -> Option<Contribution> {
        self.previous.clone()
    }

    /// End of tick: current becomes previous
    pub fn rotate(&mut self) {
        self.previous = self.current.take();
        self.valid = false;
    }

    /// Drop any stale audio, keeping the tick state
    pub fn clear_current(&mut self) {
        self.current = None;
    }

    pub fn clear(&mut self) {
        self.current = None;
        self.previous = None;
        self.valid = false;
    }
}

/// Identity of a mix source. A listener has at most one descriptor per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceKey {
    Group(String),
    Member(CallId),
    Treatment(String),
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKey::Group(id) => write!(f, "group:{}", id),
            SourceKey::Member(id) => write!(f, "member:{}", id),
            SourceKey::Treatment(id) => write!(f, "treatment:{}", id),
        }
    }
}

/// A concrete contribution source
#[derive(Clone)]
pub enum MixSource {
    Group(Arc<WhisperGroup>),
    Member(Arc<MemberReceiver>),
    Treatment(Arc<TreatmentManager>),
}

impl MixSource {
    pub fn key(&self) -> SourceKey {
        match self {
            MixSource::Group(g) => SourceKey::Group(g.id().to_string()),
            MixSource::Member(r) => SourceKey::Member(r.call_id().clone()),
            MixSource::Treatment(t) => SourceKey::Treatment(t.id().to_string()),
        }
    }

    fn source(&self) -> &dyn ContributionSource {
        match self {
            MixSource::Group(g) => g.as_ref(),
            MixSource::Member(r) => r.as_ref(),
            MixSource::Treatment(t) => t.as_ref(),
        }
    }

    pub fn as_group(&self) -> Option<&Arc<WhisperGroup>> {
        match self {
            MixSource::Group(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_member(&self) -> Option<&Arc<MemberReceiver>> {
        match self {
            MixSource::Member(r) => Some(r),
            _ => None,
        }
    }
}

impl ContributionSource for MixSource {
    fn source_id(&self) -> String {
        self.source().source_id()
    }

    fn save_current_contribution(&self) {
        self.source().save_current_contribution()
    }

    fn current_contribution(&self) -> Option<Contribution> {
        self.source().current_contribution()
    }

    fn previous_contribution(&self) -> Option<Contribution> {
        self.source().previous_contribution()
    }

    fn contribution_is_in_common_mix(&self) -> bool {
        self.source().contribution_is_in_common_mix()
    }

    fn invalidate_current_contribution(&self) {
        self.source().invalidate_current_contribution()
    }
}

impl fmt::Debug for MixSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}
