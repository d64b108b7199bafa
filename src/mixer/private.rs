//! Deferred private-mix updates
//!
//! Private mixes can arrive many times per tick from the control plane.
//! Requests are keyed by (requester, target); a newer request for the same
//! pair replaces the pending one. The whole batch is drained and applied
//! once, at the start of the next tick.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::descriptor::SpatialValues;
use crate::conference::CallId;

/// One pending private mix
#[derive(Debug, Clone, PartialEq)]
pub struct PrivateMixRequest {
    pub requester: CallId,
    pub target: CallId,
    pub values: SpatialValues,
}

#[derive(Default)]
pub struct PrivateMixBatch {
    /// Pending values plus arrival order, so application order is stable
    pending: Mutex<HashMap<(CallId, CallId), (u64, SpatialValues)>>,
    arrivals: AtomicU64,
    coalesced: AtomicU64,
    applied: AtomicU64,
}

impl PrivateMixBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a private mix, replacing any pending one for the same pair
    pub fn set_private_mix(&self, requester: CallId, target: CallId, values: SpatialValues) {
        let order = self.arrivals.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.pending.lock();
        if pending.insert((requester, target), (order, values)).is_some() {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop pending requests to or from `call_id`
    pub fn remove_for(&self, call_id: &CallId) {
        self.pending
            .lock()
            .retain(|(requester, target), _| requester != call_id && target != call_id);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Take everything pending, oldest first
    pub fn drain(&self) -> Vec<PrivateMixRequest> {
        self.drain_where(|_| true)
    }

    /// Take the pending requests whose requester matches, oldest first
    pub fn drain_where<F>(&self, mut requester: F) -> Vec<PrivateMixRequest>
    where
        F: FnMut(&CallId) -> bool,
    {
        let mut taken = Vec::new();
        self.pending.lock().retain(|key, value| {
            if requester(&key.0) {
                taken.push((key.clone(), *value));
                false
            } else {
                true
            }
        });
        taken.sort_by_key(|(_, (order, _))| *order);

        self.applied.fetch_add(taken.len() as u64, Ordering::Relaxed);
        taken
            .into_iter()
            .map(|((requester, target), (_, values))| PrivateMixRequest {
                requester,
                target,
                values,
            })
            .collect()
    }

    /// Drain and hand each request to `apply`, returning how many were applied
    pub fn apply<F>(&self, mut apply: F) -> usize
    where
        F: FnMut(PrivateMixRequest),
    {
        let requests = self.drain();
        let count = requests.len();
        for request in requests {
            apply(request);
        }
        count
    }

    pub fn stats(&self) -> PrivateMixStats {
        PrivateMixStats {
            pending: self.pending_len(),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PrivateMixStats {
    pub pending: usize,
    pub coalesced: u64,
    pub applied: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> CallId {
        CallId::from(s)
    }

    #[test]
    fn test_coalesces_same_pair() {
        let batch = PrivateMixBatch::new();
        batch.set_private_mix(id("a"), id("b"), SpatialValues::neutral(0.2));
        batch.set_private_mix(id("a"), id("b"), SpatialValues::neutral(0.7));
        assert_eq!(batch.pending_len(), 1);

        let requests = batch.drain();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].values.volume(), 0.7);
        assert_eq!(batch.pending_len(), 0);
        assert_eq!(batch.stats().coalesced, 1);
    }

    #[test]
    fn test_drain_in_arrival_order() {
        let batch = PrivateMixBatch::new();
        batch.set_private_mix(id("c"), id("a"), SpatialValues::zero());
        batch.set_private_mix(id("a"), id("b"), SpatialValues::zero());
        batch.set_private_mix(id("b"), id("c"), SpatialValues::zero());

        let order: Vec<_> = batch.drain().into_iter().map(|r| r.requester).collect();
        assert_eq!(order, vec![id("c"), id("a"), id("b")]);
    }

    #[test]
    fn test_remove_for_member() {
        let batch = PrivateMixBatch::new();
        batch.set_private_mix(id("a"), id("b"), SpatialValues::zero());
        batch.set_private_mix(id("b"), id("c"), SpatialValues::zero());
        batch.set_private_mix(id("c"), id("d"), SpatialValues::zero());
        batch.remove_for(&id("b"));

        let mut applied = Vec::new();
        assert_eq!(batch.apply(|r| applied.push(r.target)), 1);
        assert_eq!(applied, vec![id("d")]);
    }

    #[test]
    fn test_drain_where_leaves_other_requesters() {
        let batch = PrivateMixBatch::new();
        batch.set_private_mix(id("a"), id("b"), SpatialValues::zero());
        batch.set_private_mix(id("x"), id("y"), SpatialValues::zero());

        let taken = batch.drain_where(|requester| requester == &id("a"));
        assert_eq!(taken.len(), 1);
        assert_eq!(batch.pending_len(), 1);
        assert_eq!(batch.drain()[0].requester, id("x"));
    }
}
