//! Per-listener mix
//!
//! A listener's mix is the ordered list of [`MixDescriptor`]s it hears. The
//! usual case is two descriptors, the member's whisper group at `1.0` and
//! its own audio at `-1.0` (mix-minus). That case takes a fast path that
//! subtracts one contribution from the other; any other shape walks every
//! descriptor. Both paths produce identical samples.

use std::sync::atomic::{AtomicU64, Ordering};

use super::descriptor::{MixDescriptor, SpatialValues};
use super::source::{Contribution, ContributionSource, MixSource, SourceKey};
use crate::audio::{pcm, Spatializer};
use crate::conference::CallId;

pub struct MixManager {
    owner: CallId,
    samples_per_packet: usize,
    spatializer: Spatializer,
    descriptors: Vec<MixDescriptor>,
    /// Indexes of (group, mix-minus) when the fast path applies
    fast_path: Option<(usize, usize)>,
    stats: MixStats,
}

impl MixManager {
    pub fn new(owner: CallId, samples_per_packet: usize, spatializer: Spatializer) -> Self {
        Self {
            owner,
            samples_per_packet,
            spatializer,
            descriptors: Vec::new(),
            fast_path: None,
            stats: MixStats::default(),
        }
    }

    /// Add a source at `attenuation`, or update it if already present.
    /// An attenuation of zero removes the source.
    pub fn add_mix(&mut self, source: MixSource, attenuation: f64) {
        let key = source.key();
        if attenuation == 0.0 {
            self.remove_mix(&key);
            return;
        }

        match self.position(&key) {
            Some(i) => {
                let md = &mut self.descriptors[i];
                md.attenuation = attenuation;
                md.spatial = None;
            }
            None => self.descriptors.push(MixDescriptor::new(source, attenuation)),
        }
        self.update_fast_path();
    }

    /// Insert a fully built descriptor, replacing one with the same key
    pub fn add_descriptor(&mut self, md: MixDescriptor) {
        match self.position(&md.key()) {
            Some(i) => self.descriptors[i] = md,
            None => self.descriptors.push(md),
        }
        self.update_fast_path();
    }

    pub fn remove_mix(&mut self, key: &SourceKey) -> Option<MixDescriptor> {
        let i = self.position(key)?;
        let md = self.descriptors.remove(i);
        self.update_fast_path();
        Some(md)
    }

    /// Set private-mix values for a source. Returns the descriptor if it
    /// changed, `None` if it already had these values.
    pub fn set_private_mix(&mut self, source: MixSource, values: SpatialValues) -> Option<&MixDescriptor> {
        let key = source.key();
        let i = match self.position(&key) {
            Some(i) => {
                if self.descriptors[i].spatial == Some(values) {
                    return None;
                }
                self.descriptors[i].spatial = Some(values);
                i
            }
            None => {
                self.descriptors.push(MixDescriptor::private(source, values));
                self.descriptors.len() - 1
            }
        };
        self.update_fast_path();
        self.descriptors.get(i)
    }

    /// Change an existing descriptor's attenuation. Zero keeps the
    /// descriptor, silenced.
    pub fn set_attenuation(&mut self, key: &SourceKey, attenuation: f64) -> bool {
        let Some(i) = self.position(key) else {
            return false;
        };
        self.descriptors[i].attenuation = attenuation;
        self.update_fast_path();
        true
    }

    pub fn set_muted(&mut self, key: &SourceKey, muted: bool) -> bool {
        let Some(i) = self.position(key) else {
            return false;
        };
        self.descriptors[i].muted = muted;
        self.update_fast_path();
        true
    }

    /// Drop every descriptor, releasing the sources they hold
    pub fn clear(&mut self) {
        self.descriptors.clear();
        self.fast_path = None;
    }

    pub fn find(&self, key: &SourceKey) -> Option<&MixDescriptor> {
        self.descriptors.iter().find(|md| md.key() == *key)
    }

    pub fn descriptors(&self) -> &[MixDescriptor] {
        &self.descriptors
    }

    /// Members this listener has private mixes for
    pub fn private_mix_targets(&self) -> Vec<CallId> {
        self.descriptors
            .iter()
            .filter(|md| md.is_private())
            .filter_map(|md| md.source.as_member().map(|r| r.call_id().clone()))
            .collect()
    }

    pub fn is_fast_path(&self) -> bool {
        self.fast_path.is_some()
    }

    pub fn samples_per_packet(&self) -> usize {
        self.samples_per_packet
    }

    pub fn owner(&self) -> &CallId {
        &self.owner
    }

    pub fn stats(&self) -> MixStatsSnapshot {
        self.stats.snapshot()
    }

    fn position(&self, key: &SourceKey) -> Option<usize> {
        self.descriptors.iter().position(|md| md.key() == *key)
    }

    /// Fast path needs exactly the own group at 1.0 and own mix-minus,
    /// both unmuted and neither private
    fn update_fast_path(&mut self) {
        self.fast_path = None;
        if self.descriptors.len() != 2 {
            return;
        }

        let group = self.descriptors.iter().position(|md| {
            md.source.as_group().is_some() && !md.is_private() && !md.muted && md.attenuation == 1.0
        });
        let minus = self
            .descriptors
            .iter()
            .position(|md| md.is_mix_minus_for(&self.owner) && !md.muted);

        if let (Some(g), Some(m)) = (group, minus) {
            self.fast_path = Some((g, m));
        }
    }

    /// This tick's mix, clipped to the i16 range. `None` means silence.
    pub fn mix(&self) -> Option<Vec<i32>> {
        let out = match self.fast_path {
            Some((g, m)) => {
                self.stats.fast.fetch_add(1, Ordering::Relaxed);
                self.mix_fast(g, m)
            }
            None => {
                self.stats.general.fetch_add(1, Ordering::Relaxed);
                self.mix_general()
            }
        };
        if out.is_none() {
            self.stats.silent.fetch_add(1, Ordering::Relaxed);
        }
        out
    }

    fn mix_fast(&self, group: usize, minus: usize) -> Option<Vec<i32>> {
        let g = self.descriptors[group].source.current_contribution();
        let m = self.descriptors[minus].source.current_contribution();
        if g.is_none() && m.is_none() {
            return None;
        }

        // Same accumulation order as the general path
        let mut terms = [(group, g, 1.0), (minus, m, -1.0)];
        terms.sort_by_key(|(index, _, _)| *index);

        let mut acc = vec![0i32; self.samples_per_packet];
        for (_, data, weight) in terms {
            if let Some(data) = data {
                pcm::add_weighted(&mut acc, &data, weight);
            }
        }
        pcm::clip_in_place(&mut acc);
        Some(acc)
    }

    /// Walk every descriptor. Used directly when the fast path does not apply.
    pub fn mix_general(&self) -> Option<Vec<i32>> {
        let mut acc = vec![0i32; self.samples_per_packet];
        let mut added = false;

        for md in &self.descriptors {
            if md.muted || md.attenuation == 0.0 {
                continue;
            }
            let Some(data) = md.source.current_contribution() else {
                continue;
            };

            match &md.spatial {
                None => {
                    pcm::add_weighted(&mut acc, &data, md.attenuation);
                    added = true;
                }
                Some(values) => {
                    added |= self.add_private(&mut acc, md, &data, values);
                }
            }
        }

        if !added {
            return None;
        }
        pcm::clip_in_place(&mut acc);
        Some(acc)
    }

    /// A private mix reshapes a source the listener may already hear
    /// through a common group mix: that copy is taken out and replaced.
    fn add_private(&self, acc: &mut [i32], md: &MixDescriptor, data: &Contribution, values: &SpatialValues) -> bool {
        let in_common_mix = md.source.contribution_is_in_common_mix();

        if values.is_spatially_neutral() {
            let volume = if in_common_mix {
                values.volume() - 1.0
            } else {
                values.volume()
            };
            let factor = volume * md.attenuation;
            if factor == 0.0 {
                return false;
            }
            pcm::add_weighted(acc, data, factor);
            return true;
        }

        if in_common_mix {
            pcm::add_weighted(acc, data, -md.attenuation);
        }
        let previous = md.source.previous_contribution();
        let placed = self.spatializer.apply(data, previous.as_deref(), values);
        pcm::add_weighted(acc, &placed, md.attenuation);
        true
    }
}

#[derive(Debug, Default)]
struct MixStats {
    fast: AtomicU64,
    general: AtomicU64,
    silent: AtomicU64,
}

impl MixStats {
    fn snapshot(&self) -> MixStatsSnapshot {
        MixStatsSnapshot {
            fast: self.fast.load(Ordering::Relaxed),
            general: self.general.load(Ordering::Relaxed),
            silent: self.silent.load(Ordering::Relaxed),
        }
    }
}

/// Mix path counters
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct MixStatsSnapshot {
    pub fast: u64,
    pub general: u64,
    pub silent: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpatialConfig;
    use crate::protocol::MediaInfo;
    use crate::treatment::{PcmClip, TreatmentManager};
    use std::sync::Arc;

    const SAMPLES: usize = 4;

    fn manager() -> MixManager {
        let media = MediaInfo::from_payload(0).unwrap();
        MixManager::new(
            CallId::from("listener"),
            SAMPLES,
            Spatializer::new(SpatialConfig::default(), &media),
        )
    }

    /// A source that publishes `value` in every sample this tick
    fn constant(id: &str, value: i32) -> MixSource {
        let treatment = Arc::new(TreatmentManager::new(id, SAMPLES));
        treatment.enqueue(Box::new(PcmClip::new(id, vec![value; SAMPLES], true)));
        treatment.save_current_contribution();
        MixSource::Treatment(treatment)
    }

    #[test]
    fn test_additive_mix() {
        let mut mix = manager();
        mix.add_mix(constant("a", 100), 1.0);
        mix.add_mix(constant("b", 200), 1.0);
        mix.add_mix(constant("c", -50), 0.5);

        assert_eq!(mix.mix().unwrap(), vec![275; SAMPLES]);
    }

    #[test]
    fn test_silent_sources_do_not_count() {
        let mut mix = manager();
        let idle = Arc::new(TreatmentManager::new("idle", SAMPLES));
        idle.save_current_contribution();
        mix.add_mix(MixSource::Treatment(idle), 1.0);
        assert!(mix.mix().is_none());

        mix.add_mix(constant("a", 7), 1.0);
        assert_eq!(mix.mix().unwrap(), vec![7; SAMPLES]);
    }

    #[test]
    fn test_zero_attenuation_removes() {
        let mut mix = manager();
        let source = constant("a", 100);
        mix.add_mix(source.clone(), 0.5);
        assert_eq!(mix.descriptors().len(), 1);

        mix.add_mix(source.clone(), 0.0);
        assert!(mix.find(&source.key()).is_none());
        assert!(mix.mix().is_none());
    }

    #[test]
    fn test_muted_and_clipped() {
        let mut mix = manager();
        let loud = constant("loud", 30000);
        mix.add_mix(loud.clone(), 1.0);
        mix.add_mix(constant("louder", 30000), 1.0);
        assert_eq!(mix.mix().unwrap(), vec![i16::MAX as i32; SAMPLES]);

        mix.set_muted(&loud.key(), true);
        assert_eq!(mix.mix().unwrap(), vec![30000; SAMPLES]);
    }

    #[test]
    fn test_private_mix_dedup() {
        let mut mix = manager();
        let source = constant("a", 100);
        let values = SpatialValues::neutral(0.5);

        assert!(mix.set_private_mix(source.clone(), values).is_some());
        assert!(mix.set_private_mix(source.clone(), values).is_none());
        assert!(mix.set_private_mix(source, SpatialValues::neutral(2.0)).is_some());
        assert_eq!(mix.mix().unwrap(), vec![200; SAMPLES]);
    }

    #[test]
    fn test_no_fast_path_without_mix_minus() {
        let mut mix = manager();
        mix.add_mix(constant("a", 1), 1.0);
        mix.add_mix(constant("b", 1), -1.0);
        assert!(!mix.is_fast_path());
        assert_eq!(mix.mix_general().unwrap(), vec![0; SAMPLES]);
    }
}
