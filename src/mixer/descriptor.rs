//! Mix descriptors: one weighted source in a listener's mix

use serde::{Deserialize, Serialize};
use std::fmt;

use super::source::{MixSource, SourceKey};
use crate::conference::CallId;
use crate::error::ConferenceError;

/// Values closer than this are treated as equal
const EPSILON: f64 = 0.001;

/// Loudest private-mix volume accepted
const MAX_VOLUME: f64 = 10.0;

/// Private-mix vector: front/back, left/right, up/down, volume
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpatialValues(pub [f64; 4]);

impl SpatialValues {
    pub fn new(front_back: f64, left_right: f64, up_down: f64, volume: f64) -> Self {
        Self([front_back, left_right, up_down, volume])
    }

    /// Centred in front of the listener at `volume`
    pub fn neutral(volume: f64) -> Self {
        Self([0.0, 0.0, 0.0, volume])
    }

    /// Centred and silent
    pub fn zero() -> Self {
        Self::neutral(0.0)
    }

    pub fn front_back(&self) -> f64 {
        self.0[0]
    }

    pub fn left_right(&self) -> f64 {
        self.0[1]
    }

    pub fn up_down(&self) -> f64 {
        self.0[2]
    }

    pub fn volume(&self) -> f64 {
        self.0[3]
    }

    /// No positional component
    pub fn is_spatially_neutral(&self) -> bool {
        self.0[..3].iter().all(|v| v.abs() < EPSILON)
    }

    pub fn is_zero_volume(&self) -> bool {
        self.volume().abs() < EPSILON
    }

    /// Neutral at exactly `volume`, so the mix would not change
    pub fn is_nop(&self, volume: f64) -> bool {
        self.is_spatially_neutral() && (self.volume() - volume).abs() < EPSILON
    }

    /// Finite, positions in `-1..=1`, volume in `0..=10`
    pub fn validate(&self) -> Result<(), ConferenceError> {
        if self.0.iter().any(|v| !v.is_finite()) {
            return Err(ConferenceError::InvalidPrivateMix(format!("{:?}", self.0)));
        }
        if self.0[..3].iter().any(|v| v.abs() > 1.0) {
            return Err(ConferenceError::InvalidPrivateMix(format!(
                "position out of range: {:?}",
                self.0
            )));
        }
        if !(0.0..=MAX_VOLUME).contains(&self.volume()) {
            return Err(ConferenceError::InvalidVolume(self.volume()));
        }
        Ok(())
    }

    /// Parse `"fb:lr:ud:vol"` or `"fb,lr,ud,vol"`
    pub fn parse(text: &str) -> Result<Self, ConferenceError> {
        let invalid = || ConferenceError::InvalidPrivateMix(text.to_string());
        let parts: Vec<f64> = text
            .split([':', ','])
            .map(|p| p.trim().parse::<f64>().map_err(|_| invalid()))
            .collect::<Result<_, _>>()?;
        let values: [f64; 4] = parts.try_into().map_err(|_| invalid())?;
        let values = Self(values);
        values.validate()?;
        Ok(values)
    }
}

impl fmt::Display for SpatialValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.3}:{:.3}:{:.3}:{:.3}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// One source in a listener's mix
#[derive(Debug, Clone)]
pub struct MixDescriptor {
    pub source: MixSource,
    /// Weight. `1.0` for the member's own group, `-1.0` for its mix-minus
    pub attenuation: f64,
    pub muted: bool,
    /// Set for private mixes
    pub spatial: Option<SpatialValues>,
}

impl MixDescriptor {
    pub fn new(source: MixSource, attenuation: f64) -> Self {
        Self {
            source,
            attenuation,
            muted: false,
            spatial: None,
        }
    }

    pub fn private(source: MixSource, values: SpatialValues) -> Self {
        Self {
            source,
            attenuation: 1.0,
            muted: false,
            spatial: Some(values),
        }
    }

    pub fn key(&self) -> SourceKey {
        self.source.key()
    }

    pub fn is_private(&self) -> bool {
        self.spatial.is_some()
    }

    /// The listener's own audio subtracted from its group mix
    pub fn is_mix_minus_for(&self, call_id: &CallId) -> bool {
        !self.is_private()
            && self.attenuation == -1.0
            && matches!(self.source.as_member(), Some(r) if r.call_id() == call_id)
    }
}

impl fmt::Display for MixDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:.3}", self.key(), self.attenuation)?;
        if let Some(values) = &self.spatial {
            write!(f, " pm={}", values)?;
        }
        if self.muted {
            write!(f, " muted")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(SpatialValues::neutral(1.0).is_nop(1.0));
        assert!(!SpatialValues::neutral(0.5).is_nop(1.0));
        assert!(SpatialValues::zero().is_zero_volume());
        assert!(SpatialValues::zero().is_spatially_neutral());
        assert!(!SpatialValues::new(0.0, 0.5, 0.0, 1.0).is_spatially_neutral());
        assert!(!SpatialValues::new(0.0, 0.5, 0.0, 1.0).is_nop(1.0));
    }

    #[test]
    fn test_validate() {
        assert!(SpatialValues::new(0.0, 1.0, -1.0, 2.0).validate().is_ok());
        assert!(SpatialValues::new(0.0, 1.5, 0.0, 1.0).validate().is_err());
        assert!(SpatialValues::new(0.0, 0.0, 0.0, -1.0).validate().is_err());
        assert!(SpatialValues::new(f64::NAN, 0.0, 0.0, 1.0).validate().is_err());
    }

    #[test]
    fn test_parse() {
        let values = SpatialValues::parse("0:-0.5:0:0.8").unwrap();
        assert_eq!(values.left_right(), -0.5);
        assert_eq!(values.volume(), 0.8);
        assert!(SpatialValues::parse("1,2,3").is_err());
        assert!(SpatialValues::parse("a:b:c:d").is_err());
    }
}
