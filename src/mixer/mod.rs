//! Mixing engine
//!
//! - [`source`]: contribution sources and their per-tick slots
//! - [`descriptor`]: weighted sources and private-mix vectors
//! - [`manager`]: one listener's mix, fast path and general path
//! - [`private`]: batched private-mix updates

pub mod descriptor;
pub mod manager;
pub mod private;
pub mod source;

pub use descriptor::{MixDescriptor, SpatialValues};
pub use manager::{MixManager, MixStatsSnapshot};
pub use private::{PrivateMixBatch, PrivateMixRequest, PrivateMixStats};
pub use source::{Contribution, ContributionSlots, ContributionSource, MixSource, SourceKey};
