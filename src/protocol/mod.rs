//! Wire formats
//!
//! - [`rtp`]: RTP header parsing and building, telephone events, comfort noise
//! - [`media`]: payload numbers and media preference strings

pub mod media;
pub mod rtp;

pub use media::{Encoding, MediaInfo};
pub use rtp::{PacketKind, RtpHeader, RtpSequencer, TelephoneEvent};
