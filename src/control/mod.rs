//! HTTP control plane
//!
//! JSON API over the signaling-layer calls: conferences, members, whisper
//! groups, mute flags, private mixes, transfer, migration and treatments.

pub mod handlers;
pub mod server;

pub use server::{router, AppState, ControlServer};
