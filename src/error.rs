//! Error types for the conference bridge

use thiserror::Error;

/// Main error type for the bridge
#[derive(Error, Debug)]
pub enum Error {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Conference error: {0}")]
    Conference(#[from] ConferenceError),

    #[error("Member error: {0}")]
    Member(#[from] MemberError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Codec and sample conversion errors
#[derive(Error, Debug, Clone)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),

    #[error("Unsupported payload type: {0}")]
    UnsupportedPayload(u8),

    #[error("Resampler initialization failed: {0}")]
    ResamplerInit(String),

    #[error("Resampling failed: {0}")]
    ResampleFailed(String),
}

/// Transport-side errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("No transport registered for {0}")]
    NotRegistered(String),

    #[error("Cipher failure: {0}")]
    Crypto(String),
}

/// Control-plane errors. The requested operation fails and conference
/// state is left untouched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConferenceError {
    #[error("No such conference: {0}")]
    NoSuchConference(String),

    #[error("Conference already exists: {0}")]
    ConferenceExists(String),

    #[error("No such whisper group: {0}")]
    NoSuchWhisperGroup(String),

    #[error("Whisper group already exists: {0}")]
    WhisperGroupExists(String),

    #[error("The conference whisper group {0} cannot be changed this way")]
    ConferenceWhisperGroup(String),

    #[error("No such member: {0}")]
    NoSuchMember(String),

    #[error("Member already joined: {0}")]
    MemberExists(String),

    #[error("Call {call_id} is not a member of whisper group {group}")]
    NotAMember { call_id: String, group: String },

    #[error("Calls in locked whisper group {0} cannot stop whispering until removed from it")]
    WhisperGroupLocked(String),

    #[error("Invalid private mix: {0}")]
    InvalidPrivateMix(String),

    #[error("Invalid attenuation {0}, must be between 0 and 1")]
    InvalidAttenuation(f64),

    #[error("Invalid volume {0}")]
    InvalidVolume(f64),

    #[error("Invalid media preference: {0}")]
    InvalidMediaPreference(String),

    #[error("Member {0} could not be initialized: {1}")]
    MemberInit(String, String),
}

/// Failures that are fatal to a single member's call. They cancel that
/// call and never affect the conference or other members.
#[derive(Error, Debug, Clone)]
pub enum MemberError {
    #[error("Codec failure: {0}")]
    Codec(#[from] CodecError),

    #[error("Decrypt failure: {0}")]
    Decrypt(String),

    #[error("Encrypt failure: {0}")]
    Encrypt(String),

    #[error("Invalid negotiated payload {0}")]
    InvalidPayload(u8),

    #[error("No RTP or RTCP received for {0} seconds")]
    Timeout(u64),

    #[error("Bad media payload stream, {0} unexpected packets and no media")]
    BadPayloadStream(u64),

    #[error("Packet framing failure: {0}")]
    Framing(#[from] NetworkError),
}

/// Result type alias for the bridge
pub type Result<T> = std::result::Result<T, Error>;
