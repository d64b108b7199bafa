//! HTTP API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::conference::{CallId, CallParticipant, ConferenceStatus, MemberStatus};
use crate::control::server::AppState;
use crate::error::ConferenceError;
use crate::mixer::{PrivateMixStats, SpatialValues};
use crate::network::udp::UdpStats;
use crate::network::Transport;
use crate::treatment::Tone;

/// API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

type ApiResult<T> = (StatusCode, Json<ApiResponse<T>>);

fn error_status(e: &ConferenceError) -> StatusCode {
    match e {
        ConferenceError::NoSuchConference(_)
        | ConferenceError::NoSuchWhisperGroup(_)
        | ConferenceError::NoSuchMember(_) => StatusCode::NOT_FOUND,
        ConferenceError::ConferenceExists(_)
        | ConferenceError::WhisperGroupExists(_)
        | ConferenceError::MemberExists(_) => StatusCode::CONFLICT,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn reply<T>(result: Result<T, ConferenceError>, ok: StatusCode) -> ApiResult<T> {
    match result {
        Ok(data) => (ok, Json(ApiResponse::ok(data))),
        Err(e) => {
            tracing::debug!("Control request failed: {}", e);
            (error_status(&e), Json(ApiResponse::error(e.to_string())))
        }
    }
}

/// System status
#[derive(Serialize)]
pub struct SystemStatus {
    pub conferences: usize,
    pub members: usize,
    pub uptime_seconds: u64,
    pub private_mixes: PrivateMixStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp: Option<UdpStats>,
}

pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SystemStatus>> {
    let conferences = state.registry.conferences();
    let status = SystemStatus {
        conferences: conferences.len(),
        members: conferences.iter().map(|c| c.member_count()).sum(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        private_mixes: state.registry.private_mix_stats(),
        udp: state.udp.as_ref().map(|u| u.stats()),
    };
    Json(ApiResponse::ok(status))
}

#[derive(Deserialize)]
pub struct CreateConferenceRequest {
    pub id: String,
    /// `ENCODING/RATE/CHANNELS`
    pub media: Option<String>,
    #[serde(default)]
    pub permanent: bool,
}

pub async fn list_conferences(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<ConferenceStatus>>> {
    let conferences = state.registry.conferences().iter().map(|c| c.status()).collect();
    Json(ApiResponse::ok(conferences))
}

pub async fn create_conference(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateConferenceRequest>,
) -> ApiResult<ConferenceStatus> {
    let result = state
        .registry
        .create_conference(&req.id, req.media.as_deref(), req.permanent)
        .map(|c| c.status());
    reply(result, StatusCode::CREATED)
}

pub async fn get_conference(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<ConferenceStatus> {
    reply(state.registry.find(&id).map(|c| c.status()), StatusCode::OK)
}

pub async fn delete_conference(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<()> {
    let members = state.registry.find(&id).map(|c| c.call_ids()).unwrap_or_default();
    let result = state.registry.remove(&id);
    if result.is_ok() {
        if let Some(udp) = state.udp.as_ref() {
            for call_id in &members {
                udp.unregister(call_id);
            }
        }
    }
    reply(result, StatusCode::OK)
}

/// Join a call. Its RTP is routed through the UDP transport when it
/// carries a remote address.
pub async fn join_member(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(participant): Json<CallParticipant>,
) -> ApiResult<MemberStatus> {
    let remote = participant.remote_address;
    let member = match state.registry.join(&id, participant) {
        Ok(member) => member,
        Err(e) => return reply(Err(e), StatusCode::CREATED),
    };

    if let (Some(udp), Some(addr)) = (state.udp.as_ref(), remote) {
        udp.register(&id, member.call_id(), addr);
        let transport: Arc<dyn Transport> = udp.clone();
        member.sender().register_transport(transport);
    }

    let result = state
        .registry
        .find(&id)
        .and_then(|c| c.member_status(member.call_id()));
    reply(result, StatusCode::CREATED)
}

pub async fn get_member(
    State(state): State<Arc<AppState>>,
    Path((id, call_id)): Path<(String, String)>,
) -> ApiResult<MemberStatus> {
    let result = state
        .registry
        .find(&id)
        .and_then(|c| c.member_status(&CallId::from(call_id)));
    reply(result, StatusCode::OK)
}

pub async fn leave_member(
    State(state): State<Arc<AppState>>,
    Path((id, call_id)): Path<(String, String)>,
) -> ApiResult<()> {
    let call_id = CallId::from(call_id);
    let result = state
        .registry
        .find(&id)
        .and_then(|c| c.member(&call_id))
        .and_then(|_| state.registry.leave(&call_id, Some("hangup".to_string())));
    if result.is_ok() {
        if let Some(udp) = state.udp.as_ref() {
            udp.unregister(&call_id);
        }
    }
    reply(result, StatusCode::OK)
}

/// Set a flag on a member
#[derive(Deserialize)]
pub struct FlagRequest {
    pub enabled: bool,
}

pub async fn set_muted(
    State(state): State<Arc<AppState>>,
    Path((id, call_id)): Path<(String, String)>,
    Json(req): Json<FlagRequest>,
) -> ApiResult<()> {
    let result = state
        .registry
        .find(&id)
        .and_then(|c| c.set_muted(&CallId::from(call_id), req.enabled));
    reply(result, StatusCode::OK)
}

pub async fn set_conference_muted(
    State(state): State<Arc<AppState>>,
    Path((id, call_id)): Path<(String, String)>,
    Json(req): Json<FlagRequest>,
) -> ApiResult<()> {
    let result = state
        .registry
        .find(&id)
        .and_then(|c| c.set_conference_muted(&CallId::from(call_id), req.enabled));
    reply(result, StatusCode::OK)
}

pub async fn set_conference_silenced(
    State(state): State<Arc<AppState>>,
    Path((id, call_id)): Path<(String, String)>,
    Json(req): Json<FlagRequest>,
) -> ApiResult<()> {
    let result = state
        .registry
        .find(&id)
        .and_then(|c| c.set_conference_silenced(&CallId::from(call_id), req.enabled));
    reply(result, StatusCode::OK)
}

pub async fn set_whisper_group_muted(
    State(state): State<Arc<AppState>>,
    Path((id, call_id)): Path<(String, String)>,
    Json(req): Json<FlagRequest>,
) -> ApiResult<()> {
    let result = state
        .registry
        .find(&id)
        .and_then(|c| c.set_whisper_group_muted(&CallId::from(call_id), req.enabled));
    reply(result, StatusCode::OK)
}

#[derive(Deserialize)]
pub struct VolumeRequest {
    pub input: Option<f64>,
    pub output: Option<f64>,
}

pub async fn set_volume(
    State(state): State<Arc<AppState>>,
    Path((id, call_id)): Path<(String, String)>,
    Json(req): Json<VolumeRequest>,
) -> ApiResult<()> {
    let call_id = CallId::from(call_id);
    let result = state.registry.find(&id).and_then(|c| {
        if let Some(volume) = req.input {
            c.set_input_volume(&call_id, volume)?;
        }
        if let Some(volume) = req.output {
            c.set_output_volume(&call_id, volume)?;
        }
        Ok(())
    });
    reply(result, StatusCode::OK)
}

#[derive(Deserialize)]
pub struct WhisperRequest {
    pub group: String,
}

pub async fn set_whispering(
    State(state): State<Arc<AppState>>,
    Path((id, call_id)): Path<(String, String)>,
    Json(req): Json<WhisperRequest>,
) -> ApiResult<()> {
    let result = state
        .registry
        .find(&id)
        .and_then(|c| c.set_whispering(&req.group, &CallId::from(call_id)));
    reply(result, StatusCode::OK)
}

/// Private mix for `target`: `[front_back, left_right, up_down, volume]`
#[derive(Deserialize)]
pub struct PrivateMixBody {
    pub target: CallId,
    pub values: SpatialValues,
}

pub async fn set_private_mix(
    State(state): State<Arc<AppState>>,
    Path((id, call_id)): Path<(String, String)>,
    Json(req): Json<PrivateMixBody>,
) -> ApiResult<()> {
    let result = state
        .registry
        .find(&id)
        .and_then(|c| c.set_private_mix(&CallId::from(call_id), &req.target, req.values));
    reply(result, StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
pub struct TransferRequest {
    pub conference: String,
}

pub async fn transfer_member(
    State(state): State<Arc<AppState>>,
    Path((id, call_id)): Path<(String, String)>,
    Json(req): Json<TransferRequest>,
) -> ApiResult<()> {
    let call_id = CallId::from(call_id);
    let result = state
        .registry
        .find(&id)
        .and_then(|c| c.member(&call_id))
        .and_then(|_| state.registry.transfer_member(&call_id, &req.conference))
        .map(|_| ());
    if result.is_ok() {
        if let Some(udp) = state.udp.as_ref() {
            udp.move_call(&call_id, &req.conference);
        }
    }
    reply(result, StatusCode::OK)
}

/// Hand the call in `from` over to the call in the path
#[derive(Deserialize)]
pub struct MigrateRequest {
    pub from: CallId,
}

pub async fn migrate_member(
    State(state): State<Arc<AppState>>,
    Path((id, call_id)): Path<(String, String)>,
    Json(req): Json<MigrateRequest>,
) -> ApiResult<()> {
    let result = state
        .registry
        .find(&id)
        .and_then(|c| c.migrate(&req.from, &CallId::from(call_id)));
    if result.is_ok() {
        if let Some(udp) = state.udp.as_ref() {
            udp.unregister(&req.from);
        }
    }
    reply(result, StatusCode::OK)
}

/// Tone treatment
#[derive(Deserialize)]
pub struct TreatmentRequest {
    pub frequency: f64,
    #[serde(default = "default_amplitude")]
    pub amplitude: f64,
    /// Plays until stopped when absent
    pub duration_ms: Option<u64>,
    /// Whisper group to play to, the whole conference when absent
    pub group: Option<String>,
}

fn default_amplitude() -> f64 {
    4000.0
}

pub async fn play_treatment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<TreatmentRequest>,
) -> ApiResult<()> {
    let result = state.registry.find(&id).and_then(|c| {
        let tone = Tone::new(
            req.frequency,
            req.amplitude,
            req.duration_ms.map(Duration::from_millis),
            &c.media(),
        );
        c.play_treatment(req.group.as_deref(), Box::new(tone))
    });
    reply(result, StatusCode::ACCEPTED)
}

pub async fn play_member_treatment(
    State(state): State<Arc<AppState>>,
    Path((id, call_id)): Path<(String, String)>,
    Json(req): Json<TreatmentRequest>,
) -> ApiResult<()> {
    let result = state.registry.find(&id).and_then(|c| {
        let tone = Tone::new(
            req.frequency,
            req.amplitude,
            req.duration_ms.map(Duration::from_millis),
            &c.media(),
        );
        c.play_member_treatment(&CallId::from(call_id), Box::new(tone))
    });
    reply(result, StatusCode::ACCEPTED)
}

pub async fn confirm_join(
    State(state): State<Arc<AppState>>,
    Path((id, call_id)): Path<(String, String)>,
) -> ApiResult<()> {
    let result = state
        .registry
        .find(&id)
        .and_then(|c| c.confirm_join(&CallId::from(call_id)));
    reply(result, StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
pub struct CreateGroupRequest {
    pub id: String,
    pub attenuation: Option<f64>,
}

pub async fn create_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CreateGroupRequest>,
) -> ApiResult<String> {
    let result = state
        .registry
        .find(&id)
        .and_then(|c| c.create_whisper_group(&req.id, req.attenuation))
        .map(|g| g.id().to_string());
    reply(result, StatusCode::CREATED)
}

pub async fn destroy_group(
    State(state): State<Arc<AppState>>,
    Path((id, group)): Path<(String, String)>,
) -> ApiResult<()> {
    let result = state
        .registry
        .find(&id)
        .and_then(|c| c.destroy_whisper_group(&group));
    reply(result, StatusCode::OK)
}

/// Group settings to change; absent fields are left alone
#[derive(Deserialize)]
pub struct GroupUpdate {
    pub attenuation: Option<f64>,
    pub locked: Option<bool>,
    pub transient: Option<bool>,
    pub no_common_mix: Option<bool>,
}

pub async fn update_group(
    State(state): State<Arc<AppState>>,
    Path((id, group)): Path<(String, String)>,
    Json(update): Json<GroupUpdate>,
) -> ApiResult<()> {
    let result = state.registry.find(&id).and_then(|c| {
        if let Some(attenuation) = update.attenuation {
            c.set_attenuation(&group, attenuation)?;
        }
        if let Some(locked) = update.locked {
            c.set_locked(&group, locked)?;
        }
        if let Some(no_common_mix) = update.no_common_mix {
            c.set_no_common_mix(&group, no_common_mix)?;
        }
        if let Some(transient) = update.transient {
            c.set_transient(&group, transient)?;
        }
        Ok(())
    });
    reply(result, StatusCode::OK)
}

#[derive(Deserialize)]
pub struct AddCallRequest {
    pub call_id: CallId,
}

pub async fn add_call(
    State(state): State<Arc<AppState>>,
    Path((id, group)): Path<(String, String)>,
    Json(req): Json<AddCallRequest>,
) -> ApiResult<()> {
    let result = state
        .registry
        .find(&id)
        .and_then(|c| c.add_call(&group, &req.call_id));
    reply(result, StatusCode::OK)
}

pub async fn remove_call(
    State(state): State<Arc<AppState>>,
    Path((id, group, call_id)): Path<(String, String, String)>,
) -> ApiResult<()> {
    let result = state
        .registry
        .find(&id)
        .and_then(|c| c.remove_call(&group, &CallId::from(call_id)));
    reply(result, StatusCode::OK)
}
