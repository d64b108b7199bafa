//! Control API server

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::cors::CorsLayer;

use super::handlers;
use crate::conference::ConferenceRegistry;
use crate::config::ControlConfig;
use crate::network::UdpTransport;

/// Shared state for handlers
pub struct AppState {
    pub registry: Arc<ConferenceRegistry>,
    /// RTP transport members are registered with on join
    pub udp: Option<Arc<UdpTransport>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(registry: Arc<ConferenceRegistry>, udp: Option<Arc<UdpTransport>>) -> Self {
        Self {
            registry,
            udp,
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(handlers::get_status))
        .route(
            "/api/conferences",
            get(handlers::list_conferences).post(handlers::create_conference),
        )
        .route(
            "/api/conferences/:id",
            get(handlers::get_conference).delete(handlers::delete_conference),
        )
        .route("/api/conferences/:id/members", post(handlers::join_member))
        .route(
            "/api/conferences/:id/members/:call_id",
            get(handlers::get_member).delete(handlers::leave_member),
        )
        .route("/api/conferences/:id/members/:call_id/mute", post(handlers::set_muted))
        .route(
            "/api/conferences/:id/members/:call_id/conference-mute",
            post(handlers::set_conference_muted),
        )
        .route(
            "/api/conferences/:id/members/:call_id/silence",
            post(handlers::set_conference_silenced),
        )
        .route(
            "/api/conferences/:id/members/:call_id/whisper-mute",
            post(handlers::set_whisper_group_muted),
        )
        .route("/api/conferences/:id/members/:call_id/volume", post(handlers::set_volume))
        .route("/api/conferences/:id/members/:call_id/whisper", post(handlers::set_whispering))
        .route(
            "/api/conferences/:id/members/:call_id/private-mix",
            post(handlers::set_private_mix),
        )
        .route("/api/conferences/:id/members/:call_id/transfer", post(handlers::transfer_member))
        .route("/api/conferences/:id/members/:call_id/migrate", post(handlers::migrate_member))
        .route(
            "/api/conferences/:id/members/:call_id/treatment",
            post(handlers::play_member_treatment),
        )
        .route(
            "/api/conferences/:id/members/:call_id/confirm-join",
            post(handlers::confirm_join),
        )
        .route("/api/conferences/:id/treatment", post(handlers::play_treatment))
        .route("/api/conferences/:id/groups", post(handlers::create_group))
        .route(
            "/api/conferences/:id/groups/:group",
            delete(handlers::destroy_group).patch(handlers::update_group),
        )
        .route("/api/conferences/:id/groups/:group/members", post(handlers::add_call))
        .route(
            "/api/conferences/:id/groups/:group/members/:call_id",
            delete(handlers::remove_call),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub struct ControlServer {
    config: ControlConfig,
    state: Arc<AppState>,
}

impl ControlServer {
    pub fn new(config: ControlConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Serve until `shutdown` fires
    pub async fn run(self, shutdown: oneshot::Receiver<()>) -> anyhow::Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.http_port).parse()?;
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Control API listening on http://{}", listener.local_addr()?);

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(async move {
                if shutdown.await.is_err() {
                    tracing::debug!("Control API shutdown channel dropped");
                }
            })
            .await?;
        Ok(())
    }
}
