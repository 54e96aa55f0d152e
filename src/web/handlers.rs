use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::engine::RtpCapabilities;
use crate::session::PeerSnapshot;
use crate::state::AppState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub engine: &'static str,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        engine: state.session.gateway().engine().name(),
    })
}

/// Router RTP capabilities
pub async fn capabilities(State(state): State<Arc<AppState>>) -> Json<RtpCapabilities> {
    Json(state.session.capabilities().clone())
}

/// Connected peers
#[derive(Serialize)]
pub struct PeersResponse {
    pub count: usize,
    pub peers: Vec<PeerSnapshot>,
}

pub async fn list_peers(State(state): State<Arc<AppState>>) -> Json<PeersResponse> {
    let peers = state.session.peers();
    Json(PeersResponse {
        count: peers.len(),
        peers,
    })
}
