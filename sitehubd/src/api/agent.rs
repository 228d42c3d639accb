//! Endpoints agents call. Every handler takes `AgentAuth` first so a bad
//! credential is rejected before the body is even parsed.

use axum::{extract::State, Json};
use shared::types::{
    AutoTicketAck, ErrorAck, ErrorReport, ErrorSubmission, EventAck, EventBatch, HeartbeatRequest,
    HeartbeatResponse, RegisterRequest, RegisterResponse, ScanAck, ScanResults, UpdateAck,
    UpdateResults,
};
use super::auth::AgentAuth;
use super::json::ApiJson;
use super::routes::AppState;
use crate::error::Result;

pub async fn register(
    State(state): State<AppState>,
    AgentAuth(client_id): AgentAuth,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> Result<Json<RegisterResponse>> {
    state.hub.register(client_id, req).await.map(Json)
}

pub async fn heartbeat(
    State(state): State<AppState>,
    AgentAuth(client_id): AgentAuth,
    ApiJson(req): ApiJson<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>> {
    state.hub.heartbeat(client_id, req).await.map(Json)
}

pub async fn scan_results(
    State(state): State<AppState>,
    AgentAuth(client_id): AgentAuth,
    ApiJson(scan): ApiJson<ScanResults>,
) -> Result<Json<ScanAck>> {
    state.hub.ingest_scan(client_id, scan).await.map(Json)
}

pub async fn update_results(
    State(state): State<AppState>,
    AgentAuth(client_id): AgentAuth,
    ApiJson(results): ApiJson<UpdateResults>,
) -> Result<Json<UpdateAck>> {
    state.hub.ingest_update_results(client_id, results).await.map(Json)
}

pub async fn events(
    State(state): State<AppState>,
    AgentAuth(client_id): AgentAuth,
    ApiJson(batch): ApiJson<EventBatch>,
) -> Result<Json<EventAck>> {
    state.hub.ingest_events(client_id, batch).await.map(Json)
}

pub async fn error_report(
    State(state): State<AppState>,
    AgentAuth(client_id): AgentAuth,
    ApiJson(submission): ApiJson<ErrorSubmission>,
) -> Result<Json<ErrorAck>> {
    state.hub.ingest_errors(client_id, submission).await.map(Json)
}

pub async fn auto_ticket(
    State(state): State<AppState>,
    AgentAuth(client_id): AgentAuth,
    ApiJson(report): ApiJson<ErrorReport>,
) -> Result<Json<AutoTicketAck>> {
    state.hub.auto_ticket(client_id, report).await.map(Json)
}
