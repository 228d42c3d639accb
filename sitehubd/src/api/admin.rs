//! Operator API, bearer-token protected
use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use shared::types::{ErrorReport, UpdateItem};
use uuid::Uuid;
use super::auth::AdminAuth;
use super::json::{ApiJson, ApiPath, ApiQuery};
use super::routes::AppState;
use crate::commands::ScanAllReport;
use crate::error::{HubError, Result};
use crate::hub::TicketPatch;
use crate::model::{Client, Ticket, TicketPriority, TicketStatus};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueRequest {
    pub name: String,
    pub site_url: String,
}

/// The only response that ever carries a full token
#[derive(Serialize)]
pub struct IssueResponse {
    pub client: Client,
    pub token: String,
}

#[derive(Deserialize)]
pub struct ErrorsQuery {
    pub limit: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketsQuery {
    pub client_id: Option<Uuid>,
}

#[derive(Deserialize)]
pub struct UpdateRequest {
    pub items: Vec<UpdateItem>,
}

#[derive(Deserialize)]
pub struct TicketPatchRequest {
    pub status: Option<TicketStatus>,
    pub priority: Option<TicketPriority>,
}

#[derive(Deserialize)]
pub struct CommentRequest {
    pub body: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAccepted {
    pub command: &'static str,
    pub client_id: Uuid,
}

#[derive(Serialize)]
pub struct ScanAllStarted {
    pub requested: usize,
}

#[derive(Serialize)]
pub struct ScanAllStatus {
    pub running: bool,
    pub last: Option<ScanAllReport>,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

pub async fn issue_client(
    State(state): State<AppState>,
    _: AdminAuth,
    ApiJson(req): ApiJson<IssueRequest>,
) -> Result<(StatusCode, Json<IssueResponse>)> {
    let client = state.hub.issue_client(&req.name, &req.site_url).await?;
    let token = client.token.expose().to_string();
    Ok((StatusCode::CREATED, Json(IssueResponse { client, token })))
}

pub async fn list_clients(State(state): State<AppState>, _: AdminAuth) -> Json<Vec<Client>> {
    Json(state.hub.registry.list().await)
}

pub async fn get_client(
    State(state): State<AppState>,
    _: AdminAuth,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<Client>> {
    state.hub.client(id).await.map(Json)
}

pub async fn remove_client(
    State(state): State<AppState>,
    _: AdminAuth,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<Client>> {
    state.hub.remove_client(id).await.map(Json)
}

pub async fn client_errors(
    State(state): State<AppState>,
    _: AdminAuth,
    ApiPath(id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<ErrorsQuery>,
) -> Result<Json<Vec<ErrorReport>>> {
    state
        .hub
        .recent_errors(id, query.limit.unwrap_or(100))
        .await
        .map(Json)
}

pub async fn scan_client(
    State(state): State<AppState>,
    _: AdminAuth,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<(StatusCode, Json<CommandAccepted>)> {
    state.hub.dispatcher.request_scan(id).await?;
    Ok((StatusCode::ACCEPTED, Json(CommandAccepted { command: "scan", client_id: id })))
}

pub async fn update_client(
    State(state): State<AppState>,
    _: AdminAuth,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<UpdateRequest>,
) -> Result<(StatusCode, Json<CommandAccepted>)> {
    state.hub.dispatcher.request_update(id, req.items).await?;
    Ok((StatusCode::ACCEPTED, Json(CommandAccepted { command: "update", client_id: id })))
}

pub async fn start_scan_all(
    State(state): State<AppState>,
    _: AdminAuth,
) -> Result<(StatusCode, Json<ScanAllStarted>)> {
    let requested = state.hub.dispatcher.start_scan_all()?;
    Ok((StatusCode::ACCEPTED, Json(ScanAllStarted { requested })))
}

pub async fn scan_all_status(State(state): State<AppState>, _: AdminAuth) -> Json<ScanAllStatus> {
    Json(ScanAllStatus {
        running: state.hub.dispatcher.scan_all_running(),
        last: state.hub.dispatcher.last_scan_all(),
    })
}

pub async fn cancel_scan_all(State(state): State<AppState>, _: AdminAuth) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.hub.dispatcher.cancel_scan_all(),
    })
}

pub async fn list_tickets(
    State(state): State<AppState>,
    _: AdminAuth,
    ApiQuery(query): ApiQuery<TicketsQuery>,
) -> Result<Json<Vec<Ticket>>> {
    state.hub.tickets(query.client_id).await.map(Json)
}

pub async fn patch_ticket(
    State(state): State<AppState>,
    _: AdminAuth,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<TicketPatchRequest>,
) -> Result<Json<Ticket>> {
    if req.status.is_none() && req.priority.is_none() {
        return Err(HubError::Validation("nothing to change".to_string()));
    }
    let patch = TicketPatch {
        status: req.status,
        priority: req.priority,
    };
    state.hub.update_ticket(id, patch).await.map(Json)
}

pub async fn comment_ticket(
    State(state): State<AppState>,
    _: AdminAuth,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<CommentRequest>,
) -> Result<(StatusCode, Json<Ticket>)> {
    let ticket = state.hub.comment_ticket(id, &req.body).await?;
    Ok((StatusCode::CREATED, Json(ticket)))
}
