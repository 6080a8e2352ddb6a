//! REST API route handlers for the daemon HTTP server

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::catalog::Server;
use crate::directory::{section_title, DirectoryRow};
use crate::error::{CatalogError, SelectionError, SkyLinkError};
use crate::service::{StatusSnapshot, VpnService};
use crate::session::RequestOutcome;

/// Shared application state for route handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<VpnService>,
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub code: i32,
    pub message: String,
}

impl From<SkyLinkError> for ApiError {
    fn from(e: SkyLinkError) -> Self {
        let status = match &e {
            SkyLinkError::Selection(SelectionError::SubscriptionRequired { .. }) => {
                StatusCode::PAYMENT_REQUIRED
            }
            SkyLinkError::Selection(SelectionError::UnknownServer { .. }) => StatusCode::NOT_FOUND,
            SkyLinkError::Selection(SelectionError::NoServerAvailable { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            SkyLinkError::Catalog(CatalogError::CacheMiss) => StatusCode::SERVICE_UNAVAILABLE,
            SkyLinkError::Network(_) | SkyLinkError::Catalog(CatalogError::Fetch(_)) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: e.exit_code(),
            message: e.user_message(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

/// Build the API router with all routes
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/connect", post(handle_connect))
        .route("/api/v1/disconnect", post(handle_disconnect))
        .route("/api/v1/status", get(handle_status))
        .route("/api/v1/servers", get(handle_list_servers))
        .route("/api/v1/servers/select", post(handle_select_server))
        .route("/api/v1/servers/refresh", post(handle_refresh_servers))
        // SSE events stream
        .route("/api/v1/events", get(handle_events_sse))
        .with_state(state)
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct OutcomeResponse {
    pub outcome: RequestOutcome,
}

#[derive(Debug, Deserialize)]
pub struct ServersQuery {
    pub q: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SectionView {
    pub section: usize,
    pub title: &'static str,
    pub rows: Vec<DirectoryRow>,
}

#[derive(Debug, Serialize)]
pub struct ServersResponse {
    pub searching: bool,
    pub sections: Vec<SectionView>,
}

#[derive(Debug, Deserialize)]
pub struct SelectServerRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub servers: usize,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/connect
pub async fn handle_connect(State(state): State<AppState>) -> Result<Json<OutcomeResponse>, ApiError> {
    let outcome = state.service.connect().await?;
    Ok(Json(OutcomeResponse { outcome }))
}

/// POST /api/v1/disconnect
pub async fn handle_disconnect(
    State(state): State<AppState>,
) -> Result<Json<OutcomeResponse>, ApiError> {
    let outcome = state.service.disconnect().await?;
    Ok(Json(OutcomeResponse { outcome }))
}

/// GET /api/v1/status
pub async fn handle_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.service.status().await)
}

/// GET /api/v1/servers?q=
pub async fn handle_list_servers(
    State(state): State<AppState>,
    Query(query): Query<ServersQuery>,
) -> Result<Json<ServersResponse>, ApiError> {
    let searching = query.q.as_deref().is_some_and(|q| !q.trim().is_empty());
    let rows = state.service.servers(query.q.as_deref()).await?;

    let sections = (0..2)
        .filter_map(|section| {
            let title = section_title(section)?;
            let rows = rows.iter().filter(|r| r.section() == section).cloned().collect();
            Some(SectionView {
                section,
                title,
                rows,
            })
        })
        .collect();

    Ok(Json(ServersResponse { searching, sections }))
}

/// POST /api/v1/servers/select
pub async fn handle_select_server(
    State(state): State<AppState>,
    Json(request): Json<SelectServerRequest>,
) -> Result<Json<Server>, ApiError> {
    let server = state.service.select_server(&request.name).await?;
    Ok(Json(server))
}

/// POST /api/v1/servers/refresh
pub async fn handle_refresh_servers(
    State(state): State<AppState>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let servers = state.service.refresh().await?;
    Ok(Json(RefreshResponse { servers }))
}

// ============================================================================
// Server-Sent Events
// ============================================================================

/// GET /api/v1/events - SSE stream of session events
pub async fn handle_events_sse(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.service.events().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| {
        result
            .ok()
            .and_then(|event| Event::default().json_data(&event).ok())
            .map(Ok)
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
