//! HTTP request handlers

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::server::AppContext;
use crate::db::history::PlayRecord;
use crate::error::{Error, Result};
use fleetbox_common::control::{ControlMessage, StatusMessage};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    module: String,
    version: String,
}

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    status: String,
    #[serde(rename = "type")]
    kind: String,
}

// ============================================================================
// Health
// ============================================================================

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        module: "fleetbox-node".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============================================================================
// Status
// ============================================================================

/// GET /status - latest deviceStatus, playbackStatus and downloadProgress
pub async fn status(State(ctx): State<AppContext>) -> Json<Vec<StatusMessage>> {
    Json(ctx.node.snapshot())
}

// ============================================================================
// History
// ============================================================================

const DEFAULT_HISTORY_LIMIT: u32 = 50;
const MAX_HISTORY_LIMIT: u32 = 1000;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    limit: Option<u32>,
}

/// GET /history?limit=N - most recent plays, newest first
pub async fn history(
    State(ctx): State<AppContext>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<PlayRecord>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    Ok(Json(ctx.node.history(limit).await?))
}

// ============================================================================
// Control channel
// ============================================================================

/// POST /control - one inbound fleet message
///
/// The body is parsed here rather than by the `Json` extractor so malformed
/// messages get the same 400 as invalid ones.
pub async fn control(
    State(ctx): State<AppContext>,
    body: String,
) -> Result<(StatusCode, Json<AcceptedResponse>)> {
    let message = ControlMessage::from_json(&body).map_err(|e| {
        warn!("Rejected control message: {}", e);
        Error::from(e)
    })?;
    let kind = message.kind();

    ctx.node.handle_control(message).await?;
    info!(kind, "Control message accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted".to_string(),
            kind: kind.to_string(),
        }),
    ))
}
