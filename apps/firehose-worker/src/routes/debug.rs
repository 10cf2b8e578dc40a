use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::error::AppResult;
use crate::model::PersistedEvent;
use crate::pipeline::IngestStatsSnapshot;
use crate::state::AppState;
use crate::store::DeviceSummary;
use crate::supervisor::TenantStreamState;

const RECENT_EVENTS: i64 = 5;

/// Tenant listing with the credential reduced to a presence flag.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TenantSummary {
    id: String,
    name: String,
    is_active: bool,
    credential_configured: bool,
    last_seen: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DebugResponse {
    event_count: i64,
    devices: Vec<DeviceSummary>,
    tenants: Vec<TenantSummary>,
    recent_events: Vec<PersistedEvent>,
    streams: Vec<TenantStreamState>,
    ingest: IngestStatsSnapshot,
}

pub(crate) async fn debug_stats(State(state): State<AppState>) -> AppResult<Json<DebugResponse>> {
    let stats = state.events.stats(RECENT_EVENTS).await?;
    let tenants = state
        .registry
        .list()
        .await?
        .into_iter()
        .map(|tenant| TenantSummary {
            credential_configured: tenant.has_credential(),
            id: tenant.id,
            name: tenant.display_name,
            is_active: tenant.is_active,
            last_seen: tenant.last_seen,
        })
        .collect();

    Ok(Json(DebugResponse {
        event_count: stats.event_count,
        devices: stats.devices,
        tenants,
        recent_events: stats.recent_events,
        streams: state.supervisor.snapshot().await,
        ingest: state.stats.snapshot(),
    }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/debug", get(debug_stats))
}
