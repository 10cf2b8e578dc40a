use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::distribution::{query, QueryPage};
use crate::error::AppResult;
use crate::model::now_millis;
use crate::routes::require_tenant;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EventsQuery {
    pub(crate) tenant_id: Option<String>,
    pub(crate) device_id: Option<String>,
    pub(crate) mac_address: Option<String>,
    pub(crate) since: Option<i64>,
}

impl EventsQuery {
    pub(crate) fn device(&self) -> Option<String> {
        self.device_id
            .as_deref()
            .or(self.mac_address.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    /// Explicit cursor, or the configured look-back window on a first call.
    pub(crate) fn since_or_window(&self, window_ms: i64) -> i64 {
        self.since
            .unwrap_or_else(|| now_millis().saturating_sub(window_ms))
    }
}

pub(crate) async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<EventsQuery>,
) -> AppResult<Json<QueryPage>> {
    let tenant_id = require_tenant(params.tenant_id.as_deref())?;
    let device = params.device();
    let page = query(
        &state.events,
        &tenant_id,
        device.as_deref(),
        params.since_or_window(state.config.pull_window_ms),
        state.config.query_page_limit,
    )
    .await?;
    Ok(Json(page))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/events", get(list_events))
}
