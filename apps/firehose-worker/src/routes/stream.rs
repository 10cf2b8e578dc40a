use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use futures::{Stream, StreamExt};

use crate::distribution::{subscribe, SubscribeParams};
use crate::error::AppResult;
use crate::routes::events::EventsQuery;
use crate::routes::require_tenant;
use crate::state::AppState;

pub(crate) async fn stream_events(
    State(state): State<AppState>,
    Query(params): Query<EventsQuery>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let tenant_id = require_tenant(params.tenant_id.as_deref())?;
    tracing::debug!(tenant = %tenant_id, "push subscriber connected");

    let messages = subscribe(
        state.events.clone(),
        state.stats.clone(),
        SubscribeParams {
            since: params.since_or_window(state.config.pull_window_ms),
            device_id: params.device(),
            tenant_id,
            limit: state.config.query_page_limit,
            tick: state.config.push_tick(),
        },
    );
    let events = messages.map(|message| Event::default().json_data(message));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/stream", get(stream_events))
}
