pub mod debug;
pub mod events;
pub mod health;
pub mod stream;
pub mod tenants;

use axum::Router;
use tower_http::cors::CorsLayer;

use crate::error::{AppError, AppResult};
use crate::model::clean_tenant_id;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .nest(
            "/api/firehose",
            Router::new()
                .merge(tenants::router())
                .merge(events::router())
                .merge(stream::router())
                .merge(debug::router()),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Cleans a tenant id taken from a request; missing or blank ids are a 400.
pub(crate) fn require_tenant(raw: Option<&str>) -> AppResult<String> {
    raw.map(clean_tenant_id)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::bad_request("tenantId is required"))
}
