use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::registry::{Registration, TenantStatus};
use crate::routes::require_tenant;
use crate::state::AppState;
use crate::supervisor::TenantStreamState;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RegisterRequest {
    tenant_id: Option<String>,
    tenant_name: Option<String>,
    api_key: Option<String>,
    active: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct RegisterResponse {
    success: bool,
    message: String,
}

/// Stored intent plus, when this process runs a unit for the tenant, its live
/// connection state. A rejected or missing credential shows up under `stream`.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct StatusResponse {
    #[serde(flatten)]
    status: TenantStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<TenantStreamState>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StatusQuery {
    tenant_id: Option<String>,
}

pub(crate) async fn register_tenant(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> AppResult<Json<RegisterResponse>> {
    let tenant_id = require_tenant(body.tenant_id.as_deref())?;
    let tenant = state
        .registry
        .register(&Registration {
            tenant_id,
            display_name: body.tenant_name,
            api_key: body.api_key,
            active: body.active,
        })
        .await?;

    let message = if tenant.has_credential() {
        format!("Tenant {} registered", tenant.id)
    } else {
        format!("Tenant {} registered without an API key", tenant.id)
    };
    Ok(Json(RegisterResponse {
        success: true,
        message,
    }))
}

pub(crate) async fn tenant_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> AppResult<Json<StatusResponse>> {
    let tenant_id = require_tenant(query.tenant_id.as_deref())?;
    let status = state.registry.status(&tenant_id).await?;
    let stream = state.supervisor.tenant_state(&tenant_id).await;
    Ok(Json(StatusResponse { status, stream }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register_tenant))
        .route("/status", get(tenant_status))
}
