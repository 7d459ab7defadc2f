use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use fibernet_auth::{require, Capability};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::{PrincipalContext, TenantContext};

pub fn router() -> Router {
    Router::new()
        .route("/outcomes", get(list_outcomes))
        .route("/dispatch", post(dispatch))
}

/// Recent sync outcomes for the caller's tenant, newest first.
pub async fn list_outcomes(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Query(query): Query<dto::OutcomesQuery>,
) -> axum::response::Response {
    let device_id = match query.device_id() {
        Ok(d) => d,
        Err(resp) => return resp,
    };

    match services
        .outcomes
        .recent(tenant.tenant_id(), device_id, query.limit())
        .await
    {
        Ok(entries) => Json(dto::OutcomesResponse {
            tenant_id: tenant.tenant_id(),
            entries,
        })
        .into_response(),
        Err(e) => errors::outcome_error_to_response(e),
    }
}

/// Run the once-per-day gate for the caller's tenant.
pub async fn dispatch(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    if let Err(e) = require(principal.capabilities(), Capability::ManageDevices) {
        return errors::json_error(StatusCode::FORBIDDEN, "forbidden", e.to_string());
    }

    match services
        .dispatcher
        .dispatch_for_tenant_once_per_day(tenant.tenant_id())
        .await
    {
        Ok(enqueued) => (
            StatusCode::ACCEPTED,
            Json(dto::DispatchResponse {
                tenant_id: tenant.tenant_id(),
                queue: services.dispatcher.settings().queue.clone(),
                enqueued,
            }),
        )
            .into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}
