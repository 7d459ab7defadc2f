//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: backends, dispatch gate, sync job and executor wiring
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

use services::AppServices;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<AppServices>, jwt_secret: &str) -> Router {
    let jwt = Arc::new(fibernet_auth::Hs256JwtValidator::new(jwt_secret.as_bytes()));
    let auth_state = middleware::AuthState {
        jwt,
        policy: services.policy.clone(),
    };
    let on_access = middleware::OnAccessSync::new(
        services.dispatcher.clone(),
        services.config.on_access_enabled,
        services.config.on_access_min_interval,
    );

    // Protected routes: auth runs first, then the on-access trigger.
    let protected = routes::router()
        .layer(Extension(services))
        .layer(axum::middleware::from_fn_with_state(
            on_access,
            middleware::on_access_sync_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
        .layer(ServiceBuilder::new())
}
