use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use chrono::Utc;

use fibernet_auth::{Actor, Capability, CapabilityPolicy, JwtValidator};
use fibernet_core::TenantId;
use fibernet_infra::sync::DailySyncDispatcher;

use crate::context::{PrincipalContext, TenantContext};

#[derive(Clone)]
pub struct AuthState {
    pub jwt: Arc<dyn JwtValidator>,
    pub policy: Arc<dyn CapabilityPolicy>,
}

pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = extract_bearer(req.headers())?;

    let claims = state
        .jwt
        .validate(token, Utc::now())
        .map_err(|_e| StatusCode::UNAUTHORIZED)?;

    let actor = Actor {
        principal_id: claims.sub,
        tenant_id: claims.tenant_id,
        roles: claims.roles,
        permissions: claims.permissions,
    };
    let capabilities = state.policy.capabilities(&actor);

    req.extensions_mut()
        .insert(TenantContext::new(actor.tenant_id));
    req.extensions_mut().insert(PrincipalContext::new(
        actor.principal_id,
        actor.roles,
        capabilities,
    ));

    Ok(next.run(req).await)
}

fn extract_bearer(headers: &HeaderMap) -> Result<&str, StatusCode> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let header = header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;

    let header = header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = header.trim();
    if token.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(token)
}

/// Opportunistic daily sync, triggered by authenticated traffic.
#[derive(Clone)]
pub struct OnAccessSync {
    dispatcher: Arc<DailySyncDispatcher>,
    enabled: bool,
    limiter: Arc<TenantRateLimiter>,
}

impl OnAccessSync {
    pub fn new(dispatcher: Arc<DailySyncDispatcher>, enabled: bool, min_interval: Duration) -> Self {
        Self {
            dispatcher,
            enabled,
            limiter: Arc::new(TenantRateLimiter::new(min_interval)),
        }
    }

    /// Fire the gate for the principal's tenant without waiting on it.
    /// Returns whether an attempt was spawned.
    pub fn trigger(&self, tenant: &TenantContext, principal: &PrincipalContext) -> bool {
        if !self.enabled || !principal.can(Capability::ManageDevices) {
            return false;
        }

        let tenant_id = tenant.tenant_id();
        if !self.limiter.try_claim(tenant_id, Instant::now()) {
            return false;
        }

        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            match dispatcher.dispatch_for_tenant_once_per_day(tenant_id).await {
                Ok(count) => tracing::debug!(tenant_id = %tenant_id, count, "on-access sync gate ran"),
                Err(e) => tracing::debug!(tenant_id = %tenant_id, error = %e, "on-access sync gate failed"),
            }
        });
        true
    }
}

/// Runs after [`auth_middleware`]; never affects the response.
pub async fn on_access_sync_middleware(
    State(state): State<OnAccessSync>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let tenant = req.extensions().get::<TenantContext>().copied();
    let principal = req.extensions().get::<PrincipalContext>();
    if let (Some(tenant), Some(principal)) = (tenant, principal) {
        state.trigger(&tenant, principal);
    }

    next.run(req).await
}

/// At most one attempt per tenant per interval.
#[derive(Debug)]
pub struct TenantRateLimiter {
    min_interval: Duration,
    last_attempt: Mutex<HashMap<TenantId, Instant>>,
}

impl TenantRateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_attempt: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_claim(&self, tenant_id: TenantId, now: Instant) -> bool {
        let mut last = self.last_attempt.lock().unwrap_or_else(PoisonError::into_inner);
        match last.get(&tenant_id) {
            Some(at) if now.saturating_duration_since(*at) < self.min_interval => false,
            _ => {
                last.insert(tenant_id, now);
                true
            }
        }
    }
}
