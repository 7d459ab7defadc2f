use serde::{Deserialize, Serialize};

use fibernet_core::{DeviceId, TenantId};
use fibernet_infra::outcome_log::OutcomeEntry;

use crate::app::errors;

pub const DEFAULT_OUTCOME_LIMIT: u32 = 50;
pub const MAX_OUTCOME_LIMIT: u32 = 200;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct OutcomesQuery {
    pub device_id: Option<u64>,
    pub limit: Option<u32>,
}

impl OutcomesQuery {
    pub fn device_id(&self) -> Result<Option<DeviceId>, axum::response::Response> {
        self.device_id
            .map(DeviceId::new)
            .transpose()
            .map_err(|e| errors::json_error(axum::http::StatusCode::BAD_REQUEST, "invalid_device_id", e.to_string()))
    }

    pub fn limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_OUTCOME_LIMIT)
            .clamp(1, MAX_OUTCOME_LIMIT)
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct OutcomesResponse {
    pub tenant_id: TenantId,
    pub entries: Vec<OutcomeEntry>,
}

#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub tenant_id: TenantId,
    pub queue: String,
    pub enqueued: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_defaults_and_clamps() {
        assert_eq!(OutcomesQuery::default().limit(), DEFAULT_OUTCOME_LIMIT);
        assert_eq!(OutcomesQuery { device_id: None, limit: Some(0) }.limit(), 1);
        assert_eq!(OutcomesQuery { device_id: None, limit: Some(10_000) }.limit(), MAX_OUTCOME_LIMIT);
    }

    #[test]
    fn zero_device_id_is_rejected() {
        let query = OutcomesQuery { device_id: Some(0), limit: None };
        assert!(query.device_id().is_err());

        let query = OutcomesQuery { device_id: Some(9), limit: None };
        assert_eq!(query.device_id().ok().flatten(), Some(DeviceId::new(9).unwrap()));
    }
}
