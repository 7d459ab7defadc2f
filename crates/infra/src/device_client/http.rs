//! `DeviceClient` over the device-management service's HTTP API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use fibernet_core::TenantId;

use super::{DeviceClient, DeviceClientError, DeviceClientFactory, SyncReport};
use crate::devices::Device;

const SUPPRESS_HEADER: &str = "X-Suppress-Action-Log";
const TENANT_HEADER: &str = "X-Tenant-Id";

#[derive(Debug, Serialize)]
struct ConnectRequest<'a> {
    device_id: u64,
    host: &'a str,
    port: u16,
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    session_id: String,
}

pub struct HttpDeviceClient {
    http: reqwest::Client,
    base_url: String,
    tenant_id: TenantId,
    suppress_logging: bool,
    session: Option<String>,
}

impl HttpDeviceClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, tenant_id: TenantId) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tenant_id,
            suppress_logging: false,
            session: None,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header(TENANT_HEADER, self.tenant_id.to_string());
        if self.suppress_logging {
            req = req.header(SUPPRESS_HEADER, "1");
        }
        req
    }

    async fn send(req: reqwest::RequestBuilder) -> Result<reqwest::Response, DeviceClientError> {
        let resp = req
            .send()
            .await
            .map_err(|e| DeviceClientError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            return Err(DeviceClientError::Api(status, resp.text().await.unwrap_or_default()));
        }
        Ok(resp)
    }
}

#[async_trait]
impl DeviceClient for HttpDeviceClient {
    fn suppress_interactive_logging(&mut self, suppress: bool) {
        self.suppress_logging = suppress;
    }

    #[instrument(skip(self, device), fields(tenant_id = %self.tenant_id, device_id = %device.id), err)]
    async fn connect(&mut self, device: &Device) -> Result<(), DeviceClientError> {
        let body = ConnectRequest {
            device_id: device.id.get(),
            host: &device.host,
            port: device.port,
            username: &device.username,
            password: &device.password,
        };
        let resp = Self::send(self.request(reqwest::Method::POST, "/sessions").json(&body)).await?;
        let session: SessionResponse = resp
            .json()
            .await
            .map_err(|e| DeviceClientError::Parse(e.to_string()))?;

        debug!(session_id = %session.session_id, "device session opened");
        self.session = Some(session.session_id);
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %self.tenant_id), err)]
    async fn sync_all_to_local(&mut self) -> Result<SyncReport, DeviceClientError> {
        let session = self.session.as_deref().ok_or(DeviceClientError::NotConnected)?;
        let path = format!("/sessions/{session}/sync-all");
        let resp = Self::send(self.request(reqwest::Method::POST, &path)).await?;
        resp.json()
            .await
            .map_err(|e| DeviceClientError::Parse(e.to_string()))
    }

    async fn disconnect(&mut self) -> Result<(), DeviceClientError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        let path = format!("/sessions/{session}");
        Self::send(self.request(reqwest::Method::DELETE, &path)).await?;
        Ok(())
    }
}

/// Hands out clients sharing one connection pool.
#[derive(Debug, Clone)]
pub struct HttpDeviceClientFactory {
    http: reqwest::Client,
    base_url: String,
}

impl HttpDeviceClientFactory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

impl DeviceClientFactory for HttpDeviceClientFactory {
    fn create(&self, tenant_id: TenantId) -> Box<dyn DeviceClient> {
        Box::new(HttpDeviceClient::new(self.http.clone(), self.base_url.clone(), tenant_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{delete, post};
    use axum::{Json, Router};
    use fibernet_core::DeviceId;

    #[derive(Clone, Default)]
    struct Seen {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Seen {
        fn push(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    fn header(headers: &HeaderMap, name: &str) -> String {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string()
    }

    async fn open(State(seen): State<Seen>, headers: HeaderMap, Json(body): Json<serde_json::Value>) -> Json<serde_json::Value> {
        seen.push(format!(
            "open host={} suppress={} tenant={}",
            body["host"].as_str().unwrap_or_default(),
            header(&headers, SUPPRESS_HEADER),
            header(&headers, TENANT_HEADER)
        ));
        Json(serde_json::json!({ "session_id": "s-1" }))
    }

    async fn sync_all(State(seen): State<Seen>, Path(id): Path<String>) -> Result<Json<serde_json::Value>, StatusCode> {
        seen.push(format!("sync {id}"));
        if id != "s-1" {
            return Err(StatusCode::NOT_FOUND);
        }
        Ok(Json(serde_json::json!({
            "synced_count": 42,
            "ports": ["0/1/1", "0/1/2"],
            "name_sync_updated": 3
        })))
    }

    async fn close(State(seen): State<Seen>, Path(id): Path<String>) -> StatusCode {
        seen.push(format!("close {id}"));
        StatusCode::NO_CONTENT
    }

    async fn serve(seen: Seen) -> String {
        let app = Router::new()
            .route("/sessions", post(open))
            .route("/sessions/:id/sync-all", post(sync_all))
            .route("/sessions/:id", delete(close))
            .with_state(seen);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn device() -> Device {
        Device::new(TenantId::new(4).unwrap(), DeviceId::new(9).unwrap(), "OLT-9", "10.1.1.9")
            .unwrap()
            .with_credentials("admin", "pw")
    }

    #[tokio::test]
    async fn session_lifecycle_against_service() {
        let seen = Seen::default();
        let base = serve(seen.clone()).await;
        let mut client = HttpDeviceClientFactory::new(base).create(TenantId::new(4).unwrap());

        client.suppress_interactive_logging(true);
        client.connect(&device()).await.unwrap();
        let report = client.sync_all_to_local().await.unwrap();
        client.disconnect().await.unwrap();
        // Second disconnect has no session left to close.
        client.disconnect().await.unwrap();

        assert_eq!(report.synced_count, 42);
        assert_eq!(report.ports.len(), 2);
        assert_eq!(report.name_sync_updated, 3);
        assert_eq!(
            *seen.calls.lock().unwrap(),
            vec![
                "open host=10.1.1.9 suppress=1 tenant=4".to_string(),
                "sync s-1".to_string(),
                "close s-1".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn sync_without_session_is_rejected_locally() {
        let mut client = HttpDeviceClient::new(reqwest::Client::new(), "http://127.0.0.1:9", TenantId::new(1).unwrap());
        assert_eq!(
            client.sync_all_to_local().await.unwrap_err(),
            DeviceClientError::NotConnected
        );
    }

    #[tokio::test]
    async fn unreachable_service_is_a_network_error() {
        let mut client = HttpDeviceClient::new(reqwest::Client::new(), "http://127.0.0.1:9", TenantId::new(1).unwrap());
        assert!(matches!(
            client.connect(&device()).await,
            Err(DeviceClientError::Network(_))
        ));
    }
}
