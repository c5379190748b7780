//! JSON-over-HTTP control-plane client.
//!
//! ```text
//! GET  {base}/clusters/{cluster}/services/{service}              -> ServiceStatus
//! GET  {base}/clusters/{cluster}/services/{service}/active-spec  -> WorkloadSpec
//! POST {base}/specs                                              -> WorkloadSpec
//! PUT  {base}/clusters/{cluster}/services/{service}/active-spec  <- {spec_id, force_new_rollout}
//! ```
//!
//! Status mapping: 404 is `NotFound`, 400/409/422 are `Rejected`,
//! 408/429/5xx and transport failures are `Transient`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{ControlPlane, ControlPlaneError, PlaneResult};
use crate::spec::{SpecDraft, WorkloadSpec};
use crate::types::{ServiceRef, ServiceStatus, SpecId};

#[derive(Serialize)]
struct SetActiveSpecBody<'a> {
    spec_id: &'a SpecId,
    force_new_rollout: bool,
}

pub struct HttpControlPlane {
    client: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl HttpControlPlane {
    pub fn new(
        endpoint: impl Into<String>,
        request_timeout: Duration,
        token: Option<String>,
    ) -> PlaneResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("rollout/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ControlPlaneError::Transient(format!("building http client: {e}")))?;
        Ok(Self {
            client,
            base: endpoint.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.base
    }

    fn service_url(&self, service: &ServiceRef) -> String {
        format!(
            "{}/clusters/{}/services/{}",
            self.base, service.cluster, service.service
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let req = self.client.request(method, url);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder, what: &str) -> PlaneResult<reqwest::Response> {
        let resp = req.send().await.map_err(|e| transport_error(what, e))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(status_error(status, what, body.trim()))
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder, what: &str) -> PlaneResult<T> {
        let resp = self.send(req, what).await?;
        let bytes = resp.bytes().await.map_err(|e| transport_error(what, e))?;
        serde_json::from_slice(&bytes).map_err(|e| ControlPlaneError::Decode(format!("{what}: {e}")))
    }
}

fn transport_error(what: &str, e: reqwest::Error) -> ControlPlaneError {
    if e.is_decode() {
        ControlPlaneError::Decode(format!("{what}: {e}"))
    } else {
        ControlPlaneError::Transient(format!("{what}: {e}"))
    }
}

fn status_error(status: StatusCode, what: &str, body: &str) -> ControlPlaneError {
    let msg = if body.is_empty() {
        format!("{what}: HTTP {status}")
    } else {
        format!("{what}: HTTP {status}: {body}")
    };
    match status {
        StatusCode::NOT_FOUND => ControlPlaneError::NotFound(msg),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            ControlPlaneError::Transient(msg)
        }
        s if s.is_server_error() => ControlPlaneError::Transient(msg),
        _ => ControlPlaneError::Rejected(msg),
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn get_service(&self, service: &ServiceRef) -> PlaneResult<ServiceStatus> {
        let url = self.service_url(service);
        self.send_json(self.request(Method::GET, &url), &format!("service {service}"))
            .await
    }

    async fn get_active_spec(&self, service: &ServiceRef) -> PlaneResult<WorkloadSpec> {
        let url = format!("{}/active-spec", self.service_url(service));
        self.send_json(
            self.request(Method::GET, &url),
            &format!("active spec of {service}"),
        )
        .await
    }

    async fn register_spec(&self, draft: &SpecDraft) -> PlaneResult<WorkloadSpec> {
        let url = format!("{}/specs", self.base);
        self.send_json(
            self.request(Method::POST, &url).json(draft),
            &format!("register {}", draft.family),
        )
        .await
    }

    async fn set_active_spec(
        &self,
        service: &ServiceRef,
        spec_id: &SpecId,
        force_new_rollout: bool,
    ) -> PlaneResult<()> {
        let url = format!("{}/active-spec", self.service_url(service));
        let body = SetActiveSpecBody {
            spec_id,
            force_new_rollout,
        };
        self.send(
            self.request(Method::PUT, &url).json(&body),
            &format!("activate {spec_id} on {service}"),
        )
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
