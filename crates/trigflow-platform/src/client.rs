// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HttpPlatform client for the platform's JSON API.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};
use url::Url;

use crate::config::PlatformConfig;
use crate::error::{PlatformError, Result};
use crate::platform::RemotePlatform;
use crate::types::{
    ElementHandle, OperationOutputs, RunHandle, RunKind, StartOperationRequest, StatusReport,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveResponse {
    element_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartWorkflowBody<'a> {
    template_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct StartWorkflowResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct StartOperationResponse {
    handle: String,
}

#[derive(Debug, Deserialize)]
struct InvocationResponse {
    #[serde(flatten)]
    report: StatusReport,
    #[serde(default)]
    outputs: OperationOutputs,
}

/// Platform client speaking JSON over HTTP.
///
/// | Call | Request |
/// |------|---------|
/// | `resolve_reference` | `GET references/resolve?expr=..` |
/// | `read_value` / `write_value` | `GET` / `PUT elements/{id}/value` |
/// | `upload_attachment` | `PUT elements/{id}/attachment?fileName=..` |
/// | `start_workflow` | `POST workflows` |
/// | `start_operation` | `POST operations/{id}/invocations` |
/// | `poll_status` | `GET workflows/{name}/status` or `GET invocations/{name}` |
pub struct HttpPlatform {
    http: reqwest::Client,
    config: PlatformConfig,
}

impl HttpPlatform {
    /// Create a new client with the given configuration.
    pub fn new(config: PlatformConfig) -> Result<Self> {
        if config.base_url.cannot_be_a_base() {
            return Err(PlatformError::Config(format!(
                "base URL cannot carry a path: {}",
                config.base_url
            )));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| PlatformError::Config(e.to_string()))?;

        Ok(Self { http, config })
    }

    /// Create a client from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(PlatformConfig::from_env()?)
    }

    /// Get the client configuration.
    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.config.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| PlatformError::Config("base URL cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn transport_error(&self, err: reqwest::Error) -> PlatformError {
        if err.is_timeout() {
            PlatformError::Timeout(self.config.request_timeout.as_millis() as u64)
        } else if err.is_decode() {
            PlatformError::Serialization(err.to_string())
        } else {
            PlatformError::Connection(err.to_string())
        }
    }

    /// Turn a non-success response into an error. 404 is mapped by the caller.
    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| status.canonical_reason().unwrap_or("").to_string());
        Err(PlatformError::Server {
            status: status.as_u16(),
            message,
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        request.send().await.map_err(|e| self.transport_error(e))
    }

    async fn get_invocation(&self, run: &RunHandle) -> Result<InvocationResponse> {
        let url = self.endpoint(&["invocations", &run.name])?;
        let response = self.send(self.http.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(PlatformError::RunNotFound(run.name.clone()));
        }

        self.check(response)
            .await?
            .json()
            .await
            .map_err(|e| self.transport_error(e))
    }
}

#[async_trait]
impl RemotePlatform for HttpPlatform {
    #[instrument(skip(self))]
    async fn resolve_reference(&self, expression: &str) -> Result<ElementHandle> {
        debug!("Resolving element reference");

        let url = self.endpoint(&["references", "resolve"])?;
        let response = self
            .send(self.http.get(url).query(&[("expr", expression)]))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(PlatformError::UnresolvedReference(expression.to_string()));
        }

        let body: ResolveResponse = self
            .check(response)
            .await?
            .json()
            .await
            .map_err(|e| self.transport_error(e))?;

        Ok(ElementHandle {
            expression: expression.to_string(),
            element_id: body.element_id,
        })
    }

    #[instrument(skip(self), fields(element = %element.expression))]
    async fn read_value(&self, element: &ElementHandle) -> Result<Value> {
        let url = self.endpoint(&["elements", &element.element_id, "value"])?;
        let response = self.send(self.http.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(PlatformError::UnresolvedReference(element.expression.clone()));
        }

        self.check(response)
            .await?
            .json()
            .await
            .map_err(|e| self.transport_error(e))
    }

    #[instrument(skip(self, value), fields(element = %element.expression))]
    async fn write_value(&self, element: &ElementHandle, value: Value) -> Result<()> {
        let url = self.endpoint(&["elements", &element.element_id, "value"])?;
        let response = self.send(self.http.put(url).json(&value)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(PlatformError::UnresolvedReference(element.expression.clone()));
        }

        self.check(response).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn start_workflow(&self, template_id: &str) -> Result<RunHandle> {
        info!("Starting workflow");

        let url = self.endpoint(&["workflows"])?;
        let response = self
            .send(self.http.post(url).json(&StartWorkflowBody { template_id }))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(PlatformError::TemplateNotFound(template_id.to_string()));
        }

        let body: StartWorkflowResponse = self
            .check(response)
            .await?
            .json()
            .await
            .map_err(|e| self.transport_error(e))?;

        Ok(RunHandle::workflow(body.name))
    }

    #[instrument(skip(self, request), fields(operation = %operation.expression))]
    async fn start_operation(
        &self,
        operation: &ElementHandle,
        request: StartOperationRequest,
    ) -> Result<RunHandle> {
        info!(inputs = request.inputs.len(), "Invoking operation");

        let url = self.endpoint(&["operations", &operation.element_id, "invocations"])?;
        let response = self.send(self.http.post(url).json(&request)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(PlatformError::UnresolvedReference(
                operation.expression.clone(),
            ));
        }

        let body: StartOperationResponse = self
            .check(response)
            .await?
            .json()
            .await
            .map_err(|e| self.transport_error(e))?;

        Ok(RunHandle::operation(body.handle))
    }

    #[instrument(skip(self), fields(run = %run.name))]
    async fn poll_status(&self, run: &RunHandle) -> Result<StatusReport> {
        match run.kind {
            RunKind::Workflow => {
                let url = self.endpoint(&["workflows", &run.name, "status"])?;
                let response = self.send(self.http.get(url)).await?;
                if response.status() == StatusCode::NOT_FOUND {
                    return Err(PlatformError::RunNotFound(run.name.clone()));
                }

                self.check(response)
                    .await?
                    .json()
                    .await
                    .map_err(|e| self.transport_error(e))
            }
            RunKind::Operation => Ok(self.get_invocation(run).await?.report),
        }
    }

    #[instrument(skip(self), fields(run = %run.name))]
    async fn fetch_outputs(&self, run: &RunHandle) -> Result<OperationOutputs> {
        match run.kind {
            RunKind::Workflow => Ok(OperationOutputs::new()),
            RunKind::Operation => Ok(self.get_invocation(run).await?.outputs),
        }
    }

    #[instrument(skip(self, content), fields(element = %element.expression, bytes = content.len()))]
    async fn upload_attachment(
        &self,
        element: &ElementHandle,
        file_name: &str,
        content: Vec<u8>,
    ) -> Result<()> {
        let url = self.endpoint(&["elements", &element.element_id, "attachment"])?;
        let response = self
            .send(
                self.http
                    .put(url)
                    .query(&[("fileName", file_name)])
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(content),
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(PlatformError::UnresolvedReference(element.expression.clone()));
        }

        self.check(response).await?;
        debug!(file_name, "Attachment uploaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_appends_segments() {
        let config = PlatformConfig::new().with_base_url(Url::parse("http://host:1/api/").unwrap());
        let client = HttpPlatform::new(config).unwrap();

        let url = client.endpoint(&["workflows", "wf 1", "status"]).unwrap();
        assert_eq!(url.as_str(), "http://host:1/api/workflows/wf%201/status");
    }

    #[test]
    fn test_endpoint_without_trailing_slash() {
        let config = PlatformConfig::new().with_base_url(Url::parse("http://host:1").unwrap());
        let client = HttpPlatform::new(config).unwrap();

        let url = client.endpoint(&["references", "resolve"]).unwrap();
        assert_eq!(url.as_str(), "http://host:1/references/resolve");
    }

    #[test]
    fn test_rejects_cannot_be_a_base_url() {
        let config = PlatformConfig::new().with_base_url(Url::parse("mailto:ops@example.com").unwrap());
        assert!(matches!(
            HttpPlatform::new(config),
            Err(PlatformError::Config(_))
        ));
    }
}
