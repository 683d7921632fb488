//! HTTP resource adapter.
//!
//! Speaks a neutral JSON CRUD convention against a control-plane endpoint:
//!
//! ```text
//! POST   {base}/v1/resources/{type}/{name}   create, body = attributes
//! GET    {base}/v1/resources/{type}/{name}   read
//! PUT    {base}/v1/resources/{type}/{name}   update, body = attributes
//! DELETE {base}/v1/resources/{type}/{name}   delete
//! ```
//!
//! Request and response bodies are bare JSON objects holding the resource's
//! attribute map. Transient failures (network errors, rate limits) are
//! retried with a linear backoff before the error is surfaced.

use async_trait::async_trait;
use reqwest::{Client, Method, header};
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::{AttrMap, ResourceId};
use crate::error::{AdapterError, Result, TrellisError};

use super::ResourceAdapter;

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for transient failures.
const MAX_RETRIES: u32 = 3;

/// Delay between retries in milliseconds.
const RETRY_DELAY_MS: u64 = 1000;

/// Adapter that manages resources over HTTP.
#[derive(Debug, Clone)]
pub struct HttpAdapter {
    /// HTTP client.
    client: Client,
    /// Endpoint base URL, without a trailing slash.
    base_url: String,
    /// Bearer token, if the endpoint requires one.
    token: Option<String>,
}

impl HttpAdapter {
    /// Creates a new HTTP adapter with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: Option<&str>) -> Result<Self> {
        Self::with_timeout(endpoint, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates an adapter with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(endpoint: &str, token: Option<&str>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| AdapterError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: endpoint.trim_end_matches('/').to_string(),
            token: token.map(ToString::to_string),
        })
    }

    /// Builds the URL for a resource identity.
    fn resource_url(&self, id: &ResourceId) -> String {
        format!("{}/v1/resources/{}/{}", self.base_url, id.kind, id.name)
    }

    /// Sends a request, retrying transient failures.
    async fn send(
        &self,
        method: Method,
        id: &ResourceId,
        body: Option<&AttrMap>,
    ) -> Result<reqwest::Response> {
        let url = self.resource_url(id);
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                debug!("Retry attempt {attempt} of {MAX_RETRIES} for {id}");
                tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS * u64::from(attempt)))
                    .await;
            }

            match self.send_once(method.clone(), &url, id, body).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    let transient =
                        matches!(&e, TrellisError::Adapter(inner) if inner.is_transient());
                    if transient {
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            AdapterError::network("Max retries exceeded").into()
        }))
    }

    /// Sends a single request and maps the response status.
    async fn send_once(
        &self,
        method: Method,
        url: &str,
        id: &ResourceId,
        body: Option<&AttrMap>,
    ) -> Result<reqwest::Response> {
        trace!("{method} {url}");

        let operation = method.as_str().to_ascii_lowercase();
        let mut request = self
            .client
            .request(method, url)
            .header(header::CONTENT_TYPE, "application/json");

        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }

        if let Some(attributes) = body {
            request = request.json(attributes);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TrellisError::Adapter(AdapterError::Timeout {
                    identity: id.to_string(),
                    operation,
                })
            } else {
                TrellisError::Adapter(AdapterError::network(format!("Request failed: {e}")))
            }
        })?;

        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or_default();
            let retry_after = if retry_after == 0 { 60 } else { retry_after };

            return Err(TrellisError::Adapter(AdapterError::RateLimited {
                retry_after_secs: retry_after,
            }));
        }

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(TrellisError::Adapter(AdapterError::AuthenticationFailed {
                message: String::from("Invalid or missing API token"),
            }));
        }

        if status.as_u16() == 404 {
            return Err(TrellisError::Adapter(AdapterError::NotFound {
                identity: id.to_string(),
            }));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TrellisError::Adapter(AdapterError::request(
                status.as_u16(),
                body,
            )));
        }

        Ok(response)
    }

    /// Parses a response body as an attribute map.
    async fn parse_attributes(response: reqwest::Response) -> Result<AttrMap> {
        let value: serde_json::Value = response.json().await.map_err(|e| {
            AdapterError::InvalidResponse {
                message: format!("Failed to parse response: {e}"),
            }
        })?;

        match value {
            serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
            other => Err(AdapterError::InvalidResponse {
                message: format!("Expected a JSON object, got: {other}"),
            }
            .into()),
        }
    }
}

#[async_trait]
impl ResourceAdapter for HttpAdapter {
    async fn create(&self, id: &ResourceId, attributes: &AttrMap) -> Result<AttrMap> {
        debug!("Creating resource over HTTP: {id}");
        let response = self.send(Method::POST, id, Some(attributes)).await?;
        Self::parse_attributes(response).await
    }

    async fn read(&self, id: &ResourceId) -> Result<Option<AttrMap>> {
        match self.send(Method::GET, id, None).await {
            Ok(response) => Ok(Some(Self::parse_attributes(response).await?)),
            Err(TrellisError::Adapter(AdapterError::NotFound { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update(&self, id: &ResourceId, attributes: &AttrMap) -> Result<AttrMap> {
        debug!("Updating resource over HTTP: {id}");
        let response = self.send(Method::PUT, id, Some(attributes)).await?;
        Self::parse_attributes(response).await
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        debug!("Deleting resource over HTTP: {id}");
        self.send(Method::DELETE, id, None).await?;
        Ok(())
    }

    fn adapter_type(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn attrs(pairs: &[(&str, &str)]) -> AttrMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Value::String((*v).to_string())))
            .collect()
    }

    #[tokio::test]
    async fn test_create_posts_attributes() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/resources/gateway/edge"))
            .and(body_json(json!({ "cidr": "10.0.0.0/16" })))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!({ "id": "gw-1", "cidr": "10.0.0.0/16" })),
            )
            .mount(&server)
            .await;

        let adapter = HttpAdapter::new(&server.uri(), None).expect("adapter build failed");
        let id = ResourceId::new("gateway", "edge");

        let outputs = adapter
            .create(&id, &attrs(&[("cidr", "10.0.0.0/16")]))
            .await
            .expect("create failed");

        assert_eq!(outputs.get("id"), Some(&Value::String(String::from("gw-1"))));
    }

    #[tokio::test]
    async fn test_read_missing_resource_is_none() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/resources/vm/ghost"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let adapter = HttpAdapter::new(&server.uri(), None).expect("adapter build failed");
        let id = ResourceId::new("vm", "ghost");

        let result = adapter.read(&id).await.expect("read failed");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_bearer_token_attached() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/resources/segment/app"))
            .and(header("authorization", "Bearer sekret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "vlan": 100 })))
            .mount(&server)
            .await;

        let adapter =
            HttpAdapter::new(&server.uri(), Some("sekret")).expect("adapter build failed");
        let id = ResourceId::new("segment", "app");

        let result = adapter.read(&id).await.expect("read failed");
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn test_delete_propagates_not_found() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/v1/resources/vm/web-0"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let adapter = HttpAdapter::new(&server.uri(), None).expect("adapter build failed");
        let id = ResourceId::new("vm", "web-0");

        let err = adapter.delete(&id).await.expect_err("delete should fail");
        assert!(matches!(
            err,
            TrellisError::Adapter(AdapterError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_retried() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/resources/gateway/edge"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v1/resources/gateway/edge"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "gw-1" })))
            .mount(&server)
            .await;

        let adapter = HttpAdapter::new(&server.uri(), None).expect("adapter build failed");
        let id = ResourceId::new("gateway", "edge");

        let result = adapter.read(&id).await.expect("read should retry past 429");
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn test_auth_failure_not_retried() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/resources/gateway/edge"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let adapter =
            HttpAdapter::new(&server.uri(), Some("expired")).expect("adapter build failed");
        let id = ResourceId::new("gateway", "edge");

        let err = adapter
            .create(&id, &AttrMap::new())
            .await
            .expect_err("create should fail");
        assert!(matches!(
            err,
            TrellisError::Adapter(AdapterError::AuthenticationFailed { .. })
        ));
    }
}
