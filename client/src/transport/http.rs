//! HTTP transport built on `reqwest`.

use async_trait::async_trait;
use fieldsync_engine::Method;
use serde_json::Value;

use super::{Transport, TransportError, TransportRequest, TransportResponse};

/// [`Transport`] that speaks JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl HttpTransport {
    /// Create a transport. Relative endpoints are resolved against `base_url`.
    pub fn new(base_url: Option<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Create a transport around a preconfigured client (timeouts, proxies).
    pub fn with_client(client: reqwest::Client, base_url: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.map(|url| url.trim_end_matches('/').to_string()),
        }
    }

    /// Resolve an endpoint to an absolute URL.
    pub fn url(&self, endpoint: &str) -> Result<String, TransportError> {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return Ok(endpoint.to_string());
        }
        let base = self.base_url.as_deref().ok_or_else(|| {
            TransportError::InvalidRequest(format!(
                "relative endpoint '{endpoint}' without a base URL"
            ))
        })?;
        Ok(format!("{}/{}", base, endpoint.trim_start_matches('/')))
    }
}

fn http_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        let url = self.url(&request.endpoint)?;
        let mut builder = self.client.request(http_method(request.method), &url);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(payload) = &request.payload {
            if request.method != Method::Get {
                builder = builder.json(payload);
            }
        }

        let response = builder.send().await.map_err(|e| {
            tracing::debug!(url = %url, error = %e, "Request did not reach the server");
            TransportError::Unreachable(e.to_string())
        })?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };

        Ok(TransportResponse { status, body })
    }
}
