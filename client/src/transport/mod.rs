//! Transport and authentication collaborators.
//!
//! The scheduler and coordinator talk to the backend only through
//! [`Transport`]. Every outgoing request is stamped with a bearer token from an
//! [`AuthTokenProvider`], consulted per request so refreshed tokens are picked
//! up without restarting.

mod http;

pub use http::HttpTransport;

use async_trait::async_trait;
use fieldsync_engine::{ErrorClass, Fields, Method};
use serde_json::Value;
use std::collections::BTreeMap;

/// A request handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: Method,
    pub endpoint: String,
    pub payload: Option<Value>,
    pub headers: BTreeMap<String, String>,
}

impl TransportRequest {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            payload: None,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add an `Authorization` header when the provider has a token.
    pub fn authorized(self, auth: &dyn AuthTokenProvider) -> Self {
        match auth.token() {
            Some(token) => self.with_header("Authorization", format!("Bearer {token}")),
            None => self,
        }
    }
}

/// A response received from the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Value,
}

impl TransportResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Failure class, `None` on success.
    pub fn error_class(&self) -> Option<ErrorClass> {
        ErrorClass::from_status(self.status)
    }

    /// The body as an entity-like object, if it is one.
    pub fn body_fields(&self) -> Option<&Fields> {
        self.body.as_object().filter(|fields| !fields.is_empty())
    }

    /// Short human-readable description for `lastError`.
    pub fn describe(&self) -> String {
        let detail = self
            .body
            .get("error")
            .and_then(Value::as_str)
            .or_else(|| self.body.as_str());
        match detail {
            Some(detail) => format!("HTTP {}: {}", self.status, detail),
            None => format!("HTTP {}", self.status),
        }
    }
}

/// Failures below the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection refused, DNS failure, timeout and the like
    #[error("server unreachable: {0}")]
    Unreachable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Executes requests against the backend.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: TransportRequest)
        -> Result<TransportResponse, TransportError>;
}

/// Supplies the bearer token for outgoing requests.
pub trait AuthTokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// A fixed token, or none at all.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl AuthTokenProvider for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}
