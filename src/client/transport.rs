//! HTTP transport seam.
//!
//! Epistemic foundation:
//! - B_i: Origin will respond within timeout (might fail)
//! - I^B: Network availability unknowable → surfaced as retryable errors

use crate::models::{ExportError, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// One logical call against the origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiRequest {
    /// GraphQL POST with a `{"query": ...}` body
    Graphql { path: String, query: String },
    /// REST GET with query parameters
    Get {
        path: String,
        params: Vec<(String, String)>,
    },
}

impl ApiRequest {
    pub fn graphql(path: impl Into<String>, query: impl Into<String>) -> Self {
        Self::Graphql {
            path: path.into(),
            query: query.into(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::Get {
            path: path.into(),
            params: Vec::new(),
        }
    }

    /// Append a query parameter (ignored for GraphQL requests).
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        if let Self::Get { params, .. } = &mut self {
            params.push((key.into(), value.to_string()));
        }
        self
    }

    pub fn path(&self) -> &str {
        match self {
            Self::Graphql { path, .. } | Self::Get { path, .. } => path,
        }
    }
}

/// Status and body of a completed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

/// Sends requests; classification happens above this layer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<RawResponse>;
}

/// Production transport over reqwest with bearer authentication.
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(base_url: &str, api_token: &str, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {api_token}"))
            .map_err(|_| ExportError::InvalidInput("API token is not a valid header value".into()))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .user_agent(concat!("exportkit/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ExportError::Network)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    fn map_error(&self, e: reqwest::Error) -> ExportError {
        if e.is_timeout() {
            ExportError::Timeout(self.timeout)
        } else if e.is_connect() {
            ExportError::Connection(e.to_string())
        } else {
            ExportError::Network(e)
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest) -> Result<RawResponse> {
        let builder = match request {
            ApiRequest::Graphql { path, query } => {
                self.client.post(self.url(path)).json(&json!({ "query": query }))
            }
            ApiRequest::Get { path, params } => self.client.get(self.url(path)).query(params),
        };

        let response = builder.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| self.map_error(e))?;

        debug!(path = request.path(), status, bytes = body.len(), "Response received");
        Ok(RawResponse { status, body })
    }
}
