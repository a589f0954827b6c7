//! HTTP client seam.
//!
//! The runtime dispatches fully-resolved requests through the [`Dispatch`]
//! trait; production uses a [`ReqwestDispatch`] holding one `reqwest`
//! client with a process-wide cookie jar for the duration of a run.

use crate::constants::{CONTENT_TYPE_JSON, HEADER_CONTENT_TYPE};
use crate::error::Error;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use std::time::Duration;

/// A fully-resolved HTTP request: absolute URL, no remaining `$var`s.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: IndexMap<String, String>,
    /// Basic-auth pair.
    pub auth: Option<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

/// Status, headers, and raw body of a dispatched request.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: IndexMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    /// Case-insensitive content-type header lookup.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(HEADER_CONTENT_TYPE))
            .map(|(_, value)| value.as_str())
    }

    /// True when the content type starts with `application/json`,
    /// case-insensitively.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.content_type().is_some_and(|ct| {
            ct.get(..CONTENT_TYPE_JSON.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(CONTENT_TYPE_JSON))
        })
    }
}

/// The §6 client contract: dispatch one request, return status, headers,
/// and body.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, request: &HttpRequest) -> Result<HttpResponse, Error>;
}

/// Production dispatcher over a shared `reqwest` client. The client's
/// cookie store is shared by every request of the run.
pub struct ReqwestDispatch {
    client: reqwest::Client,
}

impl ReqwestDispatch {
    /// # Errors
    ///
    /// Returns a transport error if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|e| Error::transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Dispatch for ReqwestDispatch {
    async fn dispatch(&self, request: &HttpRequest) -> Result<HttpResponse, Error> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| Error::runtime(format!("invalid HTTP method '{}'", request.method)))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some((user, pass)) = &request.auth {
            builder = builder.basic_auth(user, Some(pass));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        tracing::debug!(method = %request.method, url = %request.url, "dispatching request");
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::transport(format!("request to {} timed out", request.url))
            } else {
                Error::transport(format!("request to {} failed: {e}", request.url))
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| Error::transport(format!("reading response body failed: {e}")))?;
        tracing::trace!(status, body = %body, "response received");

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with_ct(ct: &str) -> HttpResponse {
        HttpResponse {
            status: 200,
            headers: [("content-type".to_string(), ct.to_string())]
                .into_iter()
                .collect(),
            body: String::new(),
        }
    }

    #[test]
    fn json_detection_is_prefix_and_case_insensitive() {
        assert!(response_with_ct("application/json").is_json());
        assert!(response_with_ct("Application/JSON; charset=utf-8").is_json());
        assert!(!response_with_ct("text/html").is_json());
        assert!(!response_with_ct("application/jso").is_json());
    }

    #[test]
    fn content_type_lookup_ignores_header_case() {
        let resp = HttpResponse {
            status: 200,
            headers: [("Content-Type".to_string(), "text/plain".to_string())]
                .into_iter()
                .collect(),
            body: String::new(),
        };
        assert_eq!(resp.content_type(), Some("text/plain"));
    }
}
