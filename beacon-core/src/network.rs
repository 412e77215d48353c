//! Network capability
//!
//! The pipeline only needs "POST these bytes with these headers and tell me
//! the status". [`HttpNetwork`] does that over reqwest; tests and hosts with
//! their own HTTP stack implement [`Network`] directly.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::{Error, NetworkError, Result};

/// Status code returned by the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpStatus(pub u16);

impl HttpStatus {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }
}

/// Injected HTTP capability
#[async_trait]
pub trait Network: Send + Sync {
    /// POST `body` to `url`.
    ///
    /// Any HTTP response, including 4xx and 5xx, is `Ok`; `Err` means no
    /// response was received.
    async fn post(
        &self,
        url: &str,
        body: Vec<u8>,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> std::result::Result<HttpStatus, NetworkError>;
}

/// reqwest-backed network
pub struct HttpNetwork {
    http_client: reqwest::Client,
}

impl HttpNetwork {
    pub fn new() -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("beacon/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn post(
        &self,
        url: &str,
        body: Vec<u8>,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> std::result::Result<HttpStatus, NetworkError> {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| NetworkError::Other(format!("invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| NetworkError::Other(format!("invalid header value: {}", e)))?;
            header_map.insert(name, value);
        }

        let response = self
            .http_client
            .post(url)
            .headers(header_map)
            .timeout(timeout)
            .body(body)
            .send()
            .await
            .map_err(classify)?;

        Ok(HttpStatus(response.status().as_u16()))
    }
}

fn classify(error: reqwest::Error) -> NetworkError {
    if error.is_timeout() {
        NetworkError::Timeout
    } else if error.is_connect() {
        NetworkError::Connect(error.to_string())
    } else {
        NetworkError::Other(error.to_string())
    }
}
