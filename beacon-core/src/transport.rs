//! Batch delivery with retries
//!
//! One [`Transport::send`] makes up to `1 + max_retries` attempts. Every
//! attempt has its own deadline. Between attempts the task sleeps for the
//! backoff delay. A rejection the collector will repeat (4xx other than 429)
//! ends the send immediately.

use std::sync::Arc;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::compression::CompressedBatch;
use crate::config::{CollectorConfig, TransportConfig};
use crate::error::{NetworkError, TransportError};
use crate::network::Network;
use uuid::Uuid;

/// Successful delivery of one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub batch_id: Uuid,
    pub status: u16,
    /// Attempts used, including the successful one
    pub attempts: u32,
}

pub struct Transport {
    network: Arc<dyn Network>,
    url: Option<String>,
    /// Authorization and collector id, sent with every request
    static_headers: Vec<(String, String)>,
    backoff: BackoffPolicy,
    attempt_timeout: Duration,
}

impl Transport {
    pub fn new(
        network: Arc<dyn Network>,
        collector: &CollectorConfig,
        config: &TransportConfig,
    ) -> Self {
        let mut static_headers = Vec::new();
        if let Some(api_key) = &collector.api_key {
            static_headers.push(("Authorization".to_string(), format!("Bearer {}", api_key)));
        }
        if let Some(collector_id) = &collector.collector_id {
            static_headers.push(("X-Collector-ID".to_string(), collector_id.clone()));
        }

        Self {
            network,
            url: collector.batch_url(),
            static_headers,
            backoff: BackoffPolicy::from_config(config),
            attempt_timeout: config.attempt_timeout(),
        }
    }

    /// Whether a collector endpoint is configured
    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }

    /// Headers for one payload
    pub fn headers_for(&self, payload: &CompressedBatch) -> Vec<(String, String)> {
        let mut headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            (
                "Content-Encoding".to_string(),
                payload.encoding.as_str().to_string(),
            ),
            ("X-Batch-Id".to_string(), payload.batch_id.to_string()),
            ("X-Batch-Count".to_string(), payload.count.to_string()),
        ];
        headers.extend(self.static_headers.iter().cloned());
        headers
    }

    /// Deliver one batch
    pub async fn send(&self, payload: &CompressedBatch) -> Result<Ack, TransportError> {
        let Some(url) = self.url.as_deref() else {
            return Err(TransportError::NetworkUnavailable);
        };
        let headers = self.headers_for(payload);
        let max_attempts = self.backoff.max_retries().saturating_add(1);
        let mut last_error = TransportError::NetworkUnavailable;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = self.backoff.delay(attempt - 1);
                tracing::debug!(
                    batch_id = %payload.batch_id,
                    attempt = attempt + 1,
                    max_attempts,
                    ?delay,
                    "Retrying batch"
                );
                tokio::time::sleep(delay).await;
            }

            let outcome = tokio::time::timeout(
                self.attempt_timeout,
                self.network
                    .post(url, payload.bytes.clone(), &headers, self.attempt_timeout),
            )
            .await;

            let error = match outcome {
                Ok(Ok(status)) if status.is_success() => {
                    tracing::debug!(
                        batch_id = %payload.batch_id,
                        status = status.0,
                        events = payload.count,
                        "Batch delivered"
                    );
                    return Ok(Ack {
                        batch_id: payload.batch_id,
                        status: status.0,
                        attempts: attempt + 1,
                    });
                }
                Ok(Ok(status)) => TransportError::ServerRejected(status.0),
                Ok(Err(NetworkError::Timeout)) | Err(_) => TransportError::Timeout,
                Ok(Err(e)) => {
                    tracing::debug!(batch_id = %payload.batch_id, error = %e, "Network error");
                    TransportError::NetworkUnavailable
                }
            };

            if !error.is_retryable() {
                tracing::warn!(batch_id = %payload.batch_id, error = %error, "Batch rejected");
                return Err(error);
            }

            tracing::warn!(
                batch_id = %payload.batch_id,
                attempt = attempt + 1,
                error = %error,
                "Transient error sending batch"
            );
            last_error = error;
        }

        Err(last_error)
    }
}
