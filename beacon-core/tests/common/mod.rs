//! Shared fixtures for the client integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use beacon_core::compression::{Compressor, Encoding};
use beacon_core::error::NetworkError;
use beacon_core::{BatchEnvelope, Config, HttpStatus, Network};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub type Reply = Result<HttpStatus, NetworkError>;

/// One request seen by [`ScriptedNetwork`]
#[derive(Debug, Clone)]
pub struct Request {
    pub url: String,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Decode the batch document carried by this request
    pub fn envelope(&self) -> BatchEnvelope {
        let encoding = match self.header("Content-Encoding") {
            Some("zstd") => Encoding::Zstd,
            _ => Encoding::Identity,
        };
        Compressor::decompress(&self.body, encoding).expect("decodable batch")
    }
}

/// Network fake: answers from a script, then with 200.
///
/// While `hang` is set, requests never complete.
#[derive(Default)]
pub struct ScriptedNetwork {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<Request>>,
    attempts: AtomicUsize,
    hang: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl ScriptedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies(replies: Vec<Reply>) -> Self {
        let network = Self::new();
        network.push_replies(replies);
        network
    }

    pub fn push_replies(&self, replies: Vec<Reply>) {
        self.replies.lock().unwrap().extend(replies);
    }

    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    /// Requests started, including ones that never completed
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Network for ScriptedNetwork {
    async fn post(
        &self,
        url: &str,
        body: Vec<u8>,
        headers: &[(String, String)],
        _timeout: Duration,
    ) -> Reply {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        self.requests.lock().unwrap().push(Request {
            url: url.to_string(),
            body,
            headers: headers.to_vec(),
        });
        let reply = self.replies.lock().unwrap().pop_front();
        reply.unwrap_or(Ok(HttpStatus(200)))
    }
}

pub fn offline() -> Reply {
    Err(NetworkError::Connect("connection refused".to_string()))
}

/// Config pointed at a fake collector, with retries inside one send disabled
/// and the periodic flush pushed out of the way
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.collector.server_url = Some("https://collector.test".to_string());
    config.collector.api_key = Some("bk_test".to_string());
    config.transport.max_retries = 0;
    config.scheduler.flush_interval_secs = 3600;
    config
}

/// A fixed start time in the middle of an hour
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 9, 10, 0).unwrap()
}
