//! Batch encoding and zstd compression
//!
//! A batch is encoded as a [`BatchEnvelope`] JSON document. Documents at or
//! above the size threshold are zstd-compressed; smaller ones, and documents
//! compression does not shrink, go out as `identity`.

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::types::{Batch, BatchEnvelope};
use std::fmt;
use uuid::Uuid;

/// `Content-Encoding` of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Zstd,
    Identity,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Zstd => "zstd",
            Encoding::Identity => "identity",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire-ready payload for one batch
#[derive(Debug, Clone)]
pub struct CompressedBatch {
    pub batch_id: Uuid,
    pub count: usize,
    pub encoding: Encoding,
    pub bytes: Vec<u8>,
    /// Size of the JSON document before compression
    pub raw_len: usize,
}

impl CompressedBatch {
    pub fn compression_ratio(&self) -> f32 {
        if self.bytes.is_empty() {
            1.0
        } else {
            self.raw_len as f32 / self.bytes.len() as f32
        }
    }
}

#[derive(Debug, Clone)]
pub struct Compressor {
    level: i32,
    min_bytes: usize,
}

impl Compressor {
    pub fn new(level: i32, min_bytes: usize) -> Self {
        Self { level, min_bytes }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.compression_level, config.compression_min_bytes)
    }

    pub fn compress(&self, batch: &Batch) -> Result<CompressedBatch> {
        let envelope = BatchEnvelope::from_batch(batch);
        let raw = serde_json::to_vec(&envelope)?;
        let raw_len = raw.len();

        let (bytes, encoding) = if raw_len >= self.min_bytes {
            match zstd::bulk::compress(&raw, self.level) {
                Ok(compressed) if compressed.len() < raw_len => (compressed, Encoding::Zstd),
                Ok(_) => (raw, Encoding::Identity),
                Err(e) => {
                    tracing::debug!(
                        batch_id = %batch.batch_id,
                        error = %e,
                        "Compression failed, sending uncompressed"
                    );
                    (raw, Encoding::Identity)
                }
            }
        } else {
            (raw, Encoding::Identity)
        };

        Ok(CompressedBatch {
            batch_id: batch.batch_id,
            count: batch.len(),
            encoding,
            bytes,
            raw_len,
        })
    }

    /// Recover the envelope from a payload
    pub fn decompress(payload: &[u8], encoding: Encoding) -> Result<BatchEnvelope> {
        let raw = match encoding {
            Encoding::Zstd => zstd::stream::decode_all(payload)
                .map_err(|e| Error::Compression(e.to_string()))?,
            Encoding::Identity => payload.to_vec(),
        };
        Ok(serde_json::from_slice(&raw)?)
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}
