//! Ingest and export configuration types
//!
//! Only the knobs the library itself needs. Input selection, session tags and
//! output locations belong to the application layer.

use crate::transport::cyphal::DEFAULT_TRANSFER_ID_TIMEOUT_US;
use crate::types::{Result, TelemetryError};
use serde::{Deserialize, Serialize};

/// How payload ranges from a source relate to each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Every payload is an independent buffer region (one UDP datagram).
    /// A partial trailing frame is discarded.
    #[default]
    Datagram,
    /// Payloads are consecutive chunks of one byte stream (a capture file).
    /// A partial trailing frame is carried over to the next chunk.
    Stream,
}

/// Configuration for one ingestion run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Extent used when subscribing lazily to a (kind, port)
    #[serde(default = "default_extent_bytes")]
    pub extent_bytes: usize,

    /// Transfer-ID timeout used when subscribing (microseconds)
    #[serde(default = "default_transfer_id_timeout")]
    pub transfer_id_timeout_us: u64,

    #[serde(default)]
    pub framing: Framing,

    /// Chunk size used by reader-backed payload sources
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
}

fn default_extent_bytes() -> usize {
    1024
}

fn default_transfer_id_timeout() -> u64 {
    DEFAULT_TRANSFER_ID_TIMEOUT_US
}

fn default_read_chunk_bytes() -> usize {
    64 * 1024
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            extent_bytes: default_extent_bytes(),
            transfer_id_timeout_us: default_transfer_id_timeout(),
            framing: Framing::default(),
            read_chunk_bytes: default_read_chunk_bytes(),
        }
    }
}

impl IngestConfig {
    /// Create an ingest configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the subscription extent
    pub fn with_extent_bytes(mut self, extent_bytes: usize) -> Self {
        self.extent_bytes = extent_bytes;
        self
    }

    /// Builder method: set the transfer-ID timeout
    pub fn with_transfer_id_timeout_us(mut self, timeout_us: u64) -> Self {
        self.transfer_id_timeout_us = timeout_us;
        self
    }

    /// Builder method: set the payload framing
    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Builder method: set the reader chunk size
    pub fn with_read_chunk_bytes(mut self, bytes: usize) -> Self {
        self.read_chunk_bytes = bytes;
        self
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.extent_bytes == 0 {
            return Err(TelemetryError::InvalidConfig(
                "extent_bytes must be greater than zero".to_string(),
            ));
        }
        if self.read_chunk_bytes == 0 {
            return Err(TelemetryError::InvalidConfig(
                "read_chunk_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for line-protocol export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Maximum number of records per batch
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

fn default_max_batch_size() -> usize {
    5000
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
        }
    }
}

impl ExportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the batch size
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(TelemetryError::InvalidConfig(
                "max_batch_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
