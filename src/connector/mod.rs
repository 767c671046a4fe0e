//! # Connector Framework
//!
//! The shared base for source and destination connectors (spec.md §4.D): a common
//! lifecycle, a push-style ingestion entry point for sources, and a `send` entry
//! point for destinations. Concrete connectors (`mllp`, `http`, `file`) implement
//! these traits the way the teacher's transport implementations
//! (`UnixDomainSocketTransport`, `TcpSocketTransport`, ...) each implement
//! `IpcTransport` (`src/ipc/mod.rs`).

pub mod file;
pub mod http;
pub mod mllp;

use crate::error::Result;
use crate::model::Maps;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A destination's reported outcome for one send attempt, per spec.md §4.D.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Sent,
    Queued,
    Error,
    Filtered,
}

/// The outcome of a destination `send`.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: ResponseStatus,
    pub message: Option<String>,
    pub status_code: Option<u16>,
}

impl Response {
    pub fn sent() -> Self {
        Self {
            status: ResponseStatus::Sent,
            message: None,
            status_code: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            message: Some(message.into()),
            status_code: None,
        }
    }
}

/// Connector lifecycle mirroring the channel state machine at a finer grain
/// (spec.md §4.D).
#[async_trait]
pub trait Connector: Send + Sync {
    async fn start(&mut self) -> Result<()>;
    async fn stop(&mut self) -> Result<()>;
    async fn halt(&mut self) -> Result<()>;
    async fn pause(&mut self) -> Result<()>;
    async fn resume(&mut self) -> Result<()>;
}

/// A raw inbound payload plus the source-map entries the connector populated
/// while receiving it (e.g. remote address, calling AE title, ...).
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub payload: String,
    pub source_map: std::collections::HashMap<String, String>,
}

/// The result of handing a raw message to the pipeline: enough for a push-style
/// source to synthesize a protocol-level acknowledgement (e.g. an MLLP ACK or a
/// DICOM C-STORE-RSP status).
#[derive(Debug, Clone)]
pub struct MessageResult {
    pub message_id: i64,
    pub accepted: bool,
    pub detail: Option<String>,
}

/// A source connector: push-style sources call `dispatch_raw_message` per inbound
/// unit of work; pull-style sources drive their own polling loop and call the same
/// method once they have a payload.
#[async_trait]
pub trait SourceConnector: Connector {
    async fn dispatch_raw_message(&self, raw: RawMessage) -> Result<MessageResult>;
}

/// A destination connector: `send` performs one delivery attempt and reports the
/// outcome. Destinations never retry internally — retries are the dispatcher's
/// concern (spec.md §4.F, §7).
#[async_trait]
pub trait DestinationConnector: Connector {
    async fn send(&self, encoded_payload: &str, maps: &Maps) -> Result<Response>;
}
