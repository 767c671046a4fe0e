//! # Data Model
//!
//! The entities from specification §3: Channel identity, Message, ConnectorMessage,
//! MessageContent, Attachment, the runtime maps, and statistics counters.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// `metaDataId` reserved for the source connector of a channel.
pub const SOURCE_META_DATA_ID: i32 = 0;

/// Identity of a channel configuration.
pub type ChannelId = Uuid;

/// A connector-message status, per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorMessageStatus {
    Received,
    Filtered,
    Transformed,
    Sent,
    Queued,
    Error,
    Pending,
}

impl ConnectorMessageStatus {
    /// Terminal statuses per spec.md §8 invariant 1: SENT, FILTERED, ERROR, or a
    /// `Queued` that will not be retried further (manual-release QUEUED).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectorMessageStatus::Sent
                | ConnectorMessageStatus::Filtered
                | ConnectorMessageStatus::Error
                | ConnectorMessageStatus::Queued
        )
    }
}

/// The fifteen content types from spec.md §3, in the order they are listed there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentType {
    Raw = 1,
    ProcessedRaw,
    Transformed,
    Encoded,
    Sent,
    Response,
    ResponseTransformed,
    ProcessedResponse,
    ConnectorMap,
    ChannelMap,
    SourceMap,
    ResponseMap,
    ProcessingError,
    PostprocessorError,
    ResponseError,
}

/// A `Message`: the top-level unit of work flowing through a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub channel_id: ChannelId,
    pub message_id: i64,
    pub server_id: Uuid,
    pub received_date: chrono::DateTime<chrono::Utc>,
    pub processed: bool,
    pub import_id: Option<i64>,
    pub import_channel_id: Option<ChannelId>,
}

/// A `ConnectorMessage`: the per-connector shadow of a `Message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorMessage {
    pub channel_id: ChannelId,
    pub message_id: i64,
    pub meta_data_id: i32,
    pub connector_name: String,
    pub status: ConnectorMessageStatus,
    pub send_attempts: u32,
    pub error_code: Option<i32>,
}

impl ConnectorMessage {
    pub fn new_source(channel_id: ChannelId, message_id: i64) -> Self {
        Self {
            channel_id,
            message_id,
            meta_data_id: SOURCE_META_DATA_ID,
            connector_name: "Source".to_string(),
            status: ConnectorMessageStatus::Received,
            send_attempts: 0,
            error_code: None,
        }
    }

    pub fn new_destination(channel_id: ChannelId, message_id: i64, meta_data_id: i32, name: &str) -> Self {
        Self {
            channel_id,
            message_id,
            meta_data_id,
            connector_name: name.to_string(),
            status: ConnectorMessageStatus::Received,
            send_attempts: 0,
            error_code: None,
        }
    }
}

/// A `MessageContent` row. The `text` field is the decoded payload; storage-layer
/// compression/encryption is applied and reversed by `crate::codec`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContent {
    pub channel_id: ChannelId,
    pub message_id: i64,
    pub meta_data_id: i32,
    pub content_type: ContentType,
    pub text: String,
    pub data_type: Option<String>,
}

/// An `Attachment`: an opaque binary payload associated with a `Message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub channel_id: ChannelId,
    pub message_id: i64,
    pub attachment_id: i64,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Per-message runtime maps. `Maps` is cloned at connector-message boundaries
/// (spec.md §4.E step 4: "copying maps from the source snapshot") and serialized
/// into `ConnectorMap`/`ChannelMap`/`SourceMap`/`ResponseMap` content rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Maps {
    pub channel_map: HashMap<String, String>,
    pub connector_map: HashMap<String, String>,
    pub source_map: HashMap<String, String>,
    pub response_map: HashMap<String, String>,
}

/// Per-`(channelId, metaDataId)` statistics counters, per spec.md §3.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ConnectorStatistics {
    pub received: u64,
    pub filtered: u64,
    pub transformed: u64,
    pub sent: u64,
    pub error: u64,
    pub queued: u64,
}

impl ConnectorStatistics {
    /// Which counters reset when `resetStatistics` targets this status.
    pub fn reset(&mut self, statuses: Option<&[ConnectorMessageStatus]>) {
        let Some(statuses) = statuses else {
            *self = ConnectorStatistics::default();
            return;
        };
        for status in statuses {
            match status {
                ConnectorMessageStatus::Received => self.received = 0,
                ConnectorMessageStatus::Filtered => self.filtered = 0,
                ConnectorMessageStatus::Transformed => self.transformed = 0,
                ConnectorMessageStatus::Sent => self.sent = 0,
                ConnectorMessageStatus::Error => self.error = 0,
                ConnectorMessageStatus::Queued => self.queued = 0,
                ConnectorMessageStatus::Pending => {}
            }
        }
    }

    pub fn record(&mut self, status: ConnectorMessageStatus) {
        match status {
            ConnectorMessageStatus::Received => self.received += 1,
            ConnectorMessageStatus::Filtered => self.filtered += 1,
            ConnectorMessageStatus::Transformed => self.transformed += 1,
            ConnectorMessageStatus::Sent => self.sent += 1,
            ConnectorMessageStatus::Error => self.error += 1,
            ConnectorMessageStatus::Queued => self.queued += 1,
            ConnectorMessageStatus::Pending => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(ConnectorMessageStatus::Sent.is_terminal());
        assert!(ConnectorMessageStatus::Filtered.is_terminal());
        assert!(ConnectorMessageStatus::Error.is_terminal());
        assert!(ConnectorMessageStatus::Queued.is_terminal());
        assert!(!ConnectorMessageStatus::Received.is_terminal());
        assert!(!ConnectorMessageStatus::Pending.is_terminal());
    }

    #[test]
    fn statistics_record_and_reset() {
        let mut stats = ConnectorStatistics::default();
        stats.record(ConnectorMessageStatus::Received);
        stats.record(ConnectorMessageStatus::Sent);
        assert_eq!(stats.received, 1);
        assert_eq!(stats.sent, 1);

        stats.reset(Some(&[ConnectorMessageStatus::Sent]));
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.received, 1);

        stats.reset(None);
        assert_eq!(stats.received, 0);
    }
}
