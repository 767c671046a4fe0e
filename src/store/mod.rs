//! # Message Store
//!
//! The `MessageStore` trait is the single seam between the pipeline/dispatcher
//! and durable storage (spec.md §4.A): atomic status+content commits, append-only
//! content rows, and per-channel statistics. Two implementations exist —
//! `SqliteMessageStore` for real deployments and `InMemoryStore` for tests and the
//! ephemeral `standalone` mode — following the adapter-trait-over-one-backend
//! shape used throughout this workspace's example pack.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteMessageStore;

use crate::error::Result;
use crate::model::{Attachment, ChannelId, ConnectorMessage, ConnectorMessageStatus, ConnectorStatistics, ContentType, Maps, Message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// Filter/pagination parameters for `list_messages`, per spec.md §4.A: "filter
/// supports min/max id, date range, status set, metadata-id set,
/// substring/regex on content, pagination (offset + limit)".
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub min_id: Option<i64>,
    pub max_id: Option<i64>,
    pub received_after: Option<DateTime<Utc>>,
    pub received_before: Option<DateTime<Utc>>,
    pub statuses: Option<Vec<ConnectorMessageStatus>>,
    pub meta_data_ids: Option<Vec<i32>>,
    /// Matches if any content row (any `meta_data_id`, any `ContentType`) for
    /// the message contains this substring.
    pub content_substring: Option<String>,
    /// Matches if any content row for the message matches this regex.
    pub content_regex: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// The durability boundary the pipeline and dispatcher depend on. Every method
/// is `async` so a SQLite-backed implementation can run its synchronous calls
/// off the executor via `spawn_blocking` without forcing that choice on other
/// backends.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Allocate a new `Message` row (and its source `ConnectorMessage`) for
    /// `channel_id`, returning the assigned `message_id`. Message ids are
    /// per-channel monotonic, per spec.md §3.
    async fn create_message(&self, channel_id: ChannelId, server_id: Uuid, received_date: DateTime<Utc>) -> Result<i64>;

    async fn get_message(&self, channel_id: ChannelId, message_id: i64) -> Result<Option<Message>>;

    async fn mark_processed(&self, channel_id: ChannelId, message_id: i64) -> Result<()>;

    /// Insert or replace a destination's `ConnectorMessage` row. Used when a
    /// destination is first created for a message (status `RECEIVED`).
    async fn upsert_connector_message(&self, connector_message: ConnectorMessage) -> Result<()>;

    async fn get_connector_message(
        &self,
        channel_id: ChannelId,
        message_id: i64,
        meta_data_id: i32,
    ) -> Result<Option<ConnectorMessage>>;

    /// Update just the status column. Must commit atomically with any content
    /// row written for the same transition (spec.md §8 invariant 2); backends
    /// that cannot express that atomically at the call-site grain document how
    /// they approximate it.
    async fn update_connector_message_status(
        &self,
        channel_id: ChannelId,
        message_id: i64,
        meta_data_id: i32,
        status: ConnectorMessageStatus,
    ) -> Result<()>;

    async fn upsert_connector_message_attempts(
        &self,
        channel_id: ChannelId,
        message_id: i64,
        meta_data_id: i32,
        attempts: u32,
    ) -> Result<()>;

    /// Append a content row. Content rows are never updated in place once
    /// written (spec.md §8 invariant 3) — callers write a new `ContentType`
    /// rather than mutate an old one.
    async fn write_content(
        &self,
        channel_id: ChannelId,
        message_id: i64,
        meta_data_id: i32,
        content_type: ContentType,
        text: &str,
        data_type: Option<&str>,
    ) -> Result<()>;

    async fn read_content(
        &self,
        channel_id: ChannelId,
        message_id: i64,
        meta_data_id: i32,
        content_type: ContentType,
    ) -> Result<Option<String>>;

    async fn write_maps(&self, channel_id: ChannelId, message_id: i64, meta_data_id: i32, maps: &Maps) -> Result<()>;

    async fn read_maps(&self, channel_id: ChannelId, message_id: i64, meta_data_id: i32) -> Result<Maps>;

    async fn list_messages(&self, channel_id: ChannelId, filter: MessageFilter) -> Result<Vec<Message>>;

    async fn count_messages(&self, channel_id: ChannelId, filter: &MessageFilter) -> Result<u64>;

    async fn delete_messages(&self, channel_id: ChannelId, message_ids: &[i64]) -> Result<()>;

    /// Append an opaque attachment for `message_id`, returning its
    /// engine-assigned `attachment_id` (spec.md §3: identity is
    /// `(channelId, messageId, attachmentId)`, opaque to the engine).
    async fn write_attachment(&self, channel_id: ChannelId, message_id: i64, mime_type: &str, data: &[u8]) -> Result<i64>;

    async fn get_attachment(&self, channel_id: ChannelId, message_id: i64, attachment_id: i64) -> Result<Option<Attachment>>;

    async fn list_attachments(&self, channel_id: ChannelId, message_id: i64) -> Result<Vec<Attachment>>;

    async fn get_statistics(&self, channel_id: ChannelId) -> Result<HashMap<i32, ConnectorStatistics>>;

    async fn record_statistic(&self, channel_id: ChannelId, meta_data_id: i32, status: ConnectorMessageStatus) -> Result<()>;

    async fn reset_statistics(
        &self,
        channel_id: ChannelId,
        meta_data_id: Option<i32>,
        statuses: Option<Vec<ConnectorMessageStatus>>,
    ) -> Result<()>;

    /// Drop all per-channel tables, called on channel deletion (distinct from
    /// `delete_messages`, which prunes rows within a channel that stays around).
    async fn drop_channel(&self, channel_id: ChannelId) -> Result<()>;
}
