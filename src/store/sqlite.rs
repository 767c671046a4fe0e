//! A `rusqlite`-backed `MessageStore`. Each channel owns its own table family —
//! `D_M<id>` (messages), `D_MM<id>` (connector messages), `D_MC<id>` (content),
//! `D_MA<id>` (attachments), `D_MS<id>` (statistics) — matching the per-channel
//! table-per-tenant layout spec.md §3 names directly.
//!
//! `rusqlite`'s API is synchronous; every call below runs inside
//! `tokio::task::spawn_blocking` so it never blocks the async executor, the same
//! pattern this workspace's `bearcove-peeps` uses for its `rusqlite` access from
//! an async `axum` handler.

use super::{MessageFilter, MessageStore};
use crate::error::{EngineError, Result};
use crate::model::{Attachment, ChannelId, ConnectorMessage, ConnectorMessageStatus, ConnectorStatistics, ContentType, Maps, Message};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashSet;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub struct SqliteMessageStore {
    conn: Arc<Mutex<Connection>>,
    initialized_channels: DashSet<ChannelId>,
}

impl SqliteMessageStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(EngineError::Storage)?;
        register_content_regexp(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            initialized_channels: DashSet::new(),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(EngineError::Storage)?;
        register_content_regexp(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            initialized_channels: DashSet::new(),
        })
    }

    fn tables(channel_id: ChannelId) -> ChannelTables {
        ChannelTables::new(channel_id)
    }

    async fn ensure_channel(&self, channel_id: ChannelId) -> Result<()> {
        if self.initialized_channels.contains(&channel_id) {
            return Ok(());
        }
        let conn = self.conn.clone();
        let tables = Self::tables(channel_id);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.lock();
            conn.execute_batch(&tables.create_statements()).map_err(EngineError::Storage)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))??;
        self.initialized_channels.insert(channel_id);
        Ok(())
    }
}

struct ChannelTables {
    messages: String,
    connector_messages: String,
    content: String,
    attachments: String,
    statistics: String,
}

impl ChannelTables {
    fn new(channel_id: ChannelId) -> Self {
        let suffix = channel_id.simple().to_string();
        Self {
            messages: format!("D_M{suffix}"),
            connector_messages: format!("D_MM{suffix}"),
            content: format!("D_MC{suffix}"),
            attachments: format!("D_MA{suffix}"),
            statistics: format!("D_MS{suffix}"),
        }
    }

    fn create_statements(&self) -> String {
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {messages} (
                message_id INTEGER PRIMARY KEY,
                server_id TEXT NOT NULL,
                received_date TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0,
                import_id INTEGER,
                import_channel_id TEXT
            );
            CREATE TABLE IF NOT EXISTS {connector_messages} (
                message_id INTEGER NOT NULL,
                meta_data_id INTEGER NOT NULL,
                connector_name TEXT NOT NULL,
                status TEXT NOT NULL,
                send_attempts INTEGER NOT NULL DEFAULT 0,
                error_code INTEGER,
                PRIMARY KEY (message_id, meta_data_id)
            );
            CREATE TABLE IF NOT EXISTS {content} (
                message_id INTEGER NOT NULL,
                meta_data_id INTEGER NOT NULL,
                content_type TEXT NOT NULL,
                content TEXT NOT NULL,
                data_type TEXT,
                PRIMARY KEY (message_id, meta_data_id, content_type)
            );
            CREATE TABLE IF NOT EXISTS {attachments} (
                attachment_id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id INTEGER NOT NULL,
                mime_type TEXT NOT NULL,
                data BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {statistics} (
                meta_data_id INTEGER PRIMARY KEY,
                received INTEGER NOT NULL DEFAULT 0,
                filtered INTEGER NOT NULL DEFAULT 0,
                transformed INTEGER NOT NULL DEFAULT 0,
                sent INTEGER NOT NULL DEFAULT 0,
                error INTEGER NOT NULL DEFAULT 0,
                queued INTEGER NOT NULL DEFAULT 0
            );
            "#,
            messages = self.messages,
            connector_messages = self.connector_messages,
            content = self.content,
            attachments = self.attachments,
            statistics = self.statistics,
        )
    }
}

fn content_type_name(content_type: ContentType) -> &'static str {
    match content_type {
        ContentType::Raw => "RAW",
        ContentType::ProcessedRaw => "PROCESSED_RAW",
        ContentType::Transformed => "TRANSFORMED",
        ContentType::Encoded => "ENCODED",
        ContentType::Sent => "SENT",
        ContentType::Response => "RESPONSE",
        ContentType::ResponseTransformed => "RESPONSE_TRANSFORMED",
        ContentType::ProcessedResponse => "PROCESSED_RESPONSE",
        ContentType::ConnectorMap => "CONNECTOR_MAP",
        ContentType::ChannelMap => "CHANNEL_MAP",
        ContentType::SourceMap => "SOURCE_MAP",
        ContentType::ResponseMap => "RESPONSE_MAP",
        ContentType::ProcessingError => "PROCESSING_ERROR",
        ContentType::PostprocessorError => "POSTPROCESSOR_ERROR",
        ContentType::ResponseError => "RESPONSE_ERROR",
    }
}

const MAPS_CONTENT_TYPE: &str = "__MAPS_BUNDLE__";

/// Registers a `content_regexp(pattern, text)` scalar function so
/// `list_messages`'s content-regex filter can run inside SQL rather than
/// pulling every row back to re-filter in Rust. Invalid patterns are treated
/// as non-matching rather than failing the whole query.
fn register_content_regexp(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "content_regexp",
        2,
        rusqlite::functions::FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let pattern = ctx.get::<String>(0)?;
            let text = ctx.get::<String>(1)?;
            let matches = regex::Regex::new(&pattern).map(|re| re.is_match(&text)).unwrap_or(false);
            Ok(matches)
        },
    )
    .map_err(EngineError::Storage)
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// Builds the `WHERE ...` clause (empty string if the filter is empty) and its
/// bind parameters, in the same order the clause references them, for
/// `list_messages`/`count_messages`. Every dimension in spec.md §4.A's filter
/// contract — min/max id, date range, status set, metadata-id set,
/// substring/regex on content — is represented here.
fn build_message_filter(tables: &ChannelTables, filter: &MessageFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(min_id) = filter.min_id {
        clauses.push("message_id >= ?".to_string());
        params.push(Box::new(min_id));
    }
    if let Some(max_id) = filter.max_id {
        clauses.push("message_id <= ?".to_string());
        params.push(Box::new(max_id));
    }
    if let Some(after) = filter.received_after {
        clauses.push("received_date >= ?".to_string());
        params.push(Box::new(after.to_rfc3339()));
    }
    if let Some(before) = filter.received_before {
        clauses.push("received_date <= ?".to_string());
        params.push(Box::new(before.to_rfc3339()));
    }

    if filter.meta_data_ids.is_some() || filter.statuses.is_some() {
        let mut sub = format!("SELECT message_id FROM {}", tables.connector_messages);
        let mut sub_clauses: Vec<String> = Vec::new();
        if let Some(meta_data_ids) = &filter.meta_data_ids {
            if meta_data_ids.is_empty() {
                sub_clauses.push("0".to_string());
            } else {
                let placeholders = vec!["?"; meta_data_ids.len()].join(", ");
                sub_clauses.push(format!("meta_data_id IN ({placeholders})"));
                for id in meta_data_ids {
                    params.push(Box::new(*id));
                }
            }
        }
        if let Some(statuses) = &filter.statuses {
            if statuses.is_empty() {
                sub_clauses.push("0".to_string());
            } else {
                let placeholders = vec!["?"; statuses.len()].join(", ");
                sub_clauses.push(format!("status IN ({placeholders})"));
                for status in statuses {
                    params.push(Box::new(status_name(*status)));
                }
            }
        }
        sub.push_str(" WHERE ");
        sub.push_str(&sub_clauses.join(" AND "));
        clauses.push(format!("message_id IN ({sub})"));
    }

    if filter.content_substring.is_some() || filter.content_regex.is_some() {
        let mut sub = format!("SELECT message_id FROM {}", tables.content);
        let mut sub_clauses: Vec<String> = Vec::new();
        if let Some(substring) = &filter.content_substring {
            sub_clauses.push("content LIKE ? ESCAPE '\\'".to_string());
            params.push(Box::new(format!("%{}%", escape_like(substring))));
        }
        if let Some(pattern) = &filter.content_regex {
            sub_clauses.push("content_regexp(?, content)".to_string());
            params.push(Box::new(pattern.clone()));
        }
        sub.push_str(" WHERE ");
        sub.push_str(&sub_clauses.join(" AND "));
        clauses.push(format!("message_id IN ({sub})"));
    }

    if clauses.is_empty() {
        (String::new(), params)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), params)
    }
}

fn status_name(status: ConnectorMessageStatus) -> &'static str {
    match status {
        ConnectorMessageStatus::Received => "RECEIVED",
        ConnectorMessageStatus::Filtered => "FILTERED",
        ConnectorMessageStatus::Transformed => "TRANSFORMED",
        ConnectorMessageStatus::Sent => "SENT",
        ConnectorMessageStatus::Queued => "QUEUED",
        ConnectorMessageStatus::Error => "ERROR",
        ConnectorMessageStatus::Pending => "PENDING",
    }
}

fn parse_status(s: &str) -> ConnectorMessageStatus {
    match s {
        "FILTERED" => ConnectorMessageStatus::Filtered,
        "TRANSFORMED" => ConnectorMessageStatus::Transformed,
        "SENT" => ConnectorMessageStatus::Sent,
        "QUEUED" => ConnectorMessageStatus::Queued,
        "ERROR" => ConnectorMessageStatus::Error,
        "PENDING" => ConnectorMessageStatus::Pending,
        _ => ConnectorMessageStatus::Received,
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn create_message(&self, channel_id: ChannelId, server_id: Uuid, received_date: DateTime<Utc>) -> Result<i64> {
        self.ensure_channel(channel_id).await?;
        let conn = self.conn.clone();
        let tables = Self::tables(channel_id);
        tokio::task::spawn_blocking(move || -> Result<i64> {
            let conn = conn.lock();
            let next_id: i64 = conn
                .query_row(&format!("SELECT COALESCE(MAX(message_id), 0) + 1 FROM {}", tables.messages), [], |r| r.get(0))
                .map_err(EngineError::Storage)?;
            conn.execute(
                &format!(
                    "INSERT INTO {} (message_id, server_id, received_date, processed) VALUES (?1, ?2, ?3, 0)",
                    tables.messages
                ),
                params![next_id, server_id.to_string(), received_date.to_rfc3339()],
            )
            .map_err(EngineError::Storage)?;
            conn.execute(
                &format!(
                    "INSERT INTO {} (message_id, meta_data_id, connector_name, status, send_attempts) VALUES (?1, 0, 'Source', 'RECEIVED', 0)",
                    tables.connector_messages
                ),
                params![next_id],
            )
            .map_err(EngineError::Storage)?;
            Ok(next_id)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))?
    }

    async fn get_message(&self, channel_id: ChannelId, message_id: i64) -> Result<Option<Message>> {
        self.ensure_channel(channel_id).await?;
        let conn = self.conn.clone();
        let tables = Self::tables(channel_id);
        tokio::task::spawn_blocking(move || -> Result<Option<Message>> {
            let conn = conn.lock();
            conn.query_row(
                &format!(
                    "SELECT server_id, received_date, processed, import_id, import_channel_id FROM {} WHERE message_id = ?1",
                    tables.messages
                ),
                params![message_id],
                |row| {
                    let server_id: String = row.get(0)?;
                    let received_date: String = row.get(1)?;
                    let processed: i64 = row.get(2)?;
                    let import_id: Option<i64> = row.get(3)?;
                    let import_channel_id: Option<String> = row.get(4)?;
                    Ok(Message {
                        channel_id,
                        message_id,
                        server_id: Uuid::parse_str(&server_id).unwrap_or_default(),
                        received_date: DateTime::parse_from_rfc3339(&received_date)
                            .map(|d| d.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap()),
                        processed: processed != 0,
                        import_id,
                        import_channel_id: import_channel_id.and_then(|s| Uuid::parse_str(&s).ok()),
                    })
                },
            )
            .optional()
            .map_err(EngineError::Storage)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))?
    }

    async fn mark_processed(&self, channel_id: ChannelId, message_id: i64) -> Result<()> {
        self.ensure_channel(channel_id).await?;
        let conn = self.conn.clone();
        let tables = Self::tables(channel_id);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.lock();
            conn.execute(
                &format!("UPDATE {} SET processed = 1 WHERE message_id = ?1", tables.messages),
                params![message_id],
            )
            .map_err(EngineError::Storage)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))?
    }

    async fn upsert_connector_message(&self, connector_message: ConnectorMessage) -> Result<()> {
        self.ensure_channel(connector_message.channel_id).await?;
        let conn = self.conn.clone();
        let tables = Self::tables(connector_message.channel_id);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.lock();
            conn.execute(
                &format!(
                    "INSERT INTO {} (message_id, meta_data_id, connector_name, status, send_attempts, error_code)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(message_id, meta_data_id) DO UPDATE SET
                        connector_name = excluded.connector_name,
                        status = excluded.status,
                        send_attempts = excluded.send_attempts,
                        error_code = excluded.error_code",
                    tables.connector_messages
                ),
                params![
                    connector_message.message_id,
                    connector_message.meta_data_id,
                    connector_message.connector_name,
                    status_name(connector_message.status),
                    connector_message.send_attempts,
                    connector_message.error_code,
                ],
            )
            .map_err(EngineError::Storage)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))?
    }

    async fn get_connector_message(
        &self,
        channel_id: ChannelId,
        message_id: i64,
        meta_data_id: i32,
    ) -> Result<Option<ConnectorMessage>> {
        self.ensure_channel(channel_id).await?;
        let conn = self.conn.clone();
        let tables = Self::tables(channel_id);
        tokio::task::spawn_blocking(move || -> Result<Option<ConnectorMessage>> {
            let conn = conn.lock();
            conn.query_row(
                &format!(
                    "SELECT connector_name, status, send_attempts, error_code FROM {} WHERE message_id = ?1 AND meta_data_id = ?2",
                    tables.connector_messages
                ),
                params![message_id, meta_data_id],
                |row| {
                    let connector_name: String = row.get(0)?;
                    let status: String = row.get(1)?;
                    let send_attempts: i64 = row.get(2)?;
                    let error_code: Option<i32> = row.get(3)?;
                    Ok(ConnectorMessage {
                        channel_id,
                        message_id,
                        meta_data_id,
                        connector_name,
                        status: parse_status(&status),
                        send_attempts: send_attempts as u32,
                        error_code,
                    })
                },
            )
            .optional()
            .map_err(EngineError::Storage)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))?
    }

    async fn update_connector_message_status(
        &self,
        channel_id: ChannelId,
        message_id: i64,
        meta_data_id: i32,
        status: ConnectorMessageStatus,
    ) -> Result<()> {
        self.ensure_channel(channel_id).await?;
        let conn = self.conn.clone();
        let tables = Self::tables(channel_id);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.lock();
            let updated = conn
                .execute(
                    &format!("UPDATE {} SET status = ?1 WHERE message_id = ?2 AND meta_data_id = ?3", tables.connector_messages),
                    params![status_name(status), message_id, meta_data_id],
                )
                .map_err(EngineError::Storage)?;
            if updated == 0 {
                conn.execute(
                    &format!(
                        "INSERT INTO {} (message_id, meta_data_id, connector_name, status, send_attempts) VALUES (?1, ?2, '', ?3, 0)",
                        tables.connector_messages
                    ),
                    params![message_id, meta_data_id, status_name(status)],
                )
                .map_err(EngineError::Storage)?;
            }
            conn.execute(
                &format!(
                    "INSERT INTO {} (meta_data_id, received, filtered, transformed, sent, error, queued)
                     VALUES (?1, 0, 0, 0, 0, 0, 0)
                     ON CONFLICT(meta_data_id) DO NOTHING",
                    tables.statistics
                ),
                params![meta_data_id],
            )
            .map_err(EngineError::Storage)?;
            let column = match status {
                ConnectorMessageStatus::Received => Some("received"),
                ConnectorMessageStatus::Filtered => Some("filtered"),
                ConnectorMessageStatus::Transformed => Some("transformed"),
                ConnectorMessageStatus::Sent => Some("sent"),
                ConnectorMessageStatus::Error => Some("error"),
                ConnectorMessageStatus::Queued => Some("queued"),
                ConnectorMessageStatus::Pending => None,
            };
            if let Some(column) = column {
                conn.execute(
                    &format!("UPDATE {} SET {} = {} + 1 WHERE meta_data_id = ?1", tables.statistics, column, column),
                    params![meta_data_id],
                )
                .map_err(EngineError::Storage)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))?
    }

    async fn upsert_connector_message_attempts(
        &self,
        channel_id: ChannelId,
        message_id: i64,
        meta_data_id: i32,
        attempts: u32,
    ) -> Result<()> {
        self.ensure_channel(channel_id).await?;
        let conn = self.conn.clone();
        let tables = Self::tables(channel_id);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.lock();
            conn.execute(
                &format!("UPDATE {} SET send_attempts = ?1 WHERE message_id = ?2 AND meta_data_id = ?3", tables.connector_messages),
                params![attempts, message_id, meta_data_id],
            )
            .map_err(EngineError::Storage)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))?
    }

    async fn write_content(
        &self,
        channel_id: ChannelId,
        message_id: i64,
        meta_data_id: i32,
        content_type: ContentType,
        text: &str,
        data_type: Option<&str>,
    ) -> Result<()> {
        self.ensure_channel(channel_id).await?;
        let conn = self.conn.clone();
        let tables = Self::tables(channel_id);
        let text = text.to_string();
        let data_type = data_type.map(|s| s.to_string());
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.lock();
            conn.execute(
                &format!(
                    "INSERT INTO {} (message_id, meta_data_id, content_type, content, data_type) VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(message_id, meta_data_id, content_type) DO UPDATE SET content = excluded.content, data_type = excluded.data_type",
                    tables.content
                ),
                params![message_id, meta_data_id, content_type_name(content_type), text, data_type],
            )
            .map_err(EngineError::Storage)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))?
    }

    async fn read_content(
        &self,
        channel_id: ChannelId,
        message_id: i64,
        meta_data_id: i32,
        content_type: ContentType,
    ) -> Result<Option<String>> {
        self.ensure_channel(channel_id).await?;
        let conn = self.conn.clone();
        let tables = Self::tables(channel_id);
        tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let conn = conn.lock();
            conn.query_row(
                &format!(
                    "SELECT content FROM {} WHERE message_id = ?1 AND meta_data_id = ?2 AND content_type = ?3",
                    tables.content
                ),
                params![message_id, meta_data_id, content_type_name(content_type)],
                |row| row.get(0),
            )
            .optional()
            .map_err(EngineError::Storage)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))?
    }

    async fn write_maps(&self, channel_id: ChannelId, message_id: i64, meta_data_id: i32, maps: &Maps) -> Result<()> {
        let json = serde_json::to_string(maps).map_err(|e| EngineError::Internal(format!("failed to serialize maps: {e}")))?;
        self.ensure_channel(channel_id).await?;
        let conn = self.conn.clone();
        let tables = Self::tables(channel_id);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.lock();
            conn.execute(
                &format!(
                    "INSERT INTO {} (message_id, meta_data_id, content_type, content, data_type) VALUES (?1, ?2, ?3, ?4, NULL)
                     ON CONFLICT(message_id, meta_data_id, content_type) DO UPDATE SET content = excluded.content",
                    tables.content
                ),
                params![message_id, meta_data_id, MAPS_CONTENT_TYPE, json],
            )
            .map_err(EngineError::Storage)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))?
    }

    async fn read_maps(&self, channel_id: ChannelId, message_id: i64, meta_data_id: i32) -> Result<Maps> {
        self.ensure_channel(channel_id).await?;
        let conn = self.conn.clone();
        let tables = Self::tables(channel_id);
        let stored: Option<String> = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let conn = conn.lock();
            conn.query_row(
                &format!(
                    "SELECT content FROM {} WHERE message_id = ?1 AND meta_data_id = ?2 AND content_type = ?3",
                    tables.content
                ),
                params![message_id, meta_data_id, MAPS_CONTENT_TYPE],
                |row| row.get(0),
            )
            .optional()
            .map_err(EngineError::Storage)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))??;

        match stored {
            Some(json) => serde_json::from_str(&json).map_err(|e| EngineError::Internal(format!("failed to deserialize maps: {e}"))),
            None => Ok(Maps::default()),
        }
    }

    async fn write_attachment(&self, channel_id: ChannelId, message_id: i64, mime_type: &str, data: &[u8]) -> Result<i64> {
        self.ensure_channel(channel_id).await?;
        let conn = self.conn.clone();
        let tables = Self::tables(channel_id);
        let mime_type = mime_type.to_string();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || -> Result<i64> {
            let conn = conn.lock();
            conn.execute(
                &format!("INSERT INTO {} (message_id, mime_type, data) VALUES (?1, ?2, ?3)", tables.attachments),
                params![message_id, mime_type, data],
            )
            .map_err(EngineError::Storage)?;
            Ok(conn.last_insert_rowid())
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))?
    }

    async fn get_attachment(&self, channel_id: ChannelId, message_id: i64, attachment_id: i64) -> Result<Option<Attachment>> {
        self.ensure_channel(channel_id).await?;
        let conn = self.conn.clone();
        let tables = Self::tables(channel_id);
        tokio::task::spawn_blocking(move || -> Result<Option<Attachment>> {
            let conn = conn.lock();
            conn.query_row(
                &format!("SELECT mime_type, data FROM {} WHERE message_id = ?1 AND attachment_id = ?2", tables.attachments),
                params![message_id, attachment_id],
                |row| {
                    Ok(Attachment {
                        channel_id,
                        message_id,
                        attachment_id,
                        mime_type: row.get(0)?,
                        data: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(EngineError::Storage)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))?
    }

    async fn list_attachments(&self, channel_id: ChannelId, message_id: i64) -> Result<Vec<Attachment>> {
        self.ensure_channel(channel_id).await?;
        let conn = self.conn.clone();
        let tables = Self::tables(channel_id);
        tokio::task::spawn_blocking(move || -> Result<Vec<Attachment>> {
            let conn = conn.lock();
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT attachment_id, mime_type, data FROM {} WHERE message_id = ?1 ORDER BY attachment_id",
                    tables.attachments
                ))
                .map_err(EngineError::Storage)?;
            let rows = stmt
                .query_map(params![message_id], |row| {
                    Ok(Attachment {
                        channel_id,
                        message_id,
                        attachment_id: row.get(0)?,
                        mime_type: row.get(1)?,
                        data: row.get(2)?,
                    })
                })
                .map_err(EngineError::Storage)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(EngineError::Storage)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))?
    }

    async fn list_messages(&self, channel_id: ChannelId, filter: MessageFilter) -> Result<Vec<Message>> {
        self.ensure_channel(channel_id).await?;
        let conn = self.conn.clone();
        let tables = Self::tables(channel_id);
        tokio::task::spawn_blocking(move || -> Result<Vec<Message>> {
            let conn = conn.lock();
            let (where_clause, params) = build_message_filter(&tables, &filter);
            let mut sql = format!(
                "SELECT message_id, server_id, received_date, processed, import_id, import_channel_id FROM {}",
                tables.messages
            );
            sql.push_str(&where_clause);
            sql.push_str(" ORDER BY message_id");

            let mut limit_offset_params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(limit) = filter.limit {
                sql.push_str(" LIMIT ?");
                limit_offset_params.push(Box::new(limit as i64));
                if let Some(offset) = filter.offset {
                    sql.push_str(" OFFSET ?");
                    limit_offset_params.push(Box::new(offset as i64));
                }
            }

            let mut stmt = conn.prepare(&sql).map_err(EngineError::Storage)?;
            let all_params: Vec<&dyn rusqlite::ToSql> =
                params.iter().chain(limit_offset_params.iter()).map(|p| p.as_ref()).collect();
            let rows = stmt
                .query_map(all_params.as_slice(), |row| {
                    let message_id: i64 = row.get(0)?;
                    let server_id: String = row.get(1)?;
                    let received_date: String = row.get(2)?;
                    let processed: i64 = row.get(3)?;
                    let import_id: Option<i64> = row.get(4)?;
                    let import_channel_id: Option<String> = row.get(5)?;
                    Ok(Message {
                        channel_id,
                        message_id,
                        server_id: Uuid::parse_str(&server_id).unwrap_or_default(),
                        received_date: DateTime::parse_from_rfc3339(&received_date)
                            .map(|d| d.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap()),
                        processed: processed != 0,
                        import_id,
                        import_channel_id: import_channel_id.and_then(|s| Uuid::parse_str(&s).ok()),
                    })
                })
                .map_err(EngineError::Storage)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(EngineError::Storage)?);
            }
            Ok(out)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))?
    }

    async fn count_messages(&self, channel_id: ChannelId, filter: &MessageFilter) -> Result<u64> {
        self.ensure_channel(channel_id).await?;
        let conn = self.conn.clone();
        let tables = Self::tables(channel_id);
        let filter = filter.clone();
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let conn = conn.lock();
            let (where_clause, params) = build_message_filter(&tables, &filter);
            let sql = format!("SELECT COUNT(*) FROM {}{}", tables.messages, where_clause);
            let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
            conn.query_row(&sql, param_refs.as_slice(), |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
                .map_err(EngineError::Storage)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))?
    }

    async fn delete_messages(&self, channel_id: ChannelId, message_ids: &[i64]) -> Result<()> {
        self.ensure_channel(channel_id).await?;
        let conn = self.conn.clone();
        let tables = Self::tables(channel_id);
        let ids = message_ids.to_vec();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.lock();
            for id in ids {
                conn.execute(&format!("DELETE FROM {} WHERE message_id = ?1", tables.messages), params![id])
                    .map_err(EngineError::Storage)?;
                conn.execute(&format!("DELETE FROM {} WHERE message_id = ?1", tables.connector_messages), params![id])
                    .map_err(EngineError::Storage)?;
                conn.execute(&format!("DELETE FROM {} WHERE message_id = ?1", tables.content), params![id])
                    .map_err(EngineError::Storage)?;
                conn.execute(&format!("DELETE FROM {} WHERE message_id = ?1", tables.attachments), params![id])
                    .map_err(EngineError::Storage)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))?
    }

    async fn get_statistics(&self, channel_id: ChannelId) -> Result<HashMap<i32, ConnectorStatistics>> {
        self.ensure_channel(channel_id).await?;
        let conn = self.conn.clone();
        let tables = Self::tables(channel_id);
        tokio::task::spawn_blocking(move || -> Result<HashMap<i32, ConnectorStatistics>> {
            let conn = conn.lock();
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT meta_data_id, received, filtered, transformed, sent, error, queued FROM {}",
                    tables.statistics
                ))
                .map_err(EngineError::Storage)?;
            let rows = stmt
                .query_map([], |row| {
                    let meta_data_id: i32 = row.get(0)?;
                    Ok((
                        meta_data_id,
                        ConnectorStatistics {
                            received: row.get::<_, i64>(1)? as u64,
                            filtered: row.get::<_, i64>(2)? as u64,
                            transformed: row.get::<_, i64>(3)? as u64,
                            sent: row.get::<_, i64>(4)? as u64,
                            error: row.get::<_, i64>(5)? as u64,
                            queued: row.get::<_, i64>(6)? as u64,
                        },
                    ))
                })
                .map_err(EngineError::Storage)?;
            let mut out = HashMap::new();
            for row in rows {
                let (id, stats) = row.map_err(EngineError::Storage)?;
                out.insert(id, stats);
            }
            Ok(out)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))?
    }

    async fn record_statistic(&self, channel_id: ChannelId, meta_data_id: i32, status: ConnectorMessageStatus) -> Result<()> {
        self.ensure_channel(channel_id).await?;
        let conn = self.conn.clone();
        let tables = Self::tables(channel_id);
        let column = match status {
            ConnectorMessageStatus::Received => "received",
            ConnectorMessageStatus::Filtered => "filtered",
            ConnectorMessageStatus::Transformed => "transformed",
            ConnectorMessageStatus::Sent => "sent",
            ConnectorMessageStatus::Error => "error",
            ConnectorMessageStatus::Queued => "queued",
            ConnectorMessageStatus::Pending => return Ok(()),
        };
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.lock();
            conn.execute(
                &format!(
                    "INSERT INTO {} (meta_data_id, received, filtered, transformed, sent, error, queued)
                     VALUES (?1, 0, 0, 0, 0, 0, 0)
                     ON CONFLICT(meta_data_id) DO NOTHING",
                    tables.statistics
                ),
                params![meta_data_id],
            )
            .map_err(EngineError::Storage)?;
            conn.execute(
                &format!("UPDATE {} SET {} = {} + 1 WHERE meta_data_id = ?1", tables.statistics, column, column),
                params![meta_data_id],
            )
            .map_err(EngineError::Storage)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))?
    }

    async fn reset_statistics(
        &self,
        channel_id: ChannelId,
        meta_data_id: Option<i32>,
        statuses: Option<Vec<ConnectorMessageStatus>>,
    ) -> Result<()> {
        self.ensure_channel(channel_id).await?;
        let conn = self.conn.clone();
        let tables = Self::tables(channel_id);
        let columns: Vec<&'static str> = match &statuses {
            Some(statuses) => statuses
                .iter()
                .filter_map(|s| match s {
                    ConnectorMessageStatus::Received => Some("received"),
                    ConnectorMessageStatus::Filtered => Some("filtered"),
                    ConnectorMessageStatus::Transformed => Some("transformed"),
                    ConnectorMessageStatus::Sent => Some("sent"),
                    ConnectorMessageStatus::Error => Some("error"),
                    ConnectorMessageStatus::Queued => Some("queued"),
                    ConnectorMessageStatus::Pending => None,
                })
                .collect(),
            None => vec!["received", "filtered", "transformed", "sent", "error", "queued"],
        };
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.lock();
            let set_clause = columns.iter().map(|c| format!("{c} = 0")).collect::<Vec<_>>().join(", ");
            let sql = match meta_data_id {
                Some(id) => format!("UPDATE {} SET {} WHERE meta_data_id = {}", tables.statistics, set_clause, id),
                None => format!("UPDATE {} SET {}", tables.statistics, set_clause),
            };
            conn.execute(&sql, []).map_err(EngineError::Storage)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))?
    }

    async fn drop_channel(&self, channel_id: ChannelId) -> Result<()> {
        let conn = self.conn.clone();
        let tables = Self::tables(channel_id);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.lock();
            for table in [&tables.messages, &tables.connector_messages, &tables.content, &tables.attachments, &tables.statistics] {
                conn.execute(&format!("DROP TABLE IF EXISTS {table}"), []).map_err(EngineError::Storage)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))?;
        self.initialized_channels.remove(&channel_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_per_channel_tables_and_round_trips_content() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let channel_id = Uuid::new_v4();
        let id = store.create_message(channel_id, Uuid::new_v4(), Utc::now()).await.unwrap();
        assert_eq!(id, 1);
        store.write_content(channel_id, id, 0, ContentType::Raw, "MSH|...", None).await.unwrap();
        let read = store.read_content(channel_id, id, 0, ContentType::Raw).await.unwrap();
        assert_eq!(read.as_deref(), Some("MSH|..."));
    }

    #[tokio::test]
    async fn status_updates_accumulate_statistics() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let channel_id = Uuid::new_v4();
        let id = store.create_message(channel_id, Uuid::new_v4(), Utc::now()).await.unwrap();
        store.update_connector_message_status(channel_id, id, 1, ConnectorMessageStatus::Sent).await.unwrap();
        let stats = store.get_statistics(channel_id).await.unwrap();
        assert_eq!(stats[&1].sent, 1);
    }

    #[tokio::test]
    async fn maps_round_trip_through_json() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let channel_id = Uuid::new_v4();
        let id = store.create_message(channel_id, Uuid::new_v4(), Utc::now()).await.unwrap();
        let mut maps = Maps::default();
        maps.channel_map.insert("k".to_string(), "v".to_string());
        store.write_maps(channel_id, id, 0, &maps).await.unwrap();
        let read = store.read_maps(channel_id, id, 0).await.unwrap();
        assert_eq!(read.channel_map.get("k"), Some(&"v".to_string()));
    }

    #[tokio::test]
    async fn list_messages_with_no_filter_returns_every_message() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let channel_id = Uuid::new_v4();
        store.create_message(channel_id, Uuid::new_v4(), Utc::now()).await.unwrap();
        store.create_message(channel_id, Uuid::new_v4(), Utc::now()).await.unwrap();
        let all = store.list_messages(channel_id, MessageFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(store.count_messages(channel_id, &MessageFilter::default()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn list_messages_filters_by_id_range_and_metadata_id_and_status() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let channel_id = Uuid::new_v4();
        let first = store.create_message(channel_id, Uuid::new_v4(), Utc::now()).await.unwrap();
        let second = store.create_message(channel_id, Uuid::new_v4(), Utc::now()).await.unwrap();
        let third = store.create_message(channel_id, Uuid::new_v4(), Utc::now()).await.unwrap();
        store.update_connector_message_status(channel_id, second, 1, ConnectorMessageStatus::Sent).await.unwrap();
        store.update_connector_message_status(channel_id, third, 2, ConnectorMessageStatus::Error).await.unwrap();

        let by_range = store
            .list_messages(channel_id, MessageFilter { min_id: Some(second), max_id: Some(third), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(by_range.iter().map(|m| m.message_id).collect::<Vec<_>>(), vec![second, third]);

        let by_status = store
            .list_messages(
                channel_id,
                MessageFilter {
                    meta_data_ids: Some(vec![1]),
                    statuses: Some(vec![ConnectorMessageStatus::Sent]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_status.iter().map(|m| m.message_id).collect::<Vec<_>>(), vec![second]);

        assert!(first > 0);
    }

    #[tokio::test]
    async fn list_messages_filters_by_content_substring_and_regex() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let channel_id = Uuid::new_v4();
        let first = store.create_message(channel_id, Uuid::new_v4(), Utc::now()).await.unwrap();
        let second = store.create_message(channel_id, Uuid::new_v4(), Utc::now()).await.unwrap();
        store.write_content(channel_id, first, 0, ContentType::Raw, "MSH|ADT^A01", None).await.unwrap();
        store.write_content(channel_id, second, 0, ContentType::Raw, "MSH|ORU^R01", None).await.unwrap();

        let by_substring = store
            .list_messages(channel_id, MessageFilter { content_substring: Some("ADT".to_string()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(by_substring.iter().map(|m| m.message_id).collect::<Vec<_>>(), vec![first]);

        let by_regex = store
            .list_messages(channel_id, MessageFilter { content_regex: Some("ORU\\^R\\d+".to_string()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(by_regex.iter().map(|m| m.message_id).collect::<Vec<_>>(), vec![second]);
    }

    #[tokio::test]
    async fn attachments_round_trip_and_assign_sequential_ids() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let channel_id = Uuid::new_v4();
        let id = store.create_message(channel_id, Uuid::new_v4(), Utc::now()).await.unwrap();
        let a1 = store.write_attachment(channel_id, id, "image/png", b"one").await.unwrap();
        let a2 = store.write_attachment(channel_id, id, "application/pdf", b"two").await.unwrap();
        assert_eq!((a1, a2), (1, 2));

        let fetched = store.get_attachment(channel_id, id, a2).await.unwrap().unwrap();
        assert_eq!(fetched.mime_type, "application/pdf");
        assert_eq!(fetched.data, b"two");

        let list = store.list_attachments(channel_id, id).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].attachment_id, a1);
    }

    #[tokio::test]
    async fn deleting_a_message_removes_its_attachments() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let channel_id = Uuid::new_v4();
        let id = store.create_message(channel_id, Uuid::new_v4(), Utc::now()).await.unwrap();
        let attachment_id = store.write_attachment(channel_id, id, "image/png", b"data").await.unwrap();

        store.delete_messages(channel_id, &[id]).await.unwrap();

        assert!(store.get_attachment(channel_id, id, attachment_id).await.unwrap().is_none());
    }
}
