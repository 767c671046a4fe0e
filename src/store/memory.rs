//! An in-process `MessageStore` backed by locked `HashMap`s. Used by the unit
//! and integration test suites and by the ephemeral `standalone` engine mode
//! (spec.md §6, `MIRTH_MODE=standalone`) where no database is configured.

use super::{MessageFilter, MessageStore};
use crate::error::{EngineError, Result};
use crate::model::{Attachment, ChannelId, ConnectorMessage, ConnectorMessageStatus, ConnectorStatistics, ContentType, Maps, Message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
struct ChannelState {
    next_message_id: i64,
    next_attachment_id: i64,
    messages: HashMap<i64, Message>,
    connector_messages: HashMap<(i64, i32), ConnectorMessage>,
    content: HashMap<(i64, i32, ContentType), String>,
    maps: HashMap<(i64, i32), Maps>,
    attachments: HashMap<i64, Attachment>,
    statistics: HashMap<i32, ConnectorStatistics>,
}

/// An in-memory `MessageStore`. Cheap to construct, never persists past process
/// lifetime, and makes no attempt at cross-process consistency.
#[derive(Default)]
pub struct InMemoryStore {
    channels: DashMap<ChannelId, Mutex<ChannelState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_channel<R>(&self, channel_id: ChannelId, f: impl FnOnce(&mut ChannelState) -> R) -> R {
        let entry = self.channels.entry(channel_id).or_default();
        let mut state = entry.lock();
        f(&mut state)
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn create_message(&self, channel_id: ChannelId, server_id: Uuid, received_date: DateTime<Utc>) -> Result<i64> {
        Ok(self.with_channel(channel_id, |state| {
            state.next_message_id += 1;
            let message_id = state.next_message_id;
            state.messages.insert(
                message_id,
                Message {
                    channel_id,
                    message_id,
                    server_id,
                    received_date,
                    processed: false,
                    import_id: None,
                    import_channel_id: None,
                },
            );
            state
                .connector_messages
                .insert((message_id, crate::model::SOURCE_META_DATA_ID), ConnectorMessage::new_source(channel_id, message_id));
            message_id
        }))
    }

    async fn get_message(&self, channel_id: ChannelId, message_id: i64) -> Result<Option<Message>> {
        Ok(self.with_channel(channel_id, |state| state.messages.get(&message_id).cloned()))
    }

    async fn mark_processed(&self, channel_id: ChannelId, message_id: i64) -> Result<()> {
        self.with_channel(channel_id, |state| {
            if let Some(message) = state.messages.get_mut(&message_id) {
                message.processed = true;
            }
        });
        Ok(())
    }

    async fn upsert_connector_message(&self, connector_message: ConnectorMessage) -> Result<()> {
        self.with_channel(connector_message.channel_id, |state| {
            state
                .connector_messages
                .insert((connector_message.message_id, connector_message.meta_data_id), connector_message);
        });
        Ok(())
    }

    async fn get_connector_message(
        &self,
        channel_id: ChannelId,
        message_id: i64,
        meta_data_id: i32,
    ) -> Result<Option<ConnectorMessage>> {
        Ok(self.with_channel(channel_id, |state| state.connector_messages.get(&(message_id, meta_data_id)).cloned()))
    }

    async fn update_connector_message_status(
        &self,
        channel_id: ChannelId,
        message_id: i64,
        meta_data_id: i32,
        status: ConnectorMessageStatus,
    ) -> Result<()> {
        self.with_channel(channel_id, |state| {
            state
                .connector_messages
                .entry((message_id, meta_data_id))
                .or_insert_with(|| ConnectorMessage::new_destination(channel_id, message_id, meta_data_id, ""))
                .status = status;
            state.statistics.entry(meta_data_id).or_default().record(status);
        });
        Ok(())
    }

    async fn upsert_connector_message_attempts(
        &self,
        channel_id: ChannelId,
        message_id: i64,
        meta_data_id: i32,
        attempts: u32,
    ) -> Result<()> {
        self.with_channel(channel_id, |state| {
            state
                .connector_messages
                .entry((message_id, meta_data_id))
                .or_insert_with(|| ConnectorMessage::new_destination(channel_id, message_id, meta_data_id, ""))
                .send_attempts = attempts;
        });
        Ok(())
    }

    async fn write_content(
        &self,
        channel_id: ChannelId,
        message_id: i64,
        meta_data_id: i32,
        content_type: ContentType,
        text: &str,
        _data_type: Option<&str>,
    ) -> Result<()> {
        self.with_channel(channel_id, |state| {
            state.content.insert((message_id, meta_data_id, content_type), text.to_string());
        });
        Ok(())
    }

    async fn read_content(
        &self,
        channel_id: ChannelId,
        message_id: i64,
        meta_data_id: i32,
        content_type: ContentType,
    ) -> Result<Option<String>> {
        Ok(self.with_channel(channel_id, |state| state.content.get(&(message_id, meta_data_id, content_type)).cloned()))
    }

    async fn write_maps(&self, channel_id: ChannelId, message_id: i64, meta_data_id: i32, maps: &Maps) -> Result<()> {
        self.with_channel(channel_id, |state| {
            state.maps.insert((message_id, meta_data_id), maps.clone());
        });
        Ok(())
    }

    async fn read_maps(&self, channel_id: ChannelId, message_id: i64, meta_data_id: i32) -> Result<Maps> {
        Ok(self.with_channel(channel_id, |state| state.maps.get(&(message_id, meta_data_id)).cloned().unwrap_or_default()))
    }

    async fn write_attachment(&self, channel_id: ChannelId, message_id: i64, mime_type: &str, data: &[u8]) -> Result<i64> {
        Ok(self.with_channel(channel_id, |state| {
            state.next_attachment_id += 1;
            let attachment_id = state.next_attachment_id;
            state.attachments.insert(
                attachment_id,
                Attachment {
                    channel_id,
                    message_id,
                    attachment_id,
                    mime_type: mime_type.to_string(),
                    data: data.to_vec(),
                },
            );
            attachment_id
        }))
    }

    async fn get_attachment(&self, channel_id: ChannelId, message_id: i64, attachment_id: i64) -> Result<Option<Attachment>> {
        Ok(self.with_channel(channel_id, |state| {
            state.attachments.get(&attachment_id).filter(|a| a.message_id == message_id).cloned()
        }))
    }

    async fn list_attachments(&self, channel_id: ChannelId, message_id: i64) -> Result<Vec<Attachment>> {
        Ok(self.with_channel(channel_id, |state| {
            let mut out: Vec<Attachment> = state.attachments.values().filter(|a| a.message_id == message_id).cloned().collect();
            out.sort_by_key(|a| a.attachment_id);
            out
        }))
    }

    async fn list_messages(&self, channel_id: ChannelId, filter: MessageFilter) -> Result<Vec<Message>> {
        let content_regex = filter
            .content_regex
            .as_deref()
            .map(regex::Regex::new)
            .transpose()
            .map_err(|e| EngineError::Validation(format!("invalid content filter regex: {e}")))?;
        Ok(self.with_channel(channel_id, |state| {
            let mut out: Vec<Message> = state
                .messages
                .values()
                .filter(|m| filter.min_id.map_or(true, |min| m.message_id >= min))
                .filter(|m| filter.max_id.map_or(true, |max| m.message_id <= max))
                .filter(|m| match filter.received_after {
                    Some(after) => m.received_date >= after,
                    None => true,
                })
                .filter(|m| match filter.received_before {
                    Some(before) => m.received_date <= before,
                    None => true,
                })
                .filter(|m| {
                    if filter.statuses.is_none() && filter.meta_data_ids.is_none() {
                        return true;
                    }
                    state.connector_messages.values().any(|cm| {
                        cm.message_id == m.message_id
                            && filter.meta_data_ids.as_ref().map_or(true, |ids| ids.contains(&cm.meta_data_id))
                            && filter.statuses.as_ref().map_or(true, |statuses| statuses.contains(&cm.status))
                    })
                })
                .filter(|m| {
                    if filter.content_substring.is_none() && content_regex.is_none() {
                        return true;
                    }
                    state.content.iter().any(|((mid, _, _), text)| {
                        *mid == m.message_id
                            && filter.content_substring.as_ref().map_or(true, |needle| text.contains(needle.as_str()))
                            && content_regex.as_ref().map_or(true, |re| re.is_match(text))
                    })
                })
                .cloned()
                .collect();
            out.sort_by_key(|m| m.message_id);
            let offset = filter.offset.unwrap_or(0) as usize;
            let out = out.into_iter().skip(offset);
            match filter.limit {
                Some(limit) => out.take(limit as usize).collect(),
                None => out.collect(),
            }
        }))
    }

    async fn count_messages(&self, channel_id: ChannelId, filter: &MessageFilter) -> Result<u64> {
        let filter = filter.clone();
        Ok(self.list_messages(channel_id, MessageFilter { limit: None, offset: None, ..filter }).await?.len() as u64)
    }

    async fn delete_messages(&self, channel_id: ChannelId, message_ids: &[i64]) -> Result<()> {
        self.with_channel(channel_id, |state| {
            for id in message_ids {
                state.messages.remove(id);
                state.connector_messages.retain(|(mid, _), _| mid != id);
                state.content.retain(|(mid, _, _), _| mid != id);
                state.maps.retain(|(mid, _), _| mid != id);
                state.attachments.retain(|_, a| &a.message_id != id);
            }
        });
        Ok(())
    }

    async fn get_statistics(&self, channel_id: ChannelId) -> Result<HashMap<i32, ConnectorStatistics>> {
        Ok(self.with_channel(channel_id, |state| state.statistics.clone()))
    }

    async fn record_statistic(&self, channel_id: ChannelId, meta_data_id: i32, status: ConnectorMessageStatus) -> Result<()> {
        self.with_channel(channel_id, |state| {
            state.statistics.entry(meta_data_id).or_default().record(status);
        });
        Ok(())
    }

    async fn reset_statistics(
        &self,
        channel_id: ChannelId,
        meta_data_id: Option<i32>,
        statuses: Option<Vec<ConnectorMessageStatus>>,
    ) -> Result<()> {
        self.with_channel(channel_id, |state| match meta_data_id {
            Some(id) => {
                if let Some(stats) = state.statistics.get_mut(&id) {
                    stats.reset(statuses.as_deref());
                }
            }
            None => {
                for stats in state.statistics.values_mut() {
                    stats.reset(statuses.as_deref());
                }
            }
        });
        Ok(())
    }

    async fn drop_channel(&self, channel_id: ChannelId) -> Result<()> {
        self.channels.remove(&channel_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn assigns_monotonic_message_ids_per_channel() {
        let store = InMemoryStore::new();
        let channel_id = Uuid::new_v4();
        let first = store.create_message(channel_id, Uuid::new_v4(), Utc::now()).await.unwrap();
        let second = store.create_message(channel_id, Uuid::new_v4(), Utc::now()).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn content_is_append_only_per_type() {
        let store = InMemoryStore::new();
        let channel_id = Uuid::new_v4();
        let id = store.create_message(channel_id, Uuid::new_v4(), Utc::now()).await.unwrap();
        store.write_content(channel_id, id, 0, ContentType::Raw, "first", None).await.unwrap();
        store.write_content(channel_id, id, 0, ContentType::Transformed, "second", None).await.unwrap();
        assert_eq!(store.read_content(channel_id, id, 0, ContentType::Raw).await.unwrap().unwrap(), "first");
        assert_eq!(
            store.read_content(channel_id, id, 0, ContentType::Transformed).await.unwrap().unwrap(),
            "second"
        );
    }

    #[tokio::test]
    async fn list_messages_filters_by_id_range_metadata_id_and_status() {
        let store = InMemoryStore::new();
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

        assert_eq!(
            store.count_messages(channel_id, &MessageFilter::default()).await.unwrap(),
            3
        );
        assert!(first > 0);
    }

    #[tokio::test]
    async fn list_messages_filters_by_content_substring_and_regex() {
        let store = InMemoryStore::new();
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
    async fn attachments_are_assigned_sequential_ids_and_scoped_to_their_message() {
        let store = InMemoryStore::new();
        let channel_id = Uuid::new_v4();
        let first_message = store.create_message(channel_id, Uuid::new_v4(), Utc::now()).await.unwrap();
        let second_message = store.create_message(channel_id, Uuid::new_v4(), Utc::now()).await.unwrap();

        let a1 = store.write_attachment(channel_id, first_message, "image/png", b"one").await.unwrap();
        let a2 = store.write_attachment(channel_id, first_message, "application/pdf", b"two").await.unwrap();
        let a3 = store.write_attachment(channel_id, second_message, "text/plain", b"three").await.unwrap();
        assert_eq!((a1, a2, a3), (1, 2, 3));

        let first_list = store.list_attachments(channel_id, first_message).await.unwrap();
        assert_eq!(first_list.len(), 2);
        assert_eq!(first_list[0].attachment_id, a1);
        assert_eq!(first_list[1].mime_type, "application/pdf");

        assert!(store.get_attachment(channel_id, first_message, a3).await.unwrap().is_none());
        let fetched = store.get_attachment(channel_id, second_message, a3).await.unwrap().unwrap();
        assert_eq!(fetched.data, b"three");
    }

    #[tokio::test]
    async fn deleting_a_message_removes_its_attachments() {
        let store = InMemoryStore::new();
        let channel_id = Uuid::new_v4();
        let message_id = store.create_message(channel_id, Uuid::new_v4(), Utc::now()).await.unwrap();
        let attachment_id = store.write_attachment(channel_id, message_id, "image/png", b"data").await.unwrap();

        store.delete_messages(channel_id, &[message_id]).await.unwrap();

        assert!(store.get_attachment(channel_id, message_id, attachment_id).await.unwrap().is_none());
        assert!(store.list_attachments(channel_id, message_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn statistics_accumulate_per_meta_data_id() {
        let store = InMemoryStore::new();
        let channel_id = Uuid::new_v4();
        store.record_statistic(channel_id, 0, ConnectorMessageStatus::Received).await.unwrap();
        store.record_statistic(channel_id, 1, ConnectorMessageStatus::Sent).await.unwrap();
        let stats = store.get_statistics(channel_id).await.unwrap();
        assert_eq!(stats[&0].received, 1);
        assert_eq!(stats[&1].sent, 1);
    }
}
