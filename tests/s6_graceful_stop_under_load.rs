//! A destination dispatcher draining a backlog of slow, in-flight deliveries
//! when the channel is stopped: every message queued before the stop request
//! must still reach a terminal status, and `drain` must return once the
//! backlog is empty rather than waiting out its full grace period.

use async_trait::async_trait;
use channel_runtime::config::QueueSettings;
use channel_runtime::connector::{Connector, DestinationConnector, Response};
use channel_runtime::dispatcher::Dispatcher;
use channel_runtime::model::{ChannelId, ConnectorMessageStatus, ContentType, Maps};
use channel_runtime::store::{InMemoryStore, MessageStore};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct SlowDestination;

#[async_trait]
impl Connector for SlowDestination {
    async fn start(&mut self) -> channel_runtime::Result<()> {
        Ok(())
    }
    async fn stop(&mut self) -> channel_runtime::Result<()> {
        Ok(())
    }
    async fn halt(&mut self) -> channel_runtime::Result<()> {
        Ok(())
    }
    async fn pause(&mut self) -> channel_runtime::Result<()> {
        Ok(())
    }
    async fn resume(&mut self) -> channel_runtime::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl DestinationConnector for SlowDestination {
    async fn send(&self, _payload: &str, _maps: &Maps) -> channel_runtime::Result<Response> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(Response::sent())
    }
}

#[tokio::test]
async fn stop_drains_a_backlog_of_slow_deliveries_before_returning() {
    let store: Arc<dyn MessageStore> = Arc::new(InMemoryStore::new());
    let channel_id = ChannelId::new_v4();

    const MESSAGE_COUNT: i64 = 5;
    for message_id in 1..=MESSAGE_COUNT {
        store.create_message(channel_id, uuid::Uuid::new_v4(), chrono::Utc::now()).await.unwrap();
        store
            .write_content(channel_id, message_id, 1, ContentType::Encoded, "payload", None)
            .await
            .unwrap();
    }

    let settings = QueueSettings {
        thread_count: 2,
        buffer_size: MESSAGE_COUNT as usize,
        ..Default::default()
    };
    let dispatcher = Arc::new(Dispatcher::new(
        channel_id,
        1,
        "SlowDest".to_string(),
        settings,
        Arc::new(SlowDestination),
        store.clone(),
        CancellationToken::new(),
    ));
    dispatcher.start();

    let mut receivers = Vec::with_capacity(MESSAGE_COUNT as usize);
    for message_id in 1..=MESSAGE_COUNT {
        receivers.push(dispatcher.enqueue(message_id).await);
    }

    // The channel is stopping while several deliveries are still in flight;
    // the dispatcher must finish them rather than abandon them mid-send.
    dispatcher.drain(Duration::from_secs(5)).await;

    for rx in receivers {
        assert_eq!(rx.await.unwrap(), ConnectorMessageStatus::Sent);
    }

    dispatcher.halt().await;
}

#[tokio::test]
async fn drain_returns_promptly_once_the_queue_is_already_empty() {
    let store: Arc<dyn MessageStore> = Arc::new(InMemoryStore::new());
    let channel_id = ChannelId::new_v4();
    let dispatcher = Arc::new(Dispatcher::new(
        channel_id,
        1,
        "SlowDest".to_string(),
        QueueSettings::default(),
        Arc::new(SlowDestination),
        store,
        CancellationToken::new(),
    ));
    dispatcher.start();

    let started = tokio::time::Instant::now();
    dispatcher.drain(Duration::from_secs(30)).await;
    assert!(started.elapsed() < Duration::from_secs(1));

    dispatcher.halt().await;
}
