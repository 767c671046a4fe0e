//! # Destination Dispatcher
//!
//! One queue worker per destination when `queueEnabled=true`; otherwise the send
//! happens synchronously on the pipeline's own task (spec.md §4.F). Backpressure
//! is a bounded semaphore sized by `bufferSize`: enqueuing a message acquires a
//! permit that is only released once the message reaches a terminal status, so
//! `bufferSize` bounds messages *in flight* (queued + sending + retrying), not
//! just messages waiting to start.
//!
//! `rotate` needs "push a failing item to the tail instead of the head blocking",
//! which no single off-the-shelf async queue crate expresses directly, so the
//! queue itself is a small `Mutex<VecDeque<_>>` + `Notify` pair — the same
//! building blocks `tokio::sync::mpsc` is made of, just with explicit front/back
//! control.

use crate::config::QueueSettings;
use crate::connector::{DestinationConnector, ResponseStatus};
use crate::model::{ChannelId, ConnectorMessageStatus, ContentType, Maps};
use crate::store::MessageStore;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct QueueItem {
    message_id: i64,
    _permit: OwnedSemaphorePermit,
    done: oneshot::Sender<ConnectorMessageStatus>,
    attempt: u32,
}

struct Queue {
    items: Mutex<VecDeque<QueueItem>>,
    notify: Notify,
}

impl Queue {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push_back(&self, item: QueueItem) {
        self.items.lock().push_back(item);
        self.notify.notify_one();
    }

    fn push_front(&self, item: QueueItem) {
        self.items.lock().push_front(item);
        self.notify.notify_one();
    }

    fn pop_front(&self) -> Option<QueueItem> {
        self.items.lock().pop_front()
    }
}

/// A per-destination queue worker pool plus its configuration and connector.
pub struct Dispatcher {
    pub channel_id: ChannelId,
    pub meta_data_id: i32,
    pub name: String,
    settings: QueueSettings,
    connector: Arc<dyn DestinationConnector>,
    store: Arc<dyn MessageStore>,
    queue: Arc<Queue>,
    permits: Arc<Semaphore>,
    cancellation: CancellationToken,
    paused: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        channel_id: ChannelId,
        meta_data_id: i32,
        name: String,
        settings: QueueSettings,
        connector: Arc<dyn DestinationConnector>,
        store: Arc<dyn MessageStore>,
        cancellation: CancellationToken,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.buffer_size.max(1)));
        Self {
            channel_id,
            meta_data_id,
            name,
            settings,
            connector,
            store,
            queue: Arc::new(Queue::new()),
            permits,
            cancellation,
            paused: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Start the worker pool. A no-op if `queueEnabled` is false: callers should
    /// use `send_sync` directly in that case.
    pub fn start(&self) {
        if !self.settings.queue_enabled {
            return;
        }
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        for worker_id in 0..self.settings.thread_count.max(1) {
            let queue = self.queue.clone();
            let connector = self.connector.clone();
            let store = self.store.clone();
            let cancellation = self.cancellation.clone();
            let paused = self.paused.clone();
            let settings = self.settings.clone();
            let channel_id = self.channel_id;
            let meta_data_id = self.meta_data_id;
            let name = self.name.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(
                    worker_id, queue, connector, store, cancellation, paused, settings, channel_id, meta_data_id, name,
                )
                .await;
            }));
        }
    }

    /// Stop accepting new work but let in-flight/queued items drain up to
    /// `grace`. Used for the `DEPLOYED:* -> STOPPED` transition.
    pub async fn drain(&self, grace: std::time::Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.queue.items.lock().is_empty() && self.permits.available_permits() == self.settings.buffer_size.max(1) {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(channel_id = %self.channel_id, destination = %self.name, "stop grace period elapsed with work still in flight");
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
    }

    /// Cancel in-flight work immediately. Workers observe the shared
    /// `CancellationToken` and return promptly; queued state remains on disk.
    pub async fn halt(&self) {
        self.cancellation.cancel();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn queue_enabled(&self) -> bool {
        self.settings.queue_enabled
    }

    /// Enqueue a message for delivery, returning a receiver that resolves once
    /// the message reaches a terminal status. Blocks (backpressure) until a
    /// buffer slot is available.
    pub async fn enqueue(&self, message_id: i64) -> oneshot::Receiver<ConnectorMessageStatus> {
        let (tx, rx) = oneshot::channel();
        if !self.settings.queue_enabled {
            // Synchronous path: caller should have used `send_sync`, but handle
            // the call gracefully to keep the interface uniform.
            let store = self.store.clone();
            let connector = self.connector.clone();
            let channel_id = self.channel_id;
            let meta_data_id = self.meta_data_id;
            let settings = self.settings.clone();
            let outcome = attempt_delivery(&connector, &store, channel_id, message_id, meta_data_id, 1).await;
            let _ = tx.send(resolve_status(&settings, outcome.status, 1).0);
            return rx;
        }

        let permit = self.permits.clone().acquire_owned().await.expect("semaphore not closed");

        if self.settings.send_first {
            let outcome = attempt_delivery(
                &self.connector,
                &self.store,
                self.channel_id,
                message_id,
                self.meta_data_id,
                1,
            )
            .await;
            let (status, retry) = resolve_status(&self.settings, outcome.status, 1);
            if !retry {
                let _ = tx.send(status);
                return rx;
            }
            // First synchronous attempt failed: fall through to the queue for
            // the remaining retries, keeping the permit we already acquired.
            self.queue.push_back(QueueItem {
                message_id,
                _permit: permit,
                done: tx,
                attempt: 1,
            });
            return rx;
        }

        self.queue.push_back(QueueItem {
            message_id,
            _permit: permit,
            done: tx,
            attempt: 0,
        });
        rx
    }

    /// Deliver a message synchronously on the caller's task, for
    /// `queueEnabled=false` destinations.
    pub async fn send_sync(&self, message_id: i64) -> ConnectorMessageStatus {
        let outcome = attempt_delivery(
            &self.connector,
            &self.store,
            self.channel_id,
            message_id,
            self.meta_data_id,
            1,
        )
        .await;
        resolve_status(&self.settings, outcome.status, 1).0
    }
}

struct DeliveryOutcome {
    status: ResponseStatus,
}

async fn attempt_delivery(
    connector: &Arc<dyn DestinationConnector>,
    store: &Arc<dyn MessageStore>,
    channel_id: ChannelId,
    message_id: i64,
    meta_data_id: i32,
    attempt_number: u32,
) -> DeliveryOutcome {
    let encoded = store
        .read_content(channel_id, message_id, meta_data_id, ContentType::Encoded)
        .await
        .ok()
        .flatten()
        .unwrap_or_default();
    let maps = store
        .read_maps(channel_id, message_id, meta_data_id)
        .await
        .unwrap_or_default();

    let response = match connector.send(&encoded, &maps).await {
        Ok(response) => response,
        Err(e) => crate::connector::Response::error(e.to_string()),
    };

    let _ = store
        .upsert_connector_message_attempts(channel_id, message_id, meta_data_id, attempt_number)
        .await;

    if let Some(message) = &response.message {
        let _ = store
            .write_content(channel_id, message_id, meta_data_id, ContentType::Response, message, None)
            .await;
    }
    if response.status == ResponseStatus::Sent {
        let _ = store
            .write_content(channel_id, message_id, meta_data_id, ContentType::Sent, &encoded, None)
            .await;
    }

    DeliveryOutcome { status: response.status }
}

/// Map a `Response.status` to a terminal/non-terminal `ConnectorMessageStatus`
/// and whether the item should be retried, per spec.md §4.F step 4.
fn resolve_status(settings: &QueueSettings, status: ResponseStatus, attempt_number: u32) -> (ConnectorMessageStatus, bool) {
    match status {
        ResponseStatus::Sent => (ConnectorMessageStatus::Sent, false),
        ResponseStatus::Filtered => (ConnectorMessageStatus::Filtered, false),
        ResponseStatus::Error => {
            if attempt_number <= settings.retry_count {
                (ConnectorMessageStatus::Queued, true)
            } else {
                (ConnectorMessageStatus::Error, false)
            }
        }
        ResponseStatus::Queued => {
            if settings.queue_on_response_status.queued {
                (ConnectorMessageStatus::Queued, true)
            } else {
                // Conservative reading of the spec's Open Question: a
                // destination-returned QUEUED not covered by
                // `queueOnResponseStatus` is terminal and needs manual release.
                (ConnectorMessageStatus::Queued, false)
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    _worker_id: usize,
    queue: Arc<Queue>,
    connector: Arc<dyn DestinationConnector>,
    store: Arc<dyn MessageStore>,
    cancellation: CancellationToken,
    paused: Arc<AtomicBool>,
    settings: QueueSettings,
    channel_id: ChannelId,
    meta_data_id: i32,
    name: String,
) {
    loop {
        if cancellation.is_cancelled() {
            return;
        }
        let Some(mut item) = queue.pop_front() else {
            tokio::select! {
                _ = queue.notify.notified() => continue,
                _ = cancellation.cancelled() => return,
            }
        };

        if paused.load(Ordering::SeqCst) {
            // Paused disables source acceptance only; destination workers keep
            // draining, per spec.md §4.G.
        }

        item.attempt += 1;
        let outcome = attempt_delivery(&connector, &store, channel_id, item.message_id, meta_data_id, item.attempt).await;
        let (status, should_retry) = resolve_status(&settings, outcome.status, item.attempt);

        if let Err(e) = store
            .update_connector_message_status(channel_id, item.message_id, meta_data_id, status)
            .await
        {
            error!(channel_id = %channel_id, destination = %name, error = %e, "failed to persist connector-message status");
        }

        if should_retry {
            info!(
                channel_id = %channel_id,
                destination = %name,
                message_id = item.message_id,
                attempt = item.attempt,
                "destination send failed, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(settings.retry_interval_millis)) => {}
                _ = cancellation.cancelled() => return,
            }
            if settings.rotate {
                queue.push_back(item);
            } else {
                queue.push_front(item);
            }
            continue;
        }

        let _ = item.done.send(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{Connector, Response};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct FlakyDestination {
        failures_remaining: AtomicU32,
    }

    #[async_trait]
    impl Connector for FlakyDestination {
        async fn start(&mut self) -> crate::error::Result<()> {
            Ok(())
        }
        async fn stop(&mut self) -> crate::error::Result<()> {
            Ok(())
        }
        async fn halt(&mut self) -> crate::error::Result<()> {
            Ok(())
        }
        async fn pause(&mut self) -> crate::error::Result<()> {
            Ok(())
        }
        async fn resume(&mut self) -> crate::error::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl DestinationConnector for FlakyDestination {
        async fn send(&self, _payload: &str, _maps: &Maps) -> crate::error::Result<Response> {
            if self.failures_remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            }).is_ok() {
                Ok(Response::error("simulated transient failure"))
            } else {
                Ok(Response::sent())
            }
        }
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let store: Arc<dyn MessageStore> = Arc::new(InMemoryStore::new());
        let channel_id = ChannelId::new_v4();
        store.create_message(channel_id, uuid::Uuid::new_v4(), chrono::Utc::now()).await.unwrap();
        store
            .write_content(channel_id, 1, 1, ContentType::Encoded, "payload", None)
            .await
            .unwrap();

        let connector: Arc<dyn DestinationConnector> = Arc::new(FlakyDestination {
            failures_remaining: AtomicU32::new(2),
        });
        let settings = QueueSettings {
            retry_count: 5,
            retry_interval_millis: 5,
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(
            channel_id,
            1,
            "Dest1".to_string(),
            settings,
            connector,
            store.clone(),
            CancellationToken::new(),
        );
        dispatcher.start();

        let rx = dispatcher.enqueue(1).await;
        let status = rx.await.unwrap();
        assert_eq!(status, ConnectorMessageStatus::Sent);
        dispatcher.halt().await;
    }

    #[tokio::test]
    async fn exhausts_retries_and_terminates_in_error() {
        let store: Arc<dyn MessageStore> = Arc::new(InMemoryStore::new());
        let channel_id = ChannelId::new_v4();
        store.create_message(channel_id, uuid::Uuid::new_v4(), chrono::Utc::now()).await.unwrap();
        store
            .write_content(channel_id, 1, 1, ContentType::Encoded, "payload", None)
            .await
            .unwrap();

        let connector: Arc<dyn DestinationConnector> = Arc::new(FlakyDestination {
            failures_remaining: AtomicU32::new(100),
        });
        let settings = QueueSettings {
            retry_count: 2,
            retry_interval_millis: 1,
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(
            channel_id,
            1,
            "Dest1".to_string(),
            settings,
            connector,
            store.clone(),
            CancellationToken::new(),
        );
        dispatcher.start();

        let rx = dispatcher.enqueue(1).await;
        let status = rx.await.unwrap();
        assert_eq!(status, ConnectorMessageStatus::Error);
        dispatcher.halt().await;
    }
}
