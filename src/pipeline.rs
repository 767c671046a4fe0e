//! # Pipeline Engine
//!
//! Ingest -> source filter -> source transformer -> fan-out to destinations ->
//! response aggregation, per spec.md §4.E. Destination fan-out is a structured
//! task group (`tokio::task::JoinSet`): destinations run concurrently unless the
//! channel disables parallelism or a destination sets
//! `waitForPreviousDestination`, in which case the group drains before that
//! destination starts, the same "ordered stages, one join point" shape the
//! teacher's benchmark orchestration (`src/benchmark.rs`) uses for its
//! warmup/measurement/cleanup stages.

use crate::codec::{self, EncryptionKey};
use crate::connector::ResponseStatus;
use crate::dispatcher::Dispatcher as DestinationDispatcher;
use crate::error::Result;
use crate::evaluator::{ScriptBindings, ScriptEvaluator, ScriptHandle};
use crate::events::{EngineEvent, EventBus, MessageProcessed};
use crate::model::{ChannelId, ConnectorMessage, ConnectorMessageStatus, ContentType, Maps};
use crate::store::MessageStore;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn, Instrument};
use uuid::Uuid;

/// A configured destination slot in the pipeline: its scripts, its dispatcher,
/// and whether it must wait for the previous destination to finish.
pub struct PipelineDestination {
    pub meta_data_id: i32,
    pub name: String,
    pub filter_handle: Option<ScriptHandle>,
    pub transformer_handle: Option<ScriptHandle>,
    pub wait_for_previous_destination: bool,
    pub dispatcher: Arc<DestinationDispatcher>,
}

/// The outcome of running one message through the pipeline.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub message_id: i64,
    pub source_status: ConnectorMessageStatus,
    pub destination_statuses: Vec<(i32, ConnectorMessageStatus)>,
    pub response_text: Option<String>,
}

pub struct Pipeline {
    pub channel_id: ChannelId,
    pub server_id: Uuid,
    store: Arc<dyn MessageStore>,
    evaluator: Arc<dyn ScriptEvaluator>,
    source_filter: Option<ScriptHandle>,
    source_transformer: Option<ScriptHandle>,
    response_script: Option<ScriptHandle>,
    destinations: Vec<PipelineDestination>,
    process_destinations_in_parallel: bool,
    encryption_key: Option<EncryptionKey>,
    events: EventBus,
    shadow_mode: bool,
    global_map: Arc<DashMap<String, String>>,
    configuration_map: Arc<HashMap<String, String>>,
    /// `GlobalChannelMap` (spec.md §3): shared across every message of this
    /// channel, never across channels. One instance per `Pipeline` since a
    /// `Pipeline` is itself one-to-one with a deployed channel.
    global_channel_map: Arc<DashMap<String, String>>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel_id: ChannelId,
        server_id: Uuid,
        store: Arc<dyn MessageStore>,
        evaluator: Arc<dyn ScriptEvaluator>,
        source_filter: Option<ScriptHandle>,
        source_transformer: Option<ScriptHandle>,
        response_script: Option<ScriptHandle>,
        destinations: Vec<PipelineDestination>,
        process_destinations_in_parallel: bool,
        encryption_key: Option<EncryptionKey>,
        events: EventBus,
        shadow_mode: bool,
        global_map: Arc<DashMap<String, String>>,
        configuration_map: Arc<HashMap<String, String>>,
    ) -> Self {
        Self {
            channel_id,
            server_id,
            store,
            evaluator,
            source_filter,
            source_transformer,
            response_script,
            destinations,
            process_destinations_in_parallel,
            encryption_key,
            events,
            shadow_mode,
            global_map,
            configuration_map,
            global_channel_map: Arc::new(DashMap::new()),
        }
    }

    #[instrument(skip(self, raw_payload, source_map), fields(channel_id = %self.channel_id, request_id = %Uuid::new_v4()))]
    pub async fn ingest(&self, raw_payload: &str, source_map: HashMap<String, String>) -> Result<IngestOutcome> {
        let message_id = self.store.create_message(self.channel_id, self.server_id, chrono::Utc::now()).await?;
        self.store.write_content(self.channel_id, message_id, 0, ContentType::Raw, raw_payload, None).await?;
        self.store.record_statistic(self.channel_id, 0, ConnectorMessageStatus::Received).await?;

        let mut maps = Maps {
            source_map,
            ..Maps::default()
        };
        self.store.write_maps(self.channel_id, message_id, 0, &maps).await?;

        let mut bindings = ScriptBindings {
            maps: maps.clone(),
            global_map: self.global_map.clone(),
            global_channel_map: self.global_channel_map.clone(),
            configuration_map: self.configuration_map.clone(),
            message_text: raw_payload.to_string(),
        };

        if let Some(handle) = self.source_filter {
            let result = self.evaluator.evaluate_filter(handle, &bindings).await?;
            if result.filtered {
                self.store
                    .update_connector_message_status(self.channel_id, message_id, 0, ConnectorMessageStatus::Filtered)
                    .await?;
                self.store.mark_processed(self.channel_id, message_id).await?;
                let outcome = IngestOutcome {
                    message_id,
                    source_status: ConnectorMessageStatus::Filtered,
                    destination_statuses: Vec::new(),
                    response_text: None,
                };
                self.publish_processed(&outcome);
                return Ok(outcome);
            }
        }

        let processed_raw = if let Some(handle) = self.source_transformer {
            let result = self.evaluator.evaluate_transform(handle, &bindings).await?;
            maps.channel_map.extend(result.channel_map_delta);
            maps.connector_map.extend(result.connector_map_delta);
            bindings.maps = maps.clone();
            self.store
                .update_connector_message_status(self.channel_id, message_id, 0, ConnectorMessageStatus::Transformed)
                .await?;
            result.transformed
        } else {
            raw_payload.to_string()
        };
        self.store
            .write_content(self.channel_id, message_id, 0, ContentType::ProcessedRaw, &processed_raw, None)
            .await?;
        self.store.write_maps(self.channel_id, message_id, 0, &maps).await?;

        let destination_statuses = self.fan_out(message_id, &processed_raw, &maps).await?;

        let response_text = self.aggregate_response(message_id, &bindings, &destination_statuses).await?;

        self.store.mark_processed(self.channel_id, message_id).await?;
        let outcome = IngestOutcome {
            message_id,
            source_status: ConnectorMessageStatus::Transformed,
            destination_statuses,
            response_text,
        };
        self.publish_processed(&outcome);
        Ok(outcome)
    }

    async fn fan_out(&self, message_id: i64, processed_raw: &str, source_maps: &Maps) -> Result<Vec<(i32, ConnectorMessageStatus)>> {
        let mut results = Vec::with_capacity(self.destinations.len());
        let mut pending: JoinSet<(i32, ConnectorMessageStatus)> = JoinSet::new();

        for destination in &self.destinations {
            if !self.process_destinations_in_parallel || destination.wait_for_previous_destination {
                while let Some(joined) = pending.join_next().await {
                    if let Ok(result) = joined {
                        results.push(result);
                    }
                }
            }

            self.store
                .upsert_connector_message(ConnectorMessage::new_destination(
                    self.channel_id,
                    message_id,
                    destination.meta_data_id,
                    &destination.name,
                ))
                .await?;

            // `JoinSet::spawn` puts each destination on its own task, which would
            // otherwise drop the `ingest` span's `request_id` from its logs.
            let task = self.run_destination(destination, message_id, processed_raw, source_maps, self.shadow_mode).in_current_span();
            pending.spawn(task);
        }

        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(channel_id = %self.channel_id, error = %e, "destination task panicked; treated as ERROR"),
            }
        }

        results.sort_by_key(|(id, _)| *id);
        Ok(results)
    }

    fn run_destination(
        &self,
        destination: &PipelineDestination,
        message_id: i64,
        processed_raw: &str,
        source_maps: &Maps,
        shadow_mode: bool,
    ) -> impl std::future::Future<Output = (i32, ConnectorMessageStatus)> + Send + 'static {
        let channel_id = self.channel_id;
        let meta_data_id = destination.meta_data_id;
        let name = destination.name.clone();
        let store = self.store.clone();
        let evaluator = self.evaluator.clone();
        let filter_handle = destination.filter_handle;
        let transformer_handle = destination.transformer_handle;
        let dispatcher = destination.dispatcher.clone();
        let encryption_key = self.encryption_key.clone();
        let processed_raw = processed_raw.to_string();
        let mut maps = source_maps.clone();
        let global_map = self.global_map.clone();
        let global_channel_map = self.global_channel_map.clone();
        let configuration_map = self.configuration_map.clone();

        async move {
            let mut bindings = ScriptBindings {
                maps: maps.clone(),
                global_map,
                global_channel_map,
                configuration_map,
                message_text: processed_raw.clone(),
            };

            if let Some(handle) = filter_handle {
                match evaluator.evaluate_filter(handle, &bindings).await {
                    Ok(result) if result.filtered => {
                        let _ = store
                            .update_connector_message_status(channel_id, message_id, meta_data_id, ConnectorMessageStatus::Filtered)
                            .await;
                        return (meta_data_id, ConnectorMessageStatus::Filtered);
                    }
                    Ok(_) => {}
                    Err(_) => {
                        let _ = store
                            .update_connector_message_status(channel_id, message_id, meta_data_id, ConnectorMessageStatus::Error)
                            .await;
                        return (meta_data_id, ConnectorMessageStatus::Error);
                    }
                }
            }

            let transformed = if let Some(handle) = transformer_handle {
                match evaluator.evaluate_transform(handle, &bindings).await {
                    Ok(result) => {
                        maps.connector_map.extend(result.connector_map_delta);
                        bindings.maps = maps.clone();
                        result.transformed
                    }
                    Err(_) => {
                        let _ = store
                            .update_connector_message_status(channel_id, message_id, meta_data_id, ConnectorMessageStatus::Error)
                            .await;
                        return (meta_data_id, ConnectorMessageStatus::Error);
                    }
                }
            } else {
                processed_raw.clone()
            };

            let _ = store
                .write_content(channel_id, message_id, meta_data_id, ContentType::Transformed, &transformed, None)
                .await;
            let _ = store.write_maps(channel_id, message_id, meta_data_id, &maps).await;

            let encoded = match codec::encode(&transformed, encryption_key.as_ref()) {
                Ok(encoded) => encoded,
                Err(_) => {
                    let _ = store
                        .update_connector_message_status(channel_id, message_id, meta_data_id, ConnectorMessageStatus::Error)
                        .await;
                    return (meta_data_id, ConnectorMessageStatus::Error);
                }
            };
            let _ = store.write_content(channel_id, message_id, meta_data_id, ContentType::Encoded, &encoded, None).await;

            if shadow_mode {
                let _ = store
                    .update_connector_message_status(channel_id, message_id, meta_data_id, ConnectorMessageStatus::Pending)
                    .await;
                info!(channel_id = %channel_id, destination = %name, message_id, "shadow mode: encoded content persisted, delivery suppressed");
                return (meta_data_id, ConnectorMessageStatus::Pending);
            }

            let status = if dispatcher.queue_enabled() {
                match dispatcher.enqueue(message_id).await.await {
                    Ok(status) => status,
                    Err(_) => ConnectorMessageStatus::Error,
                }
            } else {
                dispatcher.send_sync(message_id).await
            };

            info!(channel_id = %channel_id, destination = %name, message_id, ?status, "destination reached terminal status");
            (meta_data_id, status)
        }
    }

    async fn aggregate_response(
        &self,
        message_id: i64,
        bindings: &ScriptBindings,
        destination_statuses: &[(i32, ConnectorMessageStatus)],
    ) -> Result<Option<String>> {
        let Some(handle) = self.response_script else {
            return Ok(None);
        };
        let result = self.evaluator.evaluate_response(handle, bindings).await?;
        if let Some(message) = &result.message {
            self.store
                .write_content(self.channel_id, message_id, 0, ContentType::ResponseTransformed, message, None)
                .await?;
        }
        if result.status != ResponseStatus::Sent && destination_statuses.iter().all(|(_, s)| s.is_terminal()) {
            // Response script can downgrade the overall outcome even when every
            // destination individually succeeded; record it for operators.
            warn!(channel_id = %self.channel_id, message_id, ?result.status, "response script reported a non-SENT aggregate status");
        }
        Ok(result.message)
    }

    fn publish_processed(&self, outcome: &IngestOutcome) {
        self.events.publish(EngineEvent::MessageProcessed(MessageProcessed {
            channel_id: self.channel_id,
            message_id: outcome.message_id,
            source_status: outcome.source_status,
            destination_statuses: outcome.destination_statuses.clone(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{Connector, DestinationConnector, Response};
    use crate::evaluator::NoopEvaluator;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct AlwaysSent;

    #[async_trait]
    impl Connector for AlwaysSent {
        async fn start(&mut self) -> Result<()> {
            Ok(())
        }
        async fn stop(&mut self) -> Result<()> {
            Ok(())
        }
        async fn halt(&mut self) -> Result<()> {
            Ok(())
        }
        async fn pause(&mut self) -> Result<()> {
            Ok(())
        }
        async fn resume(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl DestinationConnector for AlwaysSent {
        async fn send(&self, _payload: &str, _maps: &Maps) -> Result<Response> {
            Ok(Response::sent())
        }
    }

    #[tokio::test]
    async fn happy_path_reaches_sent_for_every_destination() {
        let store: Arc<dyn MessageStore> = Arc::new(InMemoryStore::new());
        let channel_id = Uuid::new_v4();
        let dispatcher = Arc::new(DestinationDispatcher::new(
            channel_id,
            1,
            "Dest1".to_string(),
            crate::config::QueueSettings::default(),
            Arc::new(AlwaysSent),
            store.clone(),
            CancellationToken::new(),
        ));
        dispatcher.start();

        let pipeline = Pipeline::new(
            channel_id,
            Uuid::new_v4(),
            store.clone(),
            Arc::new(NoopEvaluator),
            None,
            None,
            None,
            vec![PipelineDestination {
                meta_data_id: 1,
                name: "Dest1".to_string(),
                filter_handle: None,
                transformer_handle: None,
                wait_for_previous_destination: false,
                dispatcher,
            }],
            false,
            None,
            EventBus::new(16),
            false,
            Arc::new(DashMap::new()),
            Arc::new(HashMap::new()),
        );

        let outcome = pipeline.ingest("MSH|...", HashMap::new()).await.unwrap();
        assert_eq!(outcome.source_status, ConnectorMessageStatus::Transformed);
        assert_eq!(outcome.destination_statuses, vec![(1, ConnectorMessageStatus::Sent)]);
    }

    #[tokio::test]
    async fn source_transformer_sees_shared_global_and_configuration_maps() {
        struct EchoesGlobals;
        #[async_trait]
        impl ScriptEvaluator for EchoesGlobals {
            async fn compile(&self, _channel_id: Uuid, _scope: crate::evaluator::ScriptScope, _source: &str) -> Result<ScriptHandle> {
                Ok(ScriptHandle(0))
            }
            async fn evaluate_filter(&self, _handle: ScriptHandle, _bindings: &ScriptBindings) -> Result<crate::evaluator::FilterResult> {
                Ok(crate::evaluator::FilterResult { filtered: false })
            }
            async fn evaluate_transform(&self, _handle: ScriptHandle, bindings: &ScriptBindings) -> Result<crate::evaluator::TransformResult> {
                let site = bindings.configuration_map.get("site").cloned().unwrap_or_default();
                let visits = bindings.global_map.get("visits").map(|v| v.value().clone()).unwrap_or_default();
                bindings.global_map.insert("visits".to_string(), "1".to_string());
                Ok(crate::evaluator::TransformResult {
                    transformed: format!("{site}/{visits}"),
                    channel_map_delta: HashMap::new(),
                    connector_map_delta: HashMap::new(),
                })
            }
            async fn evaluate_response(&self, _handle: ScriptHandle, _bindings: &ScriptBindings) -> Result<crate::evaluator::ResponseResult> {
                Ok(crate::evaluator::ResponseResult { status: ResponseStatus::Sent, message: None })
            }
            async fn release(&self, _handle: ScriptHandle) -> Result<()> {
                Ok(())
            }
        }

        let store: Arc<dyn MessageStore> = Arc::new(InMemoryStore::new());
        let channel_id = Uuid::new_v4();
        let global_map = Arc::new(DashMap::new());
        let configuration_map = Arc::new(HashMap::from([("site".to_string(), "CLINIC-A".to_string())]));

        let pipeline = Pipeline::new(
            channel_id,
            Uuid::new_v4(),
            store,
            Arc::new(EchoesGlobals),
            None,
            Some(ScriptHandle(0)),
            None,
            Vec::new(),
            false,
            None,
            EventBus::new(16),
            false,
            global_map.clone(),
            configuration_map,
        );

        let first = pipeline.ingest("MSH|...", HashMap::new()).await.unwrap();
        assert_eq!(first.source_status, ConnectorMessageStatus::Transformed);
        assert_eq!(global_map.get("visits").map(|v| v.value().clone()), Some("1".to_string()));

        // The second message observes the write the first one made to the
        // shared global map, since both share the same `Arc<DashMap>`.
        let second = pipeline.ingest("MSH|...", HashMap::new()).await.unwrap();
        assert_eq!(second.source_status, ConnectorMessageStatus::Transformed);
    }

    #[tokio::test]
    async fn shadow_mode_persists_encoded_content_without_dispatching() {
        let store: Arc<dyn MessageStore> = Arc::new(InMemoryStore::new());
        let channel_id = Uuid::new_v4();
        let dispatcher = Arc::new(DestinationDispatcher::new(
            channel_id,
            1,
            "Dest1".to_string(),
            crate::config::QueueSettings::default(),
            Arc::new(AlwaysSent),
            store.clone(),
            CancellationToken::new(),
        ));
        dispatcher.start();

        let pipeline = Pipeline::new(
            channel_id,
            Uuid::new_v4(),
            store.clone(),
            Arc::new(NoopEvaluator),
            None,
            None,
            None,
            vec![PipelineDestination {
                meta_data_id: 1,
                name: "Dest1".to_string(),
                filter_handle: None,
                transformer_handle: None,
                wait_for_previous_destination: false,
                dispatcher,
            }],
            false,
            None,
            EventBus::new(16),
            true,
            Arc::new(DashMap::new()),
            Arc::new(HashMap::new()),
        );

        let outcome = pipeline.ingest("MSH|...", HashMap::new()).await.unwrap();
        assert_eq!(outcome.destination_statuses, vec![(1, ConnectorMessageStatus::Pending)]);
        let encoded = store.read_content(channel_id, outcome.message_id, 1, ContentType::Encoded).await.unwrap();
        assert!(encoded.is_some());
    }

    #[tokio::test]
    async fn source_filter_drops_message_before_fan_out() {
        let store: Arc<dyn MessageStore> = Arc::new(InMemoryStore::new());
        let channel_id = Uuid::new_v4();

        struct AlwaysFiltered;
        #[async_trait]
        impl ScriptEvaluator for AlwaysFiltered {
            async fn compile(&self, _channel_id: Uuid, _scope: crate::evaluator::ScriptScope, _source: &str) -> Result<ScriptHandle> {
                Ok(ScriptHandle(0))
            }
            async fn evaluate_filter(&self, _handle: ScriptHandle, _bindings: &ScriptBindings) -> Result<crate::evaluator::FilterResult> {
                Ok(crate::evaluator::FilterResult { filtered: true })
            }
            async fn evaluate_transform(
                &self,
                _handle: ScriptHandle,
                bindings: &ScriptBindings,
            ) -> Result<crate::evaluator::TransformResult> {
                Ok(crate::evaluator::TransformResult {
                    transformed: bindings.message_text.clone(),
                    channel_map_delta: HashMap::new(),
                    connector_map_delta: HashMap::new(),
                })
            }
            async fn evaluate_response(
                &self,
                _handle: ScriptHandle,
                _bindings: &ScriptBindings,
            ) -> Result<crate::evaluator::ResponseResult> {
                Ok(crate::evaluator::ResponseResult {
                    status: ResponseStatus::Sent,
                    message: None,
                })
            }
            async fn release(&self, _handle: ScriptHandle) -> Result<()> {
                Ok(())
            }
        }

        let pipeline = Pipeline::new(
            channel_id,
            Uuid::new_v4(),
            store.clone(),
            Arc::new(AlwaysFiltered),
            Some(ScriptHandle(0)),
            None,
            None,
            Vec::new(),
            false,
            None,
            EventBus::new(16),
            false,
            Arc::new(DashMap::new()),
            Arc::new(HashMap::new()),
        );

        let outcome = pipeline.ingest("MSH|...", HashMap::new()).await.unwrap();
        assert_eq!(outcome.source_status, ConnectorMessageStatus::Filtered);
        assert!(outcome.destination_statuses.is_empty());

        let stats = store.get_statistics(channel_id).await.unwrap();
        assert_eq!(stats[&0].received, 1);
        assert_eq!(stats[&0].filtered, 1);
    }
}
