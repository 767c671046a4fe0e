//! # Engine Controller
//!
//! The process-wide context object spec.md §9's Design Notes call for ("model
//! the requirement as a process context object that owns the channel registry,
//! the store, and the evaluator handle; avoid global mutable state"). A
//! `DashMap` keyed by channel id holds one `DeployedChannel` per deployed
//! channel, mirroring the construction-by-lookup shape of the teacher's
//! `TransportFactory`; lifecycle operations validate through
//! `ChannelStateMachine::apply` before touching any connector or dispatcher, and
//! `deploy` enforces the revision-conflict semantics the (out-of-scope) REST
//! layer surfaces as HTTP 409.

use crate::codec::EncryptionKey;
use crate::config::{ChannelConfig, ConnectorProperties, InitialState};
use crate::connector::file::{FileDestinationConnector, FileSourceConnector};
use crate::connector::http::HttpConnector;
use crate::connector::mllp::MllpConnector;
use crate::connector::{Connector, DestinationConnector, SourceConnector};
use crate::dicom::{DicomAcceptPolicy, DicomDestinationConnector, DicomSourceConnector};
use crate::dispatcher::Dispatcher;
use crate::error::{EngineError, Result};
use crate::evaluator::{ScriptEvaluator, ScriptHandle, ScriptScope};
use crate::events::{EngineEvent, EventBus, StateChanged};
use crate::model::ChannelId;
use crate::pipeline::{Pipeline, PipelineDestination};
use crate::state_machine::{ChannelOperation, ChannelState, ChannelStateMachine};
use crate::store::MessageStore;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// One deployed channel: its configuration snapshot, lifecycle state, the
/// pipeline it drives messages through, the source connector that feeds it,
/// and the destination dispatchers the pipeline dispatches into.
pub struct DeployedChannel {
    pub config: ChannelConfig,
    state_machine: Arc<ChannelStateMachine>,
    #[allow(dead_code)]
    pipeline: Arc<Pipeline>,
    source: AsyncMutex<Box<dyn SourceConnector>>,
    dispatchers: Vec<Arc<Dispatcher>>,
}

impl DeployedChannel {
    pub fn state(&self) -> ChannelState {
        self.state_machine.current()
    }
}

/// The engine's process context: every channel deployed in this process, the
/// shared durability/scripting/eventing handles every channel is built from.
pub struct EngineController {
    server_id: Uuid,
    store: Arc<dyn MessageStore>,
    evaluator: Arc<dyn ScriptEvaluator>,
    encryption_key: Option<EncryptionKey>,
    events: EventBus,
    /// `MIRTH_SHADOW_MODE`: every deployed channel ingests and persists
    /// normally but never hands work to a destination dispatcher.
    shadow_mode: bool,
    /// `GlobalMap` (spec.md §3): process-wide, mutable, shared by every
    /// deployed channel's pipeline.
    global_map: Arc<DashMap<String, String>>,
    /// `ConfigurationMap` (spec.md §3): process-wide, read-mostly, loaded
    /// once at process start.
    configuration_map: Arc<HashMap<String, String>>,
    channels: DashMap<ChannelId, Arc<DeployedChannel>>,
}

impl EngineController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server_id: Uuid,
        store: Arc<dyn MessageStore>,
        evaluator: Arc<dyn ScriptEvaluator>,
        encryption_key: Option<EncryptionKey>,
        events: EventBus,
        shadow_mode: bool,
        configuration_map: HashMap<String, String>,
    ) -> Self {
        Self {
            server_id,
            store,
            evaluator,
            encryption_key,
            events,
            shadow_mode,
            global_map: Arc::new(DashMap::new()),
            configuration_map: Arc::new(configuration_map),
            channels: DashMap::new(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn get_channel(&self, channel_id: ChannelId) -> Result<Arc<DeployedChannel>> {
        self.channels
            .get(&channel_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::NotFound(format!("channel {channel_id} is not deployed")))
    }

    fn publish_state_change(&self, channel_id: ChannelId, from: ChannelState, to: ChannelState) {
        self.events.publish(EngineEvent::StateChanged(StateChanged {
            channel_id,
            from: from.to_string(),
            to: to.to_string(),
        }));
    }

    /// Deploy `config`. Rejects a redeploy whose `revision` is not strictly
    /// greater than the currently deployed one with `EngineError::Conflict`
    /// (spec.md §6: HTTP 409), and rejects deploying a channel whose
    /// `depends_on` list names a channel that isn't already deployed.
    #[instrument(skip(self, config), fields(channel_id = %config.channel_id, revision = config.revision, request_id = %Uuid::new_v4()))]
    pub async fn deploy(&self, config: ChannelConfig) -> Result<ChannelState> {
        config.validate().map_err(EngineError::Validation)?;

        for dependency in &config.properties.depends_on {
            if !self.channels.contains_key(dependency) {
                return Err(EngineError::Conflict(format!("channel depends on undeployed channel {dependency}")));
            }
        }

        if let Some(existing) = self.channels.get(&config.channel_id).map(|e| e.value().clone()) {
            if config.revision <= existing.config.revision {
                return Err(EngineError::Conflict(format!(
                    "channel {} has been modified (current revision {}, submitted revision {})",
                    config.channel_id, existing.config.revision, config.revision
                )));
            }
            drop(existing);
            self.undeploy(config.channel_id).await?;
        }

        let channel_id = config.channel_id;
        let initial_state = config.initial_state;
        let deployed = Arc::new(self.build_deployed_channel(config).await?);
        deployed.state_machine.apply(ChannelOperation::Deploy)?;
        self.channels.insert(channel_id, deployed.clone());

        let final_state = match initial_state {
            InitialState::Started => {
                self.activate(&deployed).await?;
                deployed.state_machine.apply(ChannelOperation::Start)?
            }
            InitialState::Paused => {
                self.activate(&deployed).await?;
                let state = deployed.state_machine.apply(ChannelOperation::Pause)?;
                deployed.source.lock().await.pause().await?;
                state
            }
            InitialState::Stopped => deployed.state_machine.apply(ChannelOperation::Stop)?,
        };
        self.publish_state_change(channel_id, ChannelState::Deploying, final_state);
        info!(channel_id = %channel_id, state = %final_state, "channel deployed");
        Ok(final_state)
    }

    async fn activate(&self, channel: &DeployedChannel) -> Result<()> {
        for dispatcher in &channel.dispatchers {
            dispatcher.start();
        }
        channel.source.lock().await.start().await
    }

    #[instrument(skip(self), fields(request_id = %Uuid::new_v4()))]
    pub async fn start(&self, channel_id: ChannelId) -> Result<ChannelState> {
        let channel = self.get_channel(channel_id)?;
        if channel.state() == ChannelState::Paused {
            return self.resume(channel_id).await;
        }
        let from = channel.state();
        let to = channel.state_machine.apply(ChannelOperation::Start)?;
        self.activate(&channel).await?;
        self.publish_state_change(channel_id, from, to);
        Ok(to)
    }

    #[instrument(skip(self), fields(request_id = %Uuid::new_v4()))]
    pub async fn pause(&self, channel_id: ChannelId) -> Result<ChannelState> {
        let channel = self.get_channel(channel_id)?;
        let from = channel.state();
        let to = channel.state_machine.apply(ChannelOperation::Pause)?;
        channel.source.lock().await.pause().await?;
        self.publish_state_change(channel_id, from, to);
        Ok(to)
    }

    #[instrument(skip(self), fields(request_id = %Uuid::new_v4()))]
    pub async fn resume(&self, channel_id: ChannelId) -> Result<ChannelState> {
        let channel = self.get_channel(channel_id)?;
        let from = channel.state();
        let to = channel.state_machine.apply(ChannelOperation::Resume)?;
        channel.source.lock().await.resume().await?;
        self.publish_state_change(channel_id, from, to);
        Ok(to)
    }

    /// Stop the source connector and let destination dispatchers drain for up
    /// to `stopGraceMillis` before returning (spec.md §4.G).
    #[instrument(skip(self), fields(request_id = %Uuid::new_v4()))]
    pub async fn stop(&self, channel_id: ChannelId) -> Result<ChannelState> {
        let channel = self.get_channel(channel_id)?;
        let from = channel.state();
        let to = channel.state_machine.apply(ChannelOperation::Stop)?;
        channel.source.lock().await.stop().await?;
        let grace = Duration::from_millis(channel.config.properties.stop_grace_millis);
        for dispatcher in &channel.dispatchers {
            dispatcher.drain(grace).await;
        }
        self.publish_state_change(channel_id, from, to);
        Ok(to)
    }

    /// Cancel all in-flight work immediately rather than draining it.
    #[instrument(skip(self), fields(request_id = %Uuid::new_v4()))]
    pub async fn halt(&self, channel_id: ChannelId) -> Result<ChannelState> {
        let channel = self.get_channel(channel_id)?;
        let from = channel.state();
        channel.state_machine.apply(ChannelOperation::Halt)?;
        channel.source.lock().await.halt().await?;
        for dispatcher in &channel.dispatchers {
            dispatcher.halt().await;
        }
        channel.state_machine.settle(ChannelState::Stopped);
        self.publish_state_change(channel_id, from, ChannelState::Stopped);
        Ok(ChannelState::Stopped)
    }

    /// Tear down a deployed channel. Channels that other deployed channels
    /// declare as a dependency cannot be undeployed until those dependents are
    /// undeployed first.
    #[instrument(skip(self), fields(request_id = %Uuid::new_v4()))]
    pub async fn undeploy(&self, channel_id: ChannelId) -> Result<ChannelState> {
        for entry in self.channels.iter() {
            if entry.key() != &channel_id && entry.value().config.properties.depends_on.contains(&channel_id) {
                return Err(EngineError::Conflict(format!("channel {} depends on {channel_id}", entry.key())));
            }
        }

        let channel = self.get_channel(channel_id)?;
        if !matches!(channel.state(), ChannelState::Stopped) {
            self.halt(channel_id).await?;
        }
        channel.state_machine.apply(ChannelOperation::Undeploy)?;
        channel.state_machine.settle(ChannelState::Undeployed);
        self.store.drop_channel(channel_id).await?;
        self.channels.remove(&channel_id);
        self.publish_state_change(channel_id, ChannelState::Undeploying, ChannelState::Undeployed);
        info!(channel_id = %channel_id, "channel undeployed");
        Ok(ChannelState::Undeployed)
    }

    pub fn channel_state(&self, channel_id: ChannelId) -> Result<ChannelState> {
        Ok(self.get_channel(channel_id)?.state())
    }

    pub fn deployed_channel_ids(&self) -> Vec<ChannelId> {
        self.channels.iter().map(|entry| *entry.key()).collect()
    }

    async fn compile_script(&self, channel_id: ChannelId, scope: ScriptScope, source: Option<&str>) -> Result<Option<ScriptHandle>> {
        match source {
            Some(src) if !src.trim().is_empty() => Ok(Some(self.evaluator.compile(channel_id, scope, src).await?)),
            _ => Ok(None),
        }
    }

    async fn build_deployed_channel(&self, config: ChannelConfig) -> Result<DeployedChannel> {
        let channel_id = config.channel_id;
        let state_machine = Arc::new(ChannelStateMachine::new());
        let cancellation = state_machine.cancellation_token();

        let source_filter = self.compile_script(channel_id, ScriptScope::SourceFilter, config.source.filter_script.as_deref()).await?;
        let source_transformer = self
            .compile_script(channel_id, ScriptScope::SourceTransformer, config.source.transformer_script.as_deref())
            .await?;
        let response_script = self.compile_script(channel_id, ScriptScope::Response, config.response_script.as_deref()).await?;

        let mut pipeline_destinations = Vec::with_capacity(config.destinations.len());
        let mut dispatchers = Vec::with_capacity(config.destinations.len());
        for destination in &config.destinations {
            if !destination.enabled {
                continue;
            }
            let connector = build_destination_connector(&destination.properties).await?;
            let dispatcher = Arc::new(Dispatcher::new(
                channel_id,
                destination.meta_data_id,
                destination.name.clone(),
                destination.queue_settings.clone(),
                connector,
                self.store.clone(),
                cancellation.clone(),
            ));
            let filter_handle = self
                .compile_script(channel_id, ScriptScope::DestinationFilter, destination.filter_script.as_deref())
                .await?;
            let transformer_handle = self
                .compile_script(channel_id, ScriptScope::DestinationTransformer, destination.transformer_script.as_deref())
                .await?;
            pipeline_destinations.push(PipelineDestination {
                meta_data_id: destination.meta_data_id,
                name: destination.name.clone(),
                filter_handle,
                transformer_handle,
                wait_for_previous_destination: destination.wait_for_previous_destination,
                dispatcher: dispatcher.clone(),
            });
            dispatchers.push(dispatcher);
        }

        let pipeline = Arc::new(Pipeline::new(
            channel_id,
            self.server_id,
            self.store.clone(),
            self.evaluator.clone(),
            source_filter,
            source_transformer,
            response_script,
            pipeline_destinations,
            config.properties.process_destinations_in_parallel,
            self.encryption_key.clone(),
            self.events.clone(),
            self.shadow_mode,
            self.global_map.clone(),
            self.configuration_map.clone(),
        ));

        let source = build_source_connector(&config.source.properties, pipeline.clone()).await?;

        Ok(DeployedChannel {
            config,
            state_machine,
            pipeline,
            source: AsyncMutex::new(source),
            dispatchers,
        })
    }
}

async fn build_source_connector(properties: &ConnectorProperties, pipeline: Arc<Pipeline>) -> Result<Box<dyn SourceConnector>> {
    match properties {
        ConnectorProperties::Mllp { host, port, idle_timeout_millis } => Ok(Box::new(MllpConnector::new(host.clone(), *port, *idle_timeout_millis, pipeline))),
        ConnectorProperties::File { directory, file_pattern } => Ok(Box::new(FileSourceConnector::new(directory.clone(), file_pattern.clone(), pipeline))),
        ConnectorProperties::Dicom {
            host,
            port,
            accepted_sop_classes,
            accepted_transfer_syntaxes,
            max_pdu_length,
            tls,
            ..
        } => {
            let mut connector = DicomSourceConnector::new(
                host.clone(),
                *port,
                DicomAcceptPolicy {
                    accepted_sop_classes: accepted_sop_classes.clone(),
                    accepted_transfer_syntaxes: accepted_transfer_syntaxes.clone(),
                    max_pdu_length: *max_pdu_length,
                },
                pipeline,
            );
            if let Some(tls) = tls {
                connector = connector.with_tls(crate::dicom::tls::DicomTlsConfig::from_files(
                    &tls.pkcs12_keystore_path,
                    &tls.keystore_password,
                    tls.ca_truststore_path.as_deref(),
                )?);
            }
            Ok(Box::new(connector))
        }
        ConnectorProperties::Http { .. } => Err(EngineError::Validation("HTTP connectors may only be used as destinations".into())),
    }
}

async fn build_destination_connector(properties: &ConnectorProperties) -> Result<Arc<dyn DestinationConnector>> {
    match properties {
        ConnectorProperties::Http { url, status_to_response } => Ok(Arc::new(HttpConnector::new(url.clone(), status_to_response.clone()))),
        ConnectorProperties::File { directory, file_pattern } => {
            let mut connector = FileDestinationConnector::new(directory.clone(), file_pattern.clone());
            connector.start().await?;
            Ok(Arc::new(connector))
        }
        ConnectorProperties::Dicom {
            host,
            port,
            application_entity,
            accepted_sop_classes,
            accepted_transfer_syntaxes,
            max_pdu_length,
            tls,
            ..
        } => {
            let sop_class_uid = accepted_sop_classes.first().cloned().unwrap_or_else(|| crate::dicom::association::VERIFICATION_SOP_CLASS_UID.to_string());
            let transfer_syntax = accepted_transfer_syntaxes.first().cloned().unwrap_or_else(|| "1.2.840.10008.1.2".to_string());
            let mut connector = DicomDestinationConnector::new(
                host.clone(),
                *port,
                application_entity.clone().unwrap_or_else(|| "ANY-SCP".to_string()),
                "CHANNEL-RUNTIME".to_string(),
                sop_class_uid,
                transfer_syntax,
                *max_pdu_length,
            );
            if let Some(tls) = tls {
                connector = connector.with_tls(crate::dicom::tls::DicomTlsConfig::from_files(
                    &tls.pkcs12_keystore_path,
                    &tls.keystore_password,
                    tls.ca_truststore_path.as_deref(),
                )?);
            }
            Ok(Arc::new(connector))
        }
        ConnectorProperties::Mllp { .. } => {
            warn!("MLLP is a source-only connector type in this engine; configuring it as a destination is a no-op sink");
            Err(EngineError::Validation("MLLP connectors may only be used as sources".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectorConfig, QueueSettings};
    use crate::evaluator::NoopEvaluator;
    use crate::store::InMemoryStore;
    use std::collections::HashMap;

    fn sample_config(port: u16) -> ChannelConfig {
        ChannelConfig {
            channel_id: Uuid::new_v4(),
            revision: 1,
            name: "Test Channel".to_string(),
            enabled: true,
            initial_state: InitialState::Started,
            source: ConnectorConfig {
                meta_data_id: 0,
                name: "Source".to_string(),
                enabled: true,
                properties: ConnectorProperties::Mllp {
                    host: "127.0.0.1".to_string(),
                    port,
                    idle_timeout_millis: None,
                },
                queue_settings: QueueSettings::default(),
                wait_for_previous_destination: false,
                filter_script: None,
                transformer_script: None,
            },
            destinations: vec![ConnectorConfig {
                meta_data_id: 1,
                name: "Dest1".to_string(),
                enabled: true,
                properties: ConnectorProperties::Http {
                    url: "http://127.0.0.1:0/ingest".to_string(),
                    status_to_response: HashMap::new(),
                },
                queue_settings: QueueSettings::default(),
                wait_for_previous_destination: false,
                filter_script: None,
                transformer_script: None,
            }],
            response_script: None,
            properties: crate::config::ChannelProperties::default(),
        }
    }

    fn controller() -> EngineController {
        EngineController::new(Uuid::new_v4(), Arc::new(InMemoryStore::new()), Arc::new(NoopEvaluator), None, EventBus::default(), false, HashMap::new())
    }

    #[tokio::test]
    async fn deploy_with_started_initial_state_reaches_started() {
        let controller = controller();
        let state = controller.deploy(sample_config(0)).await.unwrap();
        assert_eq!(state, ChannelState::Started);
    }

    #[tokio::test]
    async fn redeploy_with_stale_revision_is_a_conflict() {
        let controller = controller();
        let config = sample_config(0);
        let channel_id = config.channel_id;
        controller.deploy(config.clone()).await.unwrap();

        let mut stale = config;
        stale.name = "Renamed".to_string();
        let err = controller.deploy(stale).await.unwrap_err();
        assert_eq!(err.status_code(), 409);
        assert_eq!(controller.channel_state(channel_id).unwrap(), ChannelState::Started);
    }

    #[tokio::test]
    async fn undeploy_removes_the_channel_from_the_registry() {
        let controller = controller();
        let config = sample_config(0);
        let channel_id = config.channel_id;
        controller.deploy(config).await.unwrap();
        controller.undeploy(channel_id).await.unwrap();
        assert!(controller.channel_state(channel_id).is_err());
    }

    #[tokio::test]
    async fn deploying_a_channel_that_depends_on_an_undeployed_channel_fails() {
        let controller = controller();
        let mut config = sample_config(0);
        config.properties.depends_on = vec![Uuid::new_v4()];
        let err = controller.deploy(config).await.unwrap_err();
        assert_eq!(err.status_code(), 409);
    }
}
