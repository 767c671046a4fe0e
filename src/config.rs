//! # Channel Configuration Schema
//!
//! The canonical, serializable configuration tree for a channel (spec.md §3, §9
//! Design Notes: "define a canonical configuration schema as a tagged sum/variant
//! tree; the XML and JSON surfaces are two serializations of the same schema").
//! JSON is this struct's native `serde` encoding; an XML frontend would translate
//! into this shape before handing it to the engine controller (see `DESIGN.md`
//! for why the core does not implement an XML codec itself).

use crate::model::ChannelId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A channel's declared starting state once deployed, per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InitialState {
    Started,
    Paused,
    Stopped,
}

/// Which `Response` statuses cause a dispatcher item to be re-queued rather than
/// treated as terminal, per spec.md §4.F.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueOnResponseStatus {
    pub queued: bool,
}

/// Per-destination queue settings, per spec.md §4.F.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    pub queue_enabled: bool,
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_retry_interval_millis")]
    pub retry_interval_millis: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default)]
    pub rotate: bool,
    #[serde(default)]
    pub queue_on_response_status: QueueOnResponseStatus,
    #[serde(default)]
    pub send_first: bool,
}

fn default_thread_count() -> usize {
    1
}
fn default_buffer_size() -> usize {
    1000
}
fn default_retry_interval_millis() -> u64 {
    10_000
}
fn default_retry_count() -> u32 {
    0
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            queue_enabled: true,
            thread_count: default_thread_count(),
            buffer_size: default_buffer_size(),
            retry_interval_millis: default_retry_interval_millis(),
            retry_count: default_retry_count(),
            rotate: false,
            queue_on_response_status: QueueOnResponseStatus::default(),
            send_first: false,
        }
    }
}

/// The connector protocol, a tagged union so each variant can carry its own
/// properties while sharing a common descriptor shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorProperties {
    Mllp {
        host: String,
        port: u16,
        idle_timeout_millis: Option<u64>,
    },
    Http {
        url: String,
        #[serde(default)]
        status_to_response: HashMap<u16, crate::connector::ResponseStatus>,
    },
    File {
        directory: String,
        #[serde(default = "default_file_pattern")]
        file_pattern: String,
    },
    Dicom {
        host: String,
        port: u16,
        application_entity: Option<String>,
        accepted_sop_classes: Vec<String>,
        accepted_transfer_syntaxes: Vec<String>,
        max_pdu_length: u32,
        idle_timeout_millis: Option<u64>,
        tls: Option<TlsSettings>,
    },
}

fn default_file_pattern() -> String {
    "*.*".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    pub pkcs12_keystore_path: String,
    pub keystore_password: String,
    pub ca_truststore_path: Option<String>,
}

/// A single connector descriptor (source has `meta_data_id == 0`, destinations
/// are assigned 1..N by the engine, stable across revisions until removed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub meta_data_id: i32,
    pub name: String,
    pub enabled: bool,
    pub properties: ConnectorProperties,
    #[serde(default)]
    pub queue_settings: QueueSettings,
    #[serde(default)]
    pub wait_for_previous_destination: bool,
    #[serde(default)]
    pub filter_script: Option<String>,
    #[serde(default)]
    pub transformer_script: Option<String>,
}

/// The channel configuration's properties bag: queue/storage settings, metadata
/// columns, tags, and cross-channel dependencies (spec.md §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelProperties {
    #[serde(default)]
    pub metadata_columns: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<ChannelId>,
    #[serde(default)]
    pub process_destinations_in_parallel: bool,
    #[serde(default = "default_stop_grace_millis")]
    pub stop_grace_millis: u64,
}

fn default_stop_grace_millis() -> u64 {
    30_000
}

/// The complete channel configuration, per spec.md §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel_id: ChannelId,
    pub revision: u64,
    pub name: String,
    pub enabled: bool,
    pub initial_state: InitialState,
    pub source: ConnectorConfig,
    pub destinations: Vec<ConnectorConfig>,
    #[serde(default)]
    pub response_script: Option<String>,
    #[serde(default)]
    pub properties: ChannelProperties,
}

impl ChannelConfig {
    /// Validate the invariants spec.md §3 states for a channel shape:
    /// `metaDataId=0` reserved for source, destinations use distinct values >= 1,
    /// and the name is non-empty (uniqueness across channels is enforced by the
    /// registry, not by the config in isolation).
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("channel name must not be empty".to_string());
        }
        if self.source.meta_data_id != crate::model::SOURCE_META_DATA_ID {
            return Err("source connector must have metaDataId=0".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for dest in &self.destinations {
            if dest.meta_data_id < 1 {
                return Err(format!(
                    "destination '{}' has invalid metaDataId {} (must be >= 1)",
                    dest.name, dest.meta_data_id
                ));
            }
            if !seen.insert(dest.meta_data_id) {
                return Err(format!("duplicate metaDataId {} among destinations", dest.meta_data_id));
            }
        }
        Ok(())
    }
}

/// Process-wide settings parsed from the Environment knobs in spec.md §6.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub port: u16,
    pub db_host: String,
    pub db_port: u16,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
    pub mode: EngineMode,
    pub encryption_key: Option<String>,
    pub shadow_mode: bool,
    pub cluster_enabled: bool,
    pub ws_max_clients: usize,
    /// The read-mostly, process-wide `ConfigurationMap` (spec.md §3), loaded
    /// once at startup from `MIRTH_CONFIGURATION_MAP` as a JSON object.
    pub configuration_map: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    Takeover,
    Standalone,
    Auto,
}

impl EngineSettings {
    /// Parse from the process environment, applying the documented defaults.
    pub fn from_env() -> Self {
        let env = |key: &str| std::env::var(key).ok();
        Self {
            port: env("PORT").and_then(|v| v.parse().ok()).unwrap_or(8080),
            db_host: env("DB_HOST").unwrap_or_else(|| "localhost".to_string()),
            db_port: env("DB_PORT").and_then(|v| v.parse().ok()).unwrap_or(5432),
            db_name: env("DB_NAME").unwrap_or_else(|| "channelruntime".to_string()),
            db_user: env("DB_USER").unwrap_or_else(|| "channelruntime".to_string()),
            db_password: env("DB_PASSWORD").unwrap_or_default(),
            mode: match env("MIRTH_MODE").as_deref() {
                Some("takeover") => EngineMode::Takeover,
                Some("standalone") => EngineMode::Standalone,
                _ => EngineMode::Auto,
            },
            encryption_key: env("MIRTH_ENCRYPTION_KEY"),
            shadow_mode: env("MIRTH_SHADOW_MODE").as_deref() == Some("true"),
            cluster_enabled: env("MIRTH_CLUSTER_ENABLED").as_deref() == Some("true"),
            ws_max_clients: env("MIRTH_WS_MAX_CLIENTS").and_then(|v| v.parse().ok()).unwrap_or(100),
            configuration_map: env("MIRTH_CONFIGURATION_MAP")
                .and_then(|v| serde_json::from_str(&v).ok())
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_config() -> ChannelConfig {
        ChannelConfig {
            channel_id: Uuid::new_v4(),
            revision: 1,
            name: "CH1".to_string(),
            enabled: true,
            initial_state: InitialState::Started,
            source: ConnectorConfig {
                meta_data_id: 0,
                name: "Source".to_string(),
                enabled: true,
                properties: ConnectorProperties::Mllp {
                    host: "0.0.0.0".to_string(),
                    port: 6661,
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
                    url: "http://localhost/ingest".to_string(),
                    status_to_response: HashMap::new(),
                },
                queue_settings: QueueSettings::default(),
                wait_for_previous_destination: false,
                filter_script: None,
                transformer_script: None,
            }],
            response_script: None,
            properties: ChannelProperties::default(),
        }
    }

    #[test]
    fn validates_good_config() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn rejects_source_with_nonzero_meta_data_id() {
        let mut cfg = sample_config();
        cfg.source.meta_data_id = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_destination_meta_data_ids() {
        let mut cfg = sample_config();
        let mut dup = cfg.destinations[0].clone();
        dup.name = "Dest2".to_string();
        cfg.destinations.push(dup);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = sample_config();
        let json = serde_json::to_string(&cfg).unwrap();
        let parsed: ChannelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name, cfg.name);
        assert_eq!(parsed.destinations.len(), cfg.destinations.len());
    }
}
