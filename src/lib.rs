//! # Channel Runtime
//!
//! A healthcare message-integration channel runtime: configurable source and
//! destination connectors (MLLP, HTTP, file, DICOM), a filter/transform/dispatch
//! pipeline, a durable per-channel message store, and a DICOM association
//! engine, all driven from a single in-process engine controller.

pub mod codec;
pub mod config;
pub mod connector;
pub mod controller;
pub mod dicom;
pub mod dispatcher;
pub mod error;
pub mod evaluator;
pub mod events;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod state_machine;
pub mod store;

pub use codec::EncryptionKey;
pub use config::{ChannelConfig, ChannelProperties, ConnectorConfig, ConnectorProperties, EngineMode, EngineSettings, InitialState};
pub use controller::{DeployedChannel, EngineController};
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EventBus};
pub use model::ChannelId;
pub use state_machine::ChannelState;

/// The current version of the channel runtime.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
