//! # Channel Runtime - Process Host
//!
//! Boots the engine controller: structured logging, the message store, the
//! script evaluator, and the event bus. The REST/WebSocket control surface and
//! the channel configuration API are out of scope for this repository (see
//! `DESIGN.md`); this binary deploys nothing itself and simply keeps the
//! process alive so an embedder can construct channels against
//! `channel_runtime::EngineController` and run its connectors.

use anyhow::Result;
use channel_runtime::codec::EncryptionKey;
use channel_runtime::evaluator::NoopEvaluator;
use channel_runtime::logging::ColorizedFormatter;
use channel_runtime::store::SqliteMessageStore;
use channel_runtime::{EngineController, EngineSettings, EventBus};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = EngineSettings::from_env();

    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::INFO);

    let file_appender = tracing_appender::rolling::daily(".", "channel-runtime.log");
    let (non_blocking_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    let detailed_log_layer = tracing_subscriber::fmt::layer().with_writer(non_blocking_writer).with_ansi(false).with_filter(log_level);
    let stdout_log = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .event_format(ColorizedFormatter)
        .with_filter(log_level);

    tracing_subscriber::registry().with(detailed_log_layer).with(stdout_log).init();

    info!(mode = ?settings.mode, shadow_mode = settings.shadow_mode, "starting channel runtime");

    let store = Arc::new(SqliteMessageStore::open(&format!("{}.sqlite3", settings.db_name))?);
    let evaluator = Arc::new(NoopEvaluator);
    let encryption_key = settings.encryption_key.as_deref().map(EncryptionKey::from_key_material);
    let events = EventBus::default();
    let server_id = Uuid::new_v4();

    let controller = Arc::new(EngineController::new(
        server_id,
        store,
        evaluator,
        encryption_key,
        events,
        settings.shadow_mode,
        settings.configuration_map.clone(),
    ));

    info!("channel runtime ready; awaiting shutdown signal");
    tokio::signal::ctrl_c().await?;

    info!("shutdown signal received, halting deployed channels");
    for channel_id in controller.deployed_channel_ids() {
        if let Err(e) = controller.halt(channel_id).await {
            tracing::error!(%channel_id, error = %e, "failed to halt channel during shutdown");
        }
    }

    info!("channel runtime stopped");
    Ok(())
}
