//! # File Source/Destination Connectors
//!
//! The simplest concrete instances of the connector framework (spec.md §9): a
//! pull-style source that polls a directory for files matching a glob-lite
//! pattern and a destination that writes the encoded payload to a file. These
//! exercise the polling-loop and synchronous-write code paths the generic
//! framework in `mod.rs` doesn't otherwise need a concrete example of.

use super::{Connector, DestinationConnector, MessageResult, RawMessage, Response, SourceConnector};
use crate::error::{EngineError, Result};
use crate::model::Maps;
use crate::pipeline::Pipeline;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct FileSourceConnector {
    directory: PathBuf,
    file_pattern: String,
    pipeline: Arc<Pipeline>,
    cancellation: CancellationToken,
    poll_task: Option<JoinHandle<()>>,
    paused: Arc<AtomicBool>,
}

impl FileSourceConnector {
    pub fn new(directory: String, file_pattern: String, pipeline: Arc<Pipeline>) -> Self {
        Self {
            directory: PathBuf::from(directory),
            file_pattern,
            pipeline,
            cancellation: CancellationToken::new(),
            poll_task: None,
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

}

/// A glob-lite match: `*` is the only wildcard, matching everything between a
/// fixed prefix and suffix.
fn glob_lite_matches(pattern: &str, file_name: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => file_name.starts_with(prefix) && file_name.ends_with(suffix),
        None => file_name == pattern,
    }
}

#[async_trait]
impl Connector for FileSourceConnector {
    async fn start(&mut self) -> Result<()> {
        let directory = self.directory.clone();
        let pattern = self.file_pattern.clone();
        let pipeline = self.pipeline.clone();
        let cancellation = self.cancellation.clone();
        let paused = self.paused.clone();

        self.poll_task = Some(tokio::spawn(async move {
            let matches = |name: &str| glob_lite_matches(&pattern, name);
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => return,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
                if paused.load(Ordering::SeqCst) {
                    continue;
                }
                let mut entries = match tokio::fs::read_dir(&directory).await {
                    Ok(entries) => entries,
                    Err(e) => {
                        error!(directory = %directory.display(), error = %e, "failed to poll file source directory");
                        continue;
                    }
                };
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let Ok(file_name) = entry.file_name().into_string() else { continue };
                    if !matches(&file_name) {
                        continue;
                    }
                    let path = entry.path();
                    let payload = match tokio::fs::read_to_string(&path).await {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(file = %path.display(), error = %e, "failed to read polled file");
                            continue;
                        }
                    };
                    let mut source_map = HashMap::new();
                    source_map.insert("fileName".to_string(), file_name.clone());
                    source_map.insert("filePath".to_string(), path.display().to_string());

                    match pipeline.ingest(&payload, source_map).await {
                        Ok(_) => {
                            if let Err(e) = tokio::fs::remove_file(&path).await {
                                warn!(file = %path.display(), error = %e, "failed to remove processed file");
                            }
                        }
                        Err(e) => error!(file = %path.display(), error = %e, "pipeline ingest failed for polled file"),
                    }
                }
            }
        }));
        info!(directory = %self.directory.display(), "file source polling started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.cancellation.cancel();
        if let Some(task) = self.poll_task.take() {
            let _ = task.await;
        }
        Ok(())
    }

    async fn halt(&mut self) -> Result<()> {
        self.stop().await
    }

    async fn pause(&mut self) -> Result<()> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl SourceConnector for FileSourceConnector {
    async fn dispatch_raw_message(&self, raw: RawMessage) -> Result<MessageResult> {
        let outcome = self.pipeline.ingest(&raw.payload, raw.source_map).await?;
        Ok(MessageResult {
            message_id: outcome.message_id,
            accepted: outcome.source_status != crate::model::ConnectorMessageStatus::Error,
            detail: outcome.response_text,
        })
    }
}

pub struct FileDestinationConnector {
    directory: PathBuf,
    file_name_template: String,
}

impl FileDestinationConnector {
    pub fn new(directory: String, file_name_template: String) -> Self {
        Self {
            directory: PathBuf::from(directory),
            file_name_template,
        }
    }

    fn resolve_file_name(&self, message_id: i64) -> String {
        self.file_name_template.replace("${messageId}", &message_id.to_string())
    }
}

#[async_trait]
impl Connector for FileDestinationConnector {
    async fn start(&mut self) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| EngineError::Transport(format!("failed to create destination directory {}: {e}", self.directory.display())))
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
impl DestinationConnector for FileDestinationConnector {
    async fn send(&self, encoded_payload: &str, maps: &Maps) -> Result<Response> {
        let message_id = maps
            .connector_map
            .get("messageId")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let path = self.directory.join(self.resolve_file_name(message_id));
        match tokio::fs::write(&path, encoded_payload).await {
            Ok(()) => Ok(Response::sent()),
            Err(e) => Ok(Response::error(format!("failed to write {}: {e}", path.display()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_lite_pattern_matches_prefix_and_suffix() {
        assert!(glob_lite_matches("*.hl7", "message.hl7"));
        assert!(!glob_lite_matches("*.hl7", "message.txt"));
        assert!(glob_lite_matches("in-*.dat", "in-001.dat"));
        assert!(glob_lite_matches("exact.txt", "exact.txt"));
        assert!(!glob_lite_matches("exact.txt", "other.txt"));
    }

    #[test]
    fn resolve_file_name_substitutes_message_id() {
        let connector = FileDestinationConnector::new("/tmp".to_string(), "out-${messageId}.txt".to_string());
        assert_eq!(connector.resolve_file_name(42), "out-42.txt");
    }
}
