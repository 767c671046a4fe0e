//! # MLLP Source Connector
//!
//! Minimal Lower Layer Protocol framing per spec.md §6: a frame is
//! `0x0B <hl7 bytes> 0x1C 0x0D`. A literal `0x1C` byte inside the body before the
//! trailing `0x1C 0x0D` pair is a premature terminator and surfaced as
//! `EngineError::Protocol`. On success the connector replies with an HL7 ACK
//! (`MSA|AA|<control id>`), `AE`/`AR` on failure.
//!
//! The accept-loop-plus-per-connection-read-buffer shape mirrors the teacher's
//! `TcpSocketTransport` (`src/ipc/tcp_socket.rs`): `socket2` tunes `TCP_NODELAY`
//! the same way, and the read loop accumulates into a growable buffer and scans
//! it for a complete frame instead of relying on a fixed length prefix.

use super::{Connector, MessageResult, RawMessage, SourceConnector};
use crate::error::{EngineError, Result};
use crate::pipeline::Pipeline;
use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const START_BLOCK: u8 = 0x0B;
const END_BLOCK: u8 = 0x1C;
const CARRIAGE_RETURN: u8 = 0x0D;

pub struct MllpConnector {
    host: String,
    port: u16,
    idle_timeout: Option<Duration>,
    pipeline: Arc<Pipeline>,
    cancellation: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
    paused: Arc<AtomicBool>,
}

impl MllpConnector {
    pub fn new(host: String, port: u16, idle_timeout_millis: Option<u64>, pipeline: Arc<Pipeline>) -> Self {
        Self {
            host,
            port,
            idle_timeout: idle_timeout_millis.map(Duration::from_millis),
            pipeline,
            cancellation: CancellationToken::new(),
            accept_task: None,
            paused: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Connector for MllpConnector {
    async fn start(&mut self) -> Result<()> {
        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .await
            .map_err(|e| EngineError::Transport(format!("failed to bind MLLP listener on {}:{}: {e}", self.host, self.port)))?;

        // A prior `stop()` leaves this token permanently cancelled; a fresh one
        // lets the same connector instance restart (DEPLOYED:STOPPED -> start).
        self.cancellation = CancellationToken::new();
        let cancellation = self.cancellation.clone();
        let pipeline = self.pipeline.clone();
        let idle_timeout = self.idle_timeout;
        let paused = self.paused.clone();

        self.accept_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => return,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                if paused.load(Ordering::SeqCst) {
                                    drop(stream);
                                    continue;
                                }
                                let pipeline = pipeline.clone();
                                let cancellation = cancellation.child_token();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, peer.to_string(), pipeline, idle_timeout, cancellation).await {
                                        warn!(error = %e, "MLLP connection ended with an error");
                                    }
                                });
                            }
                            Err(e) => {
                                error!(error = %e, "MLLP accept failed");
                            }
                        }
                    }
                }
            }
        }));
        info!(host = %self.host, port = self.port, "MLLP source listening");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.cancellation.cancel();
        if let Some(task) = self.accept_task.take() {
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
impl SourceConnector for MllpConnector {
    async fn dispatch_raw_message(&self, raw: RawMessage) -> Result<MessageResult> {
        let outcome = self.pipeline.ingest(&raw.payload, raw.source_map).await?;
        Ok(MessageResult {
            message_id: outcome.message_id,
            accepted: outcome.source_status != crate::model::ConnectorMessageStatus::Error,
            detail: outcome.response_text,
        })
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: String,
    pipeline: Arc<Pipeline>,
    idle_timeout: Option<Duration>,
    cancellation: CancellationToken,
) -> Result<()> {
    let sock_ref = SockRef::from(&stream);
    let _ = sock_ref.set_tcp_nodelay(true);
    let _ = sock_ref.set_tcp_keepalive(&TcpKeepalive::new().with_time(Duration::from_secs(60)));

    let mut buf = Vec::with_capacity(4096);
    let mut read_buf = [0u8; 4096];

    loop {
        let frame = match read_frame(&mut stream, &mut buf, &mut read_buf, idle_timeout, &cancellation).await? {
            Some(frame) => frame,
            None => return Ok(()),
        };

        let mut source_map = HashMap::new();
        source_map.insert("remoteAddress".to_string(), peer_addr.clone());

        let control_id = extract_control_id(&frame);
        let ingest = pipeline.ingest(&frame, source_map).await;

        let ack = match ingest {
            Ok(outcome) if outcome.source_status != crate::model::ConnectorMessageStatus::Error => {
                build_ack(&control_id, "AA")
            }
            Ok(_) => build_ack(&control_id, "AE"),
            Err(e) => {
                warn!(error = %e, "pipeline ingest failed for MLLP message");
                build_ack(&control_id, "AR")
            }
        };

        let mut framed_ack = Vec::with_capacity(ack.len() + 3);
        framed_ack.push(START_BLOCK);
        framed_ack.extend_from_slice(ack.as_bytes());
        framed_ack.push(END_BLOCK);
        framed_ack.push(CARRIAGE_RETURN);
        stream
            .write_all(&framed_ack)
            .await
            .map_err(|e| EngineError::Transport(format!("failed to write MLLP ACK: {e}")))?;
    }
}

/// Read and consume one complete `0x0B <hl7> 0x1C 0x0D` frame from `stream`,
/// using `buf` as carry-over storage across reads. Returns `Ok(None)` on a
/// clean peer-initiated close with no partial frame pending.
async fn read_frame(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    read_buf: &mut [u8],
    idle_timeout: Option<Duration>,
    cancellation: &CancellationToken,
) -> Result<Option<String>> {
    loop {
        if let Some(frame) = try_extract_frame(buf)? {
            return Ok(Some(frame));
        }

        let read_fut = stream.read(read_buf);
        let n = tokio::select! {
            _ = cancellation.cancelled() => return Ok(None),
            result = async {
                match idle_timeout {
                    Some(timeout) => tokio::time::timeout(timeout, read_fut)
                        .await
                        .map_err(|_| EngineError::Transport("MLLP connection idle timeout".into()))?,
                    None => read_fut.await,
                }
            } => result.map_err(|e| EngineError::Transport(format!("MLLP read failed: {e}")))?,
        };

        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(EngineError::Protocol("connection closed with a partial MLLP frame pending".into()));
        }
        buf.extend_from_slice(&read_buf[..n]);
    }
}

/// Scan `buf` for a complete frame. Consumes the frame's bytes (including the
/// leading `0x0B` and trailing `0x1C 0x0D`) from `buf` on success.
fn try_extract_frame(buf: &mut Vec<u8>) -> Result<Option<String>> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != START_BLOCK {
        return Err(EngineError::Protocol(format!("expected MLLP start block 0x0B, got {:#04x}", buf[0])));
    }

    let mut i = 1;
    while i < buf.len() {
        if buf[i] == END_BLOCK {
            match buf.get(i + 1) {
                Some(&CARRIAGE_RETURN) => {
                    let body = String::from_utf8_lossy(&buf[1..i]).into_owned();
                    buf.drain(0..=i + 1);
                    return Ok(Some(body));
                }
                Some(_) => {
                    return Err(EngineError::Protocol("embedded 0x1C byte before the MLLP frame terminator".into()));
                }
                None => return Ok(None), // need more data to know what follows
            }
        }
        i += 1;
    }
    Ok(None)
}

/// Pull MSH-10 (the message control id) out of an HL7 message for the ACK's
/// `MSA|<code>|<control id>` segment. Falls back to an empty id if the message
/// is too short to have one; a malformed MSH is the sender's problem, not a
/// reason to refuse acknowledging at all.
fn extract_control_id(hl7: &str) -> String {
    let Some(msh_line) = hl7.lines().next() else {
        return String::new();
    };
    let field_separator = msh_line.chars().nth(3).unwrap_or('|');
    msh_line.split(field_separator).nth(9).unwrap_or("").to_string()
}

fn build_ack(control_id: &str, code: &str) -> String {
    format!(
        "MSH|^~\\&|||||{}||ACK|{}|P|2.3\rMSA|{}|{}\r",
        chrono::Utc::now().format("%Y%m%d%H%M%S"),
        control_id,
        code,
        control_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_complete_frame_and_drains_buffer() {
        let mut buf = b"\x0bMSH|^~\\&|A\x1c\x0d".to_vec();
        let frame = try_extract_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame, "MSH|^~\\&|A");
        assert!(buf.is_empty());
    }

    #[test]
    fn returns_none_on_partial_frame() {
        let mut buf = b"\x0bMSH|^~\\&|A".to_vec();
        assert!(try_extract_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 12);
    }

    #[test]
    fn embedded_end_block_is_a_protocol_error() {
        let mut buf = b"\x0bMSH|A\x1cB\x1c\x0d".to_vec();
        assert!(try_extract_frame(&mut buf).is_err());
    }

    #[test]
    fn control_id_is_the_tenth_msh_field() {
        let hl7 = "MSH|^~\\&|A|B|C|D|20240101||ADT^A01|CTRL123|P|2.3";
        assert_eq!(extract_control_id(hl7), "CTRL123");
    }
}
