//! # DICOM Upper Layer Connector
//!
//! Wires the PDU framer (`pdu`), A-ASSOCIATE negotiation (`association`), and
//! DIMSE command processing (`dimse`) into a [`Connector`] pair: an inbound
//! `DicomSourceConnector` that accepts associations and serves C-ECHO/C-STORE,
//! and an outbound `DicomDestinationConnector` that opens one association per
//! delivery and mirrors a C-STORE or C-ECHO request to a remote AE. The dataset
//! payload itself is never decoded — it travels as a base64-enveloped blob, the
//! same opaque-binary-as-TEXT approach `crate::codec` uses for encrypted or
//! compressed content.

pub mod association;
pub mod dimse;
pub mod pdu;
pub mod tls;

use crate::connector::{Connector, DestinationConnector, RawMessage, Response, ResponseStatus, SourceConnector};
use crate::error::{EngineError, Result};
use crate::model::Maps;
use crate::pipeline::Pipeline;
use association::{AssociateRq, PresentationContextResult};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use dimse::{DimseCommand, PdvReassembler};
use futures::{SinkExt, StreamExt};
use pdu::{PduCodec, RawPdu};
use std::collections::HashMap as StdHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tls::{DicomStream, DicomTlsConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const RELEASE_RP_PAYLOAD: [u8; 4] = [0, 0, 0, 0];

/// A configured accept policy for an inbound association: which abstract
/// syntaxes and transfer syntaxes this channel serves, and the locally
/// configured maximum PDU length offered in the A-ASSOCIATE-AC.
#[derive(Debug, Clone)]
pub struct DicomAcceptPolicy {
    pub accepted_sop_classes: Vec<String>,
    pub accepted_transfer_syntaxes: Vec<String>,
    pub max_pdu_length: u32,
}

pub struct DicomSourceConnector {
    host: String,
    port: u16,
    policy: DicomAcceptPolicy,
    pipeline: Arc<Pipeline>,
    tls_config: Option<DicomTlsConfig>,
    cancellation: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
    paused: Arc<AtomicBool>,
}

impl DicomSourceConnector {
    pub fn new(host: String, port: u16, policy: DicomAcceptPolicy, pipeline: Arc<Pipeline>) -> Self {
        Self {
            host,
            port,
            policy,
            pipeline,
            tls_config: None,
            cancellation: CancellationToken::new(),
            accept_task: None,
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Serve this association port over TLS instead of plain TCP, per the
    /// "TLS optional with PKCS#12 keystore and CA truststore" external
    /// interface contract.
    pub fn with_tls(mut self, tls_config: DicomTlsConfig) -> Self {
        self.tls_config = Some(tls_config);
        self
    }
}

#[async_trait]
impl Connector for DicomSourceConnector {
    async fn start(&mut self) -> Result<()> {
        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .await
            .map_err(|e| EngineError::Transport(format!("failed to bind DICOM listener on {}:{}: {e}", self.host, self.port)))?;

        // A prior `stop()` leaves this token permanently cancelled; a fresh one
        // lets the same connector instance restart (DEPLOYED:STOPPED -> start).
        self.cancellation = CancellationToken::new();
        let cancellation = self.cancellation.clone();
        let pipeline = self.pipeline.clone();
        let policy = self.policy.clone();
        let paused = self.paused.clone();
        let acceptor = self.tls_config.as_ref().map(|c| c.build_acceptor()).transpose()?;

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
                                let policy = policy.clone();
                                let cancellation = cancellation.child_token();
                                let acceptor = acceptor.clone();
                                tokio::spawn(async move {
                                    let stream = match acceptor {
                                        Some(acceptor) => match DicomStream::accept(&acceptor, stream).await {
                                            Ok(s) => s,
                                            Err(e) => {
                                                warn!(error = %e, "DICOM TLS handshake failed");
                                                return;
                                            }
                                        },
                                        None => DicomStream::from(stream),
                                    };
                                    if let Err(e) = handle_association(stream, peer.to_string(), pipeline, policy, cancellation).await {
                                        warn!(error = %e, "DICOM association ended with an error");
                                    }
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "DICOM accept failed");
                            }
                        }
                    }
                }
            }
        }));
        info!(host = %self.host, port = self.port, "DICOM source listening");
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
impl SourceConnector for DicomSourceConnector {
    async fn dispatch_raw_message(&self, raw: RawMessage) -> Result<crate::connector::MessageResult> {
        let outcome = self.pipeline.ingest(&raw.payload, raw.source_map).await?;
        Ok(crate::connector::MessageResult {
            message_id: outcome.message_id,
            accepted: outcome.source_status != crate::model::ConnectorMessageStatus::Error,
            detail: outcome.response_text,
        })
    }
}

/// Negotiate one association, then loop serving C-ECHO/C-STORE requests on it
/// until the peer releases or aborts.
async fn handle_association(
    stream: DicomStream,
    peer_addr: String,
    pipeline: Arc<Pipeline>,
    policy: DicomAcceptPolicy,
    cancellation: CancellationToken,
) -> Result<()> {
    let mut framed = Framed::new(stream, PduCodec::default());

    let rq_pdu = match framed.next().await {
        Some(Ok(pdu)) if pdu.pdu_type == pdu::PDU_TYPE_ASSOCIATE_RQ => pdu,
        Some(Ok(_)) => return Err(EngineError::Protocol("expected A-ASSOCIATE-RQ as the first PDU".into())),
        Some(Err(e)) => return Err(e),
        None => return Ok(()),
    };

    let rq: AssociateRq = association::parse_associate_rq(&rq_pdu.payload)?;
    let results: Vec<PresentationContextResult> = association::negotiate(&rq, &policy.accepted_sop_classes, &policy.accepted_transfer_syntaxes);
    let effective_max_pdu = rq.max_pdu_length.min(policy.max_pdu_length);

    info!(peer = %peer_addr, calling_ae = %rq.calling_ae, called_ae = %rq.called_ae, "DICOM association request");

    let ac_payload = association::build_associate_ac(&rq, &results, effective_max_pdu);
    framed
        .send(RawPdu {
            pdu_type: pdu::PDU_TYPE_ASSOCIATE_AC,
            payload: ac_payload.into(),
        })
        .await?;

    let accepted_contexts: std::collections::HashSet<u8> = results.iter().filter(|r| r.result == association::RESULT_ACCEPTANCE).map(|r| r.id).collect();

    let mut reassemblers: StdHashMap<u8, PdvReassembler> = StdHashMap::new();
    let mut pending_commands: StdHashMap<u8, DimseCommand> = StdHashMap::new();

    loop {
        let pdu = tokio::select! {
            _ = cancellation.cancelled() => return Ok(()),
            next = framed.next() => match next {
                Some(Ok(pdu)) => pdu,
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            },
        };

        match pdu.pdu_type {
            pdu::PDU_TYPE_P_DATA_TF => {
                for (header, fragment) in dimse::split_pdvs(&pdu.payload)? {
                    if !accepted_contexts.contains(&header.presentation_context_id) {
                        continue;
                    }
                    let reassembler = reassemblers.entry(header.presentation_context_id).or_default();
                    reassembler.accept(&header, &fragment);

                    if reassembler.command_ready() && !pending_commands.contains_key(&header.presentation_context_id) {
                        let command_bytes = reassembler.take_command();
                        let command = dimse::parse_command(&command_bytes)?;
                        if !command.has_data_set {
                            serve_command(&mut framed, &pipeline, &peer_addr, header.presentation_context_id, command, None).await?;
                        } else {
                            pending_commands.insert(header.presentation_context_id, command);
                        }
                    }

                    let data_ready = pending_commands.contains_key(&header.presentation_context_id)
                        && reassemblers.get(&header.presentation_context_id).map(|r| r.data_ready()).unwrap_or(false);
                    if data_ready {
                        let command = pending_commands.remove(&header.presentation_context_id).unwrap();
                        let data = reassemblers.get_mut(&header.presentation_context_id).unwrap().take_data();
                        serve_command(&mut framed, &pipeline, &peer_addr, header.presentation_context_id, command, Some(data)).await?;
                    }
                }
            }
            pdu::PDU_TYPE_RELEASE_RQ => {
                framed
                    .send(RawPdu {
                        pdu_type: pdu::PDU_TYPE_RELEASE_RP,
                        payload: RELEASE_RP_PAYLOAD.to_vec().into(),
                    })
                    .await?;
                return Ok(());
            }
            pdu::PDU_TYPE_ABORT => return Ok(()),
            other => {
                warn!(pdu_type = other, "unexpected PDU type during DICOM association");
            }
        }
    }
}

async fn serve_command(
    framed: &mut Framed<DicomStream, PduCodec>,
    pipeline: &Arc<Pipeline>,
    peer_addr: &str,
    presentation_context_id: u8,
    command: DimseCommand,
    data_set: Option<Vec<u8>>,
) -> Result<()> {
    match command.command_field {
        dimse::COMMAND_FIELD_C_ECHO_RQ => {
            let response = dimse::build_c_echo_rsp(command.message_id.unwrap_or(0), dimse::STATUS_SUCCESS);
            send_command_pdv(framed, presentation_context_id, &response).await
        }
        dimse::COMMAND_FIELD_C_STORE_RQ => {
            let sop_class = command.affected_sop_class_uid.clone().unwrap_or_default();
            let sop_instance = command.affected_sop_instance_uid.clone().unwrap_or_default();
            let status = match &data_set {
                Some(bytes) => {
                    let payload = STANDARD.encode(bytes);
                    let mut source_map = StdHashMap::new();
                    source_map.insert("remoteAddress".to_string(), peer_addr.to_string());
                    source_map.insert("sopClassUid".to_string(), sop_class.clone());
                    source_map.insert("sopInstanceUid".to_string(), sop_instance.clone());
                    match pipeline.ingest(&payload, source_map).await {
                        Ok(outcome) if outcome.source_status != crate::model::ConnectorMessageStatus::Error => dimse::STATUS_SUCCESS,
                        _ => dimse::STATUS_PROCESSING_FAILURE,
                    }
                }
                None => dimse::STATUS_PROCESSING_FAILURE,
            };
            let response = dimse::build_c_store_rsp(command.message_id.unwrap_or(0), &sop_class, &sop_instance, status);
            send_command_pdv(framed, presentation_context_id, &response).await
        }
        other => Err(EngineError::Protocol(format!("unsupported DIMSE command field {other:#06x}"))),
    }
}

async fn send_command_pdv(framed: &mut Framed<DicomStream, PduCodec>, presentation_context_id: u8, command_bytes: &[u8]) -> Result<()> {
    let mut payload = Vec::with_capacity(command_bytes.len() + 6);
    payload.extend_from_slice(&((command_bytes.len() + 2) as u32).to_be_bytes());
    payload.push(presentation_context_id);
    payload.push(0x03); // last fragment, command
    payload.extend_from_slice(command_bytes);
    framed
        .send(RawPdu {
            pdu_type: pdu::PDU_TYPE_P_DATA_TF,
            payload: payload.into(),
        })
        .await
}

/// Outbound mirror: opens one association per delivery, proposes a single
/// presentation context for `sop_class_uid`, and sends a C-STORE (or, if
/// `sop_class_uid` is the DICOM verification class, a C-ECHO).
pub struct DicomDestinationConnector {
    host: String,
    port: u16,
    called_ae: String,
    calling_ae: String,
    sop_class_uid: String,
    transfer_syntax: String,
    max_pdu_length: u32,
    tls_config: Option<DicomTlsConfig>,
}

impl DicomDestinationConnector {
    pub fn new(host: String, port: u16, called_ae: String, calling_ae: String, sop_class_uid: String, transfer_syntax: String, max_pdu_length: u32) -> Self {
        Self {
            host,
            port,
            called_ae,
            calling_ae,
            sop_class_uid,
            transfer_syntax,
            max_pdu_length,
            tls_config: None,
        }
    }

    /// Open associations to this remote AE over TLS instead of plain TCP.
    pub fn with_tls(mut self, tls_config: DicomTlsConfig) -> Self {
        self.tls_config = Some(tls_config);
        self
    }

    fn build_associate_rq_payload(&self) -> Vec<u8> {
        use bytes::{BufMut, BytesMut};

        fn pad16(s: &str) -> [u8; 16] {
            let mut out = [b' '; 16];
            let bytes = s.as_bytes();
            let n = bytes.len().min(16);
            out[..n].copy_from_slice(&bytes[..n]);
            out
        }
        fn item(item_type: u8, value: &[u8], out: &mut BytesMut) {
            out.put_u8(item_type);
            out.put_u8(0);
            out.put_u16(value.len() as u16);
            out.extend_from_slice(value);
        }

        let mut out = BytesMut::new();
        out.put_u16(0x0001);
        out.put_u16(0);
        out.extend_from_slice(&pad16(&self.called_ae));
        out.extend_from_slice(&pad16(&self.calling_ae));
        out.extend_from_slice(&[0u8; 32]);

        let mut app_context = BytesMut::new();
        item(0x10, association::APPLICATION_CONTEXT_UID.as_bytes(), &mut app_context);
        out.extend_from_slice(&app_context);

        let mut sub_items = BytesMut::new();
        item(0x30, self.sop_class_uid.as_bytes(), &mut sub_items);
        item(0x40, self.transfer_syntax.as_bytes(), &mut sub_items);

        let mut pc_value = BytesMut::new();
        pc_value.put_u8(1);
        pc_value.put_u8(0);
        pc_value.put_u8(0);
        pc_value.put_u8(0);
        pc_value.extend_from_slice(&sub_items);

        let mut pc_item = BytesMut::new();
        item(0x20, &pc_value, &mut pc_item);
        out.extend_from_slice(&pc_item);

        let mut max_len_item = BytesMut::new();
        item(0x51, &self.max_pdu_length.to_be_bytes(), &mut max_len_item);
        let mut impl_class_item = BytesMut::new();
        item(0x52, association::IMPLEMENTATION_CLASS_UID.as_bytes(), &mut impl_class_item);
        let mut user_info = BytesMut::new();
        user_info.extend_from_slice(&max_len_item);
        user_info.extend_from_slice(&impl_class_item);
        let mut user_info_item = BytesMut::new();
        item(0x50, &user_info, &mut user_info_item);
        out.extend_from_slice(&user_info_item);

        out.to_vec()
    }
}

#[async_trait]
impl Connector for DicomDestinationConnector {
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
impl DestinationConnector for DicomDestinationConnector {
    async fn send(&self, encoded_payload: &str, maps: &Maps) -> Result<Response> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| EngineError::Transport(format!("failed to connect to DICOM peer {}:{}: {e}", self.host, self.port)))?;
        let stream = match &self.tls_config {
            Some(config) => {
                let connector = config.build_connector()?;
                DicomStream::connect(&connector, &self.host, stream).await?
            }
            None => DicomStream::from(stream),
        };
        let mut framed = Framed::new(stream, PduCodec::default());

        framed
            .send(RawPdu {
                pdu_type: pdu::PDU_TYPE_ASSOCIATE_RQ,
                payload: self.build_associate_rq_payload().into(),
            })
            .await?;

        let ac = framed
            .next()
            .await
            .ok_or_else(|| EngineError::Transport("DICOM peer closed before A-ASSOCIATE-AC".into()))??;
        if ac.pdu_type == pdu::PDU_TYPE_ASSOCIATE_RJ {
            return Ok(Response::error("DICOM association rejected"));
        }
        if ac.pdu_type != pdu::PDU_TYPE_ASSOCIATE_AC {
            return Err(EngineError::Protocol("expected A-ASSOCIATE-AC from DICOM peer".into()));
        }

        let message_id: u16 = 1;
        let sop_instance_uid = maps.connector_map.get("sopInstanceUid").cloned().unwrap_or_else(|| "1.2.3.4".to_string());
        let is_echo = self.sop_class_uid == association::VERIFICATION_SOP_CLASS_UID;

        let command = if is_echo {
            dimse::build_c_echo_rq(message_id)
        } else {
            dimse::build_c_store_rq(message_id, &self.sop_class_uid, &sop_instance_uid)
        };
        send_command_pdv(&mut framed, 1, &command).await?;

        if !is_echo {
            let data_set = STANDARD
                .decode(encoded_payload)
                .unwrap_or_else(|_| encoded_payload.as_bytes().to_vec());
            let mut payload = Vec::with_capacity(data_set.len() + 6);
            payload.extend_from_slice(&((data_set.len() + 2) as u32).to_be_bytes());
            payload.push(1);
            payload.push(0x02); // last fragment, data
            payload.extend_from_slice(&data_set);
            framed
                .send(RawPdu {
                    pdu_type: pdu::PDU_TYPE_P_DATA_TF,
                    payload: payload.into(),
                })
                .await?;
        }

        let mut reassembler = PdvReassembler::new();
        loop {
            let pdu = framed
                .next()
                .await
                .ok_or_else(|| EngineError::Transport("DICOM peer closed before a DIMSE response".into()))??;
            if pdu.pdu_type != pdu::PDU_TYPE_P_DATA_TF {
                return Err(EngineError::Protocol("expected P-DATA-TF carrying a DIMSE response".into()));
            }
            for (header, fragment) in dimse::split_pdvs(&pdu.payload)? {
                reassembler.accept(&header, &fragment);
            }
            if reassembler.command_ready() {
                break;
            }
        }
        let response_command = dimse::parse_command(&reassembler.take_command())?;

        let _ = framed
            .send(RawPdu {
                pdu_type: pdu::PDU_TYPE_RELEASE_RQ,
                payload: Vec::new().into(),
            })
            .await;

        match response_command.status {
            Some(dimse::STATUS_SUCCESS) => Ok(Response::sent()),
            other => Ok(Response {
                status: ResponseStatus::Error,
                message: Some(format!("DIMSE response status {other:?}")),
                status_code: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn associate_rq_payload_round_trips_through_the_parser() {
        let connector = DicomDestinationConnector::new(
            "127.0.0.1".into(),
            11112,
            "REMOTE_AE".into(),
            "LOCAL_AE".into(),
            "1.2.840.10008.5.1.4.1.1.7".into(),
            "1.2.840.10008.1.2".into(),
            16384,
        );
        let payload = connector.build_associate_rq_payload();
        let rq = association::parse_associate_rq(&payload).unwrap();
        assert_eq!(rq.called_ae, "REMOTE_AE");
        assert_eq!(rq.calling_ae, "LOCAL_AE");
        assert_eq!(rq.presentation_contexts[0].abstract_syntax, "1.2.840.10008.5.1.4.1.1.7");
    }
}
