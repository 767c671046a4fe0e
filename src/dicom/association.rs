//! # A-ASSOCIATE Negotiation
//!
//! Parses and builds the variable-item payloads of A-ASSOCIATE-RQ/AC/RJ PDUs
//! (DICOM PS3.8 §9.3.2-9.3.4): application context, one presentation context per
//! proposed abstract syntax, and the user information item carrying the peer's
//! maximum PDU length. Presentation contexts are matched against the
//! destination/source connector's configured `accepted_sop_classes` and
//! `accepted_transfer_syntaxes`; the effective max PDU length is the smaller of
//! the peer's request and this connector's own configured limit.

use bytes::{Buf, BufMut, BytesMut};

const ITEM_APPLICATION_CONTEXT: u8 = 0x10;
const ITEM_PRESENTATION_CONTEXT_RQ: u8 = 0x20;
const ITEM_PRESENTATION_CONTEXT_AC: u8 = 0x21;
const ITEM_ABSTRACT_SYNTAX: u8 = 0x30;
const ITEM_TRANSFER_SYNTAX: u8 = 0x40;
const ITEM_USER_INFORMATION: u8 = 0x50;
const ITEM_MAX_LENGTH: u8 = 0x51;
const ITEM_IMPLEMENTATION_CLASS_UID: u8 = 0x52;

pub const APPLICATION_CONTEXT_UID: &str = "1.2.840.10008.3.1.1.1";
pub const IMPLEMENTATION_CLASS_UID: &str = "1.2.826.0.1.3680043.100.0.1";
pub const VERIFICATION_SOP_CLASS_UID: &str = "1.2.840.10008.1.1";

pub const RESULT_ACCEPTANCE: u8 = 0;
pub const RESULT_ABSTRACT_SYNTAX_NOT_SUPPORTED: u8 = 3;
pub const RESULT_TRANSFER_SYNTAXES_NOT_SUPPORTED: u8 = 4;

#[derive(Debug, Clone)]
pub struct PresentationContextRq {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AssociateRq {
    pub called_ae: String,
    pub calling_ae: String,
    pub presentation_contexts: Vec<PresentationContextRq>,
    pub max_pdu_length: u32,
}

#[derive(Debug, Clone)]
pub struct PresentationContextResult {
    pub id: u8,
    pub result: u8,
    pub transfer_syntax: Option<String>,
}

struct Item {
    item_type: u8,
    value: Vec<u8>,
}

fn parse_items(mut bytes: &[u8]) -> Vec<Item> {
    let mut items = Vec::new();
    while bytes.len() >= 4 {
        let item_type = bytes[0];
        let len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if bytes.len() < 4 + len {
            break;
        }
        let value = bytes[4..4 + len].to_vec();
        items.push(Item { item_type, value });
        bytes = &bytes[4 + len..];
    }
    items
}

fn build_item(item_type: u8, value: &[u8], out: &mut BytesMut) {
    out.put_u8(item_type);
    out.put_u8(0);
    out.put_u16(value.len() as u16);
    out.extend_from_slice(value);
}

fn ascii_trimmed(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end_matches(['\0', ' ']).to_string()
}

fn pad16(s: &str) -> [u8; 16] {
    let mut out = [b' '; 16];
    let bytes = s.as_bytes();
    let n = bytes.len().min(16);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Parse an A-ASSOCIATE-RQ PDU payload (everything after the 6-byte PDU
/// header).
pub fn parse_associate_rq(payload: &[u8]) -> crate::error::Result<AssociateRq> {
    if payload.len() < 68 {
        return Err(crate::error::EngineError::Protocol("A-ASSOCIATE-RQ shorter than the fixed header".into()));
    }
    let called_ae = ascii_trimmed(&payload[4..20]);
    let calling_ae = ascii_trimmed(&payload[20..36]);
    let items = parse_items(&payload[68..]);

    let mut presentation_contexts = Vec::new();
    let mut max_pdu_length = 16384;

    for item in items {
        match item.item_type {
            ITEM_PRESENTATION_CONTEXT_RQ => {
                if item.value.len() < 4 {
                    continue;
                }
                let id = item.value[0];
                let sub_items = parse_items(&item.value[4..]);
                let mut abstract_syntax = String::new();
                let mut transfer_syntaxes = Vec::new();
                for sub in sub_items {
                    match sub.item_type {
                        ITEM_ABSTRACT_SYNTAX => abstract_syntax = ascii_trimmed(&sub.value),
                        ITEM_TRANSFER_SYNTAX => transfer_syntaxes.push(ascii_trimmed(&sub.value)),
                        _ => {}
                    }
                }
                presentation_contexts.push(PresentationContextRq {
                    id,
                    abstract_syntax,
                    transfer_syntaxes,
                });
            }
            ITEM_USER_INFORMATION => {
                for sub in parse_items(&item.value) {
                    if sub.item_type == ITEM_MAX_LENGTH && sub.value.len() == 4 {
                        max_pdu_length = u32::from_be_bytes([sub.value[0], sub.value[1], sub.value[2], sub.value[3]]);
                    }
                }
            }
            _ => {}
        }
    }

    Ok(AssociateRq {
        called_ae,
        calling_ae,
        presentation_contexts,
        max_pdu_length,
    })
}

/// Negotiate each proposed presentation context against what this connector
/// accepts, per spec.md §4.H: the abstract syntax must be in
/// `accepted_sop_classes`, and at least one proposed transfer syntax must be in
/// `accepted_transfer_syntaxes` (the first match wins).
pub fn negotiate(
    rq: &AssociateRq,
    accepted_sop_classes: &[String],
    accepted_transfer_syntaxes: &[String],
) -> Vec<PresentationContextResult> {
    rq.presentation_contexts
        .iter()
        .map(|pc| {
            if !accepted_sop_classes.iter().any(|s| s == &pc.abstract_syntax) {
                return PresentationContextResult {
                    id: pc.id,
                    result: RESULT_ABSTRACT_SYNTAX_NOT_SUPPORTED,
                    transfer_syntax: None,
                };
            }
            let matched = pc
                .transfer_syntaxes
                .iter()
                .find(|ts| accepted_transfer_syntaxes.iter().any(|accepted| &accepted == ts));
            match matched {
                Some(ts) => PresentationContextResult {
                    id: pc.id,
                    result: RESULT_ACCEPTANCE,
                    transfer_syntax: Some(ts.clone()),
                },
                None => PresentationContextResult {
                    id: pc.id,
                    result: RESULT_TRANSFER_SYNTAXES_NOT_SUPPORTED,
                    transfer_syntax: None,
                },
            }
        })
        .collect()
}

/// Build an A-ASSOCIATE-AC PDU payload.
pub fn build_associate_ac(rq: &AssociateRq, results: &[PresentationContextResult], effective_max_pdu: u32) -> Vec<u8> {
    let mut out = BytesMut::new();
    out.put_u16(0x0001); // protocol version
    out.put_u16(0); // reserved
    out.extend_from_slice(&pad16(&rq.called_ae));
    out.extend_from_slice(&pad16(&rq.calling_ae));
    out.extend_from_slice(&[0u8; 32]);

    let mut app_context = BytesMut::new();
    build_item(ITEM_APPLICATION_CONTEXT, APPLICATION_CONTEXT_UID.as_bytes(), &mut app_context);
    out.extend_from_slice(&app_context);

    for result in results {
        let mut pc_value = BytesMut::new();
        pc_value.put_u8(result.id);
        pc_value.put_u8(0);
        pc_value.put_u8(result.result);
        pc_value.put_u8(0);
        if let Some(ts) = &result.transfer_syntax {
            build_item(ITEM_TRANSFER_SYNTAX, ts.as_bytes(), &mut pc_value);
        }
        let mut pc_item = BytesMut::new();
        build_item(ITEM_PRESENTATION_CONTEXT_AC, &pc_value, &mut pc_item);
        out.extend_from_slice(&pc_item);
    }

    let mut user_info = BytesMut::new();
    let mut max_len_item = BytesMut::new();
    build_item(ITEM_MAX_LENGTH, &effective_max_pdu.to_be_bytes(), &mut max_len_item);
    user_info.extend_from_slice(&max_len_item);
    let mut impl_class_item = BytesMut::new();
    build_item(ITEM_IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_CLASS_UID.as_bytes(), &mut impl_class_item);
    user_info.extend_from_slice(&impl_class_item);
    let mut user_info_item = BytesMut::new();
    build_item(ITEM_USER_INFORMATION, &user_info, &mut user_info_item);
    out.extend_from_slice(&user_info_item);

    out.to_vec()
}

/// Build an A-ASSOCIATE-RJ PDU payload. `result` 1=rejected-permanent,
/// 2=rejected-transient; `source`/`reason` per DICOM PS3.8 table 9-21.
pub fn build_associate_rj(result: u8, source: u8, reason: u8) -> Vec<u8> {
    vec![0, result, source, reason]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rq_payload() -> Vec<u8> {
        let mut out = BytesMut::new();
        out.put_u16(0x0001);
        out.put_u16(0);
        out.extend_from_slice(&pad16("REMOTE_AE"));
        out.extend_from_slice(&pad16("LOCAL_AE"));
        out.extend_from_slice(&[0u8; 32]);

        let mut app_context = BytesMut::new();
        build_item(ITEM_APPLICATION_CONTEXT, APPLICATION_CONTEXT_UID.as_bytes(), &mut app_context);
        out.extend_from_slice(&app_context);

        let mut sub_items = BytesMut::new();
        build_item(ITEM_ABSTRACT_SYNTAX, b"1.2.840.10008.5.1.4.1.1.7", &mut sub_items);
        build_item(ITEM_TRANSFER_SYNTAX, b"1.2.840.10008.1.2", &mut sub_items);

        let mut pc_value = BytesMut::new();
        pc_value.put_u8(1);
        pc_value.put_u8(0);
        pc_value.put_u8(0);
        pc_value.put_u8(0);
        pc_value.extend_from_slice(&sub_items);

        let mut pc_item = BytesMut::new();
        build_item(ITEM_PRESENTATION_CONTEXT_RQ, &pc_value, &mut pc_item);
        out.extend_from_slice(&pc_item);

        let mut max_len_item = BytesMut::new();
        build_item(ITEM_MAX_LENGTH, &16384u32.to_be_bytes(), &mut max_len_item);
        let mut user_info = BytesMut::new();
        user_info.extend_from_slice(&max_len_item);
        let mut user_info_item = BytesMut::new();
        build_item(ITEM_USER_INFORMATION, &user_info, &mut user_info_item);
        out.extend_from_slice(&user_info_item);

        out.to_vec()
    }

    #[test]
    fn parses_ae_titles_and_presentation_context() {
        let rq = parse_associate_rq(&sample_rq_payload()).unwrap();
        assert_eq!(rq.called_ae, "REMOTE_AE");
        assert_eq!(rq.calling_ae, "LOCAL_AE");
        assert_eq!(rq.max_pdu_length, 16384);
        assert_eq!(rq.presentation_contexts.len(), 1);
        assert_eq!(rq.presentation_contexts[0].abstract_syntax, "1.2.840.10008.5.1.4.1.1.7");
        assert_eq!(rq.presentation_contexts[0].transfer_syntaxes, vec!["1.2.840.10008.1.2".to_string()]);
    }

    #[test]
    fn negotiation_accepts_matching_syntax() {
        let rq = parse_associate_rq(&sample_rq_payload()).unwrap();
        let results = negotiate(
            &rq,
            &["1.2.840.10008.5.1.4.1.1.7".to_string()],
            &["1.2.840.10008.1.2".to_string()],
        );
        assert_eq!(results[0].result, RESULT_ACCEPTANCE);
        assert_eq!(results[0].transfer_syntax.as_deref(), Some("1.2.840.10008.1.2"));
    }

    #[test]
    fn negotiation_rejects_unsupported_abstract_syntax() {
        let rq = parse_associate_rq(&sample_rq_payload()).unwrap();
        let results = negotiate(&rq, &["1.2.840.10008.5.1.4.1.1.2".to_string()], &["1.2.840.10008.1.2".to_string()]);
        assert_eq!(results[0].result, RESULT_ABSTRACT_SYNTAX_NOT_SUPPORTED);
    }

    #[test]
    fn effective_max_pdu_is_the_smaller_of_peer_and_local() {
        let rq = parse_associate_rq(&sample_rq_payload()).unwrap();
        let local_max = 8192u32;
        let effective = rq.max_pdu_length.min(local_max);
        assert_eq!(effective, 8192);
    }
}
