//! # DIMSE Command Processing
//!
//! P-DATA-TF carries one or more Presentation Data Values (PDVs): a
//! presentation-context id, a message-control header byte (bit 0 = last
//! fragment, bit 1 = command vs. data), and a fragment of either the DIMSE
//! command set or the data set. Command sets are always encoded Implicit VR
//! Little Endian regardless of the negotiated transfer syntax (DICOM PS3.7);
//! `parse_command` reads just the handful of command-set elements C-STORE and
//! C-ECHO need rather than a full DICOM dataset codec, since that's out of
//! scope for this connector.

use super::association;
use crate::error::{EngineError, Result};
use std::collections::HashMap;

pub const COMMAND_FIELD_C_STORE_RQ: u16 = 0x0001;
pub const COMMAND_FIELD_C_STORE_RSP: u16 = 0x8001;
pub const COMMAND_FIELD_C_ECHO_RQ: u16 = 0x0030;
pub const COMMAND_FIELD_C_ECHO_RSP: u16 = 0x8030;

pub const STATUS_SUCCESS: u16 = 0x0000;
pub const STATUS_PROCESSING_FAILURE: u16 = 0x0110;

const TAG_AFFECTED_SOP_CLASS_UID: (u16, u16) = (0x0000, 0x0002);
const TAG_COMMAND_FIELD: (u16, u16) = (0x0000, 0x0100);
const TAG_MESSAGE_ID: (u16, u16) = (0x0000, 0x0110);
const TAG_MESSAGE_ID_BEING_RESPONDED_TO: (u16, u16) = (0x0000, 0x0120);
const TAG_STATUS: (u16, u16) = (0x0000, 0x0900);
const TAG_AFFECTED_SOP_INSTANCE_UID: (u16, u16) = (0x0000, 0x1000);
const TAG_COMMAND_DATA_SET_TYPE: (u16, u16) = (0x0000, 0x0800);

const DATA_SET_TYPE_NONE_PRESENT: u16 = 0x0101;

fn parse_elements(bytes: &[u8]) -> HashMap<(u16, u16), Vec<u8>> {
    let mut elements = HashMap::new();
    let mut offset = 0usize;
    while offset + 8 <= bytes.len() {
        let group = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
        let element = u16::from_le_bytes([bytes[offset + 2], bytes[offset + 3]]);
        let len = u32::from_le_bytes([bytes[offset + 4], bytes[offset + 5], bytes[offset + 6], bytes[offset + 7]]) as usize;
        offset += 8;
        if offset + len > bytes.len() {
            break;
        }
        elements.insert((group, element), bytes[offset..offset + len].to_vec());
        offset += len;
    }
    elements
}

fn build_element(tag: (u16, u16), value: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&tag.0.to_le_bytes());
    out.extend_from_slice(&tag.1.to_le_bytes());
    let padded_len = value.len() + (value.len() % 2);
    out.extend_from_slice(&(padded_len as u32).to_le_bytes());
    out.extend_from_slice(value);
    if value.len() % 2 != 0 {
        out.push(0);
    }
}

fn get_u16(elements: &HashMap<(u16, u16), Vec<u8>>, tag: (u16, u16)) -> Option<u16> {
    elements.get(&tag).filter(|v| v.len() >= 2).map(|v| u16::from_le_bytes([v[0], v[1]]))
}

fn get_string(elements: &HashMap<(u16, u16), Vec<u8>>, tag: (u16, u16)) -> Option<String> {
    elements.get(&tag).map(|v| String::from_utf8_lossy(v).trim_end_matches(['\0', ' ']).to_string())
}

#[derive(Debug, Clone)]
pub struct DimseCommand {
    pub command_field: u16,
    pub message_id: Option<u16>,
    pub message_id_being_responded_to: Option<u16>,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub status: Option<u16>,
    pub has_data_set: bool,
}

pub fn parse_command(bytes: &[u8]) -> Result<DimseCommand> {
    let elements = parse_elements(bytes);
    let command_field = get_u16(&elements, TAG_COMMAND_FIELD)
        .ok_or_else(|| EngineError::Protocol("DIMSE command set missing CommandField".into()))?;
    let data_set_type = get_u16(&elements, TAG_COMMAND_DATA_SET_TYPE);
    Ok(DimseCommand {
        command_field,
        message_id: get_u16(&elements, TAG_MESSAGE_ID),
        message_id_being_responded_to: get_u16(&elements, TAG_MESSAGE_ID_BEING_RESPONDED_TO),
        affected_sop_class_uid: get_string(&elements, TAG_AFFECTED_SOP_CLASS_UID),
        affected_sop_instance_uid: get_string(&elements, TAG_AFFECTED_SOP_INSTANCE_UID),
        status: get_u16(&elements, TAG_STATUS),
        has_data_set: data_set_type != Some(DATA_SET_TYPE_NONE_PRESENT),
    })
}

pub fn build_c_echo_rsp(message_id: u16, status: u16) -> Vec<u8> {
    let mut out = Vec::new();
    build_element(TAG_AFFECTED_SOP_CLASS_UID, association::VERIFICATION_SOP_CLASS_UID.as_bytes(), &mut out);
    build_element(TAG_COMMAND_FIELD, &COMMAND_FIELD_C_ECHO_RSP.to_le_bytes(), &mut out);
    build_element(TAG_MESSAGE_ID_BEING_RESPONDED_TO, &message_id.to_le_bytes(), &mut out);
    build_element(TAG_COMMAND_DATA_SET_TYPE, &DATA_SET_TYPE_NONE_PRESENT.to_le_bytes(), &mut out);
    build_element(TAG_STATUS, &status.to_le_bytes(), &mut out);
    out
}

pub fn build_c_store_rsp(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str, status: u16) -> Vec<u8> {
    let mut out = Vec::new();
    build_element(TAG_AFFECTED_SOP_CLASS_UID, sop_class_uid.as_bytes(), &mut out);
    build_element(TAG_COMMAND_FIELD, &COMMAND_FIELD_C_STORE_RSP.to_le_bytes(), &mut out);
    build_element(TAG_MESSAGE_ID_BEING_RESPONDED_TO, &message_id.to_le_bytes(), &mut out);
    build_element(TAG_COMMAND_DATA_SET_TYPE, &DATA_SET_TYPE_NONE_PRESENT.to_le_bytes(), &mut out);
    build_element(TAG_STATUS, &status.to_le_bytes(), &mut out);
    build_element(TAG_AFFECTED_SOP_INSTANCE_UID, sop_instance_uid.as_bytes(), &mut out);
    out
}

pub fn build_c_echo_rq(message_id: u16) -> Vec<u8> {
    let mut out = Vec::new();
    build_element(TAG_AFFECTED_SOP_CLASS_UID, association::VERIFICATION_SOP_CLASS_UID.as_bytes(), &mut out);
    build_element(TAG_COMMAND_FIELD, &COMMAND_FIELD_C_ECHO_RQ.to_le_bytes(), &mut out);
    build_element(TAG_MESSAGE_ID, &message_id.to_le_bytes(), &mut out);
    build_element(TAG_COMMAND_DATA_SET_TYPE, &DATA_SET_TYPE_NONE_PRESENT.to_le_bytes(), &mut out);
    out
}

pub fn build_c_store_rq(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str) -> Vec<u8> {
    let mut out = Vec::new();
    build_element(TAG_AFFECTED_SOP_CLASS_UID, sop_class_uid.as_bytes(), &mut out);
    build_element(TAG_COMMAND_FIELD, &COMMAND_FIELD_C_STORE_RQ.to_le_bytes(), &mut out);
    build_element(TAG_MESSAGE_ID, &message_id.to_le_bytes(), &mut out);
    build_element(TAG_AFFECTED_SOP_INSTANCE_UID, sop_instance_uid.as_bytes(), &mut out);
    const DATA_SET_TYPE_PRESENT: u16 = 0x0102;
    build_element(TAG_COMMAND_DATA_SET_TYPE, &DATA_SET_TYPE_PRESENT.to_le_bytes(), &mut out);
    out
}

/// One P-DATA-TF Presentation Data Value header: presentation-context id plus
/// the is-last/is-command flags from the message control header byte.
pub struct PdvHeader {
    pub presentation_context_id: u8,
    pub is_last: bool,
    pub is_command: bool,
}

pub fn parse_pdv_header(byte: u8) -> (bool, bool) {
    let is_command = byte & 0x01 != 0;
    let is_last = byte & 0x02 != 0;
    (is_last, is_command)
}

/// Splits a P-DATA-TF PDU payload into its constituent PDVs: 4-byte big-endian
/// length, 1-byte presentation-context id, 1-byte message control header, then
/// `length - 2` bytes of fragment.
pub fn split_pdvs(mut payload: &[u8]) -> Result<Vec<(PdvHeader, Vec<u8>)>> {
    let mut out = Vec::new();
    while !payload.is_empty() {
        if payload.len() < 6 {
            return Err(EngineError::Protocol("truncated PDV in P-DATA-TF".into()));
        }
        let len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
        if payload.len() < 4 + len || len < 2 {
            return Err(EngineError::Protocol("PDV length exceeds P-DATA-TF payload".into()));
        }
        let presentation_context_id = payload[4];
        let (is_last, is_command) = parse_pdv_header(payload[5]);
        let fragment = payload[6..4 + len].to_vec();
        out.push((
            PdvHeader {
                presentation_context_id,
                is_last,
                is_command,
            },
            fragment,
        ));
        payload = &payload[4 + len..];
    }
    Ok(out)
}

/// Accumulates command/data fragments across one or more P-DATA-TF PDUs until
/// both reassemble completely (their respective last-fragment flag is seen).
#[derive(Default)]
pub struct PdvReassembler {
    command: Vec<u8>,
    data: Vec<u8>,
    command_complete: bool,
    data_complete: bool,
}

impl PdvReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, header: &PdvHeader, fragment: &[u8]) {
        if header.is_command {
            self.command.extend_from_slice(fragment);
            self.command_complete |= header.is_last;
        } else {
            self.data.extend_from_slice(fragment);
            self.data_complete |= header.is_last;
        }
    }

    pub fn command_ready(&self) -> bool {
        self.command_complete
    }

    pub fn take_command(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.command)
    }

    pub fn data_ready(&self) -> bool {
        self.data_complete
    }

    pub fn take_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_c_echo_command_through_build_and_parse() {
        let bytes = build_c_echo_rq(7);
        let command = parse_command(&bytes).unwrap();
        assert_eq!(command.command_field, COMMAND_FIELD_C_ECHO_RQ);
        assert_eq!(command.message_id, Some(7));
        assert!(!command.has_data_set);
    }

    #[test]
    fn round_trips_c_store_command_and_reports_data_set_present() {
        let bytes = build_c_store_rq(3, "1.2.840.10008.5.1.4.1.1.7", "1.2.3.4.5");
        let command = parse_command(&bytes).unwrap();
        assert_eq!(command.command_field, COMMAND_FIELD_C_STORE_RQ);
        assert_eq!(command.affected_sop_instance_uid.as_deref(), Some("1.2.3.4.5"));
        assert!(command.has_data_set);
    }

    #[test]
    fn reassembles_a_single_fragment_pdv() {
        let mut reassembler = PdvReassembler::new();
        let header = PdvHeader {
            presentation_context_id: 1,
            is_last: true,
            is_command: true,
        };
        reassembler.accept(&header, b"payload");
        assert!(reassembler.command_ready());
        assert_eq!(reassembler.take_command(), b"payload");
    }

    #[test]
    fn reassembles_fragments_split_across_two_pdvs() {
        let mut reassembler = PdvReassembler::new();
        reassembler.accept(
            &PdvHeader {
                presentation_context_id: 1,
                is_last: false,
                is_command: false,
            },
            b"part1-",
        );
        assert!(!reassembler.data_ready());
        reassembler.accept(
            &PdvHeader {
                presentation_context_id: 1,
                is_last: true,
                is_command: false,
            },
            b"part2",
        );
        assert!(reassembler.data_ready());
        assert_eq!(reassembler.take_data(), b"part1-part2");
    }

    #[test]
    fn split_pdvs_parses_multiple_values_in_one_pdu() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&5u32.to_be_bytes());
        payload.push(1);
        payload.push(0x03); // last + command
        payload.extend_from_slice(b"abc");
        let pdvs = split_pdvs(&payload).unwrap();
        assert_eq!(pdvs.len(), 1);
        assert!(pdvs[0].0.is_last);
        assert!(pdvs[0].0.is_command);
        assert_eq!(pdvs[0].1, b"abc");
    }
}
