//! # DICOM Upper Layer PDU Framer
//!
//! Every DICOM Upper Layer PDU shares a 6-byte header: 1 byte PDU type, 1
//! reserved byte, and a 4-byte big-endian length of the bytes that follow
//! (DICOM PS3.8). This mirrors the teacher's length-prefixed TCP framing
//! (`src/ipc/tcp_socket.rs`), generalized from a 4-byte little-endian prefix to
//! a 6-byte big-endian one, and implemented as a `tokio_util::codec::Decoder`
//! instead of a hand-rolled read loop since streaming framing is exactly what
//! that trait is for.

use crate::error::EngineError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const PDU_TYPE_ASSOCIATE_RQ: u8 = 0x01;
pub const PDU_TYPE_ASSOCIATE_AC: u8 = 0x02;
pub const PDU_TYPE_ASSOCIATE_RJ: u8 = 0x03;
pub const PDU_TYPE_P_DATA_TF: u8 = 0x04;
pub const PDU_TYPE_RELEASE_RQ: u8 = 0x05;
pub const PDU_TYPE_RELEASE_RP: u8 = 0x06;
pub const PDU_TYPE_ABORT: u8 = 0x07;

const HEADER_LEN: usize = 6;
/// DICOM PS3.8 bounds PDU length to a 32-bit field; reject absurd claimed
/// lengths before allocating for them.
const MAX_PDU_LEN: u32 = 128 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct RawPdu {
    pub pdu_type: u8,
    pub payload: Bytes,
}

#[derive(Default)]
pub struct PduCodec {
    pending_len: Option<(u8, u32)>,
}

impl Decoder for PduCodec {
    type Item = RawPdu;
    type Error = EngineError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawPdu>, EngineError> {
        let (pdu_type, len) = match self.pending_len {
            Some(header) => header,
            None => {
                if src.len() < HEADER_LEN {
                    src.reserve(HEADER_LEN - src.len());
                    return Ok(None);
                }
                let pdu_type = src[0];
                let len = u32::from_be_bytes([src[2], src[3], src[4], src[5]]);
                if len > MAX_PDU_LEN {
                    return Err(EngineError::Protocol(format!("PDU length {len} exceeds maximum {MAX_PDU_LEN}")));
                }
                src.advance(HEADER_LEN);
                self.pending_len = Some((pdu_type, len));
                (pdu_type, len)
            }
        };

        if (src.len() as u32) < len {
            src.reserve((len as usize).saturating_sub(src.len()));
            return Ok(None);
        }

        let payload = src.split_to(len as usize).freeze();
        self.pending_len = None;
        Ok(Some(RawPdu { pdu_type, payload }))
    }
}

impl Encoder<RawPdu> for PduCodec {
    type Error = EngineError;

    fn encode(&mut self, pdu: RawPdu, dst: &mut BytesMut) -> Result<(), EngineError> {
        if pdu.payload.len() as u64 > MAX_PDU_LEN as u64 {
            return Err(EngineError::Protocol("outbound PDU exceeds maximum length".into()));
        }
        dst.reserve(HEADER_LEN + pdu.payload.len());
        dst.put_u8(pdu.pdu_type);
        dst.put_u8(0); // reserved
        dst.put_u32(pdu.payload.len() as u32);
        dst.extend_from_slice(&pdu.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_complete_pdu_in_one_pass() {
        let mut codec = PduCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u8(PDU_TYPE_P_DATA_TF);
        buf.put_u8(0);
        buf.put_u32(3);
        buf.extend_from_slice(b"abc");
        let pdu = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(pdu.pdu_type, PDU_TYPE_P_DATA_TF);
        assert_eq!(&pdu.payload[..], b"abc");
        assert!(buf.is_empty());
    }

    #[test]
    fn reassembles_a_pdu_split_across_reads() {
        let mut codec = PduCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u8(PDU_TYPE_ASSOCIATE_RQ);
        buf.put_u8(0);
        buf.put_u32(4);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"ab");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"cd");
        let pdu = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&pdu.payload[..], b"abcd");
    }

    #[test]
    fn round_trips_through_encoder() {
        let mut codec = PduCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(
                RawPdu {
                    pdu_type: PDU_TYPE_ABORT,
                    payload: Bytes::from_static(b"\x00\x00\x00\x00"),
                },
                &mut buf,
            )
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.pdu_type, PDU_TYPE_ABORT);
        assert_eq!(&decoded.payload[..], b"\x00\x00\x00\x00");
    }
}
