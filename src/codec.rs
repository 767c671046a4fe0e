//! # Content Codec
//!
//! Transparent compression and optional encryption for `MessageContent` text
//! payloads (spec.md §4.B). Compression is applied when the plaintext exceeds a
//! configurable threshold; encryption is applied to selected content types when an
//! encryption key is configured (e.g. via `MIRTH_ENCRYPTION_KEY`). Both steps are
//! reversed transparently on read: `decode(encode(x, compressed, encrypted)) == x`
//! for every supported type and (compressed, encrypted) combination (spec.md §8
//! invariant 6).
//!
//! Compressed/encrypted bytes are stored as base64 text so the storage layer never
//! has to distinguish text from binary columns, following the same "wrap binary as
//! a self-describing envelope" approach as the teacher's `Message::to_bytes`.

use crate::error::{EngineError, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use ring::aead::{self, BoundKey, Nonce, NonceSequence, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use std::io::Read;

/// Payloads at or above this size are compressed before storage.
pub const COMPRESSION_THRESHOLD_BYTES: usize = 1024;

const NONCE_LEN: usize = 12;

/// A 256-bit key used to encrypt selected content types. Constructed once at
/// process start from `MIRTH_ENCRYPTION_KEY` and shared read-only across channels.
#[derive(Clone)]
pub struct EncryptionKey(pub [u8; 32]);

impl EncryptionKey {
    /// Derive a key from arbitrary configured key material by hashing it down to
    /// 32 bytes. Real deployments would use a KMS-issued key directly; this keeps
    /// the contract ("a key is configured or it isn't") simple for the core.
    pub fn from_key_material(material: &str) -> Self {
        use ring::digest::{digest, SHA256};
        let hash = digest(&SHA256, material.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(hash.as_ref());
        EncryptionKey(key)
    }
}

struct SingleUseNonce(Option<Nonce>);

impl NonceSequence for SingleUseNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0.take().ok_or(ring::error::Unspecified)
    }
}

fn compress(plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(plaintext, Compression::default());
    let mut out = Vec::new();
    encoder
        .read_to_end(&mut out)
        .map_err(|e| EngineError::Internal(format!("compression failed: {e}")))?;
    Ok(out)
}

fn decompress(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| EngineError::Internal(format!("decompression failed: {e}")))?;
    Ok(out)
}

fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let unbound = UnboundKey::new(&AES_256_GCM, &key.0)
        .map_err(|_| EngineError::Internal("invalid encryption key".into()))?;
    let rng = SystemRandom::new();
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| EngineError::Internal("failed to generate nonce".into()))?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);
    let mut sealing = aead::SealingKey::new(unbound, SingleUseNonce(Some(nonce)));

    let mut in_out = plaintext.to_vec();
    sealing
        .seal_in_place_append_tag(aead::Aad::empty(), &mut in_out)
        .map_err(|_| EngineError::Internal("encryption failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&in_out);
    Ok(out)
}

fn decrypt(key: &EncryptionKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < NONCE_LEN {
        return Err(EngineError::Internal("ciphertext too short".into()));
    }
    let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
    let mut nonce_arr = [0u8; NONCE_LEN];
    nonce_arr.copy_from_slice(nonce_bytes);
    let nonce = Nonce::assume_unique_for_key(nonce_arr);

    let unbound = UnboundKey::new(&AES_256_GCM, &key.0)
        .map_err(|_| EngineError::Internal("invalid encryption key".into()))?;
    let mut opening = aead::OpeningKey::new(unbound, SingleUseNonce(Some(nonce)));

    let mut in_out = sealed.to_vec();
    let plaintext = opening
        .open_in_place(aead::Aad::empty(), &mut in_out)
        .map_err(|_| EngineError::Internal("decryption failed".into()))?;
    Ok(plaintext.to_vec())
}

/// Encode `text` for storage: compress if it's large enough, then encrypt if a
/// key is supplied, then base64 so the result is safe to store as TEXT.
pub fn encode(text: &str, key: Option<&EncryptionKey>) -> Result<String> {
    let plaintext = text.as_bytes();
    let compressed = plaintext.len() >= COMPRESSION_THRESHOLD_BYTES;
    let mut bytes = if compressed {
        compress(plaintext)?
    } else {
        plaintext.to_vec()
    };

    let encrypted = key.is_some();
    if let Some(key) = key {
        bytes = encrypt(key, &bytes)?;
    }

    // A one-byte header records which transforms were applied so `decode` can
    // reverse them without out-of-band bookkeeping.
    let mut framed = Vec::with_capacity(bytes.len() + 1);
    framed.push((compressed as u8) | ((encrypted as u8) << 1));
    framed.extend_from_slice(&bytes);
    Ok(STANDARD.encode(framed))
}

/// Reverse `encode`.
pub fn decode(stored: &str, key: Option<&EncryptionKey>) -> Result<String> {
    let framed = STANDARD
        .decode(stored)
        .map_err(|e| EngineError::Internal(format!("invalid stored content: {e}")))?;
    let (&header, bytes) = framed
        .split_first()
        .ok_or_else(|| EngineError::Internal("empty stored content".into()))?;
    let compressed = header & 0b01 != 0;
    let encrypted = header & 0b10 != 0;

    let mut bytes = bytes.to_vec();
    if encrypted {
        let key = key.ok_or_else(|| EngineError::Internal("content is encrypted but no key is configured".into()))?;
        bytes = decrypt(key, &bytes)?;
    }
    if compressed {
        bytes = decompress(&bytes)?;
    }

    String::from_utf8(bytes).map_err(|e| EngineError::Internal(format!("decoded content is not valid utf-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> EncryptionKey {
        EncryptionKey::from_key_material("test-key-material")
    }

    #[test]
    fn round_trips_small_plaintext_no_key() {
        let text = "MSH|^~\\&|A|B|C|D|20240101||ADT^A01|1|P|2.3";
        let encoded = encode(text, None).unwrap();
        assert_eq!(decode(&encoded, None).unwrap(), text);
    }

    #[test]
    fn round_trips_large_payload_compressed() {
        let text = "x".repeat(COMPRESSION_THRESHOLD_BYTES * 4);
        let encoded = encode(&text, None).unwrap();
        assert_eq!(decode(&encoded, None).unwrap(), text);
    }

    #[test]
    fn round_trips_encrypted_small() {
        let k = key();
        let text = "sensitive PHI payload";
        let encoded = encode(text, Some(&k)).unwrap();
        assert_eq!(decode(&encoded, Some(&k)).unwrap(), text);
    }

    #[test]
    fn round_trips_compressed_and_encrypted() {
        let k = key();
        let text = "y".repeat(COMPRESSION_THRESHOLD_BYTES * 2);
        let encoded = encode(&text, Some(&k)).unwrap();
        assert_eq!(decode(&encoded, Some(&k)).unwrap(), text);
    }

    #[test]
    fn all_four_combinations_round_trip() {
        let k = key();
        let small = "short";
        let large = "z".repeat(COMPRESSION_THRESHOLD_BYTES * 3);
        for text in [small, large.as_str()] {
            for key_opt in [None, Some(&k)] {
                let encoded = encode(text, key_opt).unwrap();
                assert_eq!(decode(&encoded, key_opt).unwrap(), text);
            }
        }
    }

    #[test]
    fn decoding_encrypted_content_without_key_fails() {
        let k = key();
        let encoded = encode("secret", Some(&k)).unwrap();
        assert!(decode(&encoded, None).is_err());
    }
}
