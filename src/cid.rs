//! Content identifiers for canonical payloads
//!
//! An identifier is a CIDv1 over the canonical bytes of a payload:
//! `varint(1) ++ varint(0x0129 dag-json) ++ multihash`, where the multihash is
//! `0x12 0x20 ++ sha256(bytes)`. The textual form is multibase base32: a
//! leading `b` followed by lowercase RFC 4648 base32 without padding.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::canonical::canonicalize;
use crate::error::{EncodingError, IntegrityError};
use crate::types::ContentHash;

/// Multihash code for SHA2-256
pub const SHA2_256: u64 = 0x12;
/// Multicodec for DAG-JSON
pub const DAG_JSON: u64 = 0x0129;
const CID_VERSION: u64 = 1;
const DIGEST_LEN: usize = 32;
const MULTIBASE_BASE32: char = 'b';
const ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Parsed content identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentId {
    codec: u64,
    digest: [u8; DIGEST_LEN],
}

impl ContentId {
    /// Identifier of a payload's canonical encoding
    pub fn for_payload<T: Serialize + ?Sized>(payload: &T) -> Result<Self, EncodingError> {
        Ok(Self::for_bytes(&canonicalize(payload)?))
    }

    /// Identifier of raw canonical bytes
    pub fn for_bytes(bytes: &[u8]) -> Self {
        Self {
            codec: DAG_JSON,
            digest: Sha256::digest(bytes).into(),
        }
    }

    pub fn codec(&self) -> u64 {
        self.codec
    }

    pub fn digest(&self) -> ContentHash {
        ContentHash::from_digest(&self.digest)
    }

    /// `0x12 0x20 ++ digest`
    pub fn multihash(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + DIGEST_LEN);
        write_varint(SHA2_256, &mut out);
        write_varint(DIGEST_LEN as u64, &mut out);
        out.extend_from_slice(&self.digest);
        out
    }

    /// Multihash as lowercase hex
    pub fn multihash_hex(&self) -> String {
        hex::encode(self.multihash())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 2 + DIGEST_LEN);
        write_varint(CID_VERSION, &mut out);
        write_varint(self.codec, &mut out);
        out.extend_from_slice(&self.multihash());
        out
    }

    /// Textual multibase form
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(64);
        out.push(MULTIBASE_BASE32);
        out.push_str(&base32_encode(&self.to_bytes()));
        out
    }

    /// Parse the textual form, rejecting anything but CIDv1 + SHA2-256
    pub fn parse(text: &str) -> Result<Self, IntegrityError> {
        let malformed = |reason: &str| IntegrityError::MalformedContentId {
            content_id: text.to_string(),
            reason: reason.to_string(),
        };

        let body = text
            .strip_prefix(MULTIBASE_BASE32)
            .ok_or_else(|| malformed("expected multibase base32 prefix 'b'"))?;
        let bytes = base32_decode(body).ok_or_else(|| malformed("invalid base32"))?;

        let mut cursor = bytes.as_slice();
        let version = read_varint(&mut cursor).ok_or_else(|| malformed("truncated version"))?;
        if version != CID_VERSION {
            return Err(malformed("unsupported CID version"));
        }
        let codec = read_varint(&mut cursor).ok_or_else(|| malformed("truncated codec"))?;
        let hash_code = read_varint(&mut cursor).ok_or_else(|| malformed("truncated multihash"))?;
        if hash_code != SHA2_256 {
            return Err(malformed("unsupported multihash function"));
        }
        let len = read_varint(&mut cursor).ok_or_else(|| malformed("truncated multihash"))?;
        if len != DIGEST_LEN as u64 || cursor.len() != DIGEST_LEN {
            return Err(malformed("digest length mismatch"));
        }

        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(cursor);
        Ok(Self { codec, digest })
    }

    /// True when `bytes` hash to this identifier's digest
    pub fn matches_bytes(&self, bytes: &[u8]) -> bool {
        let digest: [u8; DIGEST_LEN] = Sha256::digest(bytes).into();
        digest == self.digest
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Textual identifier of a payload
pub fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<String, EncodingError> {
    ContentId::for_payload(payload).map(|cid| cid.encode())
}

/// Decode `id` and compare its digest against the payload's canonical bytes
pub fn verify<T: Serialize + ?Sized>(id: &str, payload: &T) -> bool {
    match canonicalize(payload) {
        Ok(bytes) => verify_bytes(id, &bytes),
        Err(_) => false,
    }
}

/// Decode `id` and compare its digest against raw bytes
pub fn verify_bytes(id: &str, bytes: &[u8]) -> bool {
    ContentId::parse(id).map(|cid| cid.matches_bytes(bytes)).unwrap_or(false)
}

fn write_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(cursor: &mut &[u8]) -> Option<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let (&byte, rest) = cursor.split_first()?;
        *cursor = rest;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    None
}

fn base32_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 8 + 4) / 5);
    let mut buffer = 0u32;
    let mut bits = 0u32;
    for &byte in bytes {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(char::from(ALPHABET[((buffer >> bits) & 0x1f) as usize]));
        }
    }
    if bits > 0 {
        out.push(char::from(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize]));
    }
    out
}

fn base32_decode(text: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len() * 5 / 8);
    let mut buffer = 0u32;
    let mut bits = 0u32;
    for ch in text.bytes() {
        let value = ALPHABET.iter().position(|&c| c == ch)? as u32;
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((buffer >> bits) & 0xff) as u8);
        }
    }
    // Leftover bits must be zero padding from the encoder
    if bits >= 5 || buffer & ((1 << bits) - 1) != 0 {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_base32_rfc4648_vectors() {
        assert_eq!(base32_encode(b""), "");
        assert_eq!(base32_encode(b"f"), "my");
        assert_eq!(base32_encode(b"fo"), "mzxq");
        assert_eq!(base32_encode(b"foo"), "mzxw6");
        assert_eq!(base32_encode(b"foobar"), "mzxw6ytboi");
        assert_eq!(base32_decode("mzxw6ytboi").unwrap(), b"foobar");
    }

    #[test]
    fn test_varint() {
        let mut out = Vec::new();
        write_varint(DAG_JSON, &mut out);
        assert_eq!(out, vec![0xa9, 0x02]);

        let mut cursor = out.as_slice();
        assert_eq!(read_varint(&mut cursor), Some(DAG_JSON));
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_identifier_layout() {
        let cid = ContentId::for_bytes(b"{}");
        let bytes = cid.to_bytes();

        assert_eq!(&bytes[..5], &[0x01, 0xa9, 0x02, 0x12, 0x20]);
        assert_eq!(bytes.len(), 5 + 32);
        assert!(cid.encode().starts_with("baguqee"));
        assert!(cid.multihash_hex().starts_with("1220"));
    }

    #[test]
    fn test_round_trip() {
        let payload = json!({"tick": 5, "entities": ["a", "b"]});
        let id = encode(&payload).unwrap();

        assert!(verify(&id, &payload));
        assert_eq!(ContentId::parse(&id).unwrap().encode(), id);
    }

    #[test]
    fn test_digest_matches_canonical_hash() {
        let payload = json!({"b": 1, "a": 2});
        let cid = ContentId::for_payload(&payload).unwrap();
        assert_eq!(cid.digest(), crate::canonical::compute_hash(&payload).unwrap());
    }

    #[test]
    fn test_changed_payload_fails() {
        let id = encode(&json!({"tick": 5})).unwrap();
        assert!(!verify(&id, &json!({"tick": 6})));
    }

    #[test]
    fn test_malformed_identifiers() {
        assert!(ContentId::parse("zabc").is_err());
        assert!(ContentId::parse("b0000").is_err());
        assert!(ContentId::parse("b").is_err());
        assert!(!verify_bytes("not-a-cid", b"{}"));
    }
}
