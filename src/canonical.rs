//! Canonical encoding and SHA-256 hashing
//!
//! Every hash in the crate is computed over the bytes produced here, so the
//! encoding law is the one thing every producer and verifier must share:
//!
//! - map keys sorted lexicographically, recursively
//! - `true`, `false` and `null` as literal tokens
//! - integers only; any floating-point value fails with [`EncodingError`]
//! - strings as raw UTF-8 with `"` and `\` escaped; control characters use
//!   JSON short escapes (`\n`, `\t`, ...) or `\u00XX`
//! - lists keep their order, no insignificant whitespace

use serde::ser::{self, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::EncodingError;
use crate::types::ContentHash;

/// Stateless canonical encoder and hasher
#[derive(Debug, Clone, Copy, Default)]
pub struct CanonicalEncoder;

impl CanonicalEncoder {
    /// Create a new encoder
    pub fn new() -> Self {
        Self
    }

    /// Deterministically serialize any serde value
    pub fn canonicalize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, EncodingError> {
        reject_floats(value)?;
        let tree = serde_json::to_value(value).map_err(|e| EncodingError::Unsupported {
            reason: e.to_string(),
        })?;
        self.canonicalize_value(&tree)
    }

    /// Deterministically serialize an already-built JSON tree
    pub fn canonicalize_value(&self, value: &Value) -> Result<Vec<u8>, EncodingError> {
        let mut out = Vec::with_capacity(128);
        let mut path = String::from("$");
        write_value(value, &mut out, &mut path)?;
        Ok(out)
    }

    /// SHA-256 over the canonical bytes
    pub fn hash<T: Serialize + ?Sized>(&self, value: &T) -> Result<ContentHash, EncodingError> {
        let bytes = self.canonicalize(value)?;
        Ok(self.hash_bytes(&bytes))
    }

    /// SHA-256 over raw bytes
    pub fn hash_bytes(&self, bytes: &[u8]) -> ContentHash {
        let digest: [u8; 32] = Sha256::digest(bytes).into();
        ContentHash::from_digest(&digest)
    }

    /// Summarize a set of chain heads as one hash.
    ///
    /// Heads are sorted by their hex form and concatenated before hashing, so
    /// the result does not depend on the order entities are visited in. An
    /// empty set hashes the empty string.
    pub fn merkle_root<'a, I>(&self, heads: I) -> ContentHash
    where
        I: IntoIterator<Item = &'a ContentHash>,
    {
        let mut sorted: Vec<&str> = heads.into_iter().map(ContentHash::as_str).collect();
        sorted.sort_unstable();
        self.hash_bytes(sorted.concat().as_bytes())
    }
}

/// Deterministically serialize any serde value
pub fn canonicalize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, EncodingError> {
    CanonicalEncoder.canonicalize(value)
}

/// Lowercase hex SHA-256 of the canonical encoding
pub fn compute_hash<T: Serialize + ?Sized>(value: &T) -> Result<ContentHash, EncodingError> {
    CanonicalEncoder.hash(value)
}

/// Compare two textual hashes after normalizing the `sha256:` prefix and case
pub fn hashes_equal(left: &str, right: &str) -> bool {
    match (ContentHash::parse(left), ContentHash::parse(right)) {
        (Ok(l), Ok(r)) => l == r,
        _ => false,
    }
}

fn write_value(value: &Value, out: &mut Vec<u8>, path: &mut String) -> Result<(), EncodingError> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.extend_from_slice(i.to_string().as_bytes());
            } else if let Some(u) = n.as_u64() {
                out.extend_from_slice(u.to_string().as_bytes());
            } else {
                return Err(EncodingError::FloatNotAllowed { path: path.clone() });
            }
        }
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                let mark = path.len();
                path.push_str(&format!("[{}]", i));
                write_value(item, out, path)?;
                path.truncate(mark);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            // serde_json may be built with preserve_order elsewhere in the graph
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(key, out);
                out.push(b':');
                let mark = path.len();
                path.push('.');
                path.push_str(key);
                if let Some(item) = map.get(key) {
                    write_value(item, out, path)?;
                }
                path.truncate(mark);
            }
            out.push(b'}');
        }
    }
    Ok(())
}

fn write_string(s: &str, out: &mut Vec<u8>) {
    out.push(b'"');
    for ch in s.chars() {
        match ch {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            '\t' => out.extend_from_slice(b"\\t"),
            '\u{08}' => out.extend_from_slice(b"\\b"),
            '\u{0c}' => out.extend_from_slice(b"\\f"),
            c if (c as u32) < 0x20 => out.extend_from_slice(format!("\\u{:04x}", c as u32).as_bytes()),
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push(b'"');
}

/// serde_json maps NaN and infinities to `null`, so floats are rejected
/// while walking the serde data model, before any JSON tree exists.
fn reject_floats<T: Serialize + ?Sized>(value: &T) -> Result<(), EncodingError> {
    let mut probe = FloatProbe { path: vec!["$".to_string()] };
    value.serialize(&mut probe).map_err(|e| match e {
        ProbeError::Float(path) => EncodingError::FloatNotAllowed { path },
        ProbeError::Custom(reason) => EncodingError::Unsupported { reason },
    })
}

#[derive(Debug)]
enum ProbeError {
    Float(String),
    Custom(String),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Float(path) => write!(f, "float at {}", path),
            ProbeError::Custom(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for ProbeError {}

impl ser::Error for ProbeError {
    fn custom<M: fmt::Display>(msg: M) -> Self {
        ProbeError::Custom(msg.to_string())
    }
}

struct FloatProbe {
    path: Vec<String>,
}

impl FloatProbe {
    fn float(&self) -> ProbeError {
        ProbeError::Float(self.path.join("."))
    }

    fn nested<T: Serialize + ?Sized>(&mut self, segment: &str, value: &T) -> Result<(), ProbeError> {
        self.path.push(segment.to_string());
        let result = value.serialize(&mut *self);
        self.path.pop();
        result
    }
}

impl<'a> ser::Serializer for &'a mut FloatProbe {
    type Ok = ();
    type Error = ProbeError;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _: bool) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_i8(self, _: i8) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_i16(self, _: i16) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_i32(self, _: i32) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_i64(self, _: i64) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_u8(self, _: u8) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_u16(self, _: u16) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_u32(self, _: u32) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_u64(self, _: u64) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_f32(self, _: f32) -> Result<(), ProbeError> {
        Err(self.float())
    }
    fn serialize_f64(self, _: f64) -> Result<(), ProbeError> {
        Err(self.float())
    }
    fn serialize_char(self, _: char) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_str(self, _: &str) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_bytes(self, _: &[u8]) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_none(self) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<(), ProbeError> {
        value.serialize(self)
    }
    fn serialize_unit(self) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_unit_struct(self, _: &'static str) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_unit_variant(self, _: &'static str, _: u32, _: &'static str) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<(), ProbeError> {
        value.serialize(self)
    }
    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<(), ProbeError> {
        self.nested(variant, value)
    }
    fn serialize_seq(self, _: Option<usize>) -> Result<Self, ProbeError> {
        Ok(self)
    }
    fn serialize_tuple(self, _: usize) -> Result<Self, ProbeError> {
        Ok(self)
    }
    fn serialize_tuple_struct(self, _: &'static str, _: usize) -> Result<Self, ProbeError> {
        Ok(self)
    }
    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, ProbeError> {
        Ok(self)
    }
    fn serialize_map(self, _: Option<usize>) -> Result<Self, ProbeError> {
        Ok(self)
    }
    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self, ProbeError> {
        Ok(self)
    }
    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, ProbeError> {
        Ok(self)
    }
}

impl<'a> ser::SerializeSeq for &'a mut FloatProbe {
    type Ok = ();
    type Error = ProbeError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ProbeError> {
        self.nested("[]", value)
    }
    fn end(self) -> Result<(), ProbeError> {
        Ok(())
    }
}

impl<'a> ser::SerializeTuple for &'a mut FloatProbe {
    type Ok = ();
    type Error = ProbeError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ProbeError> {
        self.nested("[]", value)
    }
    fn end(self) -> Result<(), ProbeError> {
        Ok(())
    }
}

impl<'a> ser::SerializeTupleStruct for &'a mut FloatProbe {
    type Ok = ();
    type Error = ProbeError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ProbeError> {
        self.nested("[]", value)
    }
    fn end(self) -> Result<(), ProbeError> {
        Ok(())
    }
}

impl<'a> ser::SerializeTupleVariant for &'a mut FloatProbe {
    type Ok = ();
    type Error = ProbeError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ProbeError> {
        self.nested("[]", value)
    }
    fn end(self) -> Result<(), ProbeError> {
        Ok(())
    }
}

impl<'a> ser::SerializeMap for &'a mut FloatProbe {
    type Ok = ();
    type Error = ProbeError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), ProbeError> {
        key.serialize(&mut **self)
    }
    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ProbeError> {
        self.nested("{}", value)
    }
    fn end(self) -> Result<(), ProbeError> {
        Ok(())
    }
}

impl<'a> ser::SerializeStruct for &'a mut FloatProbe {
    type Ok = ();
    type Error = ProbeError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), ProbeError> {
        self.nested(key, value)
    }
    fn end(self) -> Result<(), ProbeError> {
        Ok(())
    }
}

impl<'a> ser::SerializeStructVariant for &'a mut FloatProbe {
    type Ok = ();
    type Error = ProbeError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), ProbeError> {
        self.nested(key, value)
    }
    fn end(self) -> Result<(), ProbeError> {
        Ok(())
    }
}
