// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Canonical tagged value codec for replicated payloads.
//!
//! Enforces:
//! - Map keys sorted lexically by UTF-8 bytes; no duplicates
//! - Integers in minimal big-endian two's-complement width
//! - Floats as IEEE-754 binary64 big-endian with a single canonical NaN
//!   bit pattern and negative zero normalized to positive zero
//! - No trailing bytes after a top-level value
//!
//! Two encoders given equal values produce byte-identical output, which is
//! what makes conflict hashing and delta comparison well-defined.

use std::collections::BTreeMap;

use bytes::Bytes;

/// 32-byte content digest (blake3).
pub type Digest = [u8; 32];

/// A replicated entity payload: stable field names mapped to tagged values.
pub type Payload = BTreeMap<String, Value>;

const TAG_NULL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_STR: u8 = 0x05;
const TAG_BYTES: u8 = 0x06;
const TAG_LIST: u8 = 0x07;
const TAG_MAP: u8 = 0x08;

/// The canonical quiet-NaN bit pattern every NaN is normalized to.
const CANONICAL_NAN_BITS: u64 = 0x7ff8_0000_0000_0000;

/// Violations of the canonical encoding.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CanonError {
    /// Input ended before the value was complete.
    #[error("incomplete input")]
    Incomplete,
    /// Bytes remained after the top-level value.
    #[error("trailing bytes after value")]
    Trailing,
    /// Unknown type tag.
    #[error("unknown value tag {0:#04x}")]
    UnknownTag(u8),
    /// Integer encoded wider than its minimal two's-complement width.
    #[error("non-minimal integer width")]
    NonCanonicalInt,
    /// Float carried a non-normalized NaN or negative-zero bit pattern.
    #[error("non-canonical float bits")]
    NonCanonicalFloat,
    /// Map keys were not strictly increasing.
    #[error("map keys not strictly increasing")]
    MapKeyOrder,
    /// A map key appeared twice.
    #[error("duplicate map key")]
    MapKeyDuplicate,
    /// A string field held invalid UTF-8.
    #[error("invalid utf-8 in string")]
    InvalidUtf8,
    /// The value decoded but did not match the expected shape.
    #[error("decode error: {0}")]
    Decode(&'static str),
}

type Result<T> = std::result::Result<T, CanonError>;

/// A tagged payload value.
///
/// Equality is total and byte-faithful: floats compare by their canonical
/// bit pattern, so `NaN == NaN` and `0.0 == -0.0` here, matching the
/// `encode(x) == encode(y) iff x == y` contract.
#[derive(Debug, Clone)]
pub enum Value {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// IEEE-754 binary64. Normalized on encode and compare.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Opaque byte string.
    Bytes(Bytes),
    /// Ordered sequence of values.
    List(Vec<Value>),
    /// Field map with lexically ordered keys.
    Map(BTreeMap<String, Value>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => normalize_bits(*a) == normalize_bits(*b),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

/// Returns the canonical bit pattern for `f` (single NaN, no negative zero).
#[inline]
fn normalize_bits(f: f64) -> u64 {
    if f.is_nan() {
        CANONICAL_NAN_BITS
    } else if f == 0.0 {
        0
    } else {
        f.to_bits()
    }
}

/// Minimal big-endian two's-complement width of `v`, in bytes (1..=8).
#[inline]
fn int_width(v: i64) -> usize {
    for w in 1..8 {
        let sign = v >> (8 * w - 1);
        if sign == 0 || sign == -1 {
            return w;
        }
    }
    8
}

// --- Encoder --------------------------------------------------------------

/// Encodes a value to its canonical byte form.
#[must_use]
pub fn encode_value(v: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    enc_value(v, &mut out);
    out
}

fn enc_value(v: &Value, out: &mut Vec<u8>) {
    match v {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(b) => out.push(if *b { TAG_TRUE } else { TAG_FALSE }),
        Value::Int(n) => {
            let w = int_width(*n);
            out.push(TAG_INT);
            out.push(w as u8);
            out.extend_from_slice(&n.to_be_bytes()[8 - w..]);
        }
        Value::Float(f) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&normalize_bits(*f).to_be_bytes());
        }
        Value::Str(s) => {
            out.push(TAG_STR);
            enc_len(s.len(), out);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            out.push(TAG_BYTES);
            enc_len(b.len(), out);
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(TAG_LIST);
            enc_len(items.len(), out);
            for it in items {
                enc_value(it, out);
            }
        }
        Value::Map(map) => {
            out.push(TAG_MAP);
            enc_len(map.len(), out);
            // BTreeMap iterates keys in lexical byte order already.
            for (k, v) in map {
                enc_len(k.len(), out);
                out.extend_from_slice(k.as_bytes());
                enc_value(v, out);
            }
        }
    }
}

#[inline]
fn enc_len(len: usize, out: &mut Vec<u8>) {
    out.extend_from_slice(&(len as u32).to_be_bytes());
}

/// Encodes a payload (top-level field map) to canonical bytes.
#[must_use]
pub fn encode_payload(payload: &Payload) -> Bytes {
    let mut out = Vec::new();
    enc_value(&Value::Map(payload.clone()), &mut out);
    Bytes::from(out)
}

/// Blake3 digest of the canonical payload encoding.
///
/// Vote-based conflict resolution tallies these digests, so equal payloads
/// hash identically on every peer.
#[must_use]
pub fn payload_digest(payload: &Payload) -> Digest {
    blake3::hash(&encode_payload(payload)).into()
}

// --- Decoder --------------------------------------------------------------

/// Decodes a canonical byte form back into a value.
///
/// # Errors
///
/// Returns a [`CanonError`] when the input is truncated, carries trailing
/// bytes, or violates any canonicality rule.
pub fn decode_value(bytes: &[u8]) -> Result<Value> {
    let mut idx = 0usize;
    let v = dec_value(bytes, &mut idx)?;
    if idx != bytes.len() {
        return Err(CanonError::Trailing);
    }
    Ok(v)
}

/// Decodes canonical payload bytes back into a field map.
///
/// # Errors
///
/// Returns [`CanonError::Decode`] when the top-level value is not a map, or
/// any codec violation from [`decode_value`].
pub fn decode_payload(bytes: &[u8]) -> Result<Payload> {
    match decode_value(bytes)? {
        Value::Map(map) => Ok(map),
        _ => Err(CanonError::Decode("payload must be a top-level map")),
    }
}

fn dec_value(bytes: &[u8], idx: &mut usize) -> Result<Value> {
    let tag = *bytes.get(*idx).ok_or(CanonError::Incomplete)?;
    *idx += 1;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_FALSE => Ok(Value::Bool(false)),
        TAG_TRUE => Ok(Value::Bool(true)),
        TAG_INT => {
            let w = *bytes.get(*idx).ok_or(CanonError::Incomplete)? as usize;
            *idx += 1;
            if w == 0 || w > 8 {
                return Err(CanonError::NonCanonicalInt);
            }
            let raw = take(bytes, idx, w)?;
            let mut buf = [0u8; 8];
            // Sign-extend from the top bit of the first byte.
            if raw[0] & 0x80 != 0 {
                buf = [0xff; 8];
            }
            buf[8 - w..].copy_from_slice(raw);
            let v = i64::from_be_bytes(buf);
            if int_width(v) != w {
                return Err(CanonError::NonCanonicalInt);
            }
            Ok(Value::Int(v))
        }
        TAG_FLOAT => {
            let raw = take(bytes, idx, 8)?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(raw);
            let bits = u64::from_be_bytes(buf);
            let f = f64::from_bits(bits);
            if normalize_bits(f) != bits {
                return Err(CanonError::NonCanonicalFloat);
            }
            Ok(Value::Float(f))
        }
        TAG_STR => {
            let len = dec_len(bytes, idx)?;
            let raw = take(bytes, idx, len)?;
            let s = std::str::from_utf8(raw).map_err(|_| CanonError::InvalidUtf8)?;
            Ok(Value::Str(s.to_owned()))
        }
        TAG_BYTES => {
            let len = dec_len(bytes, idx)?;
            let raw = take(bytes, idx, len)?;
            Ok(Value::Bytes(Bytes::copy_from_slice(raw)))
        }
        TAG_LIST => {
            let len = dec_len(bytes, idx)?;
            let mut items = Vec::new();
            for _ in 0..len {
                items.push(dec_value(bytes, idx)?);
            }
            Ok(Value::List(items))
        }
        TAG_MAP => {
            let len = dec_len(bytes, idx)?;
            let mut map = BTreeMap::new();
            let mut prev: Option<String> = None;
            for _ in 0..len {
                let klen = dec_len(bytes, idx)?;
                let raw = take(bytes, idx, klen)?;
                let key = std::str::from_utf8(raw)
                    .map_err(|_| CanonError::InvalidUtf8)?
                    .to_owned();
                if let Some(p) = &prev {
                    match p.as_bytes().cmp(key.as_bytes()) {
                        std::cmp::Ordering::Less => {}
                        std::cmp::Ordering::Equal => return Err(CanonError::MapKeyDuplicate),
                        std::cmp::Ordering::Greater => return Err(CanonError::MapKeyOrder),
                    }
                }
                let val = dec_value(bytes, idx)?;
                prev = Some(key.clone());
                map.insert(key, val);
            }
            Ok(Value::Map(map))
        }
        other => Err(CanonError::UnknownTag(other)),
    }
}

fn dec_len(bytes: &[u8], idx: &mut usize) -> Result<usize> {
    let raw = take(bytes, idx, 4)?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(raw);
    Ok(u32::from_be_bytes(buf) as usize)
}

fn take<'a>(bytes: &'a [u8], idx: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = idx.checked_add(len).ok_or(CanonError::Incomplete)?;
    if end > bytes.len() {
        return Err(CanonError::Incomplete);
    }
    let out = &bytes[*idx..end];
    *idx = end;
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn payload(entries: &[(&str, Value)]) -> Payload {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn minimal_int_widths() {
        assert_eq!(encode_value(&Value::Int(0)), vec![TAG_INT, 1, 0x00]);
        assert_eq!(encode_value(&Value::Int(127)), vec![TAG_INT, 1, 0x7f]);
        // 128 needs two bytes: 0x80 alone would read back as -128.
        assert_eq!(encode_value(&Value::Int(128)), vec![TAG_INT, 2, 0x00, 0x80]);
        assert_eq!(encode_value(&Value::Int(-1)), vec![TAG_INT, 1, 0xff]);
        assert_eq!(encode_value(&Value::Int(-128)), vec![TAG_INT, 1, 0x80]);
        assert_eq!(
            encode_value(&Value::Int(-129)),
            vec![TAG_INT, 2, 0xff, 0x7f]
        );
        assert_eq!(encode_value(&Value::Int(i64::MAX)).len(), 2 + 8);
    }

    #[test]
    fn reject_padded_int() {
        // 0 encoded in two bytes is non-minimal.
        let bytes = vec![TAG_INT, 2, 0x00, 0x00];
        assert_eq!(decode_value(&bytes), Err(CanonError::NonCanonicalInt));
    }

    #[test]
    fn floats_are_big_endian_binary64() {
        let enc = encode_value(&Value::Float(1.5));
        assert_eq!(enc[0], TAG_FLOAT);
        assert_eq!(&enc[1..], &1.5f64.to_bits().to_be_bytes());
    }

    #[test]
    fn nan_and_negative_zero_normalize() {
        let a = encode_value(&Value::Float(f64::NAN));
        let b = encode_value(&Value::Float(-f64::NAN));
        assert_eq!(a, b);
        let z = encode_value(&Value::Float(0.0));
        let nz = encode_value(&Value::Float(-0.0));
        assert_eq!(z, nz);
        assert_eq!(Value::Float(0.0), Value::Float(-0.0));
    }

    #[test]
    fn reject_non_canonical_nan_bits() {
        let mut bytes = vec![TAG_FLOAT];
        // A signaling-style NaN pattern that is not the canonical one.
        bytes.extend_from_slice(&0x7ff0_0000_0000_0001u64.to_be_bytes());
        assert_eq!(decode_value(&bytes), Err(CanonError::NonCanonicalFloat));
    }

    #[test]
    fn map_keys_sorted_and_unique_on_the_wire() {
        let p = payload(&[("b", Value::Int(2)), ("a", Value::Int(1))]);
        let enc = encode_payload(&p);
        // "a" must appear before "b" regardless of insertion order.
        let pos_a = enc.windows(1).position(|w| w == b"a").unwrap();
        let pos_b = enc.windows(1).position(|w| w == b"b").unwrap();
        assert!(pos_a < pos_b);

        let mut dup = Vec::from(&enc[..]);
        // Duplicate-key and misordered maps are hand-built.
        let two = payload(&[("a", Value::Int(1)), ("a", Value::Int(1))]);
        assert_eq!(two.len(), 1, "BTreeMap cannot hold duplicates");
        dup.clear();
        dup.push(TAG_MAP);
        dup.extend_from_slice(&2u32.to_be_bytes());
        for _ in 0..2 {
            dup.extend_from_slice(&1u32.to_be_bytes());
            dup.push(b'a');
            dup.push(TAG_NULL);
        }
        assert_eq!(decode_value(&dup), Err(CanonError::MapKeyDuplicate));
    }

    #[test]
    fn reject_misordered_map_keys() {
        let mut bytes = vec![TAG_MAP];
        bytes.extend_from_slice(&2u32.to_be_bytes());
        for key in [b"b", b"a"] {
            bytes.extend_from_slice(&1u32.to_be_bytes());
            bytes.extend_from_slice(key);
            bytes.push(TAG_NULL);
        }
        assert_eq!(decode_value(&bytes), Err(CanonError::MapKeyOrder));
    }

    #[test]
    fn reject_trailing_bytes() {
        let mut bytes = encode_value(&Value::Null);
        bytes.push(0x00);
        assert_eq!(decode_value(&bytes), Err(CanonError::Trailing));
    }

    #[test]
    fn round_trip_nested() {
        let p = payload(&[
            ("flag", Value::Bool(true)),
            ("hp", Value::Int(90)),
            ("name", Value::from("alpha")),
            ("none", Value::Null),
            (
                "pos",
                Value::Map(payload(&[
                    ("x", Value::Float(12.25)),
                    ("y", Value::Float(-3.5)),
                ])),
            ),
            (
                "tags",
                Value::List(vec![Value::from("a"), Value::from("b")]),
            ),
            ("blob", Value::Bytes(Bytes::from_static(&[1, 2, 3]))),
        ]);
        let enc = encode_payload(&p);
        let back = decode_payload(&enc).expect("canonical bytes decode");
        assert_eq!(back, p);
    }

    #[test]
    fn equal_payloads_digest_identically() {
        let a = payload(&[("hp", Value::Int(90)), ("mp", Value::Int(10))]);
        let mut b = Payload::new();
        b.insert("mp".to_owned(), Value::Int(10));
        b.insert("hp".to_owned(), Value::Int(90));
        assert_eq!(payload_digest(&a), payload_digest(&b));

        let c = payload(&[("hp", Value::Int(80)), ("mp", Value::Int(10))]);
        assert_ne!(payload_digest(&a), payload_digest(&c));
    }
}
