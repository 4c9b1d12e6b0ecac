// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Field-level deltas between two payload versions.
//!
//! A delta carries only the fields that changed against a baseline the
//! receiver is known to possess, plus the names of removed fields. Applying
//! a delta to that baseline reproduces the sender's post-write payload
//! exactly, byte for byte once re-encoded canonically.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::value::{decode_value, encode_value, CanonError, Payload, Value};

const FIELD_CHANGED: &str = "changed";
const FIELD_REMOVED: &str = "removed";

/// Changed fields and removed field names between a baseline and a newer
/// payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PayloadDelta {
    /// Fields added or whose value changed, in canonical key order.
    pub changed: Payload,
    /// Names of fields present in the baseline but absent in the newer
    /// payload, sorted.
    pub removed: Vec<String>,
}

impl PayloadDelta {
    /// Computes the delta that takes `baseline` to `next`.
    #[must_use]
    pub fn diff(baseline: &Payload, next: &Payload) -> Self {
        let mut changed = Payload::new();
        for (key, value) in next {
            if baseline.get(key) != Some(value) {
                changed.insert(key.clone(), value.clone());
            }
        }
        let removed = baseline
            .keys()
            .filter(|k| !next.contains_key(*k))
            .cloned()
            .collect();
        Self { changed, removed }
    }

    /// Applies this delta to `baseline`, producing the newer payload.
    #[must_use]
    pub fn apply(&self, baseline: &Payload) -> Payload {
        let mut out = baseline.clone();
        for name in &self.removed {
            out.remove(name);
        }
        for (key, value) in &self.changed {
            out.insert(key.clone(), value.clone());
        }
        out
    }

    /// True when the delta carries no changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }

    /// Encodes the delta canonically (a two-field map).
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut map = BTreeMap::new();
        map.insert(
            FIELD_CHANGED.to_owned(),
            Value::Map(self.changed.clone()),
        );
        map.insert(
            FIELD_REMOVED.to_owned(),
            Value::List(
                self.removed
                    .iter()
                    .map(|n| Value::Str(n.clone()))
                    .collect(),
            ),
        );
        Bytes::from(encode_value(&Value::Map(map)))
    }

    /// Decodes a canonical delta encoding.
    ///
    /// # Errors
    ///
    /// Returns a [`CanonError`] when the bytes are not a canonical two-field
    /// delta map.
    pub fn decode(bytes: &[u8]) -> Result<Self, CanonError> {
        let Value::Map(mut map) = decode_value(bytes)? else {
            return Err(CanonError::Decode("delta must be a map"));
        };
        let Some(Value::Map(changed)) = map.remove(FIELD_CHANGED) else {
            return Err(CanonError::Decode("delta missing changed map"));
        };
        let Some(Value::List(names)) = map.remove(FIELD_REMOVED) else {
            return Err(CanonError::Decode("delta missing removed list"));
        };
        let mut removed = Vec::with_capacity(names.len());
        for name in names {
            let Value::Str(name) = name else {
                return Err(CanonError::Decode("removed entries must be strings"));
            };
            removed.push(name);
        }
        Ok(Self { changed, removed })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn payload(entries: &[(&str, Value)]) -> Payload {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn diff_captures_changed_added_and_removed() {
        let base = payload(&[
            ("hp", Value::Int(100)),
            ("mp", Value::Int(50)),
            ("name", Value::from("alpha")),
        ]);
        let next = payload(&[
            ("hp", Value::Int(90)),
            ("name", Value::from("alpha")),
            ("shield", Value::Int(25)),
        ]);
        let delta = PayloadDelta::diff(&base, &next);
        assert_eq!(
            delta.changed,
            payload(&[("hp", Value::Int(90)), ("shield", Value::Int(25))])
        );
        assert_eq!(delta.removed, vec!["mp".to_owned()]);
        assert_eq!(delta.apply(&base), next);
    }

    #[test]
    fn identical_payloads_produce_empty_delta() {
        let base = payload(&[("hp", Value::Int(100))]);
        let delta = PayloadDelta::diff(&base, &base);
        assert!(delta.is_empty());
        assert_eq!(delta.apply(&base), base);
    }

    #[test]
    fn encode_decode_round_trip() {
        let base = payload(&[("a", Value::Int(1)), ("b", Value::Int(2))]);
        let next = payload(&[("a", Value::Int(3)), ("c", Value::from("new"))]);
        let delta = PayloadDelta::diff(&base, &next);
        let back = PayloadDelta::decode(&delta.encode()).expect("delta decodes");
        assert_eq!(back, delta);
        assert_eq!(back.apply(&base), next);
    }

    #[test]
    fn two_senders_of_equal_state_produce_identical_bytes() {
        let base = payload(&[("hp", Value::Int(100))]);
        let mut next_a = base.clone();
        next_a.insert("hp".to_owned(), Value::Int(90));
        next_a.insert("shield".to_owned(), Value::Int(10));
        let mut next_b = Payload::new();
        next_b.insert("shield".to_owned(), Value::Int(10));
        next_b.insert("hp".to_owned(), Value::Int(90));
        let a = PayloadDelta::diff(&base, &next_a).encode();
        let b = PayloadDelta::diff(&base, &next_b).encode();
        assert_eq!(a, b);
    }
}
