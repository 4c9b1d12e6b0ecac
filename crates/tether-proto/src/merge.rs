// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-field merge rules for the `merge` conflict policy.
//!
//! The merge table is authoritative-peer configuration and is replicated to
//! joining peers, so it has a canonical wire form alongside the in-memory
//! representation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::{CanonError, Value};

/// How two candidate values for one field combine under the merge policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRule {
    /// Keep the numerically smaller value.
    TakeMin,
    /// Keep the numerically larger value.
    TakeMax,
    /// Keep the value from the candidate that wins last-write-wins ordering.
    TakeLatest,
    /// Blend numeric values as `old * (1 - alpha) + new * alpha`.
    Interpolate(
        /// Blend factor in `[0, 1]`.
        f64,
    ),
}

/// Field name → merge rule. Unlisted fields default to [`MergeRule::TakeLatest`].
pub type MergeTable = BTreeMap<String, MergeRule>;

const RULE_TAKE_MIN: &str = "take_min";
const RULE_TAKE_MAX: &str = "take_max";
const RULE_TAKE_LATEST: &str = "take_latest";
const RULE_INTERPOLATE: &str = "interpolate";

impl MergeRule {
    /// Canonical wire form of this rule.
    #[must_use]
    pub fn to_value(self) -> Value {
        match self {
            MergeRule::TakeMin => Value::Str(RULE_TAKE_MIN.to_owned()),
            MergeRule::TakeMax => Value::Str(RULE_TAKE_MAX.to_owned()),
            MergeRule::TakeLatest => Value::Str(RULE_TAKE_LATEST.to_owned()),
            MergeRule::Interpolate(alpha) => {
                let mut map = BTreeMap::new();
                map.insert(RULE_INTERPOLATE.to_owned(), Value::Float(alpha));
                Value::Map(map)
            }
        }
    }

    /// Parses a rule from its canonical wire form.
    ///
    /// # Errors
    ///
    /// Returns [`CanonError::Decode`] for unknown rule names or shapes.
    pub fn from_value(value: &Value) -> Result<Self, CanonError> {
        match value {
            Value::Str(name) => match name.as_str() {
                RULE_TAKE_MIN => Ok(MergeRule::TakeMin),
                RULE_TAKE_MAX => Ok(MergeRule::TakeMax),
                RULE_TAKE_LATEST => Ok(MergeRule::TakeLatest),
                _ => Err(CanonError::Decode("unknown merge rule name")),
            },
            Value::Map(map) => match map.get(RULE_INTERPOLATE) {
                Some(Value::Float(alpha)) => Ok(MergeRule::Interpolate(*alpha)),
                _ => Err(CanonError::Decode("interpolate rule missing alpha")),
            },
            _ => Err(CanonError::Decode("merge rule must be string or map")),
        }
    }
}

/// Encodes a merge table as a canonical field map.
#[must_use]
pub fn merge_table_to_value(table: &MergeTable) -> Value {
    Value::Map(
        table
            .iter()
            .map(|(field, rule)| (field.clone(), rule.to_value()))
            .collect(),
    )
}

/// Parses a merge table from its canonical wire form.
///
/// # Errors
///
/// Returns [`CanonError::Decode`] when the value is not a map of rules.
pub fn merge_table_from_value(value: &Value) -> Result<MergeTable, CanonError> {
    let Value::Map(map) = value else {
        return Err(CanonError::Decode("merge table must be a map"));
    };
    let mut table = MergeTable::new();
    for (field, rule) in map {
        table.insert(field.clone(), MergeRule::from_value(rule)?);
    }
    Ok(table)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn rules_round_trip_through_wire_form() {
        let rules = [
            MergeRule::TakeMin,
            MergeRule::TakeMax,
            MergeRule::TakeLatest,
            MergeRule::Interpolate(0.25),
        ];
        for rule in rules {
            let back = MergeRule::from_value(&rule.to_value()).expect("rule decodes");
            assert_eq!(back, rule);
        }
    }

    #[test]
    fn table_round_trips() {
        let mut table = MergeTable::new();
        table.insert("hp".to_owned(), MergeRule::TakeMin);
        table.insert("pos".to_owned(), MergeRule::Interpolate(0.5));
        let back =
            merge_table_from_value(&merge_table_to_value(&table)).expect("table decodes");
        assert_eq!(back, table);
    }

    #[test]
    fn unknown_rule_name_is_rejected() {
        let v = Value::Str("take_median".to_owned());
        assert!(MergeRule::from_value(&v).is_err());
    }
}
