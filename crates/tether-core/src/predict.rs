// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Client-side prediction records and server reconciliation.
//!
//! A prediction is retained until the authoritative update for its tick (or
//! later) arrives, or until it ages out of the rollback window. The local
//! integrator — external to the core — replaces its state on a diff and
//! replays its unacked inputs.

use std::collections::BTreeMap;

use tether_proto::{Payload, Value};

use crate::ident::{EntityId, PeerId, TickNumber};

/// One locally-predicted write, bound to the input that caused it.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRecord {
    /// Input id issued by the predicting peer.
    pub input_id: u64,
    /// The raw input payload.
    pub input: Payload,
    /// The locally-predicted entity payload.
    pub predicted: Payload,
    /// Tick the prediction was made for.
    pub tick: TickNumber,
}

/// Correction delivered when an authoritative payload disagrees with a
/// prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationDiff {
    /// The predicting peer.
    pub peer: PeerId,
    /// Affected entity.
    pub entity: EntityId,
    /// Input whose prediction missed, when one is identified.
    pub input_id: Option<u64>,
    /// The payload the peer predicted.
    pub predicted: Option<Payload>,
    /// The authoritative payload to adopt.
    pub authoritative: Payload,
    /// True when the peer drifted past the window and must resync from a
    /// full snapshot.
    pub full_resync: bool,
}

/// Ordered predictions per entity for the local peer.
#[derive(Debug, Default)]
pub struct PredictionLedger {
    by_entity: BTreeMap<EntityId, Vec<PredictionRecord>>,
}

impl PredictionLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a prediction, kept in tick order.
    pub fn record(&mut self, entity: &EntityId, record: PredictionRecord) {
        self.by_entity.entry(entity.clone()).or_default().push(record);
    }

    /// Pending predictions for `entity`.
    #[must_use]
    pub fn pending(&self, entity: &EntityId) -> &[PredictionRecord] {
        self.by_entity.get(entity).map_or(&[], |v| v.as_slice())
    }

    /// Total pending predictions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_entity.values().map(Vec::len).sum()
    }

    /// True when nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_entity.values().all(Vec::is_empty)
    }

    /// Reconciles predictions for `entity` against an authoritative payload
    /// applied at `auth_tick`.
    ///
    /// Predictions at `auth_tick` or earlier are dropped: silently when the
    /// prediction matches within `tolerance`, otherwise with a diff. Later
    /// predictions stay pending for the integrator to replay.
    pub fn reconcile(
        &mut self,
        peer: &PeerId,
        entity: &EntityId,
        authoritative: &Payload,
        auth_tick: TickNumber,
        tolerance: f64,
    ) -> Vec<ReconciliationDiff> {
        let Some(records) = self.by_entity.get_mut(entity) else {
            return Vec::new();
        };
        let mut diffs = Vec::new();
        records.retain(|record| {
            if record.tick > auth_tick {
                return true;
            }
            if !payloads_agree(&record.predicted, authoritative, tolerance) {
                diffs.push(ReconciliationDiff {
                    peer: peer.clone(),
                    entity: entity.clone(),
                    input_id: Some(record.input_id),
                    predicted: Some(record.predicted.clone()),
                    authoritative: authoritative.clone(),
                    full_resync: false,
                });
            }
            false
        });
        diffs
    }

    /// Discards predictions older than the rollback window, returning a
    /// full-resync diff per affected entity.
    pub fn expire(
        &mut self,
        peer: &PeerId,
        now_tick: TickNumber,
        window: u64,
        authoritative_of: impl Fn(&EntityId) -> Option<Payload>,
    ) -> Vec<ReconciliationDiff> {
        let floor = now_tick.saturating_sub(window);
        let mut diffs = Vec::new();
        for (entity, records) in &mut self.by_entity {
            let before = records.len();
            records.retain(|r| r.tick >= floor);
            if records.len() < before {
                diffs.push(ReconciliationDiff {
                    peer: peer.clone(),
                    entity: entity.clone(),
                    input_id: None,
                    predicted: None,
                    authoritative: authoritative_of(entity).unwrap_or_default(),
                    full_resync: true,
                });
            }
        }
        self.by_entity.retain(|_, records| !records.is_empty());
        diffs
    }
}

/// Structural payload comparison with float tolerance.
///
/// Floats agree within `tolerance` absolute difference; every other value
/// kind must match exactly, recursively.
#[must_use]
pub fn payloads_agree(a: &Payload, b: &Payload, tolerance: f64) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|(key, va)| {
        b.get(key).is_some_and(|vb| values_agree(va, vb, tolerance))
    })
}

fn values_agree(a: &Value, b: &Value, tolerance: f64) -> bool {
    match (a, b) {
        (Value::Float(x), Value::Float(y)) => {
            (x.is_nan() && y.is_nan()) || (x - y).abs() <= tolerance
        }
        (Value::Float(x), Value::Int(y)) | (Value::Int(y), Value::Float(x)) => {
            (x - *y as f64).abs() <= tolerance
        }
        (Value::List(xs), Value::List(ys)) => {
            xs.len() == ys.len()
                && xs.iter().zip(ys).all(|(x, y)| values_agree(x, y, tolerance))
        }
        (Value::Map(xs), Value::Map(ys)) => payloads_agree(xs, ys, tolerance),
        _ => a == b,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn pos(x: f64) -> Payload {
        [("x".to_owned(), Value::Float(x))].into_iter().collect()
    }

    fn record(input_id: u64, x: f64, tick: TickNumber) -> PredictionRecord {
        PredictionRecord {
            input_id,
            input: pos(x),
            predicted: pos(x),
            tick,
        }
    }

    #[test]
    fn matching_prediction_drops_silently() {
        let mut ledger = PredictionLedger::new();
        let e = EntityId::from("e1");
        let me = PeerId::from("client");
        ledger.record(&e, record(1, 12.0, 50));
        let diffs = ledger.reconcile(&me, &e, &pos(12.0), 53, 1e-6);
        assert!(diffs.is_empty());
        assert!(ledger.pending(&e).is_empty());
    }

    #[test]
    fn mismatch_emits_diff_and_keeps_later_predictions() {
        let mut ledger = PredictionLedger::new();
        let e = EntityId::from("e1");
        let me = PeerId::from("client");
        ledger.record(&e, record(1, 12.0, 50));
        ledger.record(&e, record(2, 13.0, 55));
        let diffs = ledger.reconcile(&me, &e, &pos(11.0), 53, 1e-6);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].input_id, Some(1));
        assert_eq!(diffs[0].predicted, Some(pos(12.0)));
        assert_eq!(diffs[0].authoritative, pos(11.0));
        assert!(!diffs[0].full_resync);
        // The unacked later prediction is left for replay.
        assert_eq!(ledger.pending(&e).len(), 1);
        assert_eq!(ledger.pending(&e)[0].input_id, 2);
    }

    #[test]
    fn tolerance_absorbs_float_noise() {
        let mut ledger = PredictionLedger::new();
        let e = EntityId::from("e1");
        let me = PeerId::from("client");
        ledger.record(&e, record(1, 12.0, 50));
        let diffs = ledger.reconcile(&me, &e, &pos(12.0 + 1e-9), 50, 1e-6);
        assert!(diffs.is_empty());
    }

    #[test]
    fn expiry_past_the_window_demands_full_resync() {
        let mut ledger = PredictionLedger::new();
        let e = EntityId::from("e1");
        let me = PeerId::from("client");
        ledger.record(&e, record(1, 12.0, 10));
        let diffs = ledger.expire(&me, 100, 60, |_| Some(pos(11.0)));
        assert_eq!(diffs.len(), 1);
        assert!(diffs[0].full_resync);
        assert_eq!(diffs[0].authoritative, pos(11.0));
        assert!(ledger.is_empty());
    }
}
