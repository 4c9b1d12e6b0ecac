// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Bounded ring of end-of-tick snapshots supporting rollback.
//!
//! Frames store only the payloads that changed since the prior frame.
//! Evicted frames fold into a base map, so `restore` always materializes
//! full state even though storage is delta-encoded.

use std::collections::{BTreeMap, VecDeque};

use tether_proto::Payload;

use crate::error::CoreError;
use crate::ident::{EntityId, TickNumber};
use crate::store::EntityStore;

/// End-of-tick snapshot: the payloads that changed during that tick.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryFrame {
    /// Tick the frame closes.
    pub tick: TickNumber,
    /// Entity payloads as of end-of-tick, only where changed.
    pub changed: BTreeMap<EntityId, Payload>,
}

/// Bounded rollback history (newest at the back, oldest evicted).
#[derive(Debug)]
pub struct HistoryBuffer {
    window: usize,
    /// State folded out of evicted frames.
    base: BTreeMap<EntityId, Payload>,
    frames: VecDeque<HistoryFrame>,
    /// Materialized end state of the newest frame, for delta computation.
    head: BTreeMap<EntityId, Payload>,
}

impl HistoryBuffer {
    /// Creates a buffer retaining `window` frames.
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            base: BTreeMap::new(),
            frames: VecDeque::new(),
            head: BTreeMap::new(),
        }
    }

    /// Tick of the newest retained frame.
    #[must_use]
    pub fn newest_tick(&self) -> Option<TickNumber> {
        self.frames.back().map(|f| f.tick)
    }

    /// Oldest tick `restore` can still materialize.
    #[must_use]
    pub fn oldest_restorable_tick(&self) -> Option<TickNumber> {
        self.frames.front().map(|f| f.tick)
    }

    /// Number of retained frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True when no frames are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Records the end-of-tick state of `store` as the frame for `tick`.
    pub fn snapshot(&mut self, tick: TickNumber, store: &EntityStore) {
        let mut changed = BTreeMap::new();
        for record in store.iter() {
            if self.head.get(&record.id) != Some(&record.payload) {
                changed.insert(record.id.clone(), record.payload.clone());
            }
        }
        for (id, payload) in &changed {
            self.head.insert(id.clone(), payload.clone());
        }
        self.push_frame(HistoryFrame { tick, changed });
    }

    /// Appends a pre-built frame (journal replay path). Evicts past the
    /// window exactly like [`snapshot`](Self::snapshot).
    pub fn push_frame(&mut self, frame: HistoryFrame) {
        for (id, payload) in &frame.changed {
            self.head.insert(id.clone(), payload.clone());
        }
        self.frames.push_back(frame);
        while self.frames.len() > self.window {
            if let Some(evicted) = self.frames.pop_front() {
                for (id, payload) in evicted.changed {
                    self.base.insert(id, payload);
                }
            }
        }
    }

    /// Materializes the full state as of end-of-`tick`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::HistoryExpired`] when `tick` precedes the oldest
    /// retained frame.
    pub fn state_at(&self, tick: TickNumber) -> Result<BTreeMap<EntityId, Payload>, CoreError> {
        let oldest = self
            .oldest_restorable_tick()
            .ok_or(CoreError::HistoryExpired { tick, oldest: 0 })?;
        if tick < oldest {
            return Err(CoreError::HistoryExpired { tick, oldest });
        }
        let mut state = self.base.clone();
        for frame in &self.frames {
            if frame.tick > tick {
                break;
            }
            for (id, payload) in &frame.changed {
                state.insert(id.clone(), payload.clone());
            }
        }
        Ok(state)
    }

    /// Overwrites every recorded entity's payload in `store` to its value at
    /// end-of-`tick`, returning the entities whose payload actually moved.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::HistoryExpired`] when the tick is outside the
    /// window; the caller degrades the conflict policy instead of rolling
    /// back.
    pub fn restore(
        &self,
        tick: TickNumber,
        store: &mut EntityStore,
    ) -> Result<Vec<EntityId>, CoreError> {
        let state = self.state_at(tick)?;
        let mut touched = Vec::new();
        for (id, payload) in state {
            let differs = store.read(&id).is_none_or(|r| r.payload != payload);
            if differs {
                store.restore_payload(&id, payload, tick);
                touched.push(id);
            }
        }
        Ok(touched)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ident::PeerId;
    use tether_proto::Value;

    fn payload(hp: i64) -> Payload {
        [("hp".to_owned(), Value::Int(hp))].into_iter().collect()
    }

    fn write(store: &mut EntityStore, id: &str, hp: i64, tick: TickNumber) {
        store
            .write(&EntityId::from(id), payload(hp), &PeerId::from("host"), tick)
            .expect("write");
    }

    #[test]
    fn frames_hold_only_changed_payloads() {
        let mut store = EntityStore::new(16);
        let mut history = HistoryBuffer::new(8);
        write(&mut store, "e1", 100, 1);
        write(&mut store, "e2", 200, 1);
        history.snapshot(1, &store);
        // Only e1 changes during tick 2.
        write(&mut store, "e1", 90, 2);
        history.snapshot(2, &store);

        let state1 = history.state_at(1).unwrap();
        assert_eq!(state1[&EntityId::from("e1")], payload(100));
        let state2 = history.state_at(2).unwrap();
        assert_eq!(state2[&EntityId::from("e1")], payload(90));
        assert_eq!(state2[&EntityId::from("e2")], payload(200));
    }

    #[test]
    fn eviction_folds_into_base_and_keeps_restores_whole() {
        let mut store = EntityStore::new(16);
        let mut history = HistoryBuffer::new(3);
        write(&mut store, "e1", 100, 1);
        history.snapshot(1, &store);
        for tick in 2..=6 {
            write(&mut store, "e2", tick as i64, tick);
            history.snapshot(tick, &store);
        }
        // Frames 1..=3 evicted; e1's only recorded payload lives in base.
        assert_eq!(history.oldest_restorable_tick(), Some(4));
        let state = history.state_at(4).unwrap();
        assert_eq!(state[&EntityId::from("e1")], payload(100));
        assert_eq!(state[&EntityId::from("e2")], payload(4));
    }

    #[test]
    fn restore_outside_window_is_history_expired() {
        let mut store = EntityStore::new(16);
        let mut history = HistoryBuffer::new(2);
        for tick in 1..=5 {
            write(&mut store, "e1", tick as i64, tick);
            history.snapshot(tick, &store);
        }
        let err = history.restore(2, &mut store).unwrap_err();
        assert_eq!(
            err,
            CoreError::HistoryExpired {
                tick: 2,
                oldest: 4
            }
        );
    }

    #[test]
    fn restore_rewinds_store_payloads() {
        let mut store = EntityStore::new(16);
        let mut history = HistoryBuffer::new(8);
        write(&mut store, "e1", 100, 1);
        write(&mut store, "e2", 7, 1);
        history.snapshot(1, &store);
        write(&mut store, "e1", 50, 2);
        history.snapshot(2, &store);

        let touched = history.restore(1, &mut store).unwrap();
        assert_eq!(touched, vec![EntityId::from("e1")], "e2 never moved");
        assert_eq!(store.read(&EntityId::from("e1")).unwrap().payload, payload(100));
        assert_eq!(store.read(&EntityId::from("e1")).unwrap().last_tick, 1);
    }
}
