// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Versioned entity store with cooperative locks.
//!
//! Invariants:
//! - `version` is strictly monotonic per entity and equals the count of
//!   accepted writes.
//! - A lock-held record accepts writes only from its holder.
//! - Dirty iteration is in entity-id order, so the outbound flush is
//!   byte-deterministic across peers.

use std::collections::BTreeMap;

use tether_proto::Payload;

use crate::error::CoreError;
use crate::ident::{EntityId, PeerId, TickNumber};

/// Lock state of one entity record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LockState {
    /// No lock.
    #[default]
    Free,
    /// Lease granted to `holder` until `expiry_tick` (inclusive).
    Held {
        /// Current holder.
        holder: PeerId,
        /// Last tick the lease is valid for.
        expiry_tick: TickNumber,
    },
    /// A client request the host has not confirmed yet.
    Pending {
        /// Requesting peer.
        requester: PeerId,
        /// Tick the pending request lapses at.
        expiry_tick: TickNumber,
    },
}

impl LockState {
    /// The holder of a held lock.
    #[must_use]
    pub fn holder(&self) -> Option<&PeerId> {
        match self {
            LockState::Held { holder, .. } => Some(holder),
            _ => None,
        }
    }
}

/// One replicated entity.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    /// Stable identity.
    pub id: EntityId,
    /// Accepted-write counter, strictly monotonic from 1.
    pub version: u64,
    /// Tick of the most recently accepted write.
    pub last_tick: TickNumber,
    /// Current payload.
    pub payload: Payload,
    /// Authoritative-writer hint (the creator until ownership transfers).
    pub owner: PeerId,
    /// Origin of the most recently accepted write.
    pub last_writer: PeerId,
    /// Lock state.
    pub lock: LockState,
    /// Set on accepted writes; cleared after the outbound flush.
    pub dirty: bool,
}

/// Outcome of a write attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The record did not exist; created at version 1.
    Created {
        /// Version after the write.
        version: u64,
    },
    /// The write replaced the payload and bumped the version.
    Accepted {
        /// Version after the write.
        version: u64,
    },
    /// The entity is locked by another peer; nothing changed.
    LockedOut {
        /// Current holder, echoed to the origin.
        holder: PeerId,
    },
    /// The incoming tick is strictly older than the last accepted one;
    /// the caller routes the write to conflict resolution.
    Superseded,
}

/// Outcome of a lock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockDecision {
    /// Lease granted until `expiry_tick`.
    Granted {
        /// Last tick the lease is valid for.
        expiry_tick: TickNumber,
    },
    /// Denied; `holder` is the current holder when one exists.
    Denied {
        /// Current holder, if the lock is held.
        holder: Option<PeerId>,
    },
    /// Deferred until the host confirms.
    Pending {
        /// Tick the pending request lapses at.
        expiry_tick: TickNumber,
    },
}

/// Versioned map of entity id → replicated record plus lock metadata.
#[derive(Debug, Default)]
pub struct EntityStore {
    records: BTreeMap<EntityId, EntityRecord>,
    max_entities: usize,
}

impl EntityStore {
    /// Creates a store bounded at `max_entities`.
    #[must_use]
    pub fn new(max_entities: usize) -> Self {
        Self {
            records: BTreeMap::new(),
            max_entities,
        }
    }

    /// Looks up a record.
    #[must_use]
    pub fn read(&self, id: &EntityId) -> Option<&EntityRecord> {
        self.records.get(id)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates all records in id order.
    pub fn iter(&self) -> impl Iterator<Item = &EntityRecord> {
        self.records.values()
    }

    /// Writes `payload` for `id` as of `tick`.
    ///
    /// Creates at version 1 when absent; rejects when locked by a peer other
    /// than `origin`; returns [`WriteOutcome::Superseded`] when `tick` is
    /// strictly older than the last accepted tick so the caller can resolve
    /// the conflict; otherwise replaces the payload, bumps the version, and
    /// sets the dirty flag.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Overcapacity`] when creating past the entity
    /// limit.
    pub fn write(
        &mut self,
        id: &EntityId,
        payload: Payload,
        origin: &PeerId,
        tick: TickNumber,
    ) -> Result<WriteOutcome, CoreError> {
        if let Some(record) = self.records.get_mut(id) {
            if let LockState::Held { holder, .. } = &record.lock {
                if holder != origin {
                    return Ok(WriteOutcome::LockedOut {
                        holder: holder.clone(),
                    });
                }
            }
            if tick < record.last_tick {
                return Ok(WriteOutcome::Superseded);
            }
            record.version += 1;
            record.last_tick = tick;
            record.payload = payload;
            record.last_writer = origin.clone();
            record.dirty = true;
            return Ok(WriteOutcome::Accepted {
                version: record.version,
            });
        }

        if self.records.len() >= self.max_entities {
            return Err(CoreError::Overcapacity("max_entities"));
        }
        self.records.insert(
            id.clone(),
            EntityRecord {
                id: id.clone(),
                version: 1,
                last_tick: tick,
                payload,
                owner: origin.clone(),
                last_writer: origin.clone(),
                lock: LockState::Free,
                dirty: true,
            },
        );
        Ok(WriteOutcome::Created { version: 1 })
    }

    /// Commits a conflict-resolution winner: like [`write`](Self::write) but
    /// never routes back to resolution — a winner with an older tick than
    /// the incumbent still lands, and `last_tick` moves to the applied tick.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Overcapacity`] when creating past the entity
    /// limit.
    pub fn apply_resolved(
        &mut self,
        id: &EntityId,
        payload: Payload,
        origin: &PeerId,
        tick: TickNumber,
    ) -> Result<WriteOutcome, CoreError> {
        if let Some(record) = self.records.get_mut(id) {
            if let LockState::Held { holder, .. } = &record.lock {
                if holder != origin {
                    return Ok(WriteOutcome::LockedOut {
                        holder: holder.clone(),
                    });
                }
            }
            record.version += 1;
            record.last_tick = tick;
            record.payload = payload;
            record.last_writer = origin.clone();
            record.dirty = true;
            return Ok(WriteOutcome::Accepted {
                version: record.version,
            });
        }
        self.write(id, payload, origin, tick)
    }

    /// Overwrites a record's payload without bumping the version.
    ///
    /// Rollback restores flow through here: the version counter never
    /// regresses, only the payload and last-accepted tick do.
    pub fn restore_payload(&mut self, id: &EntityId, payload: Payload, tick: TickNumber) {
        if let Some(record) = self.records.get_mut(id) {
            record.payload = payload;
            record.last_tick = tick;
            record.dirty = true;
        }
    }

    /// Adopts a snapshot record wholesale (authoritative resync).
    ///
    /// The version is taken from the snapshot, never lowered below the
    /// local counter.
    pub fn adopt(
        &mut self,
        id: &EntityId,
        payload: Payload,
        version: u64,
        origin: &PeerId,
        tick: TickNumber,
    ) {
        if let Some(record) = self.records.get_mut(id) {
            record.version = record.version.max(version);
            record.last_tick = tick;
            record.payload = payload;
            record.last_writer = origin.clone();
            record.dirty = false;
            return;
        }
        self.records.insert(
            id.clone(),
            EntityRecord {
                id: id.clone(),
                version,
                last_tick: tick,
                payload,
                owner: origin.clone(),
                last_writer: origin.clone(),
                lock: LockState::Free,
                dirty: false,
            },
        );
    }

    /// Requests a lock on `id` for `peer`.
    ///
    /// `defer` marks the client-side advisory path: the record moves to
    /// [`LockState::Pending`] until the host confirms. The authoritative
    /// (host) path grants directly. Requesting an already-held lock by the
    /// same peer extends the lease.
    pub fn request_lock(
        &mut self,
        id: &EntityId,
        peer: &PeerId,
        ttl_ticks: u64,
        now_tick: TickNumber,
        defer: bool,
    ) -> LockDecision {
        let expiry_tick = now_tick + ttl_ticks;
        let Some(record) = self.records.get_mut(id) else {
            return LockDecision::Denied { holder: None };
        };
        match &record.lock {
            LockState::Held { holder, .. } if holder != peer => LockDecision::Denied {
                holder: Some(holder.clone()),
            },
            LockState::Pending { requester, .. } if requester != peer => {
                LockDecision::Denied { holder: None }
            }
            _ if defer => {
                record.lock = LockState::Pending {
                    requester: peer.clone(),
                    expiry_tick,
                };
                LockDecision::Pending { expiry_tick }
            }
            _ => {
                record.lock = LockState::Held {
                    holder: peer.clone(),
                    expiry_tick,
                };
                LockDecision::Granted { expiry_tick }
            }
        }
    }

    /// Confirms a host-granted lock on the advisory (client) side.
    pub fn confirm_lock(&mut self, id: &EntityId, holder: &PeerId, expiry_tick: TickNumber) {
        if let Some(record) = self.records.get_mut(id) {
            record.lock = LockState::Held {
                holder: holder.clone(),
                expiry_tick,
            };
        }
    }

    /// Releases `peer`'s lock (held or pending) on `id`. Returns whether a
    /// lock was released.
    pub fn release_lock(&mut self, id: &EntityId, peer: &PeerId) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        let owned = match &record.lock {
            LockState::Held { holder, .. } => holder == peer,
            LockState::Pending { requester, .. } => requester == peer,
            LockState::Free => false,
        };
        if owned {
            record.lock = LockState::Free;
        }
        owned
    }

    /// Frees every lock whose lease lapsed before `now_tick`, returning the
    /// released `(entity, holder)` pairs in id order.
    pub fn sweep_locks(&mut self, now_tick: TickNumber) -> Vec<(EntityId, PeerId)> {
        let mut released = Vec::new();
        for record in self.records.values_mut() {
            let expired = match &record.lock {
                LockState::Held {
                    holder,
                    expiry_tick,
                } if now_tick > *expiry_tick => Some(holder.clone()),
                LockState::Pending {
                    requester,
                    expiry_tick,
                } if now_tick > *expiry_tick => Some(requester.clone()),
                _ => None,
            };
            if let Some(holder) = expired {
                record.lock = LockState::Free;
                released.push((record.id.clone(), holder));
            }
        }
        released
    }

    /// Frees every lock held or requested by `peer` (disconnect cascade),
    /// returning the entities in id order.
    pub fn release_locks_held_by(&mut self, peer: &PeerId) -> Vec<EntityId> {
        let mut released = Vec::new();
        for record in self.records.values_mut() {
            let owned = match &record.lock {
                LockState::Held { holder, .. } => holder == peer,
                LockState::Pending { requester, .. } => requester == peer,
                LockState::Free => false,
            };
            if owned {
                record.lock = LockState::Free;
                released.push(record.id.clone());
            }
        }
        released
    }

    /// Lazily iterates dirty records in id order.
    pub fn iter_dirty(&self) -> impl Iterator<Item = &EntityRecord> {
        self.records.values().filter(|r| r.dirty)
    }

    /// Clears every dirty flag after the outbound flush.
    pub fn clear_dirty(&mut self) {
        for record in self.records.values_mut() {
            record.dirty = false;
        }
    }
}
