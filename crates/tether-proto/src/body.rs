// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Message kinds and typed bodies.
//!
//! Every body has a canonical field-map form; handlers dispatch on the
//! [`MsgKind`] tag and the typed [`Body`] variant, never on strings.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::delta::PayloadDelta;
use crate::merge::{merge_table_from_value, merge_table_to_value, MergeTable};
use crate::value::{decode_value, encode_value, CanonError, Payload, Value};

/// Wire tag for each message kind. Tag `0` is invalid; the high bit marks a
/// compressed frame body and never collides with a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgKind {
    /// Full payload write for one entity.
    StateUpdate = 1,
    /// Request for a full snapshot of one entity.
    StateRequest = 2,
    /// Full state of one or more entities (join, resync).
    Snapshot = 3,
    /// Field delta against an acked baseline.
    Delta = 4,
    /// Liveness beacon.
    Heartbeat = 5,
    /// A peer enters the session.
    Join = 6,
    /// A peer leaves the session.
    Leave = 7,
    /// Opaque command routed to the host.
    Command = 8,
    /// Opaque broadcast event.
    Event = 9,
    /// Client asks the host for an entity lock.
    LockRequest = 10,
    /// Host grants or denies a lock.
    LockResponse = 11,
    /// Holder releases an entity lock.
    LockRelease = 12,
    /// Acknowledges one message id. Never itself acked.
    Ack = 13,
    /// RTT probe.
    Ping = 14,
    /// RTT probe response.
    Pong = 15,
    /// Conflict outcome echoed to a rejected origin.
    Conflict = 16,
    /// Announces a rollback and the entities it touched.
    RollbackNotice = 17,
}

/// Drain priority, most urgent first. The derived order makes `Critical`
/// sort before `High` before `Normal` before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Join/leave, snapshots, lock responses, conflicts.
    Critical,
    /// Upgraded state traffic (locked entities, version jumps).
    High,
    /// Ordinary state traffic.
    Normal,
    /// Liveness and probes.
    Low,
}

impl Priority {
    /// All priorities in drain order.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Index of this priority in drain order (0 = most urgent).
    #[must_use]
    pub fn rank(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

impl MsgKind {
    /// Maps a wire tag (compression bit cleared) back to a kind.
    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => MsgKind::StateUpdate,
            2 => MsgKind::StateRequest,
            3 => MsgKind::Snapshot,
            4 => MsgKind::Delta,
            5 => MsgKind::Heartbeat,
            6 => MsgKind::Join,
            7 => MsgKind::Leave,
            8 => MsgKind::Command,
            9 => MsgKind::Event,
            10 => MsgKind::LockRequest,
            11 => MsgKind::LockResponse,
            12 => MsgKind::LockRelease,
            13 => MsgKind::Ack,
            14 => MsgKind::Ping,
            15 => MsgKind::Pong,
            16 => MsgKind::Conflict,
            17 => MsgKind::RollbackNotice,
            _ => return None,
        })
    }

    /// The wire tag for this kind.
    #[must_use]
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Canonical name for logs and reports.
    #[must_use]
    pub fn op_name(self) -> &'static str {
        match self {
            MsgKind::StateUpdate => "state_update",
            MsgKind::StateRequest => "state_request",
            MsgKind::Snapshot => "snapshot",
            MsgKind::Delta => "delta",
            MsgKind::Heartbeat => "heartbeat",
            MsgKind::Join => "join",
            MsgKind::Leave => "leave",
            MsgKind::Command => "command",
            MsgKind::Event => "event",
            MsgKind::LockRequest => "lock_request",
            MsgKind::LockResponse => "lock_response",
            MsgKind::LockRelease => "lock_release",
            MsgKind::Ack => "ack",
            MsgKind::Ping => "ping",
            MsgKind::Pong => "pong",
            MsgKind::Conflict => "conflict",
            MsgKind::RollbackNotice => "rollback_notice",
        }
    }

    /// Default drain priority before pipeline upgrades.
    ///
    /// Critical is reserved for join/leave, snapshots, lock responses, and
    /// conflicts; state traffic starts Normal and may be upgraded.
    #[must_use]
    pub fn default_priority(self) -> Priority {
        match self {
            MsgKind::Join
            | MsgKind::Leave
            | MsgKind::Snapshot
            | MsgKind::LockResponse
            | MsgKind::Conflict => Priority::Critical,
            MsgKind::LockRequest
            | MsgKind::LockRelease
            | MsgKind::StateRequest
            | MsgKind::RollbackNotice => Priority::High,
            MsgKind::StateUpdate | MsgKind::Delta | MsgKind::Command | MsgKind::Event => {
                Priority::Normal
            }
            MsgKind::Heartbeat | MsgKind::Ack | MsgKind::Ping | MsgKind::Pong => Priority::Low,
        }
    }

    /// Whether this kind is retransmitted until acked by default.
    ///
    /// Acks never require acks; liveness traffic is fire-and-forget.
    #[must_use]
    pub fn acked_by_default(self) -> bool {
        !matches!(
            self,
            MsgKind::Ack | MsgKind::Heartbeat | MsgKind::Ping | MsgKind::Pong | MsgKind::Event
        )
    }
}

/// Full state of one entity inside a snapshot body.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    /// Entity id.
    pub id: String,
    /// Version at the time of the snapshot.
    pub version: u64,
    /// Full payload.
    pub payload: Payload,
}

/// Failures turning bytes into a typed body.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BodyError {
    /// The canonical value layer rejected the bytes.
    #[error(transparent)]
    Canon(#[from] CanonError),
    /// A required field was absent.
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    /// A field decoded to the wrong value type.
    #[error("field `{0}` has the wrong type")]
    WrongType(&'static str),
    /// A numeric field fell outside its permitted range.
    #[error("field `{0}` is out of range")]
    OutOfRange(&'static str),
}

/// Typed message body, one variant per [`MsgKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Full payload write for one entity.
    StateUpdate {
        /// Entity id.
        entity: String,
        /// Writer's post-write version.
        version: u64,
        /// Full payload.
        payload: Payload,
    },
    /// Request for a full snapshot of one entity.
    StateRequest {
        /// Entity id.
        entity: String,
    },
    /// Full state of one or more entities, optionally carrying the host's
    /// merge table during the join handshake.
    Snapshot {
        /// Entity states.
        entities: Vec<EntityState>,
        /// Host merge table, present on join handshakes.
        merge_rules: Option<MergeTable>,
    },
    /// Field delta against an acked baseline.
    Delta {
        /// Entity id.
        entity: String,
        /// Writer's post-write version.
        version: u64,
        /// Version the delta was computed against.
        base_version: u64,
        /// Changed and removed fields.
        delta: PayloadDelta,
    },
    /// Liveness beacon.
    Heartbeat,
    /// A peer enters the session.
    Join {
        /// Requested role name (`host`, `client`, `spectator`, `admin`).
        role: String,
        /// Speaker's protocol version.
        protocol_version: u32,
    },
    /// A peer leaves the session.
    Leave {
        /// Optional human-readable reason.
        reason: Option<String>,
    },
    /// Opaque command routed to the host.
    Command {
        /// Command name.
        name: String,
        /// Command arguments.
        args: Payload,
    },
    /// Opaque broadcast event.
    Event {
        /// Event name.
        name: String,
        /// Event arguments.
        args: Payload,
    },
    /// Client asks the host for an entity lock.
    LockRequest {
        /// Entity id.
        entity: String,
        /// Requested lease length in ticks.
        ttl_ticks: u64,
    },
    /// Host grants or denies a lock.
    LockResponse {
        /// Entity id.
        entity: String,
        /// Whether the lock was granted.
        granted: bool,
        /// Current holder when denied, the grantee when granted.
        holder: Option<String>,
        /// Tick after which the lease lapses (0 when denied).
        expiry_tick: u64,
    },
    /// Holder releases an entity lock.
    LockRelease {
        /// Entity id.
        entity: String,
    },
    /// Acknowledges one message id.
    Ack {
        /// Origin of the acked message.
        origin: String,
        /// Sequence number of the acked message.
        seq: u32,
    },
    /// RTT probe.
    Ping {
        /// Echoed opaque nonce.
        nonce: u64,
    },
    /// RTT probe response.
    Pong {
        /// Nonce from the matching ping.
        nonce: u64,
    },
    /// Conflict outcome echoed to a rejected origin.
    Conflict {
        /// Entity id.
        entity: String,
        /// Winning origin id.
        winner: String,
        /// Resolved payload.
        payload: Payload,
        /// Tick the resolution applied at.
        applied_tick: u64,
        /// Policy name that produced the outcome.
        policy: String,
    },
    /// Announces a rollback and the entities it touched.
    RollbackNotice {
        /// Tick the store was restored to.
        tick: u64,
        /// Entities whose payloads were rewound.
        entities: Vec<String>,
    },
}

impl EntityState {
    fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("id".to_owned(), Value::Str(self.id.clone()));
        map.insert("payload".to_owned(), Value::Map(self.payload.clone()));
        map.insert("version".to_owned(), int_value(self.version));
        Value::Map(map)
    }

    fn from_value(value: Value) -> Result<Self, BodyError> {
        let Value::Map(map) = value else {
            return Err(BodyError::WrongType("entities"));
        };
        let mut fields = Fields(map);
        Ok(Self {
            id: fields.take_str("id")?,
            version: fields.take_u64("version")?,
            payload: fields.take_payload("payload")?,
        })
    }
}

impl Body {
    /// The message kind this body belongs to.
    #[must_use]
    pub fn kind(&self) -> MsgKind {
        match self {
            Body::StateUpdate { .. } => MsgKind::StateUpdate,
            Body::StateRequest { .. } => MsgKind::StateRequest,
            Body::Snapshot { .. } => MsgKind::Snapshot,
            Body::Delta { .. } => MsgKind::Delta,
            Body::Heartbeat => MsgKind::Heartbeat,
            Body::Join { .. } => MsgKind::Join,
            Body::Leave { .. } => MsgKind::Leave,
            Body::Command { .. } => MsgKind::Command,
            Body::Event { .. } => MsgKind::Event,
            Body::LockRequest { .. } => MsgKind::LockRequest,
            Body::LockResponse { .. } => MsgKind::LockResponse,
            Body::LockRelease { .. } => MsgKind::LockRelease,
            Body::Ack { .. } => MsgKind::Ack,
            Body::Ping { .. } => MsgKind::Ping,
            Body::Pong { .. } => MsgKind::Pong,
            Body::Conflict { .. } => MsgKind::Conflict,
            Body::RollbackNotice { .. } => MsgKind::RollbackNotice,
        }
    }

    /// Encodes the body to its canonical byte form.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut map = BTreeMap::new();
        match self {
            Body::StateUpdate {
                entity,
                version,
                payload,
            } => {
                map.insert("entity".to_owned(), Value::Str(entity.clone()));
                map.insert("payload".to_owned(), Value::Map(payload.clone()));
                map.insert("version".to_owned(), int_value(*version));
            }
            Body::StateRequest { entity } | Body::LockRelease { entity } => {
                map.insert("entity".to_owned(), Value::Str(entity.clone()));
            }
            Body::Snapshot {
                entities,
                merge_rules,
            } => {
                map.insert(
                    "entities".to_owned(),
                    Value::List(entities.iter().map(EntityState::to_value).collect()),
                );
                if let Some(table) = merge_rules {
                    map.insert("merge_rules".to_owned(), merge_table_to_value(table));
                }
            }
            Body::Delta {
                entity,
                version,
                base_version,
                delta,
            } => {
                map.insert("base_version".to_owned(), int_value(*base_version));
                map.insert("changed".to_owned(), Value::Map(delta.changed.clone()));
                map.insert("entity".to_owned(), Value::Str(entity.clone()));
                map.insert(
                    "removed".to_owned(),
                    Value::List(delta.removed.iter().map(|n| Value::Str(n.clone())).collect()),
                );
                map.insert("version".to_owned(), int_value(*version));
            }
            Body::Heartbeat => {}
            Body::Join {
                role,
                protocol_version,
            } => {
                map.insert(
                    "protocol_version".to_owned(),
                    int_value(u64::from(*protocol_version)),
                );
                map.insert("role".to_owned(), Value::Str(role.clone()));
            }
            Body::Leave { reason } => {
                if let Some(reason) = reason {
                    map.insert("reason".to_owned(), Value::Str(reason.clone()));
                }
            }
            Body::Command { name, args } | Body::Event { name, args } => {
                map.insert("args".to_owned(), Value::Map(args.clone()));
                map.insert("name".to_owned(), Value::Str(name.clone()));
            }
            Body::LockRequest { entity, ttl_ticks } => {
                map.insert("entity".to_owned(), Value::Str(entity.clone()));
                map.insert("ttl".to_owned(), int_value(*ttl_ticks));
            }
            Body::LockResponse {
                entity,
                granted,
                holder,
                expiry_tick,
            } => {
                map.insert("entity".to_owned(), Value::Str(entity.clone()));
                map.insert("expiry".to_owned(), int_value(*expiry_tick));
                map.insert("granted".to_owned(), Value::Bool(*granted));
                if let Some(holder) = holder {
                    map.insert("holder".to_owned(), Value::Str(holder.clone()));
                }
            }
            Body::Ack { origin, seq } => {
                map.insert("origin".to_owned(), Value::Str(origin.clone()));
                map.insert("seq".to_owned(), int_value(u64::from(*seq)));
            }
            Body::Ping { nonce } | Body::Pong { nonce } => {
                map.insert("nonce".to_owned(), int_value(*nonce));
            }
            Body::Conflict {
                entity,
                winner,
                payload,
                applied_tick,
                policy,
            } => {
                map.insert("entity".to_owned(), Value::Str(entity.clone()));
                map.insert("payload".to_owned(), Value::Map(payload.clone()));
                map.insert("policy".to_owned(), Value::Str(policy.clone()));
                map.insert("tick".to_owned(), int_value(*applied_tick));
                map.insert("winner".to_owned(), Value::Str(winner.clone()));
            }
            Body::RollbackNotice { tick, entities } => {
                map.insert(
                    "entities".to_owned(),
                    Value::List(entities.iter().map(|e| Value::Str(e.clone())).collect()),
                );
                map.insert("tick".to_owned(), int_value(*tick));
            }
        }
        Bytes::from(encode_value(&Value::Map(map)))
    }

    /// Decodes a body of the given kind from canonical bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`BodyError`] when the bytes are not canonical or the field
    /// map does not match the kind's schema.
    pub fn decode(kind: MsgKind, bytes: &[u8]) -> Result<Self, BodyError> {
        let Value::Map(map) = decode_value(bytes)? else {
            return Err(BodyError::Canon(CanonError::Decode(
                "body must be a top-level map",
            )));
        };
        let mut fields = Fields(map);
        let body = match kind {
            MsgKind::StateUpdate => Body::StateUpdate {
                entity: fields.take_str("entity")?,
                version: fields.take_u64("version")?,
                payload: fields.take_payload("payload")?,
            },
            MsgKind::StateRequest => Body::StateRequest {
                entity: fields.take_str("entity")?,
            },
            MsgKind::Snapshot => {
                let entities = fields
                    .take_list("entities")?
                    .into_iter()
                    .map(EntityState::from_value)
                    .collect::<Result<Vec<_>, _>>()?;
                let merge_rules = match fields.take_opt("merge_rules") {
                    Some(value) => Some(
                        merge_table_from_value(&value).map_err(BodyError::Canon)?,
                    ),
                    None => None,
                };
                Body::Snapshot {
                    entities,
                    merge_rules,
                }
            }
            MsgKind::Delta => {
                let removed = fields
                    .take_list("removed")?
                    .into_iter()
                    .map(|v| match v {
                        Value::Str(s) => Ok(s),
                        _ => Err(BodyError::WrongType("removed")),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Body::Delta {
                    entity: fields.take_str("entity")?,
                    version: fields.take_u64("version")?,
                    base_version: fields.take_u64("base_version")?,
                    delta: PayloadDelta {
                        changed: fields.take_payload("changed")?,
                        removed,
                    },
                }
            }
            MsgKind::Heartbeat => Body::Heartbeat,
            MsgKind::Join => Body::Join {
                role: fields.take_str("role")?,
                protocol_version: fields.take_u32("protocol_version")?,
            },
            MsgKind::Leave => Body::Leave {
                reason: fields.take_opt_str("reason")?,
            },
            MsgKind::Command => Body::Command {
                name: fields.take_str("name")?,
                args: fields.take_payload("args")?,
            },
            MsgKind::Event => Body::Event {
                name: fields.take_str("name")?,
                args: fields.take_payload("args")?,
            },
            MsgKind::LockRequest => Body::LockRequest {
                entity: fields.take_str("entity")?,
                ttl_ticks: fields.take_u64("ttl")?,
            },
            MsgKind::LockResponse => Body::LockResponse {
                entity: fields.take_str("entity")?,
                granted: fields.take_bool("granted")?,
                holder: fields.take_opt_str("holder")?,
                expiry_tick: fields.take_u64("expiry")?,
            },
            MsgKind::LockRelease => Body::LockRelease {
                entity: fields.take_str("entity")?,
            },
            MsgKind::Ack => Body::Ack {
                origin: fields.take_str("origin")?,
                seq: fields.take_u32("seq")?,
            },
            MsgKind::Ping => Body::Ping {
                nonce: fields.take_u64("nonce")?,
            },
            MsgKind::Pong => Body::Pong {
                nonce: fields.take_u64("nonce")?,
            },
            MsgKind::Conflict => Body::Conflict {
                entity: fields.take_str("entity")?,
                winner: fields.take_str("winner")?,
                payload: fields.take_payload("payload")?,
                applied_tick: fields.take_u64("tick")?,
                policy: fields.take_str("policy")?,
            },
            MsgKind::RollbackNotice => {
                let entities = fields
                    .take_list("entities")?
                    .into_iter()
                    .map(|v| match v {
                        Value::Str(s) => Ok(s),
                        _ => Err(BodyError::WrongType("entities")),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Body::RollbackNotice {
                    tick: fields.take_u64("tick")?,
                    entities,
                }
            }
        };
        Ok(body)
    }
}

#[inline]
fn int_value(v: u64) -> Value {
    Value::Int(i64::try_from(v).unwrap_or(i64::MAX))
}

/// Field-map access with typed extraction.
struct Fields(BTreeMap<String, Value>);

impl Fields {
    fn take(&mut self, key: &'static str) -> Result<Value, BodyError> {
        self.0.remove(key).ok_or(BodyError::MissingField(key))
    }

    fn take_opt(&mut self, key: &'static str) -> Option<Value> {
        match self.0.remove(key) {
            None | Some(Value::Null) => None,
            Some(v) => Some(v),
        }
    }

    fn take_str(&mut self, key: &'static str) -> Result<String, BodyError> {
        match self.take(key)? {
            Value::Str(s) => Ok(s),
            _ => Err(BodyError::WrongType(key)),
        }
    }

    fn take_opt_str(&mut self, key: &'static str) -> Result<Option<String>, BodyError> {
        match self.take_opt(key) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s)),
            Some(_) => Err(BodyError::WrongType(key)),
        }
    }

    fn take_bool(&mut self, key: &'static str) -> Result<bool, BodyError> {
        match self.take(key)? {
            Value::Bool(b) => Ok(b),
            _ => Err(BodyError::WrongType(key)),
        }
    }

    fn take_u64(&mut self, key: &'static str) -> Result<u64, BodyError> {
        match self.take(key)? {
            Value::Int(n) => u64::try_from(n).map_err(|_| BodyError::OutOfRange(key)),
            _ => Err(BodyError::WrongType(key)),
        }
    }

    fn take_u32(&mut self, key: &'static str) -> Result<u32, BodyError> {
        let n = self.take_u64(key)?;
        u32::try_from(n).map_err(|_| BodyError::OutOfRange(key))
    }

    fn take_payload(&mut self, key: &'static str) -> Result<Payload, BodyError> {
        match self.take(key)? {
            Value::Map(m) => Ok(m),
            _ => Err(BodyError::WrongType(key)),
        }
    }

    fn take_list(&mut self, key: &'static str) -> Result<Vec<Value>, BodyError> {
        match self.take(key)? {
            Value::List(items) => Ok(items),
            _ => Err(BodyError::WrongType(key)),
        }
    }
}
