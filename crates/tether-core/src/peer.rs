// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Peer roles, permissions, and the liveness registry.
//!
//! Invariants:
//! - At most one peer holds [`Role::Host`] at any time.
//! - Role changes are atomic: demote and promote happen inside one registry
//!   call, within one tick.
//! - Removal cascades to lock release; the registry reports the removed ids
//!   and the controller releases their locks in the same sweep.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tether_proto::MsgKind;

use crate::error::{CoreError, RejectReason};
use crate::ident::PeerId;

/// A peer's role in the session. Role determines the default permission set
/// and, for the host, conflict authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Authoritative peer: grants locks, resolves conflicts, serves
    /// snapshots.
    Host,
    /// Ordinary participant: writes state, requests locks.
    Client,
    /// Observer: receives state, originates only liveness traffic.
    Spectator,
    /// Participant with event-broadcast rights.
    Admin,
}

impl Role {
    /// Canonical wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Client => "client",
            Role::Spectator => "spectator",
            Role::Admin => "admin",
        }
    }

    /// Parses a wire name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "host" => Role::Host,
            "client" => Role::Client,
            "spectator" => Role::Spectator,
            "admin" => Role::Admin,
            _ => return None,
        })
    }

    /// Whether this role may originate the given message kind.
    ///
    /// Spectators are read-only apart from liveness; snapshots, lock
    /// responses, conflicts, and rollback notices are host-only.
    #[must_use]
    pub fn may_originate(self, kind: MsgKind) -> bool {
        match kind {
            // Anyone attached may keep the session alive and leave it.
            MsgKind::Join
            | MsgKind::Leave
            | MsgKind::Heartbeat
            | MsgKind::Ping
            | MsgKind::Pong
            | MsgKind::Ack
            | MsgKind::StateRequest => true,
            // Host authority surface.
            MsgKind::Snapshot
            | MsgKind::LockResponse
            | MsgKind::Conflict
            | MsgKind::RollbackNotice => self == Role::Host,
            // Write surface.
            MsgKind::StateUpdate
            | MsgKind::Delta
            | MsgKind::LockRequest
            | MsgKind::LockRelease
            | MsgKind::Command => matches!(self, Role::Host | Role::Client | Role::Admin),
            // Broadcast events are host/admin only.
            MsgKind::Event => matches!(self, Role::Host | Role::Admin),
        }
    }
}

/// A connected peer.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Stable identity.
    pub id: PeerId,
    /// Current role.
    pub role: Role,
    /// Last instant any frame arrived from this peer, in nanoseconds.
    pub last_heard_nanos: u64,
    /// Measured round-trip latency, if a ping has completed.
    pub rtt_nanos: Option<u64>,
    /// Protocol version announced at join.
    pub protocol_version: u32,
    /// False once the peer is being torn down.
    pub connected: bool,
}

/// The set of connected peers. Mutated only under the controller's tick.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<PeerId, Peer>,
    successor: Option<PeerId>,
    max_peers: usize,
}

impl PeerRegistry {
    /// Creates a registry bounded at `max_peers`.
    #[must_use]
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: BTreeMap::new(),
            successor: None,
            max_peers,
        }
    }

    /// Attaches a peer.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Overcapacity`] at the peer limit and
    /// [`RejectReason::HostTaken`] when a second host tries to attach.
    pub fn attach(
        &mut self,
        id: PeerId,
        role: Role,
        protocol_version: u32,
        now_nanos: u64,
    ) -> Result<(), CoreError> {
        if !self.peers.contains_key(&id) && self.peers.len() >= self.max_peers {
            return Err(CoreError::Overcapacity("max_peers"));
        }
        if role == Role::Host {
            if let Some(host) = self.host() {
                if host.id != id {
                    return Err(RejectReason::HostTaken {
                        holder: host.id.clone(),
                    }
                    .into());
                }
            }
        }
        self.peers.insert(
            id.clone(),
            Peer {
                id,
                role,
                last_heard_nanos: now_nanos,
                rtt_nanos: None,
                protocol_version,
                connected: true,
            },
        );
        Ok(())
    }

    /// Detaches and returns a peer.
    pub fn detach(&mut self, id: &PeerId) -> Option<Peer> {
        if self.successor.as_ref() == Some(id) {
            self.successor = None;
        }
        self.peers.remove(id)
    }

    /// Looks up a peer.
    #[must_use]
    pub fn get(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    /// Whether the peer is attached.
    #[must_use]
    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    /// Number of attached peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when no peers are attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Iterates peers in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Records that a frame arrived from `id`.
    pub fn mark_heard(&mut self, id: &PeerId, now_nanos: u64) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.last_heard_nanos = peer.last_heard_nanos.max(now_nanos);
        }
    }

    /// Records a measured round-trip time.
    pub fn record_rtt(&mut self, id: &PeerId, rtt_nanos: u64) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.rtt_nanos = Some(rtt_nanos);
        }
    }

    /// The current host, if any.
    #[must_use]
    pub fn host(&self) -> Option<&Peer> {
        self.peers.values().find(|p| p.role == Role::Host)
    }

    /// Pre-registers the peer promoted if the host disappears.
    pub fn set_successor(&mut self, id: Option<PeerId>) {
        self.successor = id;
    }

    /// The pre-registered successor, if any.
    #[must_use]
    pub fn successor(&self) -> Option<&PeerId> {
        self.successor.as_ref()
    }

    /// Atomically transfers the host role to `id` (demote then promote).
    ///
    /// # Errors
    ///
    /// Returns [`RejectReason::UnknownPeer`] when `id` is not attached.
    pub fn promote(&mut self, id: &PeerId) -> Result<(), CoreError> {
        if !self.peers.contains_key(id) {
            return Err(RejectReason::UnknownPeer(id.clone()).into());
        }
        let old_host = self.host().map(|p| p.id.clone());
        if let Some(old) = old_host {
            if let Some(peer) = self.peers.get_mut(&old) {
                peer.role = Role::Client;
            }
        }
        if let Some(peer) = self.peers.get_mut(id) {
            peer.role = Role::Host;
        }
        Ok(())
    }

    /// Removes every peer unheard for longer than `timeout_nanos`, in id
    /// order. The caller cascades lock release for the returned ids.
    pub fn prune(&mut self, now_nanos: u64, timeout_nanos: u64) -> Vec<PeerId> {
        let stale: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| now_nanos.saturating_sub(p.last_heard_nanos) > timeout_nanos)
            .map(|p| p.id.clone())
            .collect();
        for id in &stale {
            self.detach(id);
        }
        stale
    }
}
