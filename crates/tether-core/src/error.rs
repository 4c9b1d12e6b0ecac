// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Error kinds surfaced to callers.
//!
//! Everything recoverable (retries, policy degradations, lock expiries,
//! reorder-window drops) is handled inside the tick and surfaced as events;
//! these errors are the contract failures a caller can act on.

use thiserror::Error;

use crate::ident::{EntityId, MessageId, PeerId, TickNumber};

/// Why a write or request was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    /// The entity is locked by another peer.
    #[error("entity {entity} locked by {holder}")]
    LockedOut {
        /// Entity carrying the lock.
        entity: EntityId,
        /// Current lock holder, so the caller can queue or abandon.
        holder: PeerId,
    },
    /// The originating role may not send this message kind.
    #[error("role may not originate {op}")]
    Permission {
        /// Offending operation name.
        op: &'static str,
    },
    /// The session already has a host.
    #[error("host role already held by {holder}")]
    HostTaken {
        /// The current host.
        holder: PeerId,
    },
    /// The peer is not attached to the session.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
}

/// Errors surfaced by the replication core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A permission or lock violation rejected the operation.
    #[error("rejected: {0}")]
    Rejected(#[from] RejectReason),
    /// A rollback target fell outside the retained history window.
    #[error("history expired for tick {tick} (oldest restorable {oldest})")]
    HistoryExpired {
        /// Requested restore tick.
        tick: TickNumber,
        /// Oldest tick still restorable.
        oldest: TickNumber,
    },
    /// An ack-pending message exhausted its retries.
    #[error("message {id} timed out after {retries} retries")]
    MessageTimeout {
        /// Id of the dropped message.
        id: MessageId,
        /// Retries performed before giving up.
        retries: u32,
    },
    /// A malformed or forbidden frame arrived from a peer.
    #[error("protocol violation from {peer}: {detail}")]
    ProtocolViolation {
        /// Offending origin.
        peer: PeerId,
        /// What was wrong with the frame.
        detail: String,
    },
    /// A vote fell below quorum.
    #[error("vote quorum not reached ({votes} of {required})")]
    QuorumFailed {
        /// Concurring votes for the leading candidate.
        votes: usize,
        /// Votes required.
        required: usize,
    },
    /// Peer or entity counts exceeded configured limits.
    #[error("capacity exceeded: {0}")]
    Overcapacity(&'static str),
    /// The host disappeared with no promotable successor. Fatal.
    #[error("host lost with no promotable successor")]
    HostLost,
}
