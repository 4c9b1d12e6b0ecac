// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! tether-core: authoritative tick-driven state replication.
//!
//! The controller owns a versioned entity store, a bounded rollback
//! history, a prioritized message pipeline with ack/retry and delta
//! baselines, a peer registry, and a prediction ledger, and advances them
//! together at a fixed tick rate. Conflicting writes resolve through five
//! deterministic policies (last-write-wins, host authority, field merge,
//! rollback with replay, quorum vote) that agree byte-for-byte on every
//! peer.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod clock;
mod config;
mod conflict;
mod controller;
mod error;
mod event;
mod history;
mod ident;
/// On-disk frame journal (optional persistence).
pub mod journal;
mod peer;
mod pipeline;
mod predict;
mod store;
mod transport;

/// Tick scheduling and time sources.
pub use clock::{SystemTimeSource, Tick, TickClock, TimeSource};
/// Configuration knobs and persistence.
pub use config::{ConfigError, ReplicationConfig};
/// Conflict policies, candidates, and resolution outcomes.
pub use conflict::{
    lww_order, lww_winner, quorum, resolve, ApplyPlan, Candidate, ConflictReport, Outcome,
    PolicyKind, ResolveCtx,
};
/// The per-tick orchestrator.
pub use controller::{AppMessage, ReplicationController};
/// Error kinds surfaced to callers.
pub use error::{CoreError, RejectReason};
/// Observable events and subscriber registration.
pub use event::{Event, EventBus, EventSink, LeaveReason, NullEventSink};
/// Bounded rollback history.
pub use history::{HistoryBuffer, HistoryFrame};
/// Identifier types.
pub use ident::{EntityId, MessageId, PeerId, TickNumber};
/// Peer roles and the liveness registry.
pub use peer::{Peer, PeerRegistry, Role};
/// Message pipeline: priorities, reordering, acks, baselines.
pub use pipeline::{
    upgrade_state_priority, AcceptOutcome, Baseline, Message, MessagePipeline,
};
/// Prediction records and reconciliation.
pub use predict::{payloads_agree, PredictionLedger, PredictionRecord, ReconciliationDiff};
/// Versioned entity records and cooperative locks.
pub use store::{EntityRecord, EntityStore, LockDecision, LockState, WriteOutcome};
/// Transport seam and in-process test doubles.
pub use transport::{
    BlackholeTransport, Dest, InboundQueue, LoopbackTransport, RecordingTransport, Transport,
};
