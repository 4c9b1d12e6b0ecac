// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Priority message pipeline: sequencing, reordering, acks, retries, and
//! delta baselines.
//!
//! Ordering invariants:
//! - Outbound drains Critical > High > Normal > Low, FIFO within a band.
//! - Inbound frames from one origin deliver in sequence order within the
//!   reorder window; frames older than the window are discarded.
//! - Retransmits reuse the originally encoded bytes, so a retried message
//!   is byte-identical to the first send.
//! - Acks never require acks. A broadcast entry completes on its first ack.

use std::collections::{BTreeMap, VecDeque};

use rustc_hash::FxHashMap;
use tracing::warn;

use tether_proto::{Body, Frame, MsgKind, Payload, Priority};

use crate::config::ReplicationConfig;
use crate::error::CoreError;
use crate::ident::{EntityId, MessageId, PeerId, TickNumber};
use crate::transport::Dest;

/// A message flowing through the pipeline, wire frame plus routing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Identity: origin plus origin-local sequence.
    pub id: MessageId,
    /// Message kind.
    pub kind: MsgKind,
    /// Originating peer.
    pub origin: PeerId,
    /// Delivery target (outbound only; inbound messages address us).
    pub dest: Dest,
    /// Typed body.
    pub body: Body,
    /// Drain priority.
    pub priority: Priority,
    /// Tick the message was produced at.
    pub tick: TickNumber,
    /// Whether the sender retransmits until acked.
    pub requires_ack: bool,
}

/// What happened to an accepted frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Delivered into the priority queues; the count includes buffered
    /// successors the frame released.
    Delivered(usize),
    /// A duplicate of an already-delivered sequence (usually a retransmit
    /// whose ack was lost). The caller re-acks kinds that expect one.
    Duplicate {
        /// Message kind of the duplicate.
        kind: MsgKind,
        /// Originating peer.
        origin: PeerId,
        /// Duplicated sequence number.
        seq: u32,
    },
    /// Older than the reorder window; dropped.
    Stale,
    /// Ahead of a gap; buffered until earlier sequences arrive.
    Buffered,
}

/// The payload version a receiver is known to possess, used as the delta
/// reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Baseline {
    /// Confirmed version.
    pub version: u64,
    /// Payload at that version.
    pub payload: Payload,
}

#[derive(Debug)]
struct AckEntry {
    message: Message,
    encoded: Vec<u8>,
    first_sent: TickNumber,
    deadline: TickNumber,
    retries: u32,
}

#[derive(Debug, Default)]
struct OriginState {
    started: bool,
    next_expected: u32,
    highest: u32,
    buffered: BTreeMap<u32, Message>,
}

/// Priority queue plus ack/retry table and baseline book.
#[derive(Debug)]
pub struct MessagePipeline {
    reorder_window: u32,
    retry_ticks: u64,
    max_retries: u32,
    compression_threshold: usize,
    next_seq: u32,
    inbound: [VecDeque<Message>; 4],
    outbound: [VecDeque<(Message, Vec<u8>)>; 4],
    reorder: FxHashMap<PeerId, OriginState>,
    ack_table: BTreeMap<MessageId, AckEntry>,
    /// (receiver, entity) → what that receiver has acked from us.
    sender_baselines: FxHashMap<(PeerId, EntityId), Baseline>,
    /// (sender, entity) → what we last accepted from that sender.
    receiver_baselines: FxHashMap<(PeerId, EntityId), Baseline>,
}

impl MessagePipeline {
    /// Builds a pipeline from the configured windows and retry knobs.
    #[must_use]
    pub fn new(cfg: &ReplicationConfig) -> Self {
        Self {
            reorder_window: cfg.reorder_window,
            retry_ticks: cfg.retry_ticks,
            max_retries: cfg.max_retries,
            compression_threshold: cfg.compression_threshold_bytes,
            next_seq: 0,
            inbound: std::array::from_fn(|_| VecDeque::new()),
            outbound: std::array::from_fn(|_| VecDeque::new()),
            reorder: FxHashMap::default(),
            ack_table: BTreeMap::new(),
            sender_baselines: FxHashMap::default(),
            receiver_baselines: FxHashMap::default(),
        }
    }

    /// Allocates the next local sequence number.
    pub fn next_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    /// Pending ack-table entries (messages awaiting acks).
    #[must_use]
    pub fn pending_acks(&self) -> usize {
        self.ack_table.len()
    }

    // ── Outbound ───────────────────────────────────────────────────────

    /// Encodes `msg` once and queues it in its priority band. The encoded
    /// bytes are what every retransmit will reuse.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ProtocolViolation`] only for frames we fail to
    /// encode ourselves (oversized body or origin), attributed to the local
    /// origin.
    pub fn enqueue_outbound(&mut self, msg: Message) -> Result<(), CoreError> {
        let frame = Frame {
            kind: msg.kind,
            seq: msg.id.seq,
            tick: msg.tick,
            origin: msg.origin.as_str().to_owned(),
            body: msg.body.encode(),
        };
        let encoded = frame
            .encode(Some(self.compression_threshold))
            .map_err(|e| CoreError::ProtocolViolation {
                peer: msg.origin.clone(),
                detail: e.to_string(),
            })?;
        self.outbound[msg.priority.rank()].push_back((msg, encoded));
        Ok(())
    }

    /// Drains the outbound bands in priority order. Ack-requiring messages
    /// enter the ack table with a retransmit deadline of
    /// `now_tick + retry_ticks`.
    pub fn drain_outbound(&mut self, now_tick: TickNumber) -> Vec<(Dest, Vec<u8>)> {
        let mut out = Vec::new();
        for band in &mut self.outbound {
            while let Some((msg, encoded)) = band.pop_front() {
                out.push((msg.dest.clone(), encoded.clone()));
                if msg.requires_ack {
                    let id = msg.id.clone();
                    self.ack_table.insert(
                        id,
                        AckEntry {
                            message: msg,
                            encoded,
                            first_sent: now_tick,
                            deadline: now_tick + self.retry_ticks,
                            retries: 0,
                        },
                    );
                }
            }
        }
        out
    }

    /// Completes an ack for `id`, returning the original message so the
    /// caller can advance baselines. Unknown ids (already timed out or
    /// duplicate acks) return `None`.
    pub fn on_ack(&mut self, id: &MessageId) -> Option<Message> {
        self.ack_table.remove(id).map(|entry| entry.message)
    }

    /// Retransmits every ack-pending message whose deadline has passed,
    /// byte-identically. An entry that reaches the retry limit is dropped
    /// and reported as timed out `(id, retries)`.
    pub fn sweep_retries(
        &mut self,
        now_tick: TickNumber,
    ) -> (Vec<(Dest, Vec<u8>)>, Vec<(MessageId, u32)>) {
        let mut resends = Vec::new();
        let mut timeouts = Vec::new();
        let mut exhausted = Vec::new();
        for (id, entry) in &mut self.ack_table {
            if now_tick < entry.deadline {
                continue;
            }
            resends.push((entry.message.dest.clone(), entry.encoded.clone()));
            entry.retries += 1;
            entry.deadline = now_tick + self.retry_ticks;
            if entry.retries >= self.max_retries {
                exhausted.push(id.clone());
            }
        }
        for id in exhausted {
            if let Some(entry) = self.ack_table.remove(&id) {
                warn!(%id, retries = entry.retries, "ack retries exhausted; dropping");
                timeouts.push((id, entry.retries));
            }
        }
        (resends, timeouts)
    }

    // ── Inbound ────────────────────────────────────────────────────────

    /// Validates and sequences one received frame.
    ///
    /// The frame's origin must match the transport-reported peer; the kind
    /// must be known; the body must decode. In-window out-of-order frames
    /// buffer until the gap fills; duplicates report back so lost acks can
    /// be re-sent.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ProtocolViolation`] for malformed or spoofed
    /// frames.
    pub fn accept_raw(
        &mut self,
        transport_peer: &PeerId,
        raw: &[u8],
    ) -> Result<AcceptOutcome, CoreError> {
        let (frame, _used) = Frame::decode(raw).map_err(|e| CoreError::ProtocolViolation {
            peer: transport_peer.clone(),
            detail: e.to_string(),
        })?;
        let origin = PeerId::new(frame.origin.clone());
        if &origin != transport_peer {
            return Err(CoreError::ProtocolViolation {
                peer: transport_peer.clone(),
                detail: format!("frame origin {origin} does not match transport peer"),
            });
        }
        let body =
            Body::decode(frame.kind, &frame.body).map_err(|e| CoreError::ProtocolViolation {
                peer: transport_peer.clone(),
                detail: e.to_string(),
            })?;
        let msg = Message {
            id: MessageId {
                origin: origin.clone(),
                seq: frame.seq,
            },
            kind: frame.kind,
            origin: origin.clone(),
            dest: Dest::Broadcast,
            body,
            priority: frame.kind.default_priority(),
            tick: frame.tick,
            requires_ack: frame.kind.acked_by_default(),
        };
        Ok(self.sequence_inbound(msg))
    }

    fn sequence_inbound(&mut self, msg: Message) -> AcceptOutcome {
        let window = self.reorder_window;
        let state = self.reorder.entry(msg.origin.clone()).or_default();
        if !state.started {
            state.started = true;
            state.next_expected = msg.id.seq;
            state.highest = msg.id.seq;
        }
        let seq = msg.id.seq;
        state.highest = state.highest.max(seq);

        if seq < state.next_expected {
            // Already delivered (or skipped): retransmit whose ack was lost,
            // or a frame that fell out of the window.
            if state.next_expected - seq > window {
                warn!(origin = %msg.origin, seq, "frame older than reorder window; dropping");
                return AcceptOutcome::Stale;
            }
            return AcceptOutcome::Duplicate {
                kind: msg.kind,
                origin: msg.origin,
                seq,
            };
        }
        if state.buffered.contains_key(&seq) {
            return AcceptOutcome::Duplicate {
                kind: msg.kind,
                origin: msg.origin,
                seq,
            };
        }
        state.buffered.insert(seq, msg);

        // Give up on gaps that fell out of the window.
        while state.highest.saturating_sub(state.next_expected) > window
            && !state.buffered.contains_key(&state.next_expected)
        {
            warn!(next = state.next_expected, "sequence gap exceeded reorder window; skipping");
            state.next_expected += 1;
        }

        let mut delivered = 0usize;
        while let Some(ready) = state.buffered.remove(&state.next_expected) {
            state.next_expected += 1;
            delivered += 1;
            self.inbound[ready.priority.rank()].push_back(ready);
        }
        if delivered == 0 {
            AcceptOutcome::Buffered
        } else {
            AcceptOutcome::Delivered(delivered)
        }
    }

    /// Pops the highest-priority inbound message.
    pub fn pop_inbound(&mut self) -> Option<Message> {
        self.inbound.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Inbound messages currently queued.
    #[must_use]
    pub fn inbound_len(&self) -> usize {
        self.inbound.iter().map(VecDeque::len).sum()
    }

    // ── Baselines ──────────────────────────────────────────────────────

    /// The payload `receiver` last acked for `entity`, if any.
    #[must_use]
    pub fn sender_baseline(&self, receiver: &PeerId, entity: &EntityId) -> Option<&Baseline> {
        self.sender_baselines.get(&(receiver.clone(), entity.clone()))
    }

    /// Advances the sender-side baseline after an ack confirms receipt.
    pub fn advance_sender_baseline(
        &mut self,
        receiver: &PeerId,
        entity: &EntityId,
        version: u64,
        payload: Payload,
    ) {
        let key = (receiver.clone(), entity.clone());
        let stale = self
            .sender_baselines
            .get(&key)
            .is_some_and(|b| b.version >= version);
        if !stale {
            self.sender_baselines.insert(key, Baseline { version, payload });
        }
    }

    /// The payload we last accepted from `sender` for `entity`, if any.
    #[must_use]
    pub fn receiver_baseline(&self, sender: &PeerId, entity: &EntityId) -> Option<&Baseline> {
        self.receiver_baselines
            .get(&(sender.clone(), entity.clone()))
    }

    /// Records the payload just accepted from `sender` so later deltas can
    /// apply against it.
    pub fn set_receiver_baseline(
        &mut self,
        sender: &PeerId,
        entity: &EntityId,
        version: u64,
        payload: Payload,
    ) {
        self.receiver_baselines
            .insert((sender.clone(), entity.clone()), Baseline { version, payload });
    }

    /// Drops per-peer state (reorder, baselines, pending acks) on detach.
    pub fn forget_peer(&mut self, peer: &PeerId) {
        self.reorder.remove(peer);
        self.sender_baselines.retain(|(p, _), _| p != peer);
        self.receiver_baselines.retain(|(p, _), _| p != peer);
        self.ack_table
            .retain(|_, entry| entry.message.dest != Dest::Peer(peer.clone()));
    }

    /// Clears every entity baseline (version counter re-baselining).
    pub fn clear_entity_baselines(&mut self, entity: &EntityId) {
        self.sender_baselines.retain(|(_, e), _| e != entity);
        self.receiver_baselines.retain(|(_, e), _| e != entity);
    }
}

/// Upgrades state-update priority per the pipeline rules: updates to locked
/// entities, or whose version jumps more than one past the acked baseline,
/// go out High.
#[must_use]
pub fn upgrade_state_priority(
    base: Priority,
    entity_locked: bool,
    version_jump: u64,
) -> Priority {
    if base == Priority::Normal && (entity_locked || version_jump > 1) {
        Priority::High
    } else {
        base
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tether_proto::Value;

    fn cfg() -> ReplicationConfig {
        ReplicationConfig::default()
    }

    fn heartbeat(origin: &str, seq: u32, tick: TickNumber) -> Message {
        Message {
            id: MessageId {
                origin: PeerId::from(origin),
                seq,
            },
            kind: MsgKind::Heartbeat,
            origin: PeerId::from(origin),
            dest: Dest::Broadcast,
            body: Body::Heartbeat,
            priority: MsgKind::Heartbeat.default_priority(),
            tick,
            requires_ack: false,
        }
    }

    fn join(origin: &str, seq: u32, tick: TickNumber) -> Message {
        Message {
            id: MessageId {
                origin: PeerId::from(origin),
                seq,
            },
            kind: MsgKind::Join,
            origin: PeerId::from(origin),
            dest: Dest::Broadcast,
            body: Body::Join {
                role: "client".to_owned(),
                protocol_version: 1,
            },
            priority: MsgKind::Join.default_priority(),
            tick,
            requires_ack: true,
        }
    }

    fn encode(msg: &Message) -> Vec<u8> {
        Frame {
            kind: msg.kind,
            seq: msg.id.seq,
            tick: msg.tick,
            origin: msg.origin.as_str().to_owned(),
            body: msg.body.encode(),
        }
        .encode(None)
        .expect("encode")
    }

    #[test]
    fn outbound_drains_critical_before_low() {
        let mut p = MessagePipeline::new(&cfg());
        p.enqueue_outbound(heartbeat("host", 0, 1)).unwrap();
        p.enqueue_outbound(join("host", 1, 1)).unwrap();
        let sent = p.drain_outbound(1);
        assert_eq!(sent.len(), 2);
        // Join (critical) leaves first despite later enqueue.
        let (joined, _) = Frame::decode(&sent[0].1).expect("decode");
        assert_eq!(joined.kind, MsgKind::Join);
    }

    #[test]
    fn retry_timeline_matches_the_retry_knobs() {
        let mut p = MessagePipeline::new(&cfg());
        p.enqueue_outbound(join("client", 0, 0)).unwrap();
        let first = p.drain_outbound(0);
        assert_eq!(first.len(), 1);
        let original = first[0].1.clone();

        let mut timeline = Vec::new();
        for tick in 1..=60 {
            let (resends, timeouts) = p.sweep_retries(tick);
            for (_, bytes) in &resends {
                assert_eq!(bytes, &original, "retries are byte-identical");
                timeline.push((tick, "resend"));
            }
            for _ in &timeouts {
                timeline.push((tick, "timeout"));
            }
        }
        assert_eq!(
            timeline,
            vec![
                (15, "resend"),
                (30, "resend"),
                (45, "resend"),
                (45, "timeout"),
            ]
        );
        assert_eq!(p.pending_acks(), 0, "no further retransmits after timeout");
    }

    #[test]
    fn ack_before_deadline_stops_retries() {
        let mut p = MessagePipeline::new(&cfg());
        let msg = join("client", 0, 0);
        let id = msg.id.clone();
        p.enqueue_outbound(msg).unwrap();
        p.drain_outbound(0);
        let acked = p.on_ack(&id);
        assert!(acked.is_some());
        let (resends, timeouts) = p.sweep_retries(15);
        assert!(resends.is_empty());
        assert!(timeouts.is_empty());
    }

    #[test]
    fn inbound_reorders_within_the_window() {
        let mut p = MessagePipeline::new(&cfg());
        let peer = PeerId::from("client");
        // Frames 0 and 2 arrive, then 1 fills the gap.
        let m0 = heartbeat("client", 0, 1);
        let m1 = heartbeat("client", 1, 2);
        let m2 = heartbeat("client", 2, 3);
        assert_eq!(
            p.accept_raw(&peer, &encode(&m0)).unwrap(),
            AcceptOutcome::Delivered(1)
        );
        assert_eq!(
            p.accept_raw(&peer, &encode(&m2)).unwrap(),
            AcceptOutcome::Buffered
        );
        assert_eq!(
            p.accept_raw(&peer, &encode(&m1)).unwrap(),
            AcceptOutcome::Delivered(2)
        );
        let seqs: Vec<u32> = std::iter::from_fn(|| p.pop_inbound()).map(|m| m.id.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn duplicates_are_reported_for_reacking() {
        let mut p = MessagePipeline::new(&cfg());
        let peer = PeerId::from("client");
        let m0 = join("client", 0, 1);
        p.accept_raw(&peer, &encode(&m0)).unwrap();
        let outcome = p.accept_raw(&peer, &encode(&m0)).unwrap();
        assert_eq!(
            outcome,
            AcceptOutcome::Duplicate {
                kind: MsgKind::Join,
                origin: peer,
                seq: 0,
            }
        );
        assert_eq!(p.inbound_len(), 1, "the duplicate is not re-delivered");
    }

    #[test]
    fn spoofed_origin_is_a_protocol_violation() {
        let mut p = MessagePipeline::new(&cfg());
        let spoofer = PeerId::from("mallory");
        let m = heartbeat("host", 0, 1);
        let err = p.accept_raw(&spoofer, &encode(&m)).unwrap_err();
        assert!(matches!(err, CoreError::ProtocolViolation { peer, .. } if peer == spoofer));
    }

    #[test]
    fn baselines_advance_monotonically() {
        let mut p = MessagePipeline::new(&cfg());
        let receiver = PeerId::from("client");
        let entity = EntityId::from("e1");
        let pay = |hp: i64| -> Payload {
            [("hp".to_owned(), Value::Int(hp))].into_iter().collect()
        };
        p.advance_sender_baseline(&receiver, &entity, 3, pay(30));
        // A late ack for an older version must not regress the baseline.
        p.advance_sender_baseline(&receiver, &entity, 2, pay(20));
        assert_eq!(
            p.sender_baseline(&receiver, &entity).map(|b| b.version),
            Some(3)
        );
    }

    #[test]
    fn priority_upgrades_for_locked_and_jumping_state() {
        assert_eq!(
            upgrade_state_priority(Priority::Normal, true, 1),
            Priority::High
        );
        assert_eq!(
            upgrade_state_priority(Priority::Normal, false, 3),
            Priority::High
        );
        assert_eq!(
            upgrade_state_priority(Priority::Normal, false, 1),
            Priority::Normal
        );
        assert_eq!(
            upgrade_state_priority(Priority::Critical, true, 9),
            Priority::Critical
        );
    }
}
