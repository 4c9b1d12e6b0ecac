// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The per-tick orchestrator.
//!
//! The controller is the single owner of the registry, store, history,
//! pipeline, and prediction ledger; each tick borrows them exclusively in a
//! fixed order:
//!
//! 1. drain inbound, 2. detect conflicts, 3. apply accepted mutations,
//! 4. reconcile predictions, 5. snapshot end-of-tick state, 6. flush dirty
//! entities as per-peer deltas, 7. maintenance (retries, lock TTLs, peer
//! timeouts, history eviction, RTT pings).
//!
//! Suspension points exist only at the queue boundaries: transport threads
//! deposit into the inbound queue and everything else happens inside the
//! tick.

use std::collections::{BTreeMap, VecDeque};

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use tether_proto::{Body, EntityState, MergeTable, MsgKind, Payload, PayloadDelta, Priority};

use crate::clock::{Tick, TickClock};
use crate::config::{ConfigError, ReplicationConfig};
use crate::conflict::{
    resolve, ApplyPlan, Candidate, ConflictReport, PolicyKind, ResolveCtx,
};
use crate::error::CoreError;
use crate::event::{Event, EventBus, EventSink, LeaveReason};
use crate::history::HistoryBuffer;
use crate::ident::{EntityId, MessageId, PeerId, TickNumber};
use crate::peer::{PeerRegistry, Role};
use crate::pipeline::{upgrade_state_priority, AcceptOutcome, Message, MessagePipeline};
use crate::predict::{PredictionLedger, PredictionRecord};
use crate::store::{EntityStore, LockDecision, LockState, WriteOutcome};
use crate::transport::{Dest, InboundQueue, Transport};

/// Application-level traffic the core transports but does not interpret.
#[derive(Debug, Clone, PartialEq)]
pub struct AppMessage {
    /// Originating peer.
    pub origin: PeerId,
    /// True for commands (routed to the host), false for broadcast events.
    pub is_command: bool,
    /// Opaque name.
    pub name: String,
    /// Opaque arguments.
    pub args: Payload,
}

/// Local intents staged between ticks and committed at the next tick start.
#[derive(Debug)]
enum LocalAction {
    Write { entity: EntityId, payload: Payload },
    LockRequest { entity: EntityId, ttl_ticks: u64 },
    LockRelease { entity: EntityId },
    Command { name: String, args: Payload },
    Broadcast { name: String, args: Payload },
}

#[derive(Debug, Clone)]
struct LoggedWrite {
    entity: EntityId,
    candidate: Candidate,
}

/// The authoritative state-replication engine for one peer.
pub struct ReplicationController {
    cfg: ReplicationConfig,
    local: PeerId,
    clock: TickClock,
    registry: PeerRegistry,
    store: EntityStore,
    history: HistoryBuffer,
    pipeline: MessagePipeline,
    predictions: PredictionLedger,
    events: EventBus,
    inbound: InboundQueue,
    transport: Box<dyn Transport>,
    merge_table: MergeTable,
    violations: FxHashMap<PeerId, u32>,
    pending_pings: FxHashMap<u64, (PeerId, u64)>,
    next_nonce: u64,
    current_tick: TickNumber,
    now_nanos: u64,
    /// Accepted writes per tick, retained for the rollback replay window.
    replay_log: VecDeque<(TickNumber, Vec<LoggedWrite>)>,
    /// Sequence of the write that set each entity's current payload.
    last_seq: FxHashMap<EntityId, u32>,
    pending_local: Vec<LocalAction>,
    app_inbox: Vec<AppMessage>,
    join_sent: bool,
    fatal: Option<CoreError>,
}

impl std::fmt::Debug for ReplicationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationController")
            .field("local", &self.local)
            .field("tick", &self.current_tick)
            .field("peers", &self.registry.len())
            .field("entities", &self.store.len())
            .finish_non_exhaustive()
    }
}

impl ReplicationController {
    /// Builds a controller for `local` with the given role.
    ///
    /// The host seeds the merge table from configuration; clients receive it
    /// with their join snapshot.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the configuration does not validate.
    pub fn new(
        cfg: ReplicationConfig,
        local: PeerId,
        role: Role,
        transport: Box<dyn Transport>,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let mut registry = PeerRegistry::new(cfg.max_peers);
        // Attaching the local peer cannot overflow a validated config.
        let _ = registry.attach(local.clone(), role, 1, 0);
        let merge_table = if role == Role::Host {
            cfg.merge_rules.clone()
        } else {
            MergeTable::new()
        };
        Ok(Self {
            clock: TickClock::new(&cfg),
            registry,
            store: EntityStore::new(cfg.max_entities),
            history: HistoryBuffer::new(usize::try_from(cfg.rollback_window_ticks).unwrap_or(60)),
            pipeline: MessagePipeline::new(&cfg),
            predictions: PredictionLedger::new(),
            events: EventBus::new(),
            inbound: InboundQueue::new(),
            transport,
            merge_table,
            violations: FxHashMap::default(),
            pending_pings: FxHashMap::default(),
            next_nonce: 0,
            current_tick: 0,
            now_nanos: 0,
            replay_log: VecDeque::new(),
            last_seq: FxHashMap::default(),
            pending_local: Vec::new(),
            app_inbox: Vec::new(),
            join_sent: role == Role::Host,
            fatal: None,
            local,
            cfg,
        })
    }

    // ── Public surface ─────────────────────────────────────────────────

    /// Cloneable handle the transport's receive callback deposits into.
    #[must_use]
    pub fn inbound_queue(&self) -> InboundQueue {
        self.inbound.clone()
    }

    /// Registers an event sink.
    pub fn subscribe(&mut self, sink: std::sync::Arc<dyn EventSink>) {
        self.events.subscribe(sink);
    }

    /// Removes and returns every queued event.
    pub fn drain_events(&mut self) -> Vec<Event> {
        self.events.drain()
    }

    /// Opaque commands and events received since the last call.
    pub fn take_app_messages(&mut self) -> Vec<AppMessage> {
        std::mem::take(&mut self.app_inbox)
    }

    /// The local peer id.
    #[must_use]
    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    /// The local peer's current role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.registry
            .get(&self.local)
            .map_or(Role::Spectator, |p| p.role)
    }

    /// The most recently completed tick.
    #[must_use]
    pub fn current_tick(&self) -> TickNumber {
        self.current_tick
    }

    /// Read access to the entity store.
    #[must_use]
    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// Read access to the peer registry.
    #[must_use]
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Read access to the rollback history.
    #[must_use]
    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    /// Read access to the local prediction ledger.
    #[must_use]
    pub fn predictions(&self) -> &PredictionLedger {
        &self.predictions
    }

    /// The merge table in force (host configuration, replicated on join).
    #[must_use]
    pub fn merge_table(&self) -> &MergeTable {
        &self.merge_table
    }

    /// The fatal session error, if one occurred (host lost with no
    /// successor).
    #[must_use]
    pub fn fatal(&self) -> Option<&CoreError> {
        self.fatal.as_ref()
    }

    /// Pre-registers the peer promoted when the host disappears.
    pub fn set_successor(&mut self, id: Option<PeerId>) {
        self.registry.set_successor(id);
    }

    /// Stages a local authoritative write, committed at the next tick.
    pub fn write_local(&mut self, entity: EntityId, payload: Payload) {
        self.pending_local.push(LocalAction::Write { entity, payload });
    }

    /// Stages a lock request (granted directly on the host, requested from
    /// it on clients). The outcome arrives as a `LockGranted`/`LockDenied`
    /// event.
    pub fn request_lock(&mut self, entity: EntityId, ttl_ticks: u64) {
        self.pending_local
            .push(LocalAction::LockRequest { entity, ttl_ticks });
    }

    /// Stages a lock release.
    pub fn release_lock(&mut self, entity: EntityId) {
        self.pending_local.push(LocalAction::LockRelease { entity });
    }

    /// Stages an opaque command routed to the host.
    pub fn send_command(&mut self, name: String, args: Payload) {
        self.pending_local.push(LocalAction::Command { name, args });
    }

    /// Stages an opaque event broadcast to every peer.
    pub fn broadcast_event(&mut self, name: String, args: Payload) {
        self.pending_local.push(LocalAction::Broadcast { name, args });
    }

    /// Records a local prediction bound to `input_id`, reconciled when the
    /// authoritative update for the current tick or later arrives.
    pub fn record_prediction(
        &mut self,
        entity: EntityId,
        input_id: u64,
        input: Payload,
        predicted: Payload,
    ) {
        let tick = self.current_tick + 1;
        self.predictions.record(
            &entity,
            PredictionRecord {
                input_id,
                input,
                predicted,
                tick,
            },
        );
    }

    /// Runs every tick due at `now_nanos` (monotonic).
    pub fn pump(&mut self, now_nanos: u64) {
        self.now_nanos = now_nanos;
        let ticks = self.clock.advance(now_nanos);
        for tick in ticks {
            self.run_tick(&tick);
        }
    }

    // ── Tick body ──────────────────────────────────────────────────────

    fn run_tick(&mut self, tick: &Tick) {
        self.current_tick = tick.number;
        debug!(tick = tick.number, "tick start");

        // The local peer is always live; only remotes age out.
        let local = self.local.clone();
        self.registry.mark_heard(&local, self.now_nanos);

        if !self.join_sent {
            let role = self.role();
            self.post(
                MsgKind::Join,
                Dest::Broadcast,
                Body::Join {
                    role: role.as_str().to_owned(),
                    protocol_version: 1,
                },
                None,
            );
            self.join_sent = true;
        }

        // 1. Drain inbound.
        let mut candidates: BTreeMap<EntityId, Vec<Candidate>> = BTreeMap::new();
        for (peer, raw) in self.inbound.drain() {
            match self.pipeline.accept_raw(&peer, &raw) {
                Ok(AcceptOutcome::Duplicate { kind, origin, seq }) => {
                    // A retransmit usually means our ack was lost.
                    if kind.acked_by_default() {
                        self.send_ack(&origin, seq);
                    }
                }
                Ok(_) => {}
                Err(CoreError::ProtocolViolation { peer, detail }) => {
                    self.note_violation(&peer, detail);
                }
                Err(err) => warn!(%err, "inbound frame dropped"),
            }
        }
        while let Some(msg) = self.pipeline.pop_inbound() {
            self.dispatch(msg, &mut candidates);
        }

        // 1b. Local intents join the same candidate flow.
        for action in std::mem::take(&mut self.pending_local) {
            self.stage_local(action, &mut candidates);
        }

        // 2–4. Conflicts, commits, reconciliation.
        self.apply_candidates(candidates);

        // Predictions beyond the window are discarded; the peer resyncs.
        self.expire_predictions();

        // 5. End-of-tick frame.
        self.rebaseline_overflowing();
        self.history.snapshot(tick.number, &self.store);
        self.events.emit(Event::SnapshotTaken { tick: tick.number });
        while self.replay_log.len() as u64 > self.cfg.rollback_window_ticks {
            self.replay_log.pop_front();
        }

        // 6. Flush dirty entities as per-peer deltas.
        self.flush_dirty();
        self.store.clear_dirty();

        // 7. Maintenance.
        self.flush_transport(tick.number);
        self.sweep_timeouts(tick);
    }

    fn send_ack(&mut self, to: &PeerId, seq: u32) {
        self.post(
            MsgKind::Ack,
            Dest::Peer(to.clone()),
            Body::Ack {
                origin: to.as_str().to_owned(),
                seq,
            },
            None,
        );
    }

    /// Enqueues an outbound message with the local origin and next sequence.
    fn post(&mut self, kind: MsgKind, dest: Dest, body: Body, priority: Option<Priority>) {
        let seq = self.pipeline.next_seq();
        let msg = Message {
            id: MessageId {
                origin: self.local.clone(),
                seq,
            },
            kind,
            origin: self.local.clone(),
            dest,
            body,
            priority: priority.unwrap_or_else(|| kind.default_priority()),
            tick: self.current_tick,
            requires_ack: kind.acked_by_default(),
        };
        if let Err(err) = self.pipeline.enqueue_outbound(msg) {
            warn!(%err, "failed to encode outbound message");
        }
    }

    // ── Inbound dispatch ───────────────────────────────────────────────

    fn dispatch(&mut self, msg: Message, candidates: &mut BTreeMap<EntityId, Vec<Candidate>>) {
        let origin = msg.origin.clone();

        if !self.registry.contains(&origin) {
            // A join is the only frame an unattached origin may open with;
            // it is handled before the role gate because the peer has no
            // role yet.
            if let Body::Join {
                role: wanted,
                protocol_version,
            } = &msg.body
            {
                if msg.requires_ack {
                    self.send_ack(&origin, msg.id.seq);
                }
                let wanted = wanted.clone();
                let protocol_version = *protocol_version;
                self.handle_join(&origin, &wanted, protocol_version);
                return;
            }
            if !self.bootstrap_unknown_origin(&msg) {
                return;
            }
        }
        self.registry.mark_heard(&origin, self.now_nanos);

        let role = match self.registry.get(&origin) {
            Some(peer) => peer.role,
            None => return,
        };
        if !role.may_originate(msg.kind) {
            self.note_violation(
                &origin,
                format!("{} may not originate {}", role.as_str(), msg.kind.op_name()),
            );
            return;
        }

        if msg.requires_ack {
            self.send_ack(&origin, msg.id.seq);
        }

        match msg.body {
            Body::StateUpdate {
                entity,
                version,
                payload,
            } => {
                let entity = EntityId::new(entity);
                self.pipeline
                    .set_receiver_baseline(&origin, &entity, version, payload.clone());
                candidates.entry(entity).or_default().push(Candidate {
                    origin,
                    tick: msg.tick,
                    seq: msg.id.seq,
                    version,
                    payload,
                });
            }
            Body::Delta {
                entity,
                version,
                base_version,
                delta,
            } => {
                let entity = EntityId::new(entity);
                let Some(base) = self
                    .pipeline
                    .receiver_baseline(&origin, &entity)
                    .filter(|b| b.version == base_version)
                    .cloned()
                else {
                    debug!(%entity, base_version, "delta without baseline; requesting full state");
                    self.post(
                        MsgKind::StateRequest,
                        Dest::Peer(origin),
                        Body::StateRequest {
                            entity: entity.as_str().to_owned(),
                        },
                        None,
                    );
                    return;
                };
                let payload = delta.apply(&base.payload);
                self.pipeline
                    .set_receiver_baseline(&origin, &entity, version, payload.clone());
                candidates.entry(entity).or_default().push(Candidate {
                    origin,
                    tick: msg.tick,
                    seq: msg.id.seq,
                    version,
                    payload,
                });
            }
            Body::Snapshot {
                entities,
                merge_rules,
            } => self.handle_snapshot(&origin, msg.tick, entities, merge_rules),
            Body::StateRequest { entity } => self.handle_state_request(&origin, &entity),
            Body::Heartbeat => {}
            Body::Join {
                role: wanted,
                protocol_version,
            } => self.handle_join(&origin, &wanted, protocol_version),
            Body::Leave { .. } => self.remove_peer(&origin, LeaveReason::Explicit),
            Body::Command { name, args } => self.app_inbox.push(AppMessage {
                origin,
                is_command: true,
                name,
                args,
            }),
            Body::Event { name, args } => self.app_inbox.push(AppMessage {
                origin,
                is_command: false,
                name,
                args,
            }),
            Body::LockRequest { entity, ttl_ticks } => {
                self.handle_lock_request(&origin, &EntityId::new(entity), ttl_ticks);
            }
            Body::LockResponse {
                entity,
                granted,
                holder,
                expiry_tick,
            } => self.handle_lock_response(&EntityId::new(entity), granted, holder, expiry_tick),
            Body::LockRelease { entity } => {
                let entity = EntityId::new(entity);
                self.store.release_lock(&entity, &origin);
            }
            Body::Ack {
                origin: acked_origin,
                seq,
            } => self.handle_ack(&origin, &PeerId::new(acked_origin), seq),
            Body::Ping { nonce } => {
                self.post(MsgKind::Pong, Dest::Peer(origin), Body::Pong { nonce }, None);
            }
            Body::Pong { nonce } => {
                if let Some((peer, sent)) = self.pending_pings.remove(&nonce) {
                    if peer == origin {
                        self.registry
                            .record_rtt(&origin, self.now_nanos.saturating_sub(sent));
                    }
                }
            }
            Body::Conflict {
                entity,
                winner,
                payload,
                applied_tick,
                policy,
            } => {
                let entity = EntityId::new(entity);
                // Adopt the authoritative resolution and reconcile our own
                // predictions against it.
                self.store
                    .restore_payload(&entity, payload.clone(), applied_tick);
                let report = ConflictReport {
                    entity: entity.clone(),
                    winner: PeerId::new(winner),
                    payload: payload.clone(),
                    applied_tick,
                    policy: PolicyKind::parse(&policy).unwrap_or(PolicyKind::HostAuthority),
                    degraded: false,
                };
                self.events.emit(Event::ConflictResolved(report));
                self.reconcile_entity(&entity, &payload, applied_tick);
            }
            Body::RollbackNotice { tick, entities } => {
                self.handle_rollback_notice(&origin, tick, &entities);
            }
        }
    }

    /// First contact from an unattached, non-joining origin: on a client
    /// with no host yet, the first authoritative speaker becomes our host
    /// (bootstrap). Anything else is a violation.
    fn bootstrap_unknown_origin(&mut self, msg: &Message) -> bool {
        if self.role() != Role::Host && self.registry.host().is_none() {
            match self
                .registry
                .attach(msg.origin.clone(), Role::Host, 1, self.now_nanos)
            {
                Ok(()) => {
                    self.events.emit(Event::PeerJoined {
                        peer: msg.origin.clone(),
                        role: Role::Host,
                    });
                    return true;
                }
                Err(err) => {
                    warn!(%err, "failed to adopt host");
                    return false;
                }
            }
        }
        self.note_violation(&msg.origin, "frame from unknown origin".to_owned());
        false
    }

    fn handle_join(&mut self, origin: &PeerId, wanted: &str, protocol_version: u32) {
        if self.role() != Role::Host {
            return;
        }
        let Some(role) = Role::parse(wanted) else {
            self.note_violation(origin, format!("unknown role `{wanted}`"));
            return;
        };
        match self
            .registry
            .attach(origin.clone(), role, protocol_version, self.now_nanos)
        {
            Ok(()) => {
                self.events.emit(Event::PeerJoined {
                    peer: origin.clone(),
                    role,
                });
                // Join handshake: full state plus the merge table.
                let entities: Vec<EntityState> = self
                    .store
                    .iter()
                    .map(|r| EntityState {
                        id: r.id.as_str().to_owned(),
                        version: r.version,
                        payload: r.payload.clone(),
                    })
                    .collect();
                self.post(
                    MsgKind::Snapshot,
                    Dest::Peer(origin.clone()),
                    Body::Snapshot {
                        entities,
                        merge_rules: Some(self.merge_table.clone()),
                    },
                    None,
                );
            }
            Err(err) => warn!(%origin, %err, "join rejected"),
        }
    }

    fn handle_snapshot(
        &mut self,
        origin: &PeerId,
        tick: TickNumber,
        entities: Vec<EntityState>,
        merge_rules: Option<MergeTable>,
    ) {
        if let Some(table) = merge_rules {
            self.merge_table = table;
        }
        for state in entities {
            let entity = EntityId::new(state.id);
            self.store
                .adopt(&entity, state.payload.clone(), state.version, origin, tick);
            self.pipeline
                .set_receiver_baseline(origin, &entity, state.version, state.payload.clone());
            self.reconcile_entity(&entity, &state.payload, tick);
        }
    }

    fn handle_state_request(&mut self, origin: &PeerId, entity: &str) {
        if self.role() != Role::Host {
            return;
        }
        let entity_id = EntityId::from(entity);
        let Some(record) = self.store.read(&entity_id) else {
            return;
        };
        let state = EntityState {
            id: entity.to_owned(),
            version: record.version,
            payload: record.payload.clone(),
        };
        self.post(
            MsgKind::Snapshot,
            Dest::Peer(origin.clone()),
            Body::Snapshot {
                entities: vec![state],
                merge_rules: None,
            },
            None,
        );
    }

    fn handle_lock_request(&mut self, origin: &PeerId, entity: &EntityId, ttl_ticks: u64) {
        if self.role() != Role::Host {
            return;
        }
        match self
            .store
            .request_lock(entity, origin, ttl_ticks, self.current_tick, false)
        {
            LockDecision::Granted { expiry_tick } => {
                self.events.emit(Event::LockGranted {
                    entity: entity.clone(),
                    holder: origin.clone(),
                    expiry_tick,
                });
                // Broadcast so every peer's advisory lock state converges.
                self.post(
                    MsgKind::LockResponse,
                    Dest::Broadcast,
                    Body::LockResponse {
                        entity: entity.as_str().to_owned(),
                        granted: true,
                        holder: Some(origin.as_str().to_owned()),
                        expiry_tick,
                    },
                    None,
                );
            }
            LockDecision::Denied { holder } => {
                self.events.emit(Event::LockDenied {
                    entity: entity.clone(),
                    requester: origin.clone(),
                    holder: holder.clone(),
                });
                self.post(
                    MsgKind::LockResponse,
                    Dest::Peer(origin.clone()),
                    Body::LockResponse {
                        entity: entity.as_str().to_owned(),
                        granted: false,
                        holder: holder.map(|h| h.as_str().to_owned()),
                        expiry_tick: 0,
                    },
                    None,
                );
            }
            LockDecision::Pending { .. } => {
                // The authoritative path never defers.
            }
        }
    }

    fn handle_lock_response(
        &mut self,
        entity: &EntityId,
        granted: bool,
        holder: Option<String>,
        expiry_tick: TickNumber,
    ) {
        if granted {
            if let Some(holder) = holder {
                let holder = PeerId::new(holder);
                self.store.confirm_lock(entity, &holder, expiry_tick);
                self.events.emit(Event::LockGranted {
                    entity: entity.clone(),
                    holder,
                    expiry_tick,
                });
            }
        } else {
            let local = self.local.clone();
            self.store.release_lock(entity, &local);
            self.events.emit(Event::LockDenied {
                entity: entity.clone(),
                requester: local,
                holder: holder.map(PeerId::new),
            });
        }
    }

    fn handle_ack(&mut self, acker: &PeerId, acked_origin: &PeerId, seq: u32) {
        if acked_origin != &self.local {
            // Acks address the sender of the acked message.
            return;
        }
        let id = MessageId {
            origin: self.local.clone(),
            seq,
        };
        let Some(message) = self.pipeline.on_ack(&id) else {
            return;
        };
        // Receipt confirmation advances the delta baseline for the acker.
        match message.body {
            Body::StateUpdate {
                entity,
                version,
                payload,
            } => {
                let entity = EntityId::new(entity);
                self.pipeline
                    .advance_sender_baseline(acker, &entity, version, payload);
            }
            Body::Delta {
                entity,
                version,
                delta,
                ..
            } => {
                let entity = EntityId::new(entity);
                if let Some(base) = self.pipeline.sender_baseline(acker, &entity).cloned() {
                    let payload = delta.apply(&base.payload);
                    self.pipeline
                        .advance_sender_baseline(acker, &entity, version, payload);
                }
            }
            Body::Snapshot { entities, .. } => {
                for state in entities {
                    let entity = EntityId::new(state.id);
                    self.pipeline
                        .advance_sender_baseline(acker, &entity, state.version, state.payload);
                }
            }
            _ => {}
        }
    }

    fn handle_rollback_notice(&mut self, origin: &PeerId, tick: TickNumber, entities: &[String]) {
        if Some(origin) != self.registry.host().map(|p| &p.id) {
            return;
        }
        match self.history.restore(tick, &mut self.store) {
            Ok(touched) => {
                self.events.emit(Event::RollbackApplied {
                    tick,
                    entities: touched,
                });
            }
            Err(_) => {
                // Drifted past the window: resync every named entity.
                for entity in entities {
                    self.post(
                        MsgKind::StateRequest,
                        Dest::Peer(origin.clone()),
                        Body::StateRequest {
                            entity: entity.clone(),
                        },
                        None,
                    );
                }
            }
        }
    }

    // ── Local intents ──────────────────────────────────────────────────

    fn stage_local(
        &mut self,
        action: LocalAction,
        candidates: &mut BTreeMap<EntityId, Vec<Candidate>>,
    ) {
        match action {
            LocalAction::Write { entity, payload } => {
                let seq = self.pipeline.next_seq();
                let version = self.store.read(&entity).map_or(1, |r| r.version + 1);
                candidates.entry(entity).or_default().push(Candidate {
                    origin: self.local.clone(),
                    tick: self.current_tick,
                    seq,
                    version,
                    payload,
                });
            }
            LocalAction::LockRequest { entity, ttl_ticks } => {
                if self.role() == Role::Host {
                    let local = self.local.clone();
                    self.handle_lock_request(&local, &entity, ttl_ticks);
                } else {
                    // Advisory until the host confirms.
                    let local = self.local.clone();
                    let _ = self.store.request_lock(
                        &entity,
                        &local,
                        ttl_ticks,
                        self.current_tick,
                        true,
                    );
                    self.post(
                        MsgKind::LockRequest,
                        Dest::Broadcast,
                        Body::LockRequest {
                            entity: entity.as_str().to_owned(),
                            ttl_ticks,
                        },
                        None,
                    );
                }
            }
            LocalAction::LockRelease { entity } => {
                let local = self.local.clone();
                if self.store.release_lock(&entity, &local) && self.role() != Role::Host {
                    self.post(
                        MsgKind::LockRelease,
                        Dest::Broadcast,
                        Body::LockRelease {
                            entity: entity.as_str().to_owned(),
                        },
                        None,
                    );
                }
            }
            LocalAction::Command { name, args } => {
                if self.role() == Role::Host {
                    self.app_inbox.push(AppMessage {
                        origin: self.local.clone(),
                        is_command: true,
                        name,
                        args,
                    });
                } else {
                    self.post(MsgKind::Command, Dest::Broadcast, Body::Command { name, args }, None);
                }
            }
            LocalAction::Broadcast { name, args } => {
                self.post(MsgKind::Event, Dest::Broadcast, Body::Event { name, args }, None);
            }
        }
    }

    // ── Conflict detection and commit ──────────────────────────────────

    fn apply_candidates(&mut self, candidates: BTreeMap<EntityId, Vec<Candidate>>) {
        for (entity, mut cands) in candidates {
            if cands.is_empty() {
                continue;
            }
            let incumbent_conflicts = self.store.read(&entity).is_some_and(|record| {
                cands.iter().any(|c| c.tick <= record.last_tick)
            });

            if cands.len() == 1 && !incumbent_conflicts {
                let cand = cands.remove(0);
                self.commit_plain(&entity, cand);
                continue;
            }

            // The incumbent competes whenever an incoming write does not
            // strictly postdate it.
            let mut incumbent_idx = None;
            if incumbent_conflicts {
                if let Some(record) = self.store.read(&entity) {
                    incumbent_idx = Some(cands.len());
                    cands.push(Candidate {
                        origin: record.last_writer.clone(),
                        tick: record.last_tick,
                        seq: self.last_seq.get(&entity).copied().unwrap_or(0),
                        version: record.version,
                        payload: record.payload.clone(),
                    });
                }
            }
            self.resolve_and_commit(&entity, cands, incumbent_idx);
        }
    }

    fn policy_for(&self, entity: &EntityId) -> PolicyKind {
        self.cfg
            .per_entity_policy_overrides
            .get(entity.as_str())
            .copied()
            .unwrap_or(self.cfg.default_conflict_policy)
    }

    fn commit_plain(&mut self, entity: &EntityId, cand: Candidate) {
        match self
            .store
            .write(entity, cand.payload.clone(), &cand.origin, cand.tick)
        {
            Ok(WriteOutcome::Created { version } | WriteOutcome::Accepted { version }) => {
                self.after_commit(entity, &cand, version);
            }
            Ok(WriteOutcome::LockedOut { holder }) => self.reject_locked(entity, &cand, &holder),
            Ok(WriteOutcome::Superseded) => {
                // Raced past the pre-check; resolve with the incumbent.
                if let Some(record) = self.store.read(entity) {
                    let incumbent = Candidate {
                        origin: record.last_writer.clone(),
                        tick: record.last_tick,
                        seq: self.last_seq.get(entity).copied().unwrap_or(0),
                        version: record.version,
                        payload: record.payload.clone(),
                    };
                    self.resolve_and_commit(entity, vec![cand, incumbent], Some(1));
                }
            }
            Err(err) => warn!(%entity, %err, "write dropped"),
        }
    }

    fn resolve_and_commit(
        &mut self,
        entity: &EntityId,
        cands: Vec<Candidate>,
        incumbent_idx: Option<usize>,
    ) {
        let policy = self.policy_for(entity);
        let host_id = self.registry.host().map(|p| p.id.clone());
        let outcome = {
            let ctx = ResolveCtx {
                host: host_id.as_ref(),
                merge_table: &self.merge_table,
                oldest_restorable: self.history.oldest_restorable_tick(),
            };
            resolve(policy, &cands, &ctx)
        };

        let applied_tick = outcome
            .rollback_to
            .unwrap_or_else(|| cands[outcome.winner].tick);

        if let Some(conflict_tick) = outcome.rollback_to {
            self.rollback_and_replay(entity, conflict_tick, &cands[outcome.winner]);
        } else {
            match &outcome.apply {
                ApplyPlan::Ordered(order) => {
                    let last = order.last().copied();
                    for &idx in order {
                        if Some(idx) == incumbent_idx {
                            // The incumbent's write was already counted.
                            // When it wins, restore its payload without
                            // bumping the version again; mid-order it is
                            // simply superseded.
                            if last == Some(idx) {
                                let c = &cands[idx];
                                self.store
                                    .restore_payload(entity, c.payload.clone(), c.tick);
                            }
                            continue;
                        }
                        self.commit_resolved(entity, &cands[idx]);
                    }
                }
                ApplyPlan::Single(idx) => {
                    // The incumbent winning means the store already holds
                    // the resolved payload.
                    if Some(*idx) != incumbent_idx {
                        self.commit_resolved(entity, &cands[*idx]);
                    }
                }
                ApplyPlan::Merged(payload) => {
                    let winner = &cands[outcome.winner];
                    let merged = Candidate {
                        origin: winner.origin.clone(),
                        tick: winner.tick,
                        seq: winner.seq,
                        version: winner.version,
                        payload: payload.clone(),
                    };
                    self.commit_resolved(entity, &merged);
                }
            }
        }

        let resolved_payload = self
            .store
            .read(entity)
            .map(|r| r.payload.clone())
            .unwrap_or_default();
        let report = ConflictReport {
            entity: entity.clone(),
            winner: cands[outcome.winner].origin.clone(),
            payload: resolved_payload.clone(),
            applied_tick,
            policy: outcome.policy,
            degraded: outcome.degraded,
        };

        // Echo the outcome to rejected origins so they reconcile.
        if self.role() == Role::Host {
            for &idx in &outcome.rejected {
                if Some(idx) == incumbent_idx || cands[idx].origin == self.local {
                    continue;
                }
                self.post(
                    MsgKind::Conflict,
                    Dest::Peer(cands[idx].origin.clone()),
                    Body::Conflict {
                        entity: entity.as_str().to_owned(),
                        winner: report.winner.as_str().to_owned(),
                        payload: resolved_payload.clone(),
                        applied_tick,
                        policy: outcome.policy.name().to_owned(),
                    },
                    None,
                );
            }
        }

        self.events.emit(Event::ConflictResolved(report));
        self.reconcile_entity(entity, &resolved_payload, applied_tick);
    }

    fn commit_resolved(&mut self, entity: &EntityId, cand: &Candidate) -> bool {
        match self
            .store
            .apply_resolved(entity, cand.payload.clone(), &cand.origin, cand.tick)
        {
            Ok(WriteOutcome::Created { version } | WriteOutcome::Accepted { version }) => {
                self.after_commit(entity, cand, version);
                true
            }
            Ok(WriteOutcome::LockedOut { holder }) => {
                self.reject_locked(entity, cand, &holder);
                false
            }
            Ok(WriteOutcome::Superseded) => false,
            Err(err) => {
                warn!(%entity, %err, "resolved write dropped");
                false
            }
        }
    }

    fn after_commit(&mut self, entity: &EntityId, cand: &Candidate, version: u64) {
        self.last_seq.insert(entity.clone(), cand.seq);
        self.events.emit(Event::EntityAccepted {
            entity: entity.clone(),
            version,
        });
        let logged = LoggedWrite {
            entity: entity.clone(),
            candidate: cand.clone(),
        };
        match self
            .replay_log
            .iter_mut()
            .find(|(tick, _)| *tick == cand.tick)
        {
            Some((_, writes)) => writes.push(logged),
            None => {
                self.replay_log.push_back((cand.tick, Vec::new()));
                self.replay_log.make_contiguous().sort_by_key(|(t, _)| *t);
                if let Some((_, writes)) = self
                    .replay_log
                    .iter_mut()
                    .find(|(tick, _)| *tick == cand.tick)
                {
                    writes.push(logged);
                }
            }
        }
        if cand.origin != self.local {
            self.reconcile_entity(entity, &cand.payload, cand.tick);
        }
    }

    fn reject_locked(&mut self, entity: &EntityId, cand: &Candidate, holder: &PeerId) {
        debug!(%entity, origin = %cand.origin, %holder, "write rejected: locked");
        if cand.origin == self.local || self.role() != Role::Host {
            return;
        }
        // The rejection carries the holder so the origin can queue or
        // abandon.
        self.post(
            MsgKind::LockResponse,
            Dest::Peer(cand.origin.clone()),
            Body::LockResponse {
                entity: entity.as_str().to_owned(),
                granted: false,
                holder: Some(holder.as_str().to_owned()),
                expiry_tick: 0,
            },
            None,
        );
    }

    fn rollback_and_replay(
        &mut self,
        entity: &EntityId,
        conflict_tick: TickNumber,
        winner: &Candidate,
    ) {
        let touched = match self.history.restore(conflict_tick, &mut self.store) {
            Ok(touched) => touched,
            Err(err) => {
                // The window moved since resolution; fall back to a plain
                // authoritative commit.
                warn!(%entity, %err, "rollback window lost; committing winner directly");
                self.commit_resolved(entity, winner);
                return;
            }
        };

        self.commit_resolved(entity, winner);

        // Replay the buffered writes of every subsequent tick, in order.
        let to_replay: Vec<LoggedWrite> = self
            .replay_log
            .iter()
            .filter(|(tick, _)| *tick > conflict_tick && *tick <= self.current_tick)
            .flat_map(|(_, writes)| writes.iter().cloned())
            .collect();
        for write in to_replay {
            match self.store.write(
                &write.entity,
                write.candidate.payload.clone(),
                &write.candidate.origin,
                write.candidate.tick,
            ) {
                Ok(WriteOutcome::Created { version } | WriteOutcome::Accepted { version }) => {
                    self.last_seq
                        .insert(write.entity.clone(), write.candidate.seq);
                    self.events.emit(Event::EntityAccepted {
                        entity: write.entity.clone(),
                        version,
                    });
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "replayed write dropped"),
            }
        }

        let mut entities = touched;
        if !entities.contains(entity) {
            entities.push(entity.clone());
            entities.sort();
        }
        self.events.emit(Event::RollbackApplied {
            tick: conflict_tick,
            entities: entities.clone(),
        });
        if self.role() == Role::Host {
            self.post(
                MsgKind::RollbackNotice,
                Dest::Broadcast,
                Body::RollbackNotice {
                    tick: conflict_tick,
                    entities: entities.iter().map(|e| e.as_str().to_owned()).collect(),
                },
                None,
            );
        }
    }

    // ── Prediction reconciliation ──────────────────────────────────────

    fn reconcile_entity(&mut self, entity: &EntityId, authoritative: &Payload, tick: TickNumber) {
        let diffs = self.predictions.reconcile(
            &self.local.clone(),
            entity,
            authoritative,
            tick,
            self.cfg.float_tolerance,
        );
        for diff in diffs {
            self.events.emit(Event::Reconciliation(diff));
        }
    }

    fn expire_predictions(&mut self) {
        let local = self.local.clone();
        let window = self.cfg.rollback_window_ticks;
        let now = self.current_tick;
        let store = &self.store;
        let diffs = self.predictions.expire(&local, now, window, |entity| {
            store.read(entity).map(|r| r.payload.clone())
        });
        let host = self.registry.host().map(|p| p.id.clone());
        for diff in diffs {
            // Drifted past the window: ask for a full snapshot.
            if let Some(host) = &host {
                if host != &self.local {
                    self.post(
                        MsgKind::StateRequest,
                        Dest::Peer(host.clone()),
                        Body::StateRequest {
                            entity: diff.entity.as_str().to_owned(),
                        },
                        None,
                    );
                }
            }
            self.events.emit(Event::Reconciliation(diff));
        }
    }

    // ── Flush and maintenance ──────────────────────────────────────────

    /// Re-baselines entities whose version counter is about to overflow.
    fn rebaseline_overflowing(&mut self) {
        let overflowing: Vec<EntityId> = self
            .store
            .iter()
            .filter(|r| r.version >= u64::MAX - 1)
            .map(|r| r.id.clone())
            .collect();
        for entity in overflowing {
            warn!(%entity, "version counter re-baselined at snapshot boundary");
            self.pipeline.clear_entity_baselines(&entity);
        }
    }

    fn flush_dirty(&mut self) {
        struct DirtyRecord {
            entity: EntityId,
            version: u64,
            payload: Payload,
            locked: bool,
        }
        let dirty: Vec<DirtyRecord> = self
            .store
            .iter_dirty()
            .map(|r| DirtyRecord {
                entity: r.id.clone(),
                version: r.version,
                payload: r.payload.clone(),
                locked: !matches!(r.lock, LockState::Free),
            })
            .collect();
        let peers: Vec<PeerId> = self
            .registry
            .iter()
            .filter(|p| p.id != self.local)
            .map(|p| p.id.clone())
            .collect();

        for record in &dirty {
            for peer in &peers {
                // The peer that sent us this exact payload already has it;
                // echoing it back would ping-pong versions forever.
                if self
                    .pipeline
                    .receiver_baseline(peer, &record.entity)
                    .is_some_and(|b| b.payload == record.payload)
                {
                    continue;
                }
                let baseline = self.pipeline.sender_baseline(peer, &record.entity).cloned();
                if baseline.as_ref().is_some_and(|b| b.version >= record.version) {
                    continue;
                }
                let jump = record.version - baseline.as_ref().map_or(0, |b| b.version);
                let priority =
                    upgrade_state_priority(Priority::Normal, record.locked, jump);
                let body = match &baseline {
                    Some(base) => Body::Delta {
                        entity: record.entity.as_str().to_owned(),
                        version: record.version,
                        base_version: base.version,
                        delta: PayloadDelta::diff(&base.payload, &record.payload),
                    },
                    None => Body::StateUpdate {
                        entity: record.entity.as_str().to_owned(),
                        version: record.version,
                        payload: record.payload.clone(),
                    },
                };
                let kind = match body {
                    Body::Delta { .. } => MsgKind::Delta,
                    _ => MsgKind::StateUpdate,
                };
                self.post(kind, Dest::Peer(peer.clone()), body, Some(priority));
            }
        }
    }

    fn flush_transport(&mut self, tick: TickNumber) {
        for (dest, bytes) in self.pipeline.drain_outbound(tick) {
            self.transport.send(&dest, &bytes);
        }
        let (resends, timeouts) = self.pipeline.sweep_retries(tick);
        for (dest, bytes) in resends {
            self.transport.send(&dest, &bytes);
        }
        for (id, _retries) in timeouts {
            self.events.emit(Event::MessageTimeout { id });
        }
    }

    fn sweep_timeouts(&mut self, tick: &Tick) {
        // Lock TTLs.
        self.store.sweep_locks(tick.number);

        // Peer liveness.
        let timeout_nanos =
            self.cfg.timeout_threshold_ms.saturating_mul(1_000_000);
        let stale = self.registry.prune(self.now_nanos, timeout_nanos);
        for peer in stale {
            self.cleanup_departed(&peer, LeaveReason::TimedOut);
        }

        // Liveness beacons and RTT probes.
        if self.clock.heartbeat_due(tick) {
            self.post(MsgKind::Heartbeat, Dest::Broadcast, Body::Heartbeat, None);
        }
        if self.cfg.ping_interval_ticks > 0 && tick.number % self.cfg.ping_interval_ticks == 0 {
            let peers: Vec<PeerId> = self
                .registry
                .iter()
                .filter(|p| p.id != self.local)
                .map(|p| p.id.clone())
                .collect();
            for peer in peers {
                let nonce = self.next_nonce;
                self.next_nonce += 1;
                self.pending_pings
                    .insert(nonce, (peer.clone(), self.now_nanos));
                self.post(MsgKind::Ping, Dest::Peer(peer), Body::Ping { nonce }, None);
            }
            // Late probes fire no events; drop their bookkeeping.
            let now = self.now_nanos;
            self.pending_pings
                .retain(|_, (_, sent)| now.saturating_sub(*sent) <= timeout_nanos);
        }
        // Probe and retry frames generated during the sweep leave this tick.
        for (dest, bytes) in self.pipeline.drain_outbound(tick.number) {
            self.transport.send(&dest, &bytes);
        }
    }

    fn remove_peer(&mut self, peer: &PeerId, reason: LeaveReason) {
        if self.registry.detach(peer).is_some() {
            self.cleanup_departed(peer, reason);
        }
    }

    fn cleanup_departed(&mut self, peer: &PeerId, reason: LeaveReason) {
        // Removal cascades to lock release.
        self.store.release_locks_held_by(peer);
        self.pipeline.forget_peer(peer);
        self.violations.remove(peer);
        self.events.emit(Event::PeerLeft {
            peer: peer.clone(),
            reason,
        });
        // Host disappearance promotes the pre-registered successor or ends
        // the session.
        if self.registry.host().is_none() {
            let successor = self.registry.successor().cloned();
            match successor {
                Some(next) if self.registry.promote(&next).is_ok() => {
                    // The merge table replicated at join time stays in
                    // force; the session's negotiated rules outlive the
                    // host that seeded them.
                    self.events.emit(Event::HostMigrated {
                        from: peer.clone(),
                        to: next,
                    });
                }
                _ => {
                    self.fatal = Some(CoreError::HostLost);
                }
            }
        }
    }

    fn note_violation(&mut self, peer: &PeerId, detail: String) {
        warn!(%peer, detail, "protocol violation");
        self.events.emit(Event::ProtocolViolation {
            peer: peer.clone(),
            detail,
        });
        let count = self.violations.entry(peer.clone()).or_insert(0);
        *count += 1;
        if *count >= self.cfg.violation_kick_threshold && self.registry.contains(peer) {
            let peer = peer.clone();
            self.remove_peer(&peer, LeaveReason::Kicked);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::transport::RecordingTransport;
    use tether_proto::Value;

    fn payload(hp: i64) -> Payload {
        [("hp".to_owned(), Value::Int(hp))].into_iter().collect()
    }

    fn host() -> ReplicationController {
        ReplicationController::new(
            ReplicationConfig::default(),
            PeerId::from("host"),
            Role::Host,
            Box::new(RecordingTransport::default()),
        )
        .expect("config validates")
    }

    fn interval() -> u64 {
        ReplicationConfig::default().tick_interval_nanos()
    }

    fn pump_ticks(ctrl: &mut ReplicationController, upto: u64) {
        let step = interval();
        for k in (ctrl.current_tick() + 1)..=upto {
            ctrl.pump(k * step);
        }
    }

    #[test]
    fn local_write_lands_next_tick_with_version_one() {
        let mut ctrl = host();
        ctrl.write_local(EntityId::from("e1"), payload(100));
        pump_ticks(&mut ctrl, 1);
        let record = ctrl.store().read(&EntityId::from("e1")).expect("created");
        assert_eq!(record.version, 1);
        assert_eq!(record.last_tick, 1);
        let events = ctrl.drain_events();
        assert!(events.contains(&Event::EntityAccepted {
            entity: EntityId::from("e1"),
            version: 1
        }));
    }

    #[test]
    fn every_tick_writes_a_history_frame() {
        let mut ctrl = host();
        pump_ticks(&mut ctrl, 3);
        assert_eq!(ctrl.history().len(), 3);
        assert_eq!(ctrl.history().newest_tick(), Some(3));
    }

    #[test]
    fn host_lock_grant_is_immediate_and_observable() {
        let mut ctrl = host();
        ctrl.write_local(EntityId::from("e2"), payload(1));
        pump_ticks(&mut ctrl, 1);
        ctrl.request_lock(EntityId::from("e2"), 30);
        pump_ticks(&mut ctrl, 2);
        let record = ctrl.store().read(&EntityId::from("e2")).unwrap();
        assert_eq!(
            record.lock,
            LockState::Held {
                holder: PeerId::from("host"),
                expiry_tick: 32
            }
        );
        let events = ctrl.drain_events();
        assert!(events.contains(&Event::LockGranted {
            entity: EntityId::from("e2"),
            holder: PeerId::from("host"),
            expiry_tick: 32,
        }));
    }

    #[test]
    fn fatal_is_set_when_the_host_vanishes_without_successor() {
        let mut ctrl = ReplicationController::new(
            ReplicationConfig::default(),
            PeerId::from("client"),
            Role::Client,
            Box::new(RecordingTransport::default()),
        )
        .expect("config validates");
        // Adopt a host, then let it time out.
        let q = ctrl.inbound_queue();
        let frame = tether_proto::Frame {
            kind: MsgKind::Heartbeat,
            seq: 0,
            tick: 1,
            origin: "host".to_owned(),
            body: Body::Heartbeat.encode(),
        }
        .encode(None)
        .expect("encode");
        q.deposit(PeerId::from("host"), frame);
        pump_ticks(&mut ctrl, 1);
        assert!(ctrl.registry().contains(&PeerId::from("host")));

        // Far future: the host misses every heartbeat.
        let far = 700 * interval();
        ctrl.pump(far);
        assert!(matches!(ctrl.fatal(), Some(CoreError::HostLost)));
    }
}
