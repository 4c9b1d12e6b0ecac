// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Observable events with typed payloads.
//!
//! Tagged variants and explicit subscriber registration; nothing dispatches
//! on strings. Sinks observe every event as it is emitted; the internal
//! queue backs poll-style consumption and test assertions.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::conflict::ConflictReport;
use crate::ident::{EntityId, MessageId, PeerId, TickNumber};
use crate::peer::Role;
use crate::predict::ReconciliationDiff;

/// Why a peer left the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// The peer sent an explicit leave.
    Explicit,
    /// The timeout sweep removed the peer.
    TimedOut,
    /// Repeated protocol violations crossed the kick threshold.
    Kicked,
}

/// Everything the core makes observable.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A peer attached.
    PeerJoined {
        /// The new peer.
        peer: PeerId,
        /// Its role.
        role: Role,
    },
    /// A peer detached; its locks were released in the same tick.
    PeerLeft {
        /// The departed peer.
        peer: PeerId,
        /// Why it left.
        reason: LeaveReason,
    },
    /// A write was accepted and the version bumped.
    EntityAccepted {
        /// Written entity.
        entity: EntityId,
        /// Version after the write.
        version: u64,
    },
    /// A conflict was resolved.
    ConflictResolved(ConflictReport),
    /// A prediction disagreed with the authoritative payload.
    Reconciliation(ReconciliationDiff),
    /// An ack-pending message exhausted its retries.
    MessageTimeout {
        /// Id of the dropped message.
        id: MessageId,
    },
    /// A lock lease was granted.
    LockGranted {
        /// Locked entity.
        entity: EntityId,
        /// Lease holder.
        holder: PeerId,
        /// Last tick the lease is valid for.
        expiry_tick: TickNumber,
    },
    /// A lock request was denied.
    LockDenied {
        /// Contested entity.
        entity: EntityId,
        /// Denied requester.
        requester: PeerId,
        /// Current holder when one exists.
        holder: Option<PeerId>,
    },
    /// The end-of-tick frame was written into the history buffer.
    SnapshotTaken {
        /// Closed tick.
        tick: TickNumber,
    },
    /// History was restored and buffered inbound replayed.
    RollbackApplied {
        /// Tick the store was restored to.
        tick: TickNumber,
        /// Entities whose payloads were rewound.
        entities: Vec<EntityId>,
    },
    /// A malformed or forbidden frame arrived.
    ProtocolViolation {
        /// Offending origin.
        peer: PeerId,
        /// What was wrong.
        detail: String,
    },
    /// The host role transferred to a new peer.
    HostMigrated {
        /// Previous host.
        from: PeerId,
        /// New host.
        to: PeerId,
    },
}

/// Receives every event as it is emitted.
pub trait EventSink: Send + Sync {
    /// Observes one event.
    fn on_event(&self, event: &Event);
}

/// Sink that discards everything.
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn on_event(&self, _event: &Event) {}
}

/// Event fan-out plus a drainable queue.
#[derive(Default)]
pub struct EventBus {
    sinks: Vec<Arc<dyn EventSink>>,
    queue: VecDeque<Event>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("sinks", &self.sinks.len())
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sink for all future events.
    pub fn subscribe(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    /// Emits an event to every sink and queues it for [`drain`](Self::drain).
    pub fn emit(&mut self, event: Event) {
        for sink in &self.sinks {
            sink.on_event(&event);
        }
        self.queue.push_back(event);
    }

    /// Removes and returns every queued event in emission order.
    pub fn drain(&mut self) -> Vec<Event> {
        self.queue.drain(..).collect()
    }

    /// Queued events awaiting a drain.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collector(Mutex<Vec<Event>>);

    impl EventSink for Collector {
        fn on_event(&self, event: &Event) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn sinks_and_queue_both_observe_in_order() {
        let mut bus = EventBus::new();
        let collector = Arc::new(Collector::default());
        bus.subscribe(collector.clone());
        bus.emit(Event::SnapshotTaken { tick: 1 });
        bus.emit(Event::SnapshotTaken { tick: 2 });

        let drained = bus.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0], Event::SnapshotTaken { tick: 1 });
        assert_eq!(collector.0.lock().unwrap().len(), 2);
        assert_eq!(bus.queued(), 0);
    }
}
