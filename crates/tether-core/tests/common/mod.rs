// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared helpers for controller scenario tests.
#![allow(dead_code)]

use tether_core::{InboundQueue, PeerId, RecordingTransport, ReplicationConfig, ReplicationController};
use tether_proto::{Body, Frame, MsgKind, Payload, Value};

/// Nanoseconds per tick at the default 60 Hz.
pub fn step() -> u64 {
    ReplicationConfig::default().tick_interval_nanos()
}

/// Pumps every tick up to and including `tick`.
pub fn pump_to(ctrl: &mut ReplicationController, tick: u64) {
    let step = step();
    for k in (ctrl.current_tick() + 1)..=tick {
        ctrl.pump(k * step);
    }
}

/// Integer payload from `(field, value)` pairs.
pub fn payload(entries: &[(&str, i64)]) -> Payload {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_owned(), Value::Int(*v)))
        .collect()
}

/// Float payload from `(field, value)` pairs.
pub fn fpayload(entries: &[(&str, f64)]) -> Payload {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_owned(), Value::Float(*v)))
        .collect()
}

/// Encodes a raw frame the way a remote peer would.
pub fn frame_bytes(kind: MsgKind, seq: u32, tick: u64, origin: &str, body: &Body) -> Vec<u8> {
    Frame {
        kind,
        seq,
        tick,
        origin: origin.to_owned(),
        body: body.encode(),
    }
    .encode(None)
    .expect("frame encodes")
}

pub fn join_frame(origin: &str, seq: u32, tick: u64) -> Vec<u8> {
    frame_bytes(
        MsgKind::Join,
        seq,
        tick,
        origin,
        &Body::Join {
            role: "client".to_owned(),
            protocol_version: 1,
        },
    )
}

pub fn heartbeat_frame(origin: &str, seq: u32, tick: u64) -> Vec<u8> {
    frame_bytes(MsgKind::Heartbeat, seq, tick, origin, &Body::Heartbeat)
}

pub fn state_update_frame(
    origin: &str,
    seq: u32,
    tick: u64,
    entity: &str,
    version: u64,
    body_payload: Payload,
) -> Vec<u8> {
    frame_bytes(
        MsgKind::StateUpdate,
        seq,
        tick,
        origin,
        &Body::StateUpdate {
            entity: entity.to_owned(),
            version,
            payload: body_payload,
        },
    )
}

pub fn lock_request_frame(origin: &str, seq: u32, tick: u64, entity: &str, ttl: u64) -> Vec<u8> {
    frame_bytes(
        MsgKind::LockRequest,
        seq,
        tick,
        origin,
        &Body::LockRequest {
            entity: entity.to_owned(),
            ttl_ticks: ttl,
        },
    )
}

/// Moves everything `from` recorded into `to`, tagged as `from_id`.
pub fn ferry(from: &RecordingTransport, from_id: &PeerId, to: &InboundQueue) {
    for (_dest, bytes) in from.take_sent() {
        to.deposit(from_id.clone(), bytes);
    }
}
