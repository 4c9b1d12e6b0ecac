// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Ack exhaustion over a dead link: bounded byte-identical retransmits,
//! then a timeout event and silence.

mod common;

use common::{pump_to, step};
use tether_core::{
    Event, PeerId, RecordingTransport, ReplicationConfig, ReplicationController, Role,
};
use tether_proto::{Frame, MsgKind};

#[test]
fn join_over_a_dead_link_times_out_after_bounded_retries() {
    let net = RecordingTransport::new();
    let mut client = ReplicationController::new(
        ReplicationConfig::default(),
        PeerId::from("player2"),
        Role::Client,
        Box::new(net.clone()),
    )
    .expect("config validates");

    // Nothing ever answers; the recorded frames are what a silent
    // transport would have dropped.
    let mut join_frames: Vec<(u64, Vec<u8>)> = Vec::new();
    let mut timeout_tick = None;
    for tick in 1..=100 {
        client.pump(tick * step());
        for (_, bytes) in net.take_sent() {
            let (frame, _) = Frame::decode(&bytes).expect("decodes");
            if frame.kind == MsgKind::Join {
                join_frames.push((tick, bytes));
            }
        }
        for event in client.drain_events() {
            if let Event::MessageTimeout { id } = event {
                assert_eq!(id.origin, PeerId::from("player2"));
                assert!(timeout_tick.is_none(), "the timeout fires exactly once");
                timeout_tick = Some(tick);
            }
        }
    }

    // Sent at tick 1, retried at +15, +30, +45; the timeout surfaces in
    // the same sweep as the final permitted retry.
    let ticks: Vec<u64> = join_frames.iter().map(|(t, _)| *t).collect();
    assert_eq!(ticks, vec![1, 16, 31, 46]);
    assert_eq!(timeout_tick, Some(46));

    // Every retransmit is byte-identical to the original.
    let original = &join_frames[0].1;
    for (_, frame) in &join_frames[1..] {
        assert_eq!(frame, original);
    }
}

#[test]
fn an_ack_in_time_prevents_any_timeout() {
    let net = RecordingTransport::new();
    let mut client = ReplicationController::new(
        ReplicationConfig::default(),
        PeerId::from("player2"),
        Role::Client,
        Box::new(net.clone()),
    )
    .expect("config validates");
    let q = client.inbound_queue();

    pump_to(&mut client, 1);
    let join_seq = net
        .take_sent()
        .iter()
        .find_map(|(_, bytes)| {
            let (frame, _) = Frame::decode(bytes).expect("decodes");
            (frame.kind == MsgKind::Join).then_some(frame.seq)
        })
        .expect("the join left at tick 1");

    // The host acks the join.
    q.deposit(
        PeerId::from("host"),
        common::frame_bytes(
            MsgKind::Ack,
            0,
            2,
            "host",
            &tether_proto::Body::Ack {
                origin: "player2".to_owned(),
                seq: join_seq,
            },
        ),
    );
    pump_to(&mut client, 100);

    let timeouts: Vec<Event> = client
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, Event::MessageTimeout { .. }))
        .collect();
    assert!(timeouts.is_empty());
    let retries = net
        .take_sent()
        .iter()
        .filter(|(_, bytes)| {
            Frame::decode(bytes).expect("decodes").0.kind == MsgKind::Join
        })
        .count();
    assert_eq!(retries, 0, "an acked message is never retransmitted");
}
