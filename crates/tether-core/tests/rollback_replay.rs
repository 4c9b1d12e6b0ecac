// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! A late write under the rollback policy rewinds history, applies the
//! late candidate, and replays the buffered writes on top.

mod common;

use common::{join_frame, payload, pump_to, state_update_frame};
use tether_core::{
    EntityId, Event, PeerId, PolicyKind, RecordingTransport, ReplicationConfig,
    ReplicationController, Role,
};
use tether_proto::{Frame, MsgKind};

fn rollback_config() -> ReplicationConfig {
    let mut cfg = ReplicationConfig::default();
    cfg.per_entity_policy_overrides
        .insert("e1".to_owned(), PolicyKind::Rollback);
    cfg
}

#[test]
fn late_arrival_rewinds_applies_and_replays() {
    let net = RecordingTransport::new();
    let mut host = ReplicationController::new(
        rollback_config(),
        PeerId::from("host"),
        Role::Host,
        Box::new(net.clone()),
    )
    .expect("config validates");
    let q = host.inbound_queue();
    let e1 = EntityId::from("e1");

    // Seed the entity and attach the client.
    host.write_local(e1.clone(), payload(&[("hp", 1)]));
    pump_to(&mut host, 1);
    q.deposit(PeerId::from("c1"), join_frame("c1", 0, 1));
    pump_to(&mut host, 2);
    assert!(host.registry().contains(&PeerId::from("c1")));
    host.drain_events();
    let _ = net.take_sent();

    // Host-local update accepted at tick 102.
    pump_to(&mut host, 101);
    host.write_local(e1.clone(), payload(&[("hp", 70)]));
    pump_to(&mut host, 102);
    assert_eq!(host.store().read(&e1).expect("e1").last_tick, 102);

    // The client's update tagged tick 100 arrives at tick 105.
    pump_to(&mut host, 104);
    q.deposit(
        PeerId::from("c1"),
        state_update_frame("c1", 1, 100, "e1", 2, payload(&[("hp", 55)])),
    );
    pump_to(&mut host, 105);

    let events = host.drain_events();
    assert!(
        events.contains(&Event::RollbackApplied {
            tick: 100,
            entities: vec![e1.clone()],
        }),
        "rollback to the conflict tick is observable"
    );

    // The late write landed, then the buffered tick-102 write replayed on
    // top of it.
    let record = host.store().read(&e1).expect("e1");
    assert_eq!(record.payload, payload(&[("hp", 70)]));
    assert_eq!(record.last_tick, 102);
    assert_eq!(
        record.version, 4,
        "seed + local update + late candidate + replayed update"
    );

    // Clients are told to rewind too.
    let notices: Vec<MsgKind> = net
        .take_sent()
        .iter()
        .map(|(_, bytes)| Frame::decode(bytes).expect("decodes").0.kind)
        .collect();
    assert!(notices.contains(&MsgKind::RollbackNotice));
}
