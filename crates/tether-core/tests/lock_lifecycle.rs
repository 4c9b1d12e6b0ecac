// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Lock contention: a granted lease rejects other writers, carries the
//! holder back to the rejected origin, and lapses at its TTL sweep.

mod common;

use common::{join_frame, lock_request_frame, payload, pump_to, state_update_frame};
use tether_core::{
    Dest, EntityId, Event, LockState, PeerId, RecordingTransport, ReplicationConfig,
    ReplicationController, Role,
};
use tether_proto::{Body, Frame, MsgKind};

#[test]
fn contention_rejection_and_ttl_release() {
    let net = RecordingTransport::new();
    let mut host = ReplicationController::new(
        ReplicationConfig::default(),
        PeerId::from("host"),
        Role::Host,
        Box::new(net.clone()),
    )
    .expect("config validates");
    let q = host.inbound_queue();
    let e2 = EntityId::from("e2");
    let alice = PeerId::from("alice");
    let bob = PeerId::from("bob");

    host.write_local(e2.clone(), payload(&[("hp", 1)]));
    pump_to(&mut host, 1);
    q.deposit(alice.clone(), join_frame("alice", 0, 1));
    q.deposit(bob.clone(), join_frame("bob", 0, 1));
    pump_to(&mut host, 2);
    host.drain_events();

    // Alice locks e2 with a 30-tick lease at tick 5.
    pump_to(&mut host, 4);
    q.deposit(alice.clone(), lock_request_frame("alice", 1, 4, "e2", 30));
    pump_to(&mut host, 5);
    assert_eq!(
        host.store().read(&e2).expect("e2").lock,
        LockState::Held {
            holder: alice.clone(),
            expiry_tick: 35
        }
    );
    assert!(host.drain_events().contains(&Event::LockGranted {
        entity: e2.clone(),
        holder: alice.clone(),
        expiry_tick: 35,
    }));
    let _ = net.take_sent();

    // Bob's write five ticks later is rejected and told who holds the lock.
    pump_to(&mut host, 9);
    q.deposit(
        bob.clone(),
        state_update_frame("bob", 1, 10, "e2", 2, payload(&[("hp", 50)])),
    );
    pump_to(&mut host, 10);
    let record = host.store().read(&e2).expect("e2");
    assert_eq!(record.payload, payload(&[("hp", 1)]), "write rejected");
    assert_eq!(record.version, 1);

    let denial = net
        .take_sent()
        .into_iter()
        .find_map(|(dest, bytes)| {
            let (frame, _) = Frame::decode(&bytes).expect("decodes");
            if frame.kind != MsgKind::LockResponse {
                return None;
            }
            let body = Body::decode(frame.kind, &frame.body).expect("body decodes");
            Some((dest, body))
        })
        .expect("a lock response was sent");
    assert_eq!(denial.0, Dest::Peer(bob.clone()));
    let Body::LockResponse {
        granted, holder, ..
    } = denial.1
    else {
        unreachable!("filtered to lock responses");
    };
    assert!(!granted);
    assert_eq!(holder.as_deref(), Some("alice"));

    // The TTL sweep frees the lease the tick after expiry.
    pump_to(&mut host, 35);
    assert!(matches!(
        host.store().read(&e2).expect("e2").lock,
        LockState::Held { .. }
    ));
    pump_to(&mut host, 36);
    assert_eq!(host.store().read(&e2).expect("e2").lock, LockState::Free);

    // Bob's next write succeeds and bumps the version.
    q.deposit(
        bob.clone(),
        state_update_frame("bob", 2, 37, "e2", 2, payload(&[("hp", 50)])),
    );
    pump_to(&mut host, 37);
    let record = host.store().read(&e2).expect("e2");
    assert_eq!(record.payload, payload(&[("hp", 50)]));
    assert_eq!(record.version, 2);
    assert_eq!(record.last_writer, bob);
}
