// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Two peers writing the same entity at the same tick converge on the
//! last-write-wins winner, byte for byte.

mod common;

use common::{ferry, payload, step};
use tether_core::{
    EntityId, PeerId, PolicyKind, RecordingTransport, ReplicationConfig, ReplicationController,
    Role,
};

fn lww_config() -> ReplicationConfig {
    ReplicationConfig {
        default_conflict_policy: PolicyKind::LastWriteWins,
        ..ReplicationConfig::default()
    }
}

#[test]
fn concurrent_writes_converge_on_the_host_payload() {
    let host_id = PeerId::from("host");
    let client_id = PeerId::from("player2");

    let host_net = RecordingTransport::new();
    let client_net = RecordingTransport::new();
    let mut host = ReplicationController::new(
        lww_config(),
        host_id.clone(),
        Role::Host,
        Box::new(host_net.clone()),
    )
    .expect("host config");
    let mut client = ReplicationController::new(
        lww_config(),
        client_id.clone(),
        Role::Client,
        Box::new(client_net.clone()),
    )
    .expect("client config");

    let host_q = host.inbound_queue();
    let client_q = client.inbound_queue();

    let mut exchange = |host: &mut ReplicationController,
                        client: &mut ReplicationController,
                        tick: u64| {
        client.pump(tick * step());
        ferry(&client_net, &client_id, &host_q);
        host.pump(tick * step());
        ferry(&host_net, &host_id, &client_q);
    };

    // Handshake: the client joins, the host snapshots back.
    for tick in 1..=9 {
        exchange(&mut host, &mut client, tick);
    }
    assert!(host.registry().contains(&client_id));
    assert!(client.registry().contains(&host_id));

    // Both peers write the same entity for tick 10.
    let e1 = EntityId::from("e1");
    client.write_local(e1.clone(), payload(&[("hp", 80)]));
    host.write_local(e1.clone(), payload(&[("hp", 90)]));
    for tick in 10..=14 {
        exchange(&mut host, &mut client, tick);
    }

    let host_rec = host.store().read(&e1).expect("host has e1");
    let client_rec = client.store().read(&e1).expect("client has e1");
    assert_eq!(host_rec.payload, payload(&[("hp", 90)]), "host converges");
    assert_eq!(
        client_rec.payload,
        payload(&[("hp", 90)]),
        "client converges on the same bytes"
    );
    assert_eq!(host_rec.version, 2, "both writes were accepted");
    assert_eq!(client_rec.version, 2);
    assert_eq!(
        tether_proto::encode_payload(&host_rec.payload),
        tether_proto::encode_payload(&client_rec.payload),
        "canonical encodings agree"
    );
}
