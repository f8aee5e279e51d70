//! Anti-entropy: a push/pull exchange heals divergent views.

use std::time::Duration;

use bytes::Bytes;
use shoal::proto::{Alive, Message, PeerState as WireState, PushNodeState, Suspect};
use shoal::pushpull::{read_push_pull, write_push_pull};
use shoal::transport::Transport;
use shoal::{Membership, PeerState};

use crate::fixtures::mesh::MeshNet;
use crate::fixtures::packets::RawEndpoint;
use crate::fixtures::{quiet_config, wait_until};

fn state(name: &str, last_octet: u8, incarnation: u64) -> PushNodeState {
    PushNodeState {
        name: name.into(),
        addr: Bytes::copy_from_slice(&[10, 77, 0, last_octet]),
        port: 7946,
        meta: Bytes::new(),
        incarnation,
        state: WireState::Alive,
        vsn: [1, 5, 5, 2, 5, 5],
    }
}

#[test]
fn push_pull_merges_remote_view_and_reports_ours() {
    let net = MeshNet::new();
    let engine = Membership::start(quiet_config("m0"), net.endpoint(), None).expect("start");
    let peer = RawEndpoint::new(net.endpoint(), &quiet_config("peer"));

    // Seed the engine with a stale view: t0 suspect at incarnation 0.
    peer.send(
        &[Message::Alive(Alive {
            incarnation: 0,
            node: "t0".into(),
            addr: Bytes::from_static(&[10, 77, 0, 251]),
            port: 7946,
            meta: Bytes::new(),
            vsn: [1, 5, 5, 2, 5, 5],
        })],
        engine.local_addr(),
    );
    assert!(wait_until(Duration::from_secs(1), || {
        engine.members().iter().any(|m| m.name == "t0")
    }));
    peer.send(
        &[Message::Suspect(Suspect {
            incarnation: 0,
            node: "t0".into(),
            from: "x".into(),
        })],
        engine.local_addr(),
    );
    assert!(wait_until(Duration::from_secs(1), || {
        engine
            .members()
            .iter()
            .any(|m| m.name == "t0" && m.state == PeerState::Suspect)
    }));

    // Reliable exchange: we push three fresh records, the engine answers
    // with its own (stale) view before merging ours.
    let mut conn = peer
        .transport
        .dial_stream(engine.local_addr(), Duration::from_secs(1))
        .expect("dial");
    let ours = vec![state("t0", 251, 1), state("t1", 252, 1), state("t2", 253, 1)];
    write_push_pull(&mut *conn, &peer.dispatcher, &ours, &[], false, false).expect("push");
    let (header, theirs, _user) = read_push_pull(&mut *conn, &peer.dispatcher).expect("pull");

    assert_eq!(header.nodes as usize, theirs.len());
    let t0 = theirs
        .iter()
        .find(|s| s.name == "t0")
        .expect("their reply covers t0");
    assert_eq!(t0.state, WireState::Suspect);
    assert_eq!(t0.incarnation, 0);

    assert!(
        wait_until(Duration::from_secs(2), || {
            let members = engine.members();
            ["t0", "t1", "t2"].iter().all(|name| {
                members.iter().any(|m| {
                    m.name == *name && m.state == PeerState::Alive && m.incarnation == 1
                })
            })
        }),
        "the fresher remote records win"
    );

    engine.shutdown();
}
