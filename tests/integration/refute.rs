//! Refutation: suspicion about a live node dies to a louder alive.

use std::time::Duration;

use shoal::Membership;
use shoal::proto::{Message, Suspect};
use shoal::PeerState;

use crate::fixtures::mesh::MeshNet;
use crate::fixtures::packets::RawEndpoint;
use crate::fixtures::{fast_config, init_logging, wait_until};

#[test]
fn suspected_node_refutes_and_stays_alive() {
    init_logging();
    let net = MeshNet::new();
    let a = Membership::start(fast_config("a"), net.endpoint(), None).expect("start a");
    let b = Membership::start(fast_config("b"), net.endpoint(), None).expect("start b");
    let accuser = RawEndpoint::new(net.endpoint(), &fast_config("x"));

    b.join(&[a.local_addr()]).expect("join");
    assert!(
        wait_until(Duration::from_secs(3), || {
            a.members().len() == 2 && b.members().len() == 2
        }),
        "cluster converges"
    );

    let before = a.local_incarnation();
    accuser.send(
        &[Message::Suspect(Suspect {
            incarnation: before,
            node: "a".into(),
            from: "x".into(),
        })],
        a.local_addr(),
    );

    assert!(
        wait_until(Duration::from_secs(2), || a.local_incarnation() > before),
        "refutation bumps the local incarnation above the claim"
    );
    assert!(a.health_score() >= 1, "refuting degrades awareness");

    let refuted = a.local_incarnation();
    assert!(
        wait_until(Duration::from_secs(3), || {
            b.members()
                .iter()
                .any(|m| m.name == "a" && m.state == PeerState::Alive && m.incarnation == refuted)
        }),
        "the refutation gossip reaches the peer"
    );

    a.shutdown();
    b.shutdown();
}
