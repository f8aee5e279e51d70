//! Unconfirmed suspicion expires into a dead claim.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use shoal::proto::{Alive, Message, Suspect};
use shoal::{Membership, MemberEvent, PeerState};

use crate::fixtures::mesh::MeshNet;
use crate::fixtures::packets::RawEndpoint;
use crate::fixtures::{Recorder, init_logging, wait_until};

#[test]
fn suspect_becomes_dead_after_the_window() {
    init_logging();
    let net = MeshNet::new();
    let mut config = crate::fixtures::quiet_config("m0");
    // Keep the suspicion window short: it derives from the probe
    // interval.
    config.probe_interval = Duration::from_millis(300);
    config.probe_timeout = Duration::from_millis(100);

    let recorder = Arc::new(Recorder::default());
    let engine = Membership::start(config, net.endpoint(), Some(recorder.clone()))
        .expect("start");
    let injector = RawEndpoint::new(net.endpoint(), &crate::fixtures::quiet_config("x"));

    // A peer that exists only on paper, at an address nobody answers.
    injector.send(
        &[Message::Alive(Alive {
            incarnation: 5,
            node: "q".into(),
            addr: Bytes::from_static(&[10, 77, 0, 250]),
            port: 7946,
            meta: Bytes::new(),
            vsn: [1, 5, 5, 2, 5, 5],
        })],
        engine.local_addr(),
    );
    assert!(
        wait_until(Duration::from_secs(1), || {
            engine.members().iter().any(|m| m.name == "q")
        }),
        "injected peer is registered"
    );

    injector.send(
        &[Message::Suspect(Suspect {
            incarnation: 5,
            node: "q".into(),
            from: "x".into(),
        })],
        engine.local_addr(),
    );

    assert!(
        wait_until(Duration::from_secs(1), || {
            engine
                .members()
                .iter()
                .any(|m| m.name == "q" && m.state == PeerState::Suspect)
        }),
        "claim marks the peer suspect"
    );

    // No refutation arrives, so the timer must convert it to dead with
    // the suspicion-time incarnation.
    assert!(
        wait_until(Duration::from_secs(10), || {
            engine
                .members()
                .iter()
                .any(|m| m.name == "q" && m.state == PeerState::Dead && m.incarnation == 5)
        }),
        "suspicion expires into dead"
    );
    assert!(
        recorder
            .events()
            .iter()
            .any(|event| matches!(event, MemberEvent::Leave(m) if m.name == "q")),
        "the delegate hears about the failure"
    );

    engine.shutdown();
}
