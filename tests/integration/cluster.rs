//! Whole-cluster behaviour: convergence, user gossip, leave, failure
//! detection, shutdown.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use shoal::{Error, Membership, PeerState};

use crate::fixtures::mesh::MeshNet;
use crate::fixtures::{Recorder, fast_config, init_logging, wait_until};

#[test]
fn three_nodes_converge() {
    init_logging();
    let net = MeshNet::new();
    let a = Membership::start(fast_config("a"), net.endpoint(), None).expect("start a");
    let b = Membership::start(fast_config("b"), net.endpoint(), None).expect("start b");
    let c = Membership::start(fast_config("c"), net.endpoint(), None).expect("start c");

    assert_eq!(b.join(&[a.local_addr()]).expect("b joins"), 1);
    assert_eq!(c.join(&[a.local_addr()]).expect("c joins"), 1);

    assert!(
        wait_until(Duration::from_secs(5), || {
            [&a, &b, &c].iter().all(|engine| {
                let members = engine.members();
                members.len() == 3 && members.iter().all(|m| m.state == PeerState::Alive)
            })
        }),
        "every node sees every node alive"
    );

    a.shutdown();
    b.shutdown();
    c.shutdown();
}

#[test]
fn user_broadcast_reaches_every_peer() {
    init_logging();
    let net = MeshNet::new();
    let b_recorder = Arc::new(Recorder::default());
    let c_recorder = Arc::new(Recorder::default());

    let a = Membership::start(fast_config("a"), net.endpoint(), None).expect("start a");
    let b = Membership::start(fast_config("b"), net.endpoint(), Some(b_recorder.clone()))
        .expect("start b");
    let c = Membership::start(fast_config("c"), net.endpoint(), Some(c_recorder.clone()))
        .expect("start c");
    b.join(&[a.local_addr()]).expect("b joins");
    c.join(&[a.local_addr()]).expect("c joins");
    assert!(wait_until(Duration::from_secs(5), || {
        a.members().len() == 3 && b.members().len() == 3 && c.members().len() == 3
    }));

    a.broadcast_user("greeting", Bytes::from_static(b"hello shoal"))
        .expect("broadcast");

    assert!(
        wait_until(Duration::from_secs(3), || {
            let heard = |recorder: &Recorder| {
                recorder
                    .user_messages()
                    .iter()
                    .any(|payload| &payload[..] == b"hello shoal")
            };
            heard(&b_recorder) && heard(&c_recorder)
        }),
        "gossip delivers the payload to every peer"
    );

    a.shutdown();
    b.shutdown();
    c.shutdown();
}

#[test]
fn graceful_leave_is_seen_as_departure() {
    init_logging();
    let net = MeshNet::new();
    let a = Membership::start(fast_config("a"), net.endpoint(), None).expect("start a");
    let b = Membership::start(fast_config("b"), net.endpoint(), None).expect("start b");
    b.join(&[a.local_addr()]).expect("join");
    assert!(wait_until(Duration::from_secs(3), || {
        a.members().len() == 2 && b.members().len() == 2
    }));

    b.leave(Duration::from_secs(2)).expect("leave");

    assert!(
        wait_until(Duration::from_secs(3), || {
            a.members()
                .iter()
                .any(|m| m.name == "b" && m.state == PeerState::Left)
        }),
        "a graceful leave is recorded as left, not dead"
    );

    b.shutdown();
    a.shutdown();
}

#[test]
fn crashed_peer_is_suspected_then_dead() {
    init_logging();
    let net = MeshNet::new();
    let a = Membership::start(fast_config("a"), net.endpoint(), None).expect("start a");
    let b = Membership::start(fast_config("b"), net.endpoint(), None).expect("start b");
    b.join(&[a.local_addr()]).expect("join");
    assert!(wait_until(Duration::from_secs(3), || {
        a.members().len() == 2 && b.members().len() == 2
    }));

    // Hard stop: no goodbye, the endpoint just goes dark.
    b.shutdown();

    assert!(
        wait_until(Duration::from_secs(10), || {
            a.members()
                .iter()
                .any(|m| m.name == "b" && m.state == PeerState::Dead)
        }),
        "failure detector declares the silent peer dead"
    );

    a.shutdown();
}

#[test]
fn metadata_updates_propagate() {
    init_logging();
    let net = MeshNet::new();
    let a = Membership::start(fast_config("a"), net.endpoint(), None).expect("start a");
    let b = Membership::start(fast_config("b"), net.endpoint(), None).expect("start b");
    b.join(&[a.local_addr()]).expect("join");
    assert!(wait_until(Duration::from_secs(3), || {
        a.members().len() == 2 && b.members().len() == 2
    }));

    a.set_meta(Bytes::from_static(b"zone=eu-west")).expect("set meta");

    assert!(
        wait_until(Duration::from_secs(3), || {
            b.members()
                .iter()
                .any(|m| m.name == "a" && &m.meta[..] == b"zone=eu-west")
        }),
        "fresh metadata rides the alive rebroadcast"
    );

    a.shutdown();
    b.shutdown();
}

#[test]
fn shutdown_is_idempotent_and_fails_operations() {
    init_logging();
    let net = MeshNet::new();
    let a = Membership::start(fast_config("a"), net.endpoint(), None).expect("start a");

    a.shutdown();
    a.shutdown();

    assert!(matches!(
        a.join(&["10.77.0.99:7946".parse().unwrap()]),
        Err(Error::Shutdown)
    ));
    assert!(matches!(a.leave(Duration::from_secs(1)), Err(Error::Shutdown)));
    assert!(matches!(
        a.broadcast_user("k", Bytes::from_static(b"x")),
        Err(Error::Shutdown)
    ));
    // Read-only accessors keep working on the final snapshot.
    assert_eq!(a.members().len(), 1);
}
