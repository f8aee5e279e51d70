//! Probe-protocol scenarios driven by a hand-crafted endpoint.

use std::time::Duration;

use bytes::Bytes;
use shoal::Membership;
use shoal::proto::{Ack, IndirectPingReq, Message, Nack, Ping, encode_addr, encode_message};
use shoal::transport::Transport;

use crate::fixtures::mesh::MeshNet;
use crate::fixtures::packets::RawEndpoint;
use crate::fixtures::{quiet_config, wait_until};

fn ping_for(node: Option<&str>, seq_no: u32, source: &RawEndpoint) -> Message {
    let addr = source.transport.local_addr();
    Message::Ping(Ping {
        seq_no,
        node: node.map(str::to_string),
        source_addr: encode_addr(addr.ip()),
        source_port: addr.port(),
        source_node: "prober".into(),
    })
}

#[test]
fn compound_ping_is_answered_per_part() {
    let net = MeshNet::new();
    let engine = Membership::start(quiet_config("m0"), net.endpoint(), None).expect("start");
    let prober = RawEndpoint::new(net.endpoint(), &quiet_config("prober"));

    let ping = ping_for(Some("m0"), 42, &prober);
    prober.send(
        &[ping.clone(), ping.clone(), ping],
        engine.local_addr(),
    );

    let acks: Vec<Ack> = prober
        .drain(Duration::from_millis(500))
        .into_iter()
        .filter_map(|msg| match msg {
            Message::Ack(ack) if ack.seq_no == 42 => Some(ack),
            _ => None,
        })
        .collect();
    assert_eq!(acks.len(), 3, "each compound part gets its own ack");

    engine.shutdown();
}

#[test]
fn ping_for_wrong_node_is_ignored() {
    let net = MeshNet::new();
    let engine = Membership::start(quiet_config("m0"), net.endpoint(), None).expect("start");
    let prober = RawEndpoint::new(net.endpoint(), &quiet_config("prober"));

    prober.send(&[ping_for(Some("m0-bad"), 43, &prober)], engine.local_addr());

    let acks = prober
        .drain(Duration::from_millis(200))
        .into_iter()
        .filter(|msg| matches!(msg, Message::Ack(ack) if ack.seq_no == 43))
        .count();
    assert_eq!(acks, 0, "a mistargeted ping draws no reply");

    engine.shutdown();
}

#[test]
fn indirect_ping_is_relayed_and_acked() {
    let net = MeshNet::new();
    let relay = Membership::start(quiet_config("relay"), net.endpoint(), None).expect("start");
    let target = Membership::start(quiet_config("target"), net.endpoint(), None).expect("start");
    let prober = RawEndpoint::new(net.endpoint(), &quiet_config("prober"));

    let source = prober.transport.local_addr();
    let req = Message::IndirectPing(IndirectPingReq {
        seq_no: 100,
        target: encode_addr(target.local_addr().ip()),
        port: target.local_addr().port(),
        node: "target".into(),
        nack: true,
        source_addr: encode_addr(source.ip()),
        source_port: source.port(),
        source_node: "prober".into(),
    });
    prober.send(&[req], relay.local_addr());

    let got_ack = prober
        .drain(Duration::from_secs(1))
        .into_iter()
        .any(|msg| matches!(msg, Message::Ack(ack) if ack.seq_no == 100));
    assert!(got_ack, "relay forwards the target's ack under our seq");

    relay.shutdown();
    target.shutdown();
}

#[test]
fn unreachable_indirect_target_draws_a_nack() {
    let net = MeshNet::new();
    let relay = Membership::start(quiet_config("relay"), net.endpoint(), None).expect("start");
    let prober = RawEndpoint::new(net.endpoint(), &quiet_config("prober"));

    let source = prober.transport.local_addr();
    let req = Message::IndirectPing(IndirectPingReq {
        seq_no: 101,
        target: Bytes::from_static(&[10, 77, 0, 250]),
        port: 7946,
        node: "ghost".into(),
        nack: true,
        source_addr: encode_addr(source.ip()),
        source_port: source.port(),
        source_node: "prober".into(),
    });
    prober.send(&[req], relay.local_addr());

    let got_nack = prober
        .drain(Duration::from_secs(3))
        .into_iter()
        .any(|msg| matches!(msg, Message::Nack(Nack { seq_no: 101 })));
    assert!(got_nack, "relay reports it could not reach the target");

    relay.shutdown();
}

#[test]
fn corrupted_checksum_is_dropped_and_counted() {
    let net = MeshNet::new();
    let engine = Membership::start(quiet_config("m0"), net.endpoint(), None).expect("start");
    let prober = RawEndpoint::new(net.endpoint(), &quiet_config("prober"));

    let encoded = encode_message(&ping_for(Some("m0"), 44, &prober)).expect("encode");
    let mut packet = prober
        .dispatcher
        .seal_compound(&[encoded], true, false)
        .expect("seal");
    let last = packet.len() - 1;
    packet[last] ^= 0x01;
    prober.send_raw(&packet, engine.local_addr());

    assert!(
        wait_until(Duration::from_secs(1), || {
            engine.stats().checksum_failures == 1
        }),
        "corrupted packet counted as checksum failure"
    );
    let acks = prober
        .drain(Duration::from_millis(200))
        .into_iter()
        .filter(|msg| matches!(msg, Message::Ack(ack) if ack.seq_no == 44))
        .count();
    assert_eq!(acks, 0, "corrupted ping draws no reply");
    assert_eq!(engine.members().len(), 1, "no state change from bad packet");

    engine.shutdown();
}
