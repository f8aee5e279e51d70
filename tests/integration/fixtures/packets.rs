//! Raw packet crafting and draining for attacker-style endpoints that
//! speak the wire format without running an engine.

use std::time::{Duration, Instant};

use shoal::Config;
use shoal::dispatch::Dispatcher;
use shoal::proto::{Message, encode_message};
use shoal::transport::Transport;

use super::mesh::MeshTransport;

/// A mesh endpoint driven by hand.
pub struct RawEndpoint {
    pub transport: MeshTransport,
    pub dispatcher: Dispatcher,
}

impl RawEndpoint {
    pub fn new(transport: MeshTransport, config: &Config) -> Self {
        Self {
            transport,
            dispatcher: Dispatcher::from_config(config),
        }
    }

    /// Seal and send one or more messages as a single packet.
    pub fn send(&self, msgs: &[Message], to: std::net::SocketAddr) {
        let parts: Vec<Vec<u8>> = msgs
            .iter()
            .map(|msg| encode_message(msg).expect("encode"))
            .collect();
        let packet = self
            .dispatcher
            .seal_compound(&parts, false, false)
            .expect("seal");
        self.transport.write_packet(&packet, to).expect("send");
    }

    /// Send pre-sealed packet bytes verbatim.
    pub fn send_raw(&self, packet: &[u8], to: std::net::SocketAddr) {
        self.transport.write_packet(packet, to).expect("send");
    }

    /// Drain every message that arrives within `window`.
    pub fn drain(&self, window: Duration) -> Vec<Message> {
        let deadline = Instant::now() + window;
        let mut messages = Vec::new();
        loop {
            let now = Instant::now();
            if now >= deadline {
                return messages;
            }
            match self.transport.packet_rx().recv_timeout(deadline - now) {
                Ok(packet) => {
                    if let Ok(opened) = self.dispatcher.open_packet(&packet.buf) {
                        messages.extend(opened.messages);
                    }
                }
                Err(_) => return messages,
            }
        }
    }
}
