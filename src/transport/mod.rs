//! Transport contract consumed by the engine.
//!
//! The engine assumes nothing about packet delivery, ordering,
//! uniqueness, or fragmentation. Streams are assumed reliable and
//! ordered while open. Every implementation must deliver inbound traffic
//! through the channels with a receive timestamp taken as early as
//! possible, and must honour `shutdown`.

pub mod net;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::Receiver;
use thiserror::Error;

pub use net::NetTransport;

/// An inbound packet with its source and receive timestamp.
#[derive(Clone, Debug)]
pub struct PacketEnvelope {
    pub buf: Bytes,
    pub from: SocketAddr,
    pub at: Instant,
}

/// A bidirectional reliable byte stream with per-operation deadlines.
pub trait Conn: Read + Write + Send {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()>;
    fn set_write_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()>;
}

impl Conn for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }
}

/// An accepted inbound stream.
pub struct InboundStream {
    pub conn: Box<dyn Conn>,
    pub from: SocketAddr,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport is shut down")]
    Shutdown,
    #[error("dial timed out after {0:?}")]
    DialTimeout(Duration),
}

/// Narrow contract between the engine and the network.
pub trait Transport: Send + Sync {
    /// Best-effort unreliable send. Returns the completion timestamp used
    /// for RTT accounting.
    fn write_packet(&self, buf: &[u8], to: SocketAddr) -> Result<Instant, TransportError>;

    /// Open a reliable stream to a peer within `timeout`.
    fn dial_stream(&self, to: SocketAddr, timeout: Duration)
    -> Result<Box<dyn Conn>, TransportError>;

    /// Inbound packets.
    fn packet_rx(&self) -> &Receiver<PacketEnvelope>;

    /// Inbound accepted streams.
    fn stream_rx(&self) -> &Receiver<InboundStream>;

    /// The advertised local address (packet and stream listeners share
    /// the port).
    fn local_addr(&self) -> SocketAddr;

    /// Release sockets and stop listener threads. Idempotent.
    fn shutdown(&self);
}
