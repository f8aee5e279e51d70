//! In-memory mesh transport: every endpoint gets a synthetic address,
//! packets and streams route through a shared switchboard, and links can
//! be cut to simulate partitions. No sockets involved.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, bounded, unbounded};
use shoal::transport::{Conn, InboundStream, PacketEnvelope, Transport, TransportError};

struct Endpoint {
    packet_tx: Sender<PacketEnvelope>,
    stream_tx: Sender<InboundStream>,
}

#[derive(Default)]
struct Switchboard {
    endpoints: HashMap<SocketAddr, Endpoint>,
    cut_links: HashSet<(SocketAddr, SocketAddr)>,
    next_host: u8,
}

/// A shared in-memory network.
#[derive(Clone, Default)]
pub struct MeshNet {
    inner: Arc<Mutex<Switchboard>>,
}

impl MeshNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new endpoint with a synthetic address.
    pub fn endpoint(&self) -> MeshTransport {
        let mut board = self.lock();
        board.next_host += 1;
        let addr: SocketAddr = format!("10.77.0.{}:7946", board.next_host)
            .parse()
            .expect("synthetic addr");

        let (packet_tx, packet_rx) = bounded(1024);
        let (stream_tx, stream_rx) = bounded(64);
        board.endpoints.insert(
            addr,
            Endpoint {
                packet_tx,
                stream_tx,
            },
        );
        MeshTransport {
            net: self.clone(),
            addr,
            packet_rx,
            stream_rx,
            down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Drop all traffic from `a` to `b` (one direction).
    pub fn cut(&self, a: SocketAddr, b: SocketAddr) {
        self.lock().cut_links.insert((a, b));
    }

    pub fn restore(&self, a: SocketAddr, b: SocketAddr) {
        self.lock().cut_links.remove(&(a, b));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Switchboard> {
        self.inner.lock().expect("mesh lock")
    }
}

/// One endpoint's view of the mesh.
pub struct MeshTransport {
    net: MeshNet,
    addr: SocketAddr,
    packet_rx: Receiver<PacketEnvelope>,
    stream_rx: Receiver<InboundStream>,
    down: Arc<AtomicBool>,
}

impl Transport for MeshTransport {
    fn write_packet(&self, buf: &[u8], to: SocketAddr) -> Result<Instant, TransportError> {
        if self.down.load(Ordering::Relaxed) {
            return Err(TransportError::Shutdown);
        }
        let board = self.net.lock();
        let lost = board.cut_links.contains(&(self.addr, to));
        if !lost {
            if let Some(endpoint) = board.endpoints.get(&to) {
                let _ = endpoint.packet_tx.try_send(PacketEnvelope {
                    buf: Bytes::copy_from_slice(buf),
                    from: self.addr,
                    at: Instant::now(),
                });
            }
            // An unknown destination loses the packet, as UDP would.
        }
        Ok(Instant::now())
    }

    fn dial_stream(
        &self,
        to: SocketAddr,
        _timeout: Duration,
    ) -> Result<Box<dyn Conn>, TransportError> {
        if self.down.load(Ordering::Relaxed) {
            return Err(TransportError::Shutdown);
        }
        let board = self.net.lock();
        if board.cut_links.contains(&(self.addr, to)) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "link cut",
            )));
        }
        let Some(endpoint) = board.endpoints.get(&to) else {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "no listener",
            )));
        };
        let (near, far) = pipe_pair();
        endpoint
            .stream_tx
            .try_send(InboundStream {
                conn: Box::new(far),
                from: self.addr,
            })
            .map_err(|_| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "stream backlog full",
                ))
            })?;
        Ok(Box::new(near))
    }

    fn packet_rx(&self) -> &Receiver<PacketEnvelope> {
        &self.packet_rx
    }

    fn stream_rx(&self) -> &Receiver<InboundStream> {
        &self.stream_rx
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn shutdown(&self) {
        if self.down.swap(true, Ordering::Relaxed) {
            return;
        }
        self.net.lock().endpoints.remove(&self.addr);
    }
}

/// An in-memory duplex stream honouring read timeouts.
pub struct PipeConn {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    read_timeout: Arc<Mutex<Option<Duration>>>,
}

pub fn pipe_pair() -> (PipeConn, PipeConn) {
    let (a_tx, a_rx) = unbounded();
    let (b_tx, b_rx) = unbounded();
    (
        PipeConn {
            tx: a_tx,
            rx: b_rx,
            pending: Vec::new(),
            read_timeout: Arc::new(Mutex::new(None)),
        },
        PipeConn {
            tx: b_tx,
            rx: a_rx,
            pending: Vec::new(),
            read_timeout: Arc::new(Mutex::new(None)),
        },
    )
}

impl Read for PipeConn {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pending.is_empty() {
            let timeout = self
                .read_timeout
                .lock()
                .expect("pipe timeout lock")
                .unwrap_or(Duration::from_secs(5));
            match self.rx.recv_timeout(timeout) {
                Ok(chunk) => self.pending = chunk,
                Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "pipe read timed out",
                    ));
                }
                Err(crossbeam::channel::RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

impl Write for PipeConn {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Conn for PipeConn {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        *self.read_timeout.lock().expect("pipe timeout lock") = timeout;
        Ok(())
    }

    fn set_write_timeout(&self, _timeout: Option<Duration>) -> std::io::Result<()> {
        Ok(())
    }
}
