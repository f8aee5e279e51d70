//! UDP + TCP transport: one datagram socket and one stream listener on
//! the same port, each drained by a dedicated reader thread.

use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, bounded};

use super::{Conn, InboundStream, PacketEnvelope, Transport, TransportError};

/// Largest datagram the reader accepts.
const UDP_RECV_BUF: usize = 65536;

/// How long blocking socket reads wait before rechecking the shutdown
/// flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

/// Pending inbound streams before new connections are dropped.
const STREAM_BACKLOG: usize = 32;

pub struct NetTransport {
    udp: Arc<UdpSocket>,
    local_addr: SocketAddr,
    packet_rx: Receiver<PacketEnvelope>,
    stream_rx: Receiver<InboundStream>,
    shutdown: Arc<AtomicBool>,
    dropped_packets: Arc<AtomicU64>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl NetTransport {
    /// Bind the datagram socket and stream listener on `bind_addr` (port
    /// 0 picks an ephemeral port shared by both) and start the reader
    /// threads. `handoff_depth` bounds queued inbound packets; overflow
    /// drops the oldest.
    pub fn bind(bind_addr: SocketAddr, handoff_depth: usize) -> std::io::Result<Self> {
        let udp = UdpSocket::bind(bind_addr)?;
        udp.set_read_timeout(Some(SHUTDOWN_POLL))?;
        let local_addr = udp.local_addr()?;

        let tcp = TcpListener::bind(local_addr)?;
        tcp.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let dropped_packets = Arc::new(AtomicU64::new(0));
        let (packet_tx, packet_rx) = bounded(handoff_depth.max(1));
        let (stream_tx, stream_rx) = bounded(STREAM_BACKLOG);

        let udp = Arc::new(udp);
        let mut joins = Vec::new();

        {
            let udp = Arc::clone(&udp);
            let shutdown = Arc::clone(&shutdown);
            let dropped = Arc::clone(&dropped_packets);
            let overflow_rx = packet_rx.clone();
            joins.push(thread::spawn(move || {
                run_packet_loop(&udp, &packet_tx, &overflow_rx, &shutdown, &dropped);
            }));
        }
        {
            let shutdown = Arc::clone(&shutdown);
            joins.push(thread::spawn(move || {
                run_accept_loop(&tcp, &stream_tx, &shutdown);
            }));
        }

        Ok(Self {
            udp,
            local_addr,
            packet_rx,
            stream_rx,
            shutdown,
            dropped_packets,
            joins: Mutex::new(joins),
        })
    }

    /// Packets dropped because the inbound queue was full.
    #[must_use]
    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets.load(Ordering::Relaxed)
    }
}

impl Transport for NetTransport {
    fn write_packet(&self, buf: &[u8], to: SocketAddr) -> Result<Instant, TransportError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(TransportError::Shutdown);
        }
        self.udp.send_to(buf, to)?;
        Ok(Instant::now())
    }

    fn dial_stream(
        &self,
        to: SocketAddr,
        timeout: Duration,
    ) -> Result<Box<dyn Conn>, TransportError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(TransportError::Shutdown);
        }
        let stream = TcpStream::connect_timeout(&to, timeout).map_err(|err| {
            if err.kind() == std::io::ErrorKind::TimedOut {
                TransportError::DialTimeout(timeout)
            } else {
                TransportError::Io(err)
            }
        })?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn packet_rx(&self) -> &Receiver<PacketEnvelope> {
        &self.packet_rx
    }

    fn stream_rx(&self) -> &Receiver<InboundStream> {
        &self.stream_rx
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        let joins = {
            let mut joins = self.joins.lock().expect("transport joins lock");
            std::mem::take(&mut *joins)
        };
        for join in joins {
            let _ = join.join();
        }
    }
}

impl Drop for NetTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_packet_loop(
    udp: &UdpSocket,
    tx: &Sender<PacketEnvelope>,
    overflow_rx: &Receiver<PacketEnvelope>,
    shutdown: &AtomicBool,
    dropped: &AtomicU64,
) {
    let mut buf = vec![0u8; UDP_RECV_BUF];
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        match udp.recv_from(&mut buf) {
            Ok((len, from)) => {
                let envelope = PacketEnvelope {
                    buf: Bytes::copy_from_slice(&buf[..len]),
                    from,
                    at: Instant::now(),
                };
                if tx.try_send(envelope).is_err() {
                    // Queue full: shed the oldest packet, keep the newest.
                    if overflow_rx.try_recv().is_ok() {
                        dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    let envelope = PacketEnvelope {
                        buf: Bytes::copy_from_slice(&buf[..len]),
                        from,
                        at: Instant::now(),
                    };
                    if tx.try_send(envelope).is_err() {
                        dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => {
                if !shutdown.load(Ordering::Relaxed) {
                    tracing::warn!("packet receive error: {err}");
                }
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

fn run_accept_loop(listener: &TcpListener, tx: &Sender<InboundStream>, shutdown: &AtomicBool) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        match listener.accept() {
            Ok((stream, from)) => {
                if let Err(err) = stream.set_nonblocking(false) {
                    tracing::warn!(%from, "inbound stream failed to set blocking: {err}");
                    continue;
                }
                let _ = stream.set_nodelay(true);
                let inbound = InboundStream {
                    conn: Box::new(stream),
                    from,
                };
                if tx.try_send(inbound).is_err() {
                    tracing::warn!(%from, "inbound stream backlog full, dropping connection");
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(25));
            }
            Err(err) => {
                if !shutdown.load(Ordering::Relaxed) {
                    tracing::warn!("stream accept error: {err}");
                }
                thread::sleep(Duration::from_millis(25));
            }
        }
    }
}
