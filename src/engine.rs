//! The membership engine: background loops, inbound routing, and the
//! public API.
//!
//! Concurrency model: OS threads, one per long-lived loop (probe, gossip,
//! push/pull, packet ingest, stream ingest, suspicion sweep). A single
//! mutex serializes the registry and its broadcast queue; loops hold it
//! only for short critical sections and never across network I/O.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};

use crate::config::Config;
use crate::dispatch::{DispatchError, Dispatcher};
use crate::error::Error;
use crate::latency::LatencyMeter;
use crate::probe::{AckResult, AckTable, NackAccounting, effective_probe_interval, effective_probe_timeout};
use crate::proto::{
    self, Ack, IndirectPingReq, Message, Nack, PROTOCOL_VERSION_CRC, Ping, Suspect, encode_addr,
    encode_message,
};
use crate::pushpull::{
    self, StreamFrame, read_push_pull, read_stream_frame, write_push_pull, write_stream_message,
};
use crate::registry::{Member, MemberEvent, Registry};
use crate::transport::{InboundStream, PacketEnvelope, Transport};

/// How long loops block before rechecking for shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

/// Granularity of the suspicion sweep when a deadline is pending.
const SWEEP_GRANULARITY: Duration = Duration::from_millis(100);

/// Recently seen user payload checksums kept to damp re-circulation.
const USER_SEEN_WINDOW: usize = 128;

/// Upper bound on local node metadata.
pub const META_MAX_SIZE: usize = 512;

/// Application hooks. All methods have no-op defaults; implement what the
/// surrounding program cares about.
pub trait Delegate: Send + Sync {
    /// A peer joined, changed, or left the cluster.
    fn notify_member(&self, _event: MemberEvent) {}

    /// A user message arrived via gossip.
    fn notify_user(&self, _payload: Bytes) {}

    /// Opaque state appended to push/pull exchanges.
    fn local_state(&self, _join: bool) -> Bytes {
        Bytes::new()
    }

    /// Opaque remote state received from a push/pull exchange.
    fn merge_remote_state(&self, _state: Bytes, _join: bool) {}

    /// Metadata advertised in our alive messages (at most
    /// [`META_MAX_SIZE`] bytes).
    fn node_meta(&self) -> Bytes {
        Bytes::new()
    }

    /// Payload attached to outgoing acks.
    fn ack_payload(&self) -> Bytes {
        Bytes::new()
    }
}

/// Monotonic engine counters.
#[derive(Debug, Default)]
struct EngineStats {
    packets_received: AtomicU64,
    packets_sent: AtomicU64,
    dropped_messages: AtomicU64,
    checksum_failures: AtomicU64,
    label_mismatches: AtomicU64,
    decrypt_failures: AtomicU64,
    truncated_parts: AtomicU64,
}

/// A point-in-time copy of the engine counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_received: u64,
    pub packets_sent: u64,
    pub dropped_messages: u64,
    pub checksum_failures: u64,
    pub label_mismatches: u64,
    pub decrypt_failures: u64,
    pub truncated_parts: u64,
}

/// A running membership engine. Cheap to clone; all clones share one
/// engine.
#[derive(Clone)]
pub struct Membership {
    inner: Arc<Inner>,
}

struct Inner {
    /// Self-handle for short-lived helper threads (stream fallback,
    /// indirect relays, inbound streams).
    me: Weak<Inner>,
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    shared: Mutex<Registry>,
    latency: Mutex<LatencyMeter>,
    acks: AckTable,
    seq: AtomicU32,
    delegate: Option<Arc<dyn Delegate>>,
    stats: EngineStats,
    advertise: SocketAddr,
    user_seen: Mutex<VecDeque<u32>>,
    shutdown_flag: AtomicBool,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl Membership {
    /// Start an engine on a fresh [`crate::transport::NetTransport`]
    /// bound per the configuration.
    pub fn bind(config: Config, delegate: Option<Arc<dyn Delegate>>) -> Result<Self, Error> {
        let transport =
            crate::transport::NetTransport::bind(config.bind_addr, config.handoff_queue_depth)?;
        Self::start(config, transport, delegate)
    }

    /// Start an engine on an existing transport.
    pub fn start<T>(
        config: Config,
        transport: T,
        delegate: Option<Arc<dyn Delegate>>,
    ) -> Result<Self, Error>
    where
        T: Transport + 'static,
    {
        config
            .validate()
            .map_err(|err| Error::Protocol(err.to_string()))?;

        let transport: Arc<dyn Transport> = Arc::new(transport);
        let advertise = config.advertise_addr.unwrap_or_else(|| transport.local_addr());
        let dispatcher = Dispatcher::from_config(&config);
        let config = Arc::new(config);

        let meta = delegate.as_ref().map(|d| d.node_meta()).unwrap_or_default();
        if meta.len() > META_MAX_SIZE {
            return Err(Error::Protocol(format!(
                "node metadata too large: {} bytes (max {META_MAX_SIZE})",
                meta.len()
            )));
        }

        let mut registry = Registry::new(Arc::clone(&config), advertise);
        let events = registry.local_alive(meta, Instant::now());

        let (shutdown_tx, shutdown_rx) = bounded(0);
        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            dispatcher,
            shared: Mutex::new(registry),
            latency: Mutex::new(LatencyMeter::new(64)),
            acks: AckTable::new(),
            seq: AtomicU32::new(0),
            delegate,
            stats: EngineStats::default(),
            advertise,
            user_seen: Mutex::new(VecDeque::new()),
            shutdown_flag: AtomicBool::new(false),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            joins: Mutex::new(Vec::new()),
            transport,
            config,
        });
        inner.notify(events);

        let mut joins = Vec::new();
        for (name, entry) in [
            ("probe_loop", Inner::run_probe_loop as fn(&Inner)),
            ("gossip_loop", Inner::run_gossip_loop),
            ("push_pull_loop", Inner::run_push_pull_loop),
            ("packet_loop", Inner::run_packet_loop),
            ("stream_loop", Inner::run_stream_loop),
            ("suspicion_loop", Inner::run_suspicion_loop),
        ] {
            let inner = Arc::clone(&inner);
            let span =
                tracing::info_span!("membership", loop_name = name, node = %inner.config.name);
            joins.push(thread::spawn(move || {
                span.in_scope(|| entry(&inner));
            }));
        }
        *inner.joins.lock().expect("joins lock") = joins;

        Ok(Self { inner })
    }

    /// Contact seed peers and pull their member lists. Partial success
    /// counts as success; the error aggregates every per-peer failure.
    pub fn join(&self, seeds: &[SocketAddr]) -> Result<usize, Error> {
        self.inner.check_running()?;
        let mut contacted = 0;
        let mut attempts = Vec::new();
        for &seed in seeds {
            match self.inner.push_pull_with(seed, true) {
                Ok(()) => contacted += 1,
                Err(err) => {
                    tracing::warn!(peer = %seed, "join attempt failed: {err}");
                    attempts.push((seed, err.to_string()));
                }
            }
        }
        if contacted > 0 {
            Ok(contacted)
        } else {
            Err(Error::JoinFailed { attempts })
        }
    }

    /// Gracefully leave the cluster: gossip a self-originated departure
    /// and wait up to `timeout` for the broadcast to drain.
    pub fn leave(&self, timeout: Duration) -> Result<(), Error> {
        self.inner.check_running()?;
        let (tx, rx) = bounded(1);
        let has_peers = {
            let mut shared = self.inner.lock_shared();
            if shared.is_leaving() {
                return Ok(());
            }
            shared.begin_leave(Instant::now(), Some(tx))
        };
        if !has_peers {
            return Ok(());
        }
        match rx.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Ok(()),
        }
    }

    /// Queue a user payload for best-effort gossip under `key`. A newer
    /// payload with the same key supersedes an undelivered older one.
    pub fn broadcast_user(&self, key: &str, payload: Bytes) -> Result<(), Error> {
        self.inner.check_running()?;
        let encoded = encode_message(&Message::User(payload))?;
        self.inner.remember_user_payload(&encoded[1..]);
        let mut shared = self.inner.lock_shared();
        shared.queue_raw_broadcast(format!("user:{key}"), encoded, None);
        Ok(())
    }

    /// Update local metadata and gossip a fresh alive claim.
    pub fn set_meta(&self, meta: Bytes) -> Result<(), Error> {
        self.inner.check_running()?;
        if meta.len() > META_MAX_SIZE {
            return Err(Error::Protocol(format!(
                "node metadata too large: {} bytes (max {META_MAX_SIZE})",
                meta.len()
            )));
        }
        let events = {
            let mut shared = self.inner.lock_shared();
            shared.local_alive(meta, Instant::now())
        };
        self.inner.notify(events);
        Ok(())
    }

    /// Current member snapshot, the local node included.
    #[must_use]
    pub fn members(&self) -> Vec<Member> {
        self.inner.lock_shared().snapshot()
    }

    #[must_use]
    pub fn local_name(&self) -> String {
        self.inner.config.name.clone()
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.advertise
    }

    #[must_use]
    pub fn local_incarnation(&self) -> u64 {
        self.inner.lock_shared().local_incarnation()
    }

    /// Local health score in `[0, awareness_max_multiplier]`; zero is
    /// healthy.
    #[must_use]
    pub fn health_score(&self) -> u8 {
        self.inner.lock_shared().awareness().score()
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        let stats = &self.inner.stats;
        StatsSnapshot {
            packets_received: stats.packets_received.load(Ordering::Relaxed),
            packets_sent: stats.packets_sent.load(Ordering::Relaxed),
            dropped_messages: stats.dropped_messages.load(Ordering::Relaxed),
            checksum_failures: stats.checksum_failures.load(Ordering::Relaxed),
            label_mismatches: stats.label_mismatches.load(Ordering::Relaxed),
            decrypt_failures: stats.decrypt_failures.load(Ordering::Relaxed),
            truncated_parts: stats.truncated_parts.load(Ordering::Relaxed),
        }
    }

    /// Stop every loop, close the transport, and cancel timers.
    /// Idempotent; public operations fail with `Shutdown` afterwards.
    pub fn shutdown(&self) {
        if self.inner.shutdown_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner
            .shutdown_tx
            .lock()
            .expect("shutdown sender lock")
            .take();
        self.inner.transport.shutdown();
        let joins = {
            let mut joins = self.inner.joins.lock().expect("joins lock");
            std::mem::take(&mut *joins)
        };
        for join in joins {
            let _ = join.join();
        }
        tracing::info!(node = %self.inner.config.name, "membership engine shut down");
    }
}

impl Inner {
    fn check_running(&self) -> Result<(), Error> {
        if self.shutdown_flag.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    fn lock_shared(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.shared.lock().expect("registry lock")
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn notify(&self, events: Vec<MemberEvent>) {
        let Some(delegate) = &self.delegate else {
            return;
        };
        for event in events {
            delegate.notify_member(event);
        }
    }

    /// Sleep until the next tick, or return false when shutting down.
    fn sleep(&self, interval: Duration) -> bool {
        match self.shutdown_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => !self.shutdown_flag.load(Ordering::Relaxed),
            _ => false,
        }
    }

    // ---- outbound ----

    fn with_crc(&self) -> bool {
        self.config.protocol_version >= PROTOCOL_VERSION_CRC
    }

    /// Send one encoded message, piggybacking queued gossip that fits in
    /// the remaining datagram budget.
    fn send_with_piggyback(&self, encoded: Vec<u8>, to: SocketAddr) {
        let budget = self
            .config
            .udp_buffer_size
            .saturating_sub(self.dispatcher.overhead())
            .saturating_sub(proto::envelope::COMPOUND_HEADER_OVERHEAD)
            .saturating_sub(encoded.len() + proto::envelope::COMPOUND_PART_OVERHEAD);

        let mut parts = vec![encoded];
        if budget > 0 {
            let mut shared = self.lock_shared();
            parts.extend(shared.pop_broadcasts(proto::envelope::COMPOUND_PART_OVERHEAD, budget));
        }
        self.send_parts(parts, to);
    }

    fn send_parts(&self, parts: Vec<Vec<u8>>, to: SocketAddr) {
        let sealed = match self.dispatcher.seal_compound(
            &parts,
            self.with_crc(),
            self.config.enable_compression,
        ) {
            Ok(sealed) => sealed,
            Err(err) => {
                tracing::error!(peer = %to, "failed to seal packet: {err}");
                return;
            }
        };
        match self.transport.write_packet(&sealed, to) {
            Ok(_) => {
                self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => tracing::warn!(peer = %to, "packet send failed: {err}"),
        }
    }

    // ---- probe ----

    fn run_probe_loop(&self) {
        loop {
            let interval = {
                let shared = self.lock_shared();
                effective_probe_interval(&self.config, shared.awareness())
            };
            if !self.sleep(interval) {
                return;
            }
            self.probe_round();
        }
    }

    fn probe_round(&self) {
        let (target, timeout) = {
            let mut shared = self.lock_shared();
            let Some(target) = shared.next_probe_target(Instant::now()) else {
                return;
            };
            let meter = self.latency.lock().expect("latency lock");
            let timeout = effective_probe_timeout(&self.config, shared.awareness(), &meter);
            (target, timeout)
        };

        let seq_no = self.next_seq();
        let rx = self.acks.register(seq_no);
        let ping = Ping {
            seq_no,
            node: Some(target.name.clone()),
            source_addr: encode_addr(self.advertise.ip()),
            source_port: self.advertise.port(),
            source_node: self.config.name.clone(),
        };
        let sent_at = Instant::now();
        match encode_message(&Message::Ping(ping)) {
            Ok(encoded) => self.send_with_piggyback(encoded, target.addr),
            Err(err) => {
                tracing::error!("failed to encode ping: {err}");
                self.acks.forget(seq_no);
                return;
            }
        }

        // Phase 1: direct ack within the (awareness- and RTT-scaled)
        // probe timeout.
        if self.wait_for_ack(&rx, timeout, &mut NackAccounting::new(0)) {
            self.probe_succeeded(seq_no, sent_at.elapsed());
            return;
        }
        tracing::debug!(peer = %target.name, "direct probe timed out, going indirect");

        // Phase 2: indirect pings through random relays plus a stream
        // fallback, until the probe's share of the interval is spent.
        let relays = {
            let shared = self.lock_shared();
            shared.random_live_nodes(self.config.indirect_checks, &[&target.name])
        };
        let mut nacks = NackAccounting::new(relays.len());
        let indirect = IndirectPingReq {
            seq_no,
            target: encode_addr(target.addr.ip()),
            port: target.addr.port(),
            node: target.name.clone(),
            nack: true,
            source_addr: encode_addr(self.advertise.ip()),
            source_port: self.advertise.port(),
            source_node: self.config.name.clone(),
        };
        for relay in &relays {
            match encode_message(&Message::IndirectPing(indirect.clone())) {
                Ok(encoded) => self.send_with_piggyback(encoded, relay.addr),
                Err(err) => tracing::error!("failed to encode indirect ping: {err}"),
            }
        }
        self.spawn_stream_fallback(seq_no, &target);

        let interval = {
            let shared = self.lock_shared();
            effective_probe_interval(&self.config, shared.awareness())
        };
        let remaining = interval.saturating_sub(timeout).max(self.config.probe_timeout);
        if self.wait_for_ack(&rx, remaining, &mut nacks) {
            self.probe_succeeded(seq_no, sent_at.elapsed());
            return;
        }

        // Phase 3: the peer is unreachable from here; suspect it.
        self.acks.forget(seq_no);
        tracing::info!(peer = %target.name, "probe failed, marking suspect");
        let events = {
            let mut shared = self.lock_shared();
            shared
                .awareness_mut()
                .apply_delta(1 + nacks.missed_relays());
            shared.suspect_node(
                Suspect {
                    incarnation: target.incarnation,
                    node: target.name.clone(),
                    from: self.config.name.clone(),
                },
                Instant::now(),
            )
        };
        self.notify(events);
    }

    /// Wait for an ack on `rx`, counting nacks, until `timeout` elapses.
    fn wait_for_ack(
        &self,
        rx: &Receiver<AckResult>,
        timeout: Duration,
        nacks: &mut NackAccounting,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shutdown_flag.load(Ordering::Relaxed) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let slice = (deadline - now).min(SHUTDOWN_POLL);
            match rx.recv_timeout(slice) {
                Ok(AckResult::Ack { .. }) => return true,
                Ok(AckResult::Nack) => nacks.on_nack(),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }

    fn probe_succeeded(&self, seq_no: u32, rtt: Duration) {
        self.acks.forget(seq_no);
        self.latency.lock().expect("latency lock").observe(rtt);
        let mut shared = self.lock_shared();
        shared.awareness_mut().apply_delta(-1);
    }

    /// Stream ping fallback for the asymmetric case where UDP is lost in
    /// one direction but TCP still connects.
    fn spawn_stream_fallback(&self, seq_no: u32, target: &Member) {
        let Some(inner) = self.me.upgrade() else {
            return;
        };
        let target = target.clone();
        thread::spawn(move || {
            let ping = Message::Ping(Ping {
                seq_no,
                node: Some(target.name.clone()),
                source_addr: encode_addr(inner.advertise.ip()),
                source_port: inner.advertise.port(),
                source_node: inner.config.name.clone(),
            });
            let result = inner
                .transport
                .dial_stream(target.addr, inner.config.tcp_timeout)
                .map_err(Error::from_transport)
                .and_then(|mut conn| {
                    pushpull::set_deadlines(&*conn, inner.config.tcp_timeout)?;
                    write_stream_message(&mut *conn, &inner.dispatcher, &ping)?;
                    match read_stream_frame(&mut *conn, &inner.dispatcher)? {
                        StreamFrame::Message(Message::Ack(ack)) if ack.seq_no == seq_no => {
                            inner.acks.resolve(
                                seq_no,
                                AckResult::Ack {
                                    payload: ack.payload,
                                    at: Instant::now(),
                                },
                            );
                            Ok(())
                        }
                        StreamFrame::Message(Message::Ack(ack)) => Err(Error::SequenceMismatch {
                            got: ack.seq_no,
                            want: seq_no,
                        }),
                        _ => Err(Error::Protocol("unexpected stream fallback reply".into())),
                    }
                });
            if let Err(err) = result {
                tracing::debug!(peer = %target.name, "stream fallback ping failed: {err}");
            }
        });
    }

    // ---- gossip ----

    fn run_gossip_loop(&self) {
        loop {
            if !self.sleep(self.config.gossip_interval) {
                return;
            }
            self.gossip_round();
        }
    }

    fn gossip_round(&self) {
        let targets = {
            let shared = self.lock_shared();
            shared.gossip_targets(self.config.gossip_nodes, Instant::now())
        };
        if targets.is_empty() {
            return;
        }

        let budget = self
            .config
            .udp_buffer_size
            .saturating_sub(self.dispatcher.overhead())
            .saturating_sub(proto::envelope::COMPOUND_HEADER_OVERHEAD);
        for target in targets {
            let parts = {
                let mut shared = self.lock_shared();
                shared.pop_broadcasts(proto::envelope::COMPOUND_PART_OVERHEAD, budget)
            };
            if parts.is_empty() {
                return;
            }
            self.send_parts(parts, target.addr);
        }
    }

    // ---- push/pull ----

    fn run_push_pull_loop(&self) {
        loop {
            let interval = {
                let shared = self.lock_shared();
                scale_push_pull_interval(
                    self.config.push_pull_interval,
                    shared.num_members(),
                    self.config.push_pull_scale_base,
                )
            };
            if !self.sleep(interval) {
                return;
            }
            let peer = {
                let shared = self.lock_shared();
                shared.random_live_nodes(1, &[]).pop()
            };
            let Some(peer) = peer else { continue };
            if let Err(err) = self.push_pull_with(peer.addr, false) {
                tracing::warn!(peer = %peer.name, "push/pull exchange failed: {err}");
            }
        }
    }

    /// One reliable anti-entropy exchange with `addr`.
    fn push_pull_with(&self, addr: SocketAddr, join: bool) -> Result<(), Error> {
        let mut conn = self
            .transport
            .dial_stream(addr, self.config.tcp_timeout)
            .map_err(Error::from_transport)?;
        pushpull::set_deadlines(&*conn, self.config.tcp_timeout)?;

        let states = self.lock_shared().push_states();
        let user_state = self
            .delegate
            .as_ref()
            .map(|d| d.local_state(join))
            .unwrap_or_default();
        write_push_pull(
            &mut *conn,
            &self.dispatcher,
            &states,
            &user_state,
            join,
            self.config.enable_compression,
        )?;

        let (header, remote_states, remote_user) = read_push_pull(&mut *conn, &self.dispatcher)?;
        let events = {
            let mut shared = self.lock_shared();
            shared.merge_remote_state(remote_states, Instant::now())
        };
        self.notify(events);
        if !remote_user.is_empty() {
            if let Some(delegate) = &self.delegate {
                delegate.merge_remote_state(remote_user, header.join);
            }
        }
        Ok(())
    }

    // ---- inbound packets ----

    fn run_packet_loop(&self) {
        loop {
            match self.transport.packet_rx().recv_timeout(SHUTDOWN_POLL) {
                Ok(packet) => self.handle_packet(packet),
                Err(RecvTimeoutError::Timeout) => {
                    if self.shutdown_flag.load(Ordering::Relaxed) {
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn handle_packet(&self, packet: PacketEnvelope) {
        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        let opened = match self.dispatcher.open_packet(&packet.buf) {
            Ok(opened) => opened,
            Err(err) => {
                self.count_dispatch_error(&err);
                tracing::warn!(from = %packet.from, "dropping packet: {err}");
                return;
            }
        };
        if opened.truncated_parts > 0 {
            self.stats
                .truncated_parts
                .fetch_add(opened.truncated_parts as u64, Ordering::Relaxed);
            tracing::warn!(
                from = %packet.from,
                truncated = opened.truncated_parts,
                "compound packet truncated"
            );
        }
        for err in &opened.part_errors {
            self.count_dispatch_error(err);
            tracing::warn!(from = %packet.from, "dropping compound part: {err}");
        }
        for msg in opened.messages {
            self.handle_message(msg, packet.from, packet.at);
        }
    }

    fn count_dispatch_error(&self, err: &DispatchError) {
        let counter = match err {
            DispatchError::ChecksumMismatch => &self.stats.checksum_failures,
            DispatchError::LabelMismatch { .. } => &self.stats.label_mismatches,
            DispatchError::NoKeyring
            | DispatchError::PlaintextRejected
            | DispatchError::Decrypt(_) => &self.stats.decrypt_failures,
            _ => &self.stats.dropped_messages,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn handle_message(&self, msg: Message, from: SocketAddr, at: Instant) {
        match msg {
            Message::Ping(ping) => self.handle_ping(ping, from),
            Message::IndirectPing(req) => self.handle_indirect_ping(req, from),
            Message::Ack(ack) => {
                if !self.acks.resolve(
                    ack.seq_no,
                    AckResult::Ack {
                        payload: ack.payload,
                        at,
                    },
                ) {
                    tracing::debug!(from = %from, seq_no = ack.seq_no, "stale ack ignored");
                }
            }
            Message::Nack(nack) => {
                if !self.acks.resolve(nack.seq_no, AckResult::Nack) {
                    tracing::debug!(from = %from, seq_no = nack.seq_no, "stale nack ignored");
                }
            }
            Message::Suspect(suspect) => {
                let events = {
                    let mut shared = self.lock_shared();
                    shared.suspect_node(suspect, Instant::now())
                };
                self.notify(events);
            }
            Message::Alive(alive) => {
                let events = {
                    let mut shared = self.lock_shared();
                    shared.alive_node(alive, Instant::now(), false)
                };
                self.notify(events);
            }
            Message::Dead(dead) => {
                let events = {
                    let mut shared = self.lock_shared();
                    shared.dead_node(dead, Instant::now())
                };
                self.notify(events);
            }
            Message::User(payload) => self.handle_user(payload),
            Message::Err(resp) => {
                tracing::warn!(from = %from, "remote reported error: {}", resp.error);
            }
        }
    }

    fn handle_ping(&self, ping: Ping, from: SocketAddr) {
        if let Some(node) = &ping.node {
            if node != &self.config.name {
                tracing::warn!(
                    from = %from,
                    got = %node,
                    "ping for wrong node, dropping"
                );
                return;
            }
        }
        let ack = Message::Ack(Ack {
            seq_no: ping.seq_no,
            payload: self
                .delegate
                .as_ref()
                .map(|d| d.ack_payload())
                .unwrap_or_default(),
        });
        let reply_to = proto::decode_addr(&ping.source_addr, ping.source_port).unwrap_or(from);
        match encode_message(&ack) {
            Ok(encoded) => self.send_with_piggyback(encoded, reply_to),
            Err(err) => tracing::error!("failed to encode ack: {err}"),
        }
    }

    /// Relay a ping on behalf of a prober that cannot reach the target
    /// directly. The ack (or a nack after our own timeout) flows back
    /// under the requester's sequence number.
    fn handle_indirect_ping(&self, req: IndirectPingReq, from: SocketAddr) {
        let Some(target_addr) = proto::decode_addr(&req.target, req.port) else {
            tracing::warn!(from = %from, "indirect ping with malformed target, dropping");
            return;
        };
        let reply_to = proto::decode_addr(&req.source_addr, req.source_port).unwrap_or(from);

        let local_seq = self.next_seq();
        let rx = self.acks.register(local_seq);
        let ping = Ping {
            seq_no: local_seq,
            node: Some(req.node.clone()),
            source_addr: encode_addr(self.advertise.ip()),
            source_port: self.advertise.port(),
            source_node: self.config.name.clone(),
        };
        match encode_message(&Message::Ping(ping)) {
            Ok(encoded) => self.send_with_piggyback(encoded, target_addr),
            Err(err) => {
                tracing::error!("failed to encode relayed ping: {err}");
                self.acks.forget(local_seq);
                return;
            }
        }

        let Some(inner) = self.me.upgrade() else {
            self.acks.forget(local_seq);
            return;
        };
        let timeout = self.config.probe_timeout;
        thread::spawn(move || {
            let got_ack = matches!(rx.recv_timeout(timeout), Ok(AckResult::Ack { .. }));
            inner.acks.forget(local_seq);

            let reply = if got_ack {
                Message::Ack(Ack {
                    seq_no: req.seq_no,
                    payload: Bytes::new(),
                })
            } else if req.nack {
                Message::Nack(Nack { seq_no: req.seq_no })
            } else {
                return;
            };
            match encode_message(&reply) {
                Ok(encoded) => inner.send_with_piggyback(encoded, reply_to),
                Err(err) => tracing::error!("failed to encode relay reply: {err}"),
            }
        });
    }

    fn handle_user(&self, payload: Bytes) {
        if !self.remember_user_payload(&payload) {
            return;
        }
        if let Some(delegate) = &self.delegate {
            delegate.notify_user(payload.clone());
        }
        // Keep the rumour spreading; the checksum key collapses duplicate
        // copies racing through the queue.
        let checksum = crc32fast::hash(&payload);
        match encode_message(&Message::User(payload)) {
            Ok(encoded) => {
                let mut shared = self.lock_shared();
                shared.queue_raw_broadcast(format!("user:{checksum:08x}"), encoded, None);
            }
            Err(err) => tracing::error!("failed to re-encode user message: {err}"),
        }
    }

    /// Record a user payload; returns false when it was already seen
    /// recently (damps gossip echo).
    fn remember_user_payload(&self, payload: &[u8]) -> bool {
        let checksum = crc32fast::hash(payload);
        let mut seen = self.user_seen.lock().expect("user seen lock");
        if seen.contains(&checksum) {
            return false;
        }
        while seen.len() >= USER_SEEN_WINDOW {
            seen.pop_front();
        }
        seen.push_back(checksum);
        true
    }

    // ---- inbound streams ----

    fn run_stream_loop(&self) {
        loop {
            match self.transport.stream_rx().recv_timeout(SHUTDOWN_POLL) {
                Ok(inbound) => {
                    let Some(inner) = self.me.upgrade() else {
                        return;
                    };
                    thread::spawn(move || inner.handle_stream(inbound));
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.shutdown_flag.load(Ordering::Relaxed) {
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn handle_stream(&self, mut inbound: InboundStream) {
        let from = inbound.from;
        if let Err(err) = self.serve_stream(&mut inbound) {
            tracing::warn!(from = %from, "inbound stream failed: {err}");
            // Best-effort error reply so the remote fails fast instead of
            // waiting out its read deadline.
            let resp = Message::Err(proto::ErrorResp {
                error: err.to_string(),
            });
            let _ = write_stream_message(&mut *inbound.conn, &self.dispatcher, &resp);
        }
    }

    fn serve_stream(&self, inbound: &mut InboundStream) -> Result<(), Error> {
        pushpull::set_deadlines(&*inbound.conn, self.config.tcp_timeout)?;
        match read_stream_frame(&mut *inbound.conn, &self.dispatcher)? {
            StreamFrame::PushPull {
                header,
                states,
                user_state,
            } => {
                // Answer with our view first so a slow merge cannot stall
                // the remote, then fold in theirs.
                let local_states = self.lock_shared().push_states();
                let local_user = self
                    .delegate
                    .as_ref()
                    .map(|d| d.local_state(header.join))
                    .unwrap_or_default();
                write_push_pull(
                    &mut *inbound.conn,
                    &self.dispatcher,
                    &local_states,
                    &local_user,
                    false,
                    self.config.enable_compression,
                )?;

                let events = {
                    let mut shared = self.lock_shared();
                    shared.merge_remote_state(states, Instant::now())
                };
                self.notify(events);
                if !user_state.is_empty() {
                    if let Some(delegate) = &self.delegate {
                        delegate.merge_remote_state(user_state, header.join);
                    }
                }
                Ok(())
            }
            StreamFrame::Message(Message::Ping(ping)) => {
                if let Some(node) = &ping.node {
                    if node != &self.config.name {
                        return Err(Error::WrongNode {
                            got: node.clone(),
                            want: self.config.name.clone(),
                        });
                    }
                }
                let ack = Message::Ack(Ack {
                    seq_no: ping.seq_no,
                    payload: self
                        .delegate
                        .as_ref()
                        .map(|d| d.ack_payload())
                        .unwrap_or_default(),
                });
                write_stream_message(&mut *inbound.conn, &self.dispatcher, &ack)
            }
            StreamFrame::Message(other) => Err(Error::Protocol(format!(
                "unexpected stream message {:?}",
                other.message_type()
            ))),
        }
    }

    // ---- suspicion sweep ----

    fn run_suspicion_loop(&self) {
        loop {
            let wait = {
                let shared = self.lock_shared();
                match shared.next_suspicion_deadline() {
                    Some(deadline) => deadline
                        .saturating_duration_since(Instant::now())
                        .min(SWEEP_GRANULARITY),
                    None => SHUTDOWN_POLL,
                }
            };
            if !self.sleep(wait.max(Duration::from_millis(1))) {
                return;
            }
            let events = {
                let mut shared = self.lock_shared();
                shared.sweep_suspicions(Instant::now())
            };
            self.notify(events);
        }
    }
}

impl Error {
    fn from_transport(err: crate::transport::TransportError) -> Self {
        use crate::transport::TransportError;
        match err {
            TransportError::Io(err) => Error::Transport(err),
            TransportError::Shutdown => Error::Shutdown,
            TransportError::DialTimeout(timeout) => Error::Timeout(timeout),
        }
    }
}

/// Anti-entropy cadence grows logarithmically with cluster size to keep
/// aggregate stream traffic bounded.
fn scale_push_pull_interval(base: Duration, members: usize, scale_base: usize) -> Duration {
    if members <= scale_base {
        return base;
    }
    let factor =
        ((members as f64) + 1.0).log2() / ((scale_base.max(1) as f64) + 1.0).log2();
    base.mul_f64(factor.max(1.0))
}
