//! Member registry: the authoritative local view of every known peer.
//!
//! All liveness claims funnel through the three entry points `alive_node`,
//! `suspect_node`, and `dead_node`. Claims about one peer are ordered by
//! incarnation; claims about the local node are refuted instead of
//! applied. Every applied mutation queues its own rebroadcast under the
//! subject's name before the registry lock is released, so a superseded
//! claim never outlives the claim that replaced it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::seq::SliceRandom;

use crate::awareness::Awareness;
use crate::broadcast::BroadcastQueue;
use crate::config::Config;
use crate::proto::{
    self, Alive, Dead, Message, PeerState, PushNodeState, Suspect, VersionVector, encode_addr,
    encode_message,
};
use crate::suspicion::Suspicion;

/// A known peer as exposed to library users.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub addr: SocketAddr,
    pub meta: Bytes,
    pub state: PeerState,
    pub incarnation: u64,
    pub vsn: VersionVector,
}

/// Membership change notifications delivered to the delegate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemberEvent {
    Join(Member),
    Update(Member),
    Leave(Member),
}

struct PeerRecord {
    member: Member,
    state_change: Instant,
}

pub struct Registry {
    config: Arc<Config>,
    local_name: String,
    advertise: SocketAddr,
    incarnation: u64,
    leaving: bool,
    records: HashMap<String, PeerRecord>,
    probe_ring: Vec<String>,
    probe_idx: usize,
    suspicions: HashMap<String, Suspicion>,
    queue: BroadcastQueue,
    awareness: Awareness,
}

impl Registry {
    pub fn new(config: Arc<Config>, advertise: SocketAddr) -> Self {
        let awareness = Awareness::new(config.awareness_max_multiplier);
        Self {
            local_name: config.name.clone(),
            advertise,
            incarnation: 0,
            leaving: false,
            records: HashMap::new(),
            probe_ring: Vec::new(),
            probe_idx: 0,
            suspicions: HashMap::new(),
            queue: BroadcastQueue::new(),
            awareness,
            config,
        }
    }

    /// Declare the local node alive with the given metadata, queueing the
    /// announcement for gossip. Called at start and on metadata updates.
    pub fn local_alive(&mut self, meta: Bytes, now: Instant) -> Vec<MemberEvent> {
        self.incarnation += 1;
        let msg = Alive {
            incarnation: self.incarnation,
            node: self.local_name.clone(),
            addr: encode_addr(self.advertise.ip()),
            port: self.advertise.port(),
            meta,
            vsn: self.config.vsn(),
        };
        self.alive_node(msg, now, true)
    }

    /// Apply an alive claim. `bootstrap` marks the local node announcing
    /// itself, which bypasses refutation.
    pub fn alive_node(&mut self, msg: Alive, now: Instant, bootstrap: bool) -> Vec<MemberEvent> {
        if self.leaving && msg.node == self.local_name && !bootstrap {
            return Vec::new();
        }
        if !self.version_compatible(msg.vsn) {
            tracing::warn!(
                node = %msg.node,
                vsn = ?msg.vsn,
                "ignoring alive with incompatible protocol version"
            );
            return Vec::new();
        }
        let Some(addr) = proto::decode_addr(&msg.addr, msg.port) else {
            tracing::warn!(node = %msg.node, "ignoring alive with malformed address");
            return Vec::new();
        };

        let is_local = msg.node == self.local_name;
        let mut events = Vec::new();

        match self.records.get_mut(&msg.node) {
            None => {
                let member = Member {
                    name: msg.node.clone(),
                    addr,
                    meta: msg.meta.clone(),
                    state: PeerState::Alive,
                    incarnation: msg.incarnation,
                    vsn: msg.vsn,
                };
                self.records.insert(
                    msg.node.clone(),
                    PeerRecord {
                        member: member.clone(),
                        state_change: now,
                    },
                );
                self.probe_ring.push(msg.node.clone());
                if !is_local {
                    events.push(MemberEvent::Join(member));
                }
            }
            Some(record) => {
                if is_local && !bootstrap {
                    // A peer is spreading claims about us. Equal
                    // incarnation with our exact identity is an echo;
                    // anything else gets refuted so the wrong view dies.
                    if msg.incarnation < self.incarnation {
                        return events;
                    }
                    let echo = msg.incarnation == self.incarnation
                        && msg.meta == record.member.meta
                        && addr == record.member.addr;
                    if !echo {
                        self.refute(msg.incarnation);
                    }
                    return events;
                }

                if msg.incarnation < record.member.incarnation {
                    return events;
                }
                if msg.incarnation == record.member.incarnation && !bootstrap {
                    // Equal incarnations cannot be ordered; only the peer
                    // itself can move its own state forward.
                    return events;
                }

                let old_state = record.member.state;
                let meta_changed =
                    record.member.meta != msg.meta || record.member.addr != addr;
                record.member.addr = addr;
                record.member.meta = msg.meta.clone();
                record.member.incarnation = msg.incarnation;
                record.member.vsn = msg.vsn;
                if old_state != PeerState::Alive {
                    record.member.state = PeerState::Alive;
                    record.state_change = now;
                    self.suspicions.remove(&msg.node);
                }
                let member = record.member.clone();
                if !is_local {
                    match old_state {
                        PeerState::Dead | PeerState::Left => {
                            // Rejoining peer: make sure it is probed again.
                            if !self.probe_ring.contains(&msg.node) {
                                self.probe_ring.push(msg.node.clone());
                            }
                            events.push(MemberEvent::Join(member));
                        }
                        PeerState::Alive | PeerState::Suspect if meta_changed => {
                            events.push(MemberEvent::Update(member));
                        }
                        _ => {}
                    }
                }
            }
        }

        self.queue_message_broadcast(msg.node.clone(), &Message::Alive(msg), None);
        events
    }

    /// Apply a suspect claim. Claims about the local node are refuted.
    pub fn suspect_node(&mut self, msg: Suspect, now: Instant) -> Vec<MemberEvent> {
        let Some(record) = self.records.get(&msg.node) else {
            return Vec::new();
        };
        if msg.incarnation < record.member.incarnation {
            return Vec::new();
        }

        if let Some(suspicion) = self.suspicions.get_mut(&msg.node) {
            // Already under suspicion: an unseen accuser compresses the
            // deadline and the corroborated claim is worth re-gossiping.
            if suspicion.confirm(&msg.from) {
                self.queue_message_broadcast(msg.node.clone(), &Message::Suspect(msg), None);
            }
            return Vec::new();
        }

        if record.member.state != PeerState::Alive {
            return Vec::new();
        }

        if msg.node == self.local_name {
            self.refute(msg.incarnation);
            return Vec::new();
        }

        let record = self
            .records
            .get_mut(&msg.node)
            .expect("record checked above");
        record.member.state = PeerState::Suspect;
        record.member.incarnation = msg.incarnation;
        record.state_change = now;

        let n = self.records.len();
        let (expected, min, max) = self.suspicion_window(n);
        self.suspicions.insert(
            msg.node.clone(),
            Suspicion::new(&msg.from, expected, min, max, msg.incarnation, now),
        );
        tracing::debug!(node = %msg.node, from = %msg.from, "peer marked suspect");

        self.queue_message_broadcast(msg.node.clone(), &Message::Suspect(msg), None);
        Vec::new()
    }

    /// Apply a dead claim. A claim originated by the subject itself is a
    /// graceful leave; claims about the local node are refuted unless we
    /// are leaving.
    pub fn dead_node(&mut self, msg: Dead, now: Instant) -> Vec<MemberEvent> {
        let Some(record) = self.records.get_mut(&msg.node) else {
            return Vec::new();
        };
        if msg.incarnation < record.member.incarnation {
            return Vec::new();
        }

        if msg.node == self.local_name && !self.leaving {
            self.refute(msg.incarnation);
            return Vec::new();
        }

        if matches!(record.member.state, PeerState::Dead | PeerState::Left) {
            return Vec::new();
        }

        record.member.state = if msg.from == msg.node {
            PeerState::Left
        } else {
            PeerState::Dead
        };
        record.member.incarnation = msg.incarnation;
        record.state_change = now;
        let member = record.member.clone();
        self.suspicions.remove(&msg.node);
        tracing::debug!(node = %msg.node, from = %msg.from, state = ?member.state, "peer down");

        self.queue_message_broadcast(msg.node.clone(), &Message::Dead(msg), None);
        vec![MemberEvent::Leave(member)]
    }

    /// Merge a remote node list from a push/pull exchange. Remote claims
    /// of death are softened to suspicion so a single stale view cannot
    /// instantly kill a healthy peer.
    pub fn merge_remote_state(
        &mut self,
        states: Vec<PushNodeState>,
        now: Instant,
    ) -> Vec<MemberEvent> {
        let mut events = Vec::new();
        for state in states {
            match state.state {
                PeerState::Alive => {
                    let msg = Alive {
                        incarnation: state.incarnation,
                        node: state.name,
                        addr: state.addr,
                        port: state.port,
                        meta: state.meta,
                        vsn: state.vsn,
                    };
                    events.extend(self.alive_node(msg, now, false));
                }
                PeerState::Left => {
                    let msg = Dead {
                        incarnation: state.incarnation,
                        node: state.name.clone(),
                        from: state.name,
                    };
                    events.extend(self.dead_node(msg, now));
                }
                PeerState::Dead | PeerState::Suspect => {
                    let msg = Suspect {
                        incarnation: state.incarnation,
                        node: state.name,
                        from: self.local_name.clone(),
                    };
                    events.extend(self.suspect_node(msg, now));
                }
            }
        }
        events
    }

    /// Expire suspicion timers, converting timed-out suspects to dead.
    pub fn sweep_suspicions(&mut self, now: Instant) -> Vec<MemberEvent> {
        let expired: Vec<(String, u64)> = self
            .suspicions
            .iter()
            .filter(|(_, suspicion)| suspicion.expired(now))
            .map(|(name, suspicion)| (name.clone(), suspicion.incarnation()))
            .collect();

        let mut events = Vec::new();
        for (name, incarnation) in expired {
            self.suspicions.remove(&name);
            tracing::info!(node = %name, "suspicion timeout expired, declaring dead");
            let msg = Dead {
                incarnation,
                node: name,
                from: self.local_name.clone(),
            };
            events.extend(self.dead_node(msg, now));
        }
        events
    }

    /// The earliest pending suspicion deadline, if any.
    #[must_use]
    pub fn next_suspicion_deadline(&self) -> Option<Instant> {
        self.suspicions.values().map(Suspicion::deadline).min()
    }

    /// Next peer to probe in round-robin order, reshuffling at rotation
    /// boundaries. Dead and left peers are skipped; dead peers stay in
    /// the rotation for `dead_node_reclaim` so a restart is noticed.
    pub fn next_probe_target(&mut self, now: Instant) -> Option<Member> {
        // First drain the current rotation, then reshuffle once and scan
        // the fresh rotation in full.
        for _ in 0..2 {
            while self.probe_idx < self.probe_ring.len() {
                let name = self.probe_ring[self.probe_idx].clone();
                self.probe_idx += 1;

                if name == self.local_name {
                    continue;
                }
                let Some(record) = self.records.get(&name) else {
                    continue;
                };
                match record.member.state {
                    PeerState::Alive | PeerState::Suspect => return Some(record.member.clone()),
                    PeerState::Dead | PeerState::Left => continue,
                }
            }
            self.reshuffle(now);
            if self.probe_ring.is_empty() {
                return None;
            }
        }
        None
    }

    fn reshuffle(&mut self, now: Instant) {
        let reclaim = self.config.dead_node_reclaim;
        self.probe_ring = self
            .records
            .values()
            .filter(|record| match record.member.state {
                PeerState::Alive | PeerState::Suspect => true,
                PeerState::Dead => {
                    !reclaim.is_zero() && now.duration_since(record.state_change) < reclaim
                }
                PeerState::Left => false,
            })
            .map(|record| record.member.name.clone())
            .collect();
        self.probe_ring.shuffle(&mut rand::thread_rng());
        self.probe_idx = 0;
    }

    /// Up to `k` random alive peers, excluding the local node and any
    /// name in `exclude`.
    #[must_use]
    pub fn random_live_nodes(&self, k: usize, exclude: &[&str]) -> Vec<Member> {
        let mut candidates: Vec<&Member> = self
            .records
            .values()
            .map(|record| &record.member)
            .filter(|member| {
                member.state == PeerState::Alive
                    && member.name != self.local_name
                    && !exclude.contains(&member.name.as_str())
            })
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.into_iter().take(k).cloned().collect()
    }

    /// Up to `k` random gossip targets: alive and suspect peers, plus
    /// dead or departed peers whose state changed within
    /// `gossip_to_the_dead`.
    #[must_use]
    pub fn gossip_targets(&self, k: usize, now: Instant) -> Vec<Member> {
        let horizon = self.config.gossip_to_the_dead;
        let mut candidates: Vec<&PeerRecord> = self
            .records
            .values()
            .filter(|record| record.member.name != self.local_name)
            .filter(|record| match record.member.state {
                PeerState::Alive | PeerState::Suspect => true,
                PeerState::Dead | PeerState::Left => {
                    now.duration_since(record.state_change) <= horizon
                }
            })
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates
            .into_iter()
            .take(k)
            .map(|record| record.member.clone())
            .collect()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self
            .records
            .values()
            .map(|record| record.member.clone())
            .collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    /// Wire records for a push/pull exchange, the local node included.
    #[must_use]
    pub fn push_states(&self) -> Vec<PushNodeState> {
        self.records
            .values()
            .map(|record| PushNodeState {
                name: record.member.name.clone(),
                addr: encode_addr(record.member.addr.ip()),
                port: record.member.addr.port(),
                meta: record.member.meta.clone(),
                incarnation: record.member.incarnation,
                state: record.member.state,
                vsn: record.member.vsn,
            })
            .collect()
    }

    #[must_use]
    pub fn member(&self, name: &str) -> Option<Member> {
        self.records.get(name).map(|record| record.member.clone())
    }

    #[must_use]
    pub fn num_members(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn num_alive(&self) -> usize {
        self.records
            .values()
            .filter(|record| record.member.state == PeerState::Alive)
            .count()
    }

    #[must_use]
    pub fn local_incarnation(&self) -> u64 {
        self.incarnation
    }

    #[must_use]
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    #[must_use]
    pub fn awareness(&self) -> &Awareness {
        &self.awareness
    }

    pub fn awareness_mut(&mut self) -> &mut Awareness {
        &mut self.awareness
    }

    /// Begin a graceful leave: broadcast a self-originated dead claim so
    /// peers record us as departed rather than failed. Returns false when
    /// nobody is left to tell.
    pub fn begin_leave(
        &mut self,
        now: Instant,
        finished: Option<crossbeam::channel::Sender<()>>,
    ) -> bool {
        self.leaving = true;
        let msg = Dead {
            incarnation: self.incarnation,
            node: self.local_name.clone(),
            from: self.local_name.clone(),
        };
        let alone = self
            .records
            .values()
            .all(|record| record.member.name == self.local_name
                || matches!(record.member.state, PeerState::Dead | PeerState::Left));
        let _ = self.dead_node(msg.clone(), now);
        if alone {
            return false;
        }
        // dead_node queued the claim without a hook; requeue with one so
        // the caller can wait for the broadcast to drain.
        self.queue_message_broadcast(self.local_name.clone(), &Message::Dead(msg), finished);
        true
    }

    #[must_use]
    pub fn is_leaving(&self) -> bool {
        self.leaving
    }

    /// Queue an encoded message for gossip under `key`.
    pub fn queue_message_broadcast(
        &mut self,
        key: String,
        msg: &Message,
        finished: Option<crossbeam::channel::Sender<()>>,
    ) {
        match encode_message(msg) {
            Ok(payload) => self.queue.queue(key, payload, finished),
            Err(err) => tracing::error!(%key, "failed to encode broadcast: {err}"),
        }
    }

    /// Queue a pre-encoded broadcast (user messages).
    pub fn queue_raw_broadcast(
        &mut self,
        key: String,
        payload: Vec<u8>,
        finished: Option<crossbeam::channel::Sender<()>>,
    ) {
        self.queue.queue(key, payload, finished);
    }

    /// Drain queued broadcasts within a byte budget.
    pub fn pop_broadcasts(&mut self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let members = self.records.len();
        self.queue
            .pop(overhead, limit, members, self.config.retransmit_mult)
    }

    #[must_use]
    pub fn broadcast_queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Refute a claim against the local node: jump our incarnation above
    /// the claim and gossip a fresh alive. Needing to do this is a health
    /// signal, so awareness degrades.
    fn refute(&mut self, claimed_incarnation: u64) {
        self.incarnation = self.incarnation.max(claimed_incarnation) + 1;
        self.awareness.apply_delta(1);

        if let Some(record) = self.records.get_mut(&self.local_name) {
            record.member.incarnation = self.incarnation;
        }
        let meta = self
            .records
            .get(&self.local_name)
            .map(|record| record.member.meta.clone())
            .unwrap_or_default();
        let msg = Alive {
            incarnation: self.incarnation,
            node: self.local_name.clone(),
            addr: encode_addr(self.advertise.ip()),
            port: self.advertise.port(),
            meta,
            vsn: self.config.vsn(),
        };
        tracing::info!(
            incarnation = self.incarnation,
            "refuting claim against local node"
        );
        self.queue_message_broadcast(self.local_name.clone(), &Message::Alive(msg), None);
    }

    fn version_compatible(&self, vsn: VersionVector) -> bool {
        let [peer_min, peer_max, ..] = vsn;
        peer_min <= crate::proto::PROTOCOL_VERSION_MAX
            && peer_max >= crate::proto::PROTOCOL_VERSION_MIN
            && peer_min <= peer_max
    }

    fn suspicion_window(&self, members: usize) -> (u32, Duration, Duration) {
        let mut expected = self.config.suspicion_mult.saturating_sub(2);
        if members.saturating_sub(2) < expected as usize {
            expected = 0;
        }
        let node_scale = (members.max(1) as f64).log10().max(1.0);
        let min = self
            .config
            .probe_interval
            .mul_f64(f64::from(self.config.suspicion_mult) * node_scale);
        let max = min * self.config.suspicion_max_timeout_mult;
        (expected, min, max)
    }
}
