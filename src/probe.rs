//! Failure-detector plumbing: sequence-numbered ack routing and the
//! accounting that turns probe outcomes into awareness deltas.
//!
//! The probe loop itself lives on the engine; what it needs from here is
//! a table that pairs in-flight sequence numbers with waiting probes, and
//! the nack arithmetic that distinguishes "target down" from "relay path
//! broken".

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, unbounded};

use crate::awareness::Awareness;
use crate::config::Config;
use crate::latency::LatencyMeter;

/// A response routed to a waiting probe.
#[derive(Clone, Debug)]
pub(crate) enum AckResult {
    Ack { payload: Bytes, at: Instant },
    Nack,
}

/// In-flight probes keyed by sequence number.
#[derive(Default)]
pub(crate) struct AckTable {
    waiters: Mutex<HashMap<u32, Sender<AckResult>>>,
}

impl AckTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register interest in responses for `seq_no`. The returned channel
    /// sees every ack and nack routed for it until `forget`.
    pub(crate) fn register(&self, seq_no: u32) -> Receiver<AckResult> {
        let (tx, rx) = unbounded();
        self.waiters.lock().expect("ack table lock").insert(seq_no, tx);
        rx
    }

    /// Route a response to its waiting probe. Returns false for unknown
    /// sequence numbers (stale or forged responses).
    pub(crate) fn resolve(&self, seq_no: u32, result: AckResult) -> bool {
        let waiters = self.waiters.lock().expect("ack table lock");
        match waiters.get(&seq_no) {
            Some(tx) => {
                let _ = tx.try_send(result);
                true
            }
            None => false,
        }
    }

    pub(crate) fn forget(&self, seq_no: u32) {
        self.waiters.lock().expect("ack table lock").remove(&seq_no);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.waiters.lock().expect("ack table lock").len()
    }
}

/// Nack bookkeeping for one probe's indirect phase. Relays that promised
/// a nack but never answered indicate our own connectivity is suspect, so
/// each missing response degrades awareness (bounded by the relay count).
#[derive(Debug)]
pub(crate) struct NackAccounting {
    expected: usize,
    received: usize,
}

impl NackAccounting {
    pub(crate) fn new(expected: usize) -> Self {
        Self {
            expected,
            received: 0,
        }
    }

    pub(crate) fn on_nack(&mut self) {
        if self.received < self.expected {
            self.received += 1;
        }
    }

    /// Awareness penalty for relays that never responded.
    pub(crate) fn missed_relays(&self) -> i32 {
        (self.expected - self.received) as i32
    }
}

/// The direct-ping ack deadline for the next probe: the configured floor,
/// optionally stretched to the observed RTT tail, scaled by awareness.
pub(crate) fn effective_probe_timeout(
    config: &Config,
    awareness: &Awareness,
    meter: &LatencyMeter,
) -> Duration {
    let base = if config.adaptive_probe_timeout {
        meter.probe_timeout(config.probe_timeout)
    } else {
        config.probe_timeout
    };
    awareness.scale(base)
}

/// The probe loop cadence, scaled by awareness.
pub(crate) fn effective_probe_interval(config: &Config, awareness: &Awareness) -> Duration {
    awareness.scale(config.probe_interval)
}
