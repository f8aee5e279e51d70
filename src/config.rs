//! Engine configuration.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::proto::{
    DELEGATE_VERSION_MAX, DELEGATE_VERSION_MIN, Keyring, PROTOCOL_VERSION_MAX,
    PROTOCOL_VERSION_MIN, VersionVector,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("node name must not be empty")]
    EmptyName,
    #[error("label too long: {0} bytes (max 255)")]
    LabelTooLong(usize),
    #[error("{0} must be non-zero")]
    ZeroDuration(&'static str),
    #[error("probe_timeout must be shorter than probe_interval")]
    ProbeTimeoutTooLong,
    #[error("gossip_nodes must be at least 1")]
    NoGossipNodes,
    #[error("udp_buffer_size too small: {0} bytes (min 512)")]
    UdpBufferTooSmall(usize),
    #[error("protocol_version {0} outside supported range [{PROTOCOL_VERSION_MIN}, {PROTOCOL_VERSION_MAX}]")]
    UnsupportedProtocolVersion(u8),
}

/// Engine configuration. Construct via one of the presets and override
/// fields as needed; `validate` runs at engine start.
#[derive(Clone, Debug)]
pub struct Config {
    /// Unique node name within the cluster. Primary key for the peer.
    pub name: String,
    /// Address the transport binds its packet and stream listeners to.
    pub bind_addr: SocketAddr,
    /// Address advertised to peers when it differs from the bind address
    /// (NAT, containers). Defaults to the transport's local address.
    pub advertise_addr: Option<SocketAddr>,

    /// Cadence of the failure-detector probe loop.
    pub probe_interval: Duration,
    /// Deadline for a direct ping ack before escalating to indirect pings.
    pub probe_timeout: Duration,
    /// Number of relays asked to ping on our behalf when a direct probe
    /// times out.
    pub indirect_checks: usize,
    /// Whether probe timeouts track the observed RTT distribution instead
    /// of the fixed `probe_timeout`.
    pub adaptive_probe_timeout: bool,

    /// Multiplier for the broadcast retransmit cap
    /// `ceil(retransmit_mult * log2(n + 1))`.
    pub retransmit_mult: u32,
    /// Multiplier for the minimum suspicion window.
    pub suspicion_mult: u32,
    /// Multiplier applied to the minimum window to obtain the maximum.
    pub suspicion_max_timeout_mult: u32,

    /// Cadence of the gossip fanout loop.
    pub gossip_interval: Duration,
    /// Number of peers gossiped to per tick.
    pub gossip_nodes: usize,
    /// How long after death a peer keeps receiving gossip, measured from
    /// its last state change.
    pub gossip_to_the_dead: Duration,

    /// Base cadence of the push/pull anti-entropy loop; scaled up with
    /// cluster size.
    pub push_pull_interval: Duration,
    /// Cluster size at which push/pull scaling starts.
    pub push_pull_scale_base: usize,

    /// Wrap outgoing gossip packets in the compression envelope.
    pub enable_compression: bool,
    /// Encryption keys; `None` disables the encryption envelope.
    pub keyring: Option<Keyring>,
    /// Cluster label required on inbound packets when non-empty.
    pub label: String,
    /// Accept unlabelled packets even though a label is configured.
    pub skip_inbound_label_check: bool,

    /// Protocol version spoken on the wire; gates tag emission.
    pub protocol_version: u8,
    /// Version of the delegate payload format.
    pub delegate_version: u8,

    /// Upper bound of the awareness score; timeouts scale by up to
    /// `1 + awareness_max_multiplier`.
    pub awareness_max_multiplier: u8,
    /// How long a dead peer stays in the probe rotation so a restarted
    /// instance can be noticed. Zero removes dead peers immediately.
    pub dead_node_reclaim: Duration,

    /// Bound on queued inbound messages before the oldest are dropped.
    pub handoff_queue_depth: usize,
    /// Maximum UDP payload produced by the gossip and piggyback paths.
    pub udp_buffer_size: usize,
    /// Deadline for stream connect and per-operation stream I/O.
    pub tcp_timeout: Duration,
}

impl Config {
    /// Preset for nodes sharing a fast, reliable LAN.
    pub fn lan(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bind_addr: "0.0.0.0:7946".parse().expect("static addr"),
            advertise_addr: None,
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            indirect_checks: 3,
            adaptive_probe_timeout: true,
            retransmit_mult: 4,
            suspicion_mult: 4,
            suspicion_max_timeout_mult: 6,
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            gossip_to_the_dead: Duration::from_secs(30),
            push_pull_interval: Duration::from_secs(30),
            push_pull_scale_base: 32,
            enable_compression: true,
            keyring: None,
            label: String::new(),
            skip_inbound_label_check: false,
            protocol_version: PROTOCOL_VERSION_MAX,
            delegate_version: DELEGATE_VERSION_MAX,
            awareness_max_multiplier: 8,
            dead_node_reclaim: Duration::ZERO,
            handoff_queue_depth: 1024,
            udp_buffer_size: 1400,
            tcp_timeout: Duration::from_secs(10),
        }
    }

    /// Preset for processes on one machine (tight timeouts).
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            probe_interval: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(100),
            gossip_interval: Duration::from_millis(100),
            gossip_to_the_dead: Duration::from_secs(15),
            push_pull_interval: Duration::from_secs(15),
            tcp_timeout: Duration::from_secs(1),
            ..Self::lan(name)
        }
    }

    /// Preset for nodes spread across a WAN (loose timeouts, wider fanout).
    pub fn wan(name: impl Into<String>) -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            suspicion_mult: 6,
            gossip_interval: Duration::from_millis(500),
            gossip_nodes: 4,
            gossip_to_the_dead: Duration::from_secs(60),
            push_pull_interval: Duration::from_secs(60),
            tcp_timeout: Duration::from_secs(10),
            ..Self::lan(name)
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.label.len() > 255 {
            return Err(ConfigError::LabelTooLong(self.label.len()));
        }
        if self.probe_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("probe_interval"));
        }
        if self.probe_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("probe_timeout"));
        }
        if self.gossip_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("gossip_interval"));
        }
        if self.push_pull_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("push_pull_interval"));
        }
        if self.probe_timeout >= self.probe_interval {
            return Err(ConfigError::ProbeTimeoutTooLong);
        }
        if self.gossip_nodes == 0 {
            return Err(ConfigError::NoGossipNodes);
        }
        if self.udp_buffer_size < 512 {
            return Err(ConfigError::UdpBufferTooSmall(self.udp_buffer_size));
        }
        if !(PROTOCOL_VERSION_MIN..=PROTOCOL_VERSION_MAX).contains(&self.protocol_version) {
            return Err(ConfigError::UnsupportedProtocolVersion(self.protocol_version));
        }
        Ok(())
    }

    /// The protocol version vector advertised in alive messages.
    #[must_use]
    pub fn vsn(&self) -> VersionVector {
        [
            PROTOCOL_VERSION_MIN,
            PROTOCOL_VERSION_MAX,
            self.protocol_version,
            DELEGATE_VERSION_MIN,
            DELEGATE_VERSION_MAX,
            self.delegate_version,
        ]
    }

    /// Whether encryption is enabled.
    #[must_use]
    pub fn encryption_enabled(&self) -> bool {
        self.keyring.is_some()
    }
}
