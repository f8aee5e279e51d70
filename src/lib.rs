#![forbid(unsafe_code)]

//! Weakly-consistent cluster membership and failure detection.
//!
//! `shoal` keeps a group of cooperating processes aware of each other:
//! who is in the group, who is suspected of failure, who is confirmed
//! dead, and who left on purpose. Membership changes and small user
//! payloads spread through SWIM-style gossip: a periodic failure-detector
//! probe loop with indirect relays, incarnation-numbered refutation of
//! false suspicions, piggybacked broadcasts with retransmission damping,
//! and periodic push/pull anti-entropy over reliable streams.
//!
//! The engine is a library; it has no CLI and installs no global state.
//! Construct a [`Config`], start a [`Membership`], and point it at seed
//! peers:
//!
//! ```no_run
//! use shoal::{Config, Membership};
//!
//! let mut config = Config::lan("node-1");
//! config.bind_addr = "0.0.0.0:7946".parse().unwrap();
//! let membership = Membership::bind(config, None).unwrap();
//! membership.join(&["10.0.0.1:7946".parse().unwrap()]).unwrap();
//! for member in membership.members() {
//!     println!("{} is {:?}", member.name, member.state);
//! }
//! ```

pub mod awareness;
pub mod broadcast;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod latency;
pub mod probe;
pub mod proto;
pub mod pushpull;
pub mod registry;
pub mod suspicion;
pub mod transport;

pub use config::{Config, ConfigError};
pub use engine::{Delegate, META_MAX_SIZE, Membership, StatsSnapshot};
pub use error::Error;
pub use proto::{Keyring, PeerState, SecretKey};
pub use registry::{Member, MemberEvent};

pub type Result<T> = std::result::Result<T, Error>;
