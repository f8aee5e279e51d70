#![allow(dead_code)]

pub mod mesh;
pub mod packets;

use std::sync::{Mutex, Once};
use std::time::{Duration, Instant};

use bytes::Bytes;
use shoal::{Config, Delegate, MemberEvent};

static INIT_LOGGING: Once = Once::new();

/// Route engine tracing to the test output; filter with `RUST_LOG`.
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

/// Tight timeouts for loopback scenarios.
pub fn fast_config(name: &str) -> Config {
    let mut config = Config::local(name);
    config.probe_interval = Duration::from_millis(200);
    config.probe_timeout = Duration::from_millis(100);
    config.gossip_interval = Duration::from_millis(50);
    config
}

/// A configuration whose probe loop stays out of the way, for scenarios
/// that inject state by hand.
pub fn quiet_config(name: &str) -> Config {
    let mut config = Config::local(name);
    config.probe_interval = Duration::from_secs(30);
    config.probe_timeout = Duration::from_secs(1);
    config
}

/// Delegate that records everything it is told.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<MemberEvent>>,
    pub user_messages: Mutex<Vec<Bytes>>,
}

impl Delegate for Recorder {
    fn notify_member(&self, event: MemberEvent) {
        self.events.lock().expect("events lock").push(event);
    }

    fn notify_user(&self, payload: Bytes) {
        self.user_messages
            .lock()
            .expect("user messages lock")
            .push(payload);
    }
}

impl Recorder {
    pub fn events(&self) -> Vec<MemberEvent> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn user_messages(&self) -> Vec<Bytes> {
        self.user_messages.lock().expect("user messages lock").clone()
    }
}
