//! Transmit-limited broadcast queue.
//!
//! Outgoing gossip items are drained fewest-transmissions-first so fresh
//! news crowds out old news, and every item is retired after
//! `ceil(mult * log2(n + 1))` transmissions. Queueing an item under an
//! existing key invalidates the queued one: a newer claim about a peer
//! supersedes any older claim still circulating.

use std::collections::{BTreeMap, HashMap};

use crossbeam::channel::Sender;

/// Queue order: fewest transmits first, then insertion order.
type OrderKey = (u32, u64);

struct QueuedBroadcast {
    key: String,
    payload: Vec<u8>,
    /// Closed when the item is fully transmitted or superseded.
    finished: Option<Sender<()>>,
}

#[derive(Default)]
pub struct BroadcastQueue {
    next_id: u64,
    items: BTreeMap<OrderKey, QueuedBroadcast>,
    by_key: HashMap<String, OrderKey>,
}

/// Number of times an item is transmitted before it is retired.
#[must_use]
pub fn retransmit_limit(mult: u32, members: usize) -> u32 {
    let scale = ((members as f64) + 1.0).log2();
    (f64::from(mult) * scale).ceil() as u32
}

impl BroadcastQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a broadcast, invalidating any queued item with the same key.
    pub fn queue(&mut self, key: String, payload: Vec<u8>, finished: Option<Sender<()>>) {
        if let Some(order) = self.by_key.remove(&key) {
            if let Some(old) = self.items.remove(&order) {
                notify_finished(old);
            }
        }
        let order = (0, self.next_id);
        self.next_id += 1;
        self.by_key.insert(key.clone(), order);
        self.items.insert(
            order,
            QueuedBroadcast {
                key,
                payload,
                finished,
            },
        );
    }

    /// Drain up to `limit` bytes of broadcasts, charging `overhead` bytes
    /// of framing per item. Each returned item's transmit counter is
    /// bumped; items reaching the retransmit cap for a cluster of
    /// `members` peers are retired.
    pub fn pop(&mut self, overhead: usize, limit: usize, members: usize, mult: u32) -> Vec<Vec<u8>> {
        let cap = retransmit_limit(mult, members);

        let mut selected = Vec::new();
        let mut budget = limit;
        for (order, item) in &self.items {
            let cost = overhead + item.payload.len();
            if cost <= budget {
                budget -= cost;
                selected.push(*order);
            }
        }

        let mut out = Vec::with_capacity(selected.len());
        for order in selected {
            let Some(item) = self.items.remove(&order) else {
                continue;
            };
            out.push(item.payload.clone());
            let transmits = order.0 + 1;
            if transmits >= cap {
                self.by_key.remove(&item.key);
                notify_finished(item);
            } else {
                let order = (transmits, order.1);
                self.by_key.insert(item.key.clone(), order);
                self.items.insert(order, item);
            }
        }
        out
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// True if an item with this key is queued.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }
}

fn notify_finished(item: QueuedBroadcast) {
    if let Some(finished) = item.finished {
        let _ = finished.try_send(());
    }
}
