//! Bounded flow retention with event fan-out.
//!
//! The store is a fixed-capacity ring of flow references plus an id index.
//! When full, the oldest insertion is evicted atomically with the new one.
//! Subscribers receive lifecycle events over bounded channels with
//! non-blocking sends: a subscriber that stops draining loses events, never
//! the traffic plane.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::mpsc;

use crate::proxy::flow::{FlowEvent, FlowEventType, FlowRef};

/// Default ring capacity when none is configured.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Default per-subscriber event buffer depth.
pub const DEFAULT_EVENT_BUFFER: usize = 128;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<FlowEvent>,
}

struct StoreInner {
    flows: Vec<Option<FlowRef>>,
    index: HashMap<String, FlowRef>,
    head: usize,
    count: usize,
    next_subscriber_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Thread-safe, fixed-capacity ring buffer of flows with pub/sub.
pub struct FlowStore {
    inner: RwLock<StoreInner>,
    capacity: usize,
    event_buffer: usize,
}

/// A registered event subscription. Dropping it (or passing it to
/// [`FlowStore::unsubscribe`]) closes the channel.
pub struct Subscription {
    id: u64,
    events: mpsc::Receiver<FlowEvent>,
}

impl Subscription {
    /// Receive the next event, or `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<FlowEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Result<FlowEvent, mpsc::error::TryRecvError> {
        self.events.try_recv()
    }
}

impl FlowStore {
    /// Create a store holding at most `capacity` flows (0 means the default).
    pub fn new(capacity: usize) -> FlowStore {
        FlowStore::with_event_buffer(capacity, DEFAULT_EVENT_BUFFER)
    }

    /// Create a store with an explicit per-subscriber event buffer depth.
    /// The depth is fixed for the lifetime of the store.
    pub fn with_event_buffer(capacity: usize, event_buffer: usize) -> FlowStore {
        let capacity = if capacity == 0 { DEFAULT_CAPACITY } else { capacity };
        let event_buffer = event_buffer.max(1);
        FlowStore {
            inner: RwLock::new(StoreInner {
                flows: vec![None; capacity],
                index: HashMap::new(),
                head: 0,
                count: 0,
                next_subscriber_id: 0,
                subscribers: Vec::new(),
            }),
            capacity,
            event_buffer,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store a new flow, evicting the oldest if full, and publish `new`.
    pub fn add(&self, flow: FlowRef) {
        let subscribers;
        {
            let mut inner = self.inner.write().unwrap();
            if inner.count == self.capacity {
                let head = inner.head;
                if let Some(old) = inner.flows[head].take() {
                    inner.index.remove(&old.id);
                }
            } else {
                inner.count += 1;
            }
            let head = inner.head;
            inner.flows[head] = Some(flow.clone());
            inner.index.insert(flow.id.clone(), flow.clone());
            inner.head = (inner.head + 1) % self.capacity;
            subscribers = snapshot_senders(&inner);
        }
        broadcast(
            &subscribers,
            FlowEvent {
                kind: FlowEventType::New,
                flow,
            },
        );
    }

    /// Publish a change to an existing flow. Ring contents are untouched.
    pub fn update(&self, flow: FlowRef, kind: FlowEventType) {
        let subscribers = {
            let inner = self.inner.read().unwrap();
            snapshot_senders(&inner)
        };
        broadcast(&subscribers, FlowEvent { kind, flow });
    }

    /// Look up a flow by id. Returns `None` if absent or already evicted.
    pub fn get(&self, id: &str) -> Option<FlowRef> {
        self.inner.read().unwrap().index.get(id).cloned()
    }

    /// Snapshot of stored flows in insertion order, oldest first.
    pub fn all(&self) -> Vec<FlowRef> {
        let inner = self.inner.read().unwrap();
        let mut result = Vec::with_capacity(inner.count);
        if inner.count < self.capacity {
            for slot in inner.flows.iter().take(inner.count) {
                if let Some(flow) = slot {
                    result.push(flow.clone());
                }
            }
        } else {
            for i in 0..self.capacity {
                let idx = (inner.head + i) % self.capacity;
                if let Some(flow) = &inner.flows[idx] {
                    result.push(flow.clone());
                }
            }
        }
        result
    }

    pub fn count(&self) -> usize {
        self.inner.read().unwrap().count
    }

    /// Drop all stored flows. Publishes nothing; subscriptions survive.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.flows = vec![None; self.capacity];
        inner.index.clear();
        inner.head = 0;
        inner.count = 0;
    }

    /// Register a new subscriber and return its event channel.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.event_buffer);
        let mut inner = self.inner.write().unwrap();
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner.subscribers.push(Subscriber { id, tx });
        Subscription { id, events: rx }
    }

    /// Remove a subscription, closing its channel.
    pub fn unsubscribe(&self, subscription: Subscription) {
        let mut inner = self.inner.write().unwrap();
        inner.subscribers.retain(|s| s.id != subscription.id);
    }
}

fn snapshot_senders(inner: &StoreInner) -> Vec<mpsc::Sender<FlowEvent>> {
    inner.subscribers.iter().map(|s| s.tx.clone()).collect()
}

/// Non-blocking fan-out: a full subscriber buffer drops the event for that
/// subscriber only.
fn broadcast(subscribers: &[mpsc::Sender<FlowEvent>], event: FlowEvent) {
    for tx in subscribers {
        let _ = tx.try_send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::proxy::flow::{CapturedRequest, Flow};

    fn flow(path: &str) -> FlowRef {
        Arc::new(Flow::new(
            "test",
            CapturedRequest {
                method: "GET".to_string(),
                url: path.to_string(),
                path: path.to_string(),
                host: "localhost".to_string(),
                headers: http::HeaderMap::new(),
                body: Vec::new(),
                proto: "HTTP/1.1".to_string(),
                body_truncated: false,
            },
        ))
    }

    #[test]
    fn add_and_get() {
        let store = FlowStore::new(4);
        let f = flow("/a");
        store.add(f.clone());
        assert_eq!(store.count(), 1);
        assert_eq!(store.get(&f.id).unwrap().id, f.id);
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn eviction_keeps_most_recent_capacity_flows() {
        let store = FlowStore::new(3);
        let flows: Vec<FlowRef> = (0..5).map(|i| flow(&format!("/{i}"))).collect();
        for f in &flows {
            store.add(f.clone());
        }

        assert_eq!(store.count(), 3);
        // Oldest two are gone from both the ring and the index.
        assert!(store.get(&flows[0].id).is_none());
        assert!(store.get(&flows[1].id).is_none());

        let all = store.all();
        let paths: Vec<String> = all.iter().map(|f| f.read().request.path.clone()).collect();
        assert_eq!(paths, vec!["/2", "/3", "/4"]);
    }

    #[test]
    fn all_returns_insertion_order_before_wrap() {
        let store = FlowStore::new(8);
        for i in 0..3 {
            store.add(flow(&format!("/{i}")));
        }
        let paths: Vec<String> = store
            .all()
            .iter()
            .map(|f| f.read().request.path.clone())
            .collect();
        assert_eq!(paths, vec!["/0", "/1", "/2"]);
    }

    #[test]
    fn clear_empties_ring_and_index() {
        let store = FlowStore::new(4);
        let f = flow("/a");
        store.add(f.clone());
        store.clear();
        assert_eq!(store.count(), 0);
        assert!(store.get(&f.id).is_none());
        assert!(store.all().is_empty());
    }

    #[tokio::test]
    async fn subscriber_receives_events_in_order() {
        let store = FlowStore::new(4);
        let mut sub = store.subscribe();

        let f = flow("/a");
        store.add(f.clone());
        store.update(f.clone(), FlowEventType::Complete);

        let first = sub.recv().await.unwrap();
        assert_eq!(first.kind, FlowEventType::New);
        assert_eq!(first.flow.id, f.id);
        let second = sub.recv().await.unwrap();
        assert_eq!(second.kind, FlowEventType::Complete);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_events_without_blocking() {
        let store = FlowStore::with_event_buffer(8, 1);
        let mut slow = store.subscribe();
        let mut fast = store.subscribe();

        // Three adds against a buffer of one: the slow subscriber keeps only
        // the first event; the store and other subscribers are unaffected.
        for i in 0..3 {
            store.add(flow(&format!("/{i}")));
            assert_eq!(fast.recv().await.unwrap().kind, FlowEventType::New);
        }
        assert_eq!(store.count(), 3);

        let only = slow.try_recv().unwrap();
        assert_eq!(only.flow.read().request.path, "/0");
        assert!(slow.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_closes_channel() {
        let store = FlowStore::new(4);
        let sub = store.subscribe();
        let mut sub2 = store.subscribe();
        store.unsubscribe(sub);

        store.add(flow("/a"));
        assert_eq!(sub2.recv().await.unwrap().kind, FlowEventType::New);
    }
}
