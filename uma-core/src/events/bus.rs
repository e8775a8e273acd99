//! Topic-keyed pub/sub with bounded per-subscriber queues.
//!
//! Publishers never block: each subscription owns a bounded `VecDeque`, and
//! when it is full the oldest undelivered event is dropped and the
//! subscription's drop counter incremented. The subscriber stays connected.
//! Delivery is FIFO per subscriber.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use uuid::Uuid;

use super::Event;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Topic filter for one subscription. `All` receives every event.
#[derive(Debug, Clone)]
pub enum TopicFilter {
    All,
    Topics(HashSet<String>),
}

impl TopicFilter {
    pub fn topics<I, S>(iter: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Topics(iter.into_iter().map(Into::into).collect())
    }

    fn accepts(&self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::Topics(set) => set.iter().any(|topic| event.matches(topic)),
        }
    }
}

struct SubQueue {
    events: Mutex<VecDeque<Arc<Event>>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

struct Subscriber {
    filter: TopicFilter,
    queue: Arc<SubQueue>,
}

struct BusInner {
    subscribers: RwLock<std::collections::HashMap<Uuid, Subscriber>>,
    capacity: usize,
    published: AtomicU64,
    dropped_total: AtomicU64,
}

/// The daemon-wide event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.inner.subscribers.read().len())
            .field("capacity", &self.inner.capacity)
            .field(
                "published",
                &self.inner.published.load(Ordering::Relaxed),
            )
            .field(
                "dropped_total",
                &self.inner.dropped_total.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(std::collections::HashMap::new()),
                capacity: capacity.max(1),
                published: AtomicU64::new(0),
                dropped_total: AtomicU64::new(0),
            }),
        }
    }

    /// Register a subscription and hand back its receiving half.
    pub fn subscribe(&self, filter: TopicFilter) -> EventStream {
        let id = Uuid::new_v4();
        let queue = Arc::new(SubQueue {
            events: Mutex::new(VecDeque::with_capacity(self.inner.capacity)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        self.inner.subscribers.write().insert(
            id,
            Subscriber {
                filter,
                queue: queue.clone(),
            },
        );

        EventStream {
            id,
            queue,
            bus: self.inner.clone(),
        }
    }

    /// Fan an event out to every matching subscription. Non-blocking: a full
    /// queue drops its oldest pending event.
    pub fn publish(&self, event: Event) {
        let event = Arc::new(event);
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let subscribers = self.inner.subscribers.read();
        for sub in subscribers.values() {
            if !sub.filter.accepts(&event) {
                continue;
            }
            let mut queue = sub.queue.events.lock();
            if queue.len() >= self.inner.capacity {
                queue.pop_front();
                sub.queue.dropped.fetch_add(1, Ordering::Relaxed);
                self.inner.dropped_total.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event.clone());
            drop(queue);
            sub.queue.notify.notify_one();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Events published since startup.
    pub fn published_total(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Events dropped across all subscriptions since startup.
    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped_total.load(Ordering::Relaxed)
    }

    /// Close every subscription; pending events remain readable, after which
    /// `recv` returns `None`.
    pub fn shutdown(&self) {
        let subscribers = self.inner.subscribers.read();
        for sub in subscribers.values() {
            sub.queue.closed.store(true, Ordering::Release);
            sub.queue.notify.notify_one();
        }
    }
}

/// Receiving half of a subscription. Dropping it unsubscribes.
pub struct EventStream {
    id: Uuid,
    queue: Arc<SubQueue>,
    bus: Arc<BusInner>,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("id", &self.id)
            .field("pending", &self.queue.events.lock().len())
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl EventStream {
    /// Await the next event in FIFO order. Returns `None` once the bus has
    /// shut down and the queue is drained.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        loop {
            let notified = self.queue.notify.notified();
            if let Some(event) = self.queue.events.lock().pop_front() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.queue.events.lock().pop_front()
    }

    /// Events dropped from this subscription's queue due to overflow.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Replace the subscription's topic filter.
    pub fn set_filter(&self, filter: TopicFilter) {
        if let Some(sub) = self.bus.subscribers.write().get_mut(&self.id) {
            sub.filter = filter;
        }
    }

    /// A cloneable handle for updating this subscription's filter from
    /// another task (the receiving half stays exclusive).
    pub fn filter_handle(&self) -> FilterHandle {
        FilterHandle {
            id: self.id,
            bus: self.bus.clone(),
        }
    }
}

/// Updates a subscription's topic filter; see [`EventStream::filter_handle`].
#[derive(Clone)]
pub struct FilterHandle {
    id: Uuid,
    bus: Arc<BusInner>,
}

impl std::fmt::Debug for FilterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterHandle").field("id", &self.id).finish()
    }
}

impl FilterHandle {
    pub fn set(&self, filter: TopicFilter) {
        if let Some(sub) = self.bus.subscribers.write().get_mut(&self.id) {
            sub.filter = filter;
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.bus.subscribers.write().remove(&self.id);
    }
}
