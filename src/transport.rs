//! Publish/subscribe shim standing in for memory-mapped registers.
//!
//! Every SmartIo channel is a handful of named topics in a shared key/value store.
//! A [`Publisher`] writes a topic (fire-and-forget, no acknowledgement) and a
//! [`Subscriber`] reads the most recent value, or its default if nothing has
//! arrived. Subscribers created with `send_all` also queue every update so rapid
//! toggles are not coalesced away.
//!
//! Listeners registered with [`ValueStore::add_listener`] run synchronously on the
//! publishing thread after the store lock is released; the simulated firmware and
//! the interrupt/DMA primitives are built on them.

use crate::clock::FpgaClock;
use crate::consts;
use log::trace;
use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A value carried by a topic.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Raw(Vec<u8>),
}

/// Rust types that can be stored in a topic.
pub trait TopicValue: Clone + Send + 'static {
    fn into_value(self) -> Value;
    fn from_value(value: &Value) -> Option<Self>;
}

impl TopicValue for bool {
    fn into_value(self) -> Value {
        Value::Boolean(self)
    }
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }
}

impl TopicValue for i64 {
    fn into_value(self) -> Value {
        Value::Integer(self)
    }
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }
}

impl TopicValue for f64 {
    fn into_value(self) -> Value {
        Value::Double(self)
    }
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl TopicValue for Vec<u8> {
    fn into_value(self) -> Value {
        Value::Raw(self)
    }
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Raw(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// A value together with the timestamp it was published at.
#[derive(Debug, Clone, PartialEq)]
pub struct Timestamped<T> {
    pub value: T,
    pub time_us: u64,
}

/// Options for publishers and subscribers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PubSubOptions {
    /// Requested update period. The store hands every update to its
    /// subscribers and listeners as soon as it is set; the period is only
    /// reported in the publish log.
    pub periodic: Duration,
    /// Queue every update instead of only the latest.
    pub send_all: bool,
    /// Deliver repeated identical values.
    pub keep_duplicates: bool,
}

impl Default for PubSubOptions {
    fn default() -> Self {
        PubSubOptions {
            periodic: consts::DEFAULT_PERIODIC,
            send_all: false,
            keep_duplicates: false,
        }
    }
}

impl PubSubOptions {
    /// Every update delivered, duplicates kept, 5 ms period. Used by all SmartIo endpoints.
    pub fn all_updates() -> Self {
        PubSubOptions {
            periodic: consts::SMART_IO_PERIODIC,
            send_all: true,
            keep_duplicates: true,
        }
    }
}

type Listener = Arc<dyn Fn(&str, &Value, u64) + Send + Sync>;

/// Identifies a registered listener for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug)]
struct SubscriberQueue {
    send_all: bool,
    updates: VecDeque<Timestamped<Value>>,
}

#[derive(Debug, Default)]
struct TopicEntry {
    last: Option<Timestamped<Value>>,
    queues: HashMap<u64, SubscriberQueue>,
}

#[derive(Default)]
struct StoreState {
    topics: HashMap<String, TopicEntry>,
    listeners: HashMap<String, Vec<(u64, Listener)>>,
    next_id: u64,
}

struct StoreInner {
    state: Mutex<StoreState>,
    clock: FpgaClock,
    queue_depth: usize,
}

/// Shared in-process key/value store. Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct ValueStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for ValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueStore")
            .field("queue_depth", &self.inner.queue_depth)
            .finish_non_exhaustive()
    }
}

impl ValueStore {
    /// Creates an empty store stamping updates with `clock`.
    pub fn new(clock: FpgaClock, queue_depth: usize) -> Self {
        ValueStore {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState::default()),
                clock,
                queue_depth: queue_depth.max(1),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The clock used to stamp updates.
    pub fn clock(&self) -> FpgaClock {
        self.inner.clock
    }

    /// Creates a publisher for `topic`.
    pub fn publish<T: TopicValue>(&self, topic: &str, options: PubSubOptions) -> Publisher<T> {
        self.state().topics.entry(topic.to_string()).or_default();
        trace!("Publishing {} (period {:?})", topic, options.periodic);
        Publisher {
            store: self.clone(),
            topic: topic.to_string(),
            options,
            _marker: PhantomData,
        }
    }

    /// Creates a subscriber for `topic` returning `default` until a value arrives.
    pub fn subscribe<T: TopicValue>(
        &self,
        topic: &str,
        default: T,
        options: PubSubOptions,
    ) -> Subscriber<T> {
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .queues
            .insert(
                id,
                SubscriberQueue {
                    send_all: options.send_all,
                    updates: VecDeque::new(),
                },
            );
        Subscriber {
            store: self.clone(),
            topic: topic.to_string(),
            id,
            default,
        }
    }

    /// Registers `listener` to run after every accepted update of `topic`.
    pub fn add_listener(
        &self,
        topic: &str,
        listener: impl Fn(&str, &Value, u64) + Send + Sync + 'static,
    ) -> ListenerId {
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        state
            .listeners
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        ListenerId(id)
    }

    /// Removes a listener. A call already in flight may still complete.
    pub fn remove_listener(&self, id: ListenerId) {
        let mut state = self.state();
        for listeners in state.listeners.values_mut() {
            listeners.retain(|(lid, _)| *lid != id.0);
        }
    }

    /// Latest value of `topic`, if any has been published.
    pub fn get_value(&self, topic: &str) -> Option<Timestamped<Value>> {
        self.state().topics.get(topic).and_then(|t| t.last.clone())
    }

    fn put(&self, topic: &str, value: Value, time_us: u64, keep_duplicates: bool) {
        let listeners: Vec<Listener> = {
            let mut state = self.state();
            let depth = self.inner.queue_depth;
            let entry = state.topics.entry(topic.to_string()).or_default();
            if !keep_duplicates && entry.last.as_ref().is_some_and(|last| last.value == value) {
                trace!("Dropping duplicate update of {}", topic);
                return;
            }
            let update = Timestamped {
                value: value.clone(),
                time_us,
            };
            for queue in entry.queues.values_mut() {
                if !queue.send_all {
                    queue.updates.clear();
                } else if queue.updates.len() >= depth {
                    queue.updates.pop_front();
                }
                queue.updates.push_back(update.clone());
            }
            entry.last = Some(update);
            state
                .listeners
                .get(topic)
                .map(|l| l.iter().map(|(_, f)| Arc::clone(f)).collect())
                .unwrap_or_default()
        };
        trace!("{} <- {:?} @ {} us", topic, value, time_us);
        for listener in listeners {
            listener(topic, &value, time_us);
        }
    }
}

/// Writes one topic.
pub struct Publisher<T: TopicValue> {
    store: ValueStore,
    topic: String,
    options: PubSubOptions,
    _marker: PhantomData<fn(T)>,
}

impl<T: TopicValue> std::fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher").field("topic", &self.topic).finish()
    }
}

impl<T: TopicValue> Publisher<T> {
    /// Publishes `value` stamped with the current time.
    pub fn set(&self, value: T) {
        let now = self.store.clock().now_us();
        self.set_at(value, now);
    }

    /// Publishes `value` with an explicit timestamp.
    pub fn set_at(&self, value: T, time_us: u64) {
        self.store
            .put(&self.topic, value.into_value(), time_us, self.options.keep_duplicates);
    }

    /// Topic name.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Reads one topic.
pub struct Subscriber<T: TopicValue> {
    store: ValueStore,
    topic: String,
    id: u64,
    default: T,
}

impl<T: TopicValue> std::fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber").field("topic", &self.topic).finish()
    }
}

impl<T: TopicValue> Subscriber<T> {
    /// Most recent value, or the default if none (or one of another type) arrived.
    pub fn get(&self) -> T {
        self.get_atomic().value
    }

    /// Most recent value with its timestamp; the default is stamped 0.
    pub fn get_atomic(&self) -> Timestamped<T> {
        self.store
            .get_value(&self.topic)
            .and_then(|last| {
                T::from_value(&last.value).map(|value| Timestamped {
                    value,
                    time_us: last.time_us,
                })
            })
            .unwrap_or_else(|| Timestamped {
                value: self.default.clone(),
                time_us: 0,
            })
    }

    /// Drains the updates received since the previous call.
    pub fn read_queue(&self) -> Vec<Timestamped<T>> {
        let mut state = self.store.state();
        let Some(queue) = state
            .topics
            .get_mut(&self.topic)
            .and_then(|t| t.queues.get_mut(&self.id))
        else {
            return Vec::new();
        };
        queue
            .updates
            .drain(..)
            .filter_map(|u| {
                T::from_value(&u.value).map(|value| Timestamped {
                    value,
                    time_us: u.time_us,
                })
            })
            .collect()
    }

    /// Topic name.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl<T: TopicValue> Drop for Subscriber<T> {
    fn drop(&mut self) {
        let mut state = self.store.state();
        if let Some(topic) = state.topics.get_mut(&self.topic) {
            topic.queues.remove(&self.id);
        }
    }
}
