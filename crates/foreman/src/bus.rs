//! EventBus - publish/subscribe between the components.
//!
//! Every side effect the components want others to see goes through here:
//! command lifecycle, configuration changes, workflow progress.
//!
//! # Patterns
//!
//! | Pattern | Fires for |
//! |---------|-----------|
//! | `build.started` | exactly `build.started` |
//! | `build.*` | any name starting with `build.` (not `build` itself) |
//! | `*` | every event |
//!
//! A callback registered under several patterns is invoked once per matching
//! pattern.
//!
//! # Delivery
//!
//! [`DeliveryMode::Inline`] dispatches inside [`EventBus::emit`] on the
//! caller's task. [`DeliveryMode::Queued`] hands events to one dispatch task
//! that drains a FIFO channel, so `emit` returns immediately. Both preserve
//! emission order for a single emitter.
//!
//! Callback failures (an `Err` or a panic) are logged and never stop delivery
//! to the remaining subscribers.

use crate::value::panic_message;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smallvec::SmallVec;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default number of events kept in history.
pub const DEFAULT_HISTORY_SIZE: usize = 100;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Callback invoked for each matching event.
pub type EventCallback = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// An emitted event. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    name: String,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    timestamp: DateTime<Utc>,
    source: Option<String>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Payload, source: Option<String>) -> Self {
        Self {
            name: name.into(),
            args: payload.args,
            kwargs: payload.kwargs,
            timestamp: Utc::now(),
            source,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Positional payload.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Keyword payload.
    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }
}

/// Positional and keyword payload for [`EventBus::emit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    args: Vec<Value>,
    kwargs: Map<String, Value>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    #[must_use]
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }
}

/// Parsed subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Pattern {
    /// `*`
    All,
    /// `prefix.*`, stored without the trailing `.*`.
    Prefix(String),
    Exact(String),
}

impl Pattern {
    pub fn parse(raw: &str) -> Self {
        if raw == "*" {
            Self::All
        } else if let Some(prefix) = raw.strip_suffix(".*") {
            Self::Prefix(prefix.to_string())
        } else {
            Self::Exact(raw.to_string())
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Exact(exact) => exact == name,
            Self::Prefix(prefix) => name
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.starts_with('.')),
        }
    }
}

/// Handle returned by subscribe calls; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn next(counter: &AtomicU64) -> Self {
        Self(counter.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// How events reach subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Dispatch inside `emit`, on the emitting task.
    #[default]
    Inline,
    /// Dispatch on a dedicated task draining a FIFO queue.
    Queued,
}

struct Subscription {
    id: SubscriptionId,
    raw: String,
    pattern: Pattern,
    callback: EventCallback,
    once: bool,
}

struct BusInner {
    mode: DeliveryMode,
    history_size: AtomicUsize,
    subscribers: Mutex<Vec<Subscription>>,
    history: Mutex<VecDeque<Event>>,
    next_id: AtomicU64,
    queue: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BusInner {
    fn dispatch(&self, event: &Event) {
        let matched: SmallVec<[(EventCallback, String); 8]> = {
            let mut subscribers = self.subscribers.lock();
            let matched = subscribers
                .iter()
                .filter(|s| s.pattern.matches(&event.name))
                .map(|s| (Arc::clone(&s.callback), s.raw.clone()))
                .collect();
            // One-shots leave before their callback runs, so a failing one
            // still cannot fire twice.
            subscribers.retain(|s| !(s.once && s.pattern.matches(&event.name)));
            matched
        };

        for (callback, pattern) in &matched {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(event = %event.name, pattern = %pattern, error = %err, "Event subscriber failed");
                }
                Err(panic) => {
                    error!(
                        event = %event.name,
                        pattern = %pattern,
                        panic = %panic_message(panic.as_ref()),
                        "Event subscriber panicked"
                    );
                }
            }
        }

        debug!(event = %event.name, handlers = matched.len(), "Dispatched event");
    }
}

/// Builder for [`EventBus`].
#[derive(Debug, Clone)]
pub struct EventBusBuilder {
    mode: DeliveryMode,
    history_size: usize,
}

impl EventBusBuilder {
    /// Dispatch on a dedicated task. [`build`](Self::build) must then run
    /// inside a tokio runtime.
    #[must_use]
    pub fn queued(mut self) -> Self {
        self.mode = DeliveryMode::Queued;
        self
    }

    #[must_use]
    pub fn mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn history_size(mut self, size: usize) -> Self {
        self.history_size = size.max(1);
        self
    }

    /// Build the bus.
    ///
    /// Queued mode outside a tokio runtime falls back to inline delivery and
    /// logs an error; [`EventBus::mode`] reports the mode actually in use.
    pub fn build(self) -> EventBus {
        let mut mode = self.mode;
        let runtime = tokio::runtime::Handle::try_current().ok();
        if mode == DeliveryMode::Queued && runtime.is_none() {
            error!("Queued event delivery needs a tokio runtime; falling back to inline delivery");
            mode = DeliveryMode::Inline;
        }

        let inner = Arc::new(BusInner {
            mode,
            history_size: AtomicUsize::new(self.history_size),
            subscribers: Mutex::new(Vec::new()),
            history: Mutex::new(VecDeque::with_capacity(self.history_size)),
            next_id: AtomicU64::new(1),
            queue: Mutex::new(None),
            worker: Mutex::new(None),
        });

        if let (DeliveryMode::Queued, Some(runtime)) = (mode, runtime) {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = runtime.spawn(dispatch_loop(Arc::downgrade(&inner), rx));
            *inner.queue.lock() = Some(tx);
            *inner.worker.lock() = Some(worker);
        }

        info!(mode = ?mode, history_size = self.history_size, "EventBus initialized");
        EventBus { inner }
    }
}

async fn dispatch_loop(bus: Weak<BusInner>, mut rx: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = bus.upgrade() else {
            break;
        };
        inner.dispatch(&event);
    }
    debug!("EventBus dispatch task stopped");
}

/// Cheaply cloneable handle to a shared bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Inline delivery with the default history size.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> EventBusBuilder {
        EventBusBuilder {
            mode: DeliveryMode::Inline,
            history_size: DEFAULT_HISTORY_SIZE,
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.inner.mode
    }

    /// Subscribe `callback` to `pattern` (exact, `prefix.*` or `*`).
    pub fn subscribe<F>(&self, pattern: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add(pattern, Arc::new(callback), false)
    }

    /// Subscribe for a single delivery; the subscription is removed as soon
    /// as it is dispatched.
    pub fn subscribe_once<F>(&self, pattern: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add(pattern, Arc::new(callback), true)
    }

    fn add(&self, pattern: &str, callback: EventCallback, once: bool) -> SubscriptionId {
        let id = SubscriptionId::next(&self.inner.next_id);
        self.inner.subscribers.lock().push(Subscription {
            id,
            raw: pattern.to_string(),
            pattern: Pattern::parse(pattern),
            callback,
            once,
        });
        debug!(pattern, %id, once, "Subscribed");
        id
    }

    /// Remove a subscription. Returns `false` if it was not registered under
    /// `pattern` (or already fired, for one-shots).
    pub fn unsubscribe(&self, pattern: &str, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| !(s.id == id && s.raw == pattern));
        before != subscribers.len()
    }

    /// Emit an event without a source tag.
    pub fn emit(&self, name: impl Into<String>, payload: Payload) {
        self.publish(Event::new(name, payload, None));
    }

    /// Emit an event tagged with its source component.
    pub fn emit_from(&self, name: impl Into<String>, payload: Payload, source: impl Into<String>) {
        self.publish(Event::new(name, payload, Some(source.into())));
    }

    fn publish(&self, event: Event) {
        self.record(&event);

        let event = match self.enqueue(event) {
            Some(event) => event,
            None => return,
        };
        self.inner.dispatch(&event);
    }

    /// Hand the event to the dispatch task. Gives it back when there is no
    /// live queue, so the caller can dispatch inline.
    fn enqueue(&self, event: Event) -> Option<Event> {
        if self.inner.mode != DeliveryMode::Queued {
            return Some(event);
        }
        let queue = self.inner.queue.lock();
        match queue.as_ref() {
            Some(tx) => tx.send(event).err().map(|mpsc::error::SendError(event)| event),
            None => Some(event),
        }
    }

    fn record(&self, event: &Event) {
        let limit = self.history_size();
        let mut history = self.inner.history.lock();
        history.push_back(event.clone());
        while history.len() > limit {
            history.pop_front();
        }
    }

    pub fn history_size(&self) -> usize {
        self.inner.history_size.load(Ordering::Relaxed)
    }

    /// Change how many events are kept, dropping the oldest ones if the
    /// history is already longer.
    pub fn set_history_size(&self, size: usize) {
        let size = size.max(1);
        if self.inner.history_size.swap(size, Ordering::Relaxed) == size {
            return;
        }
        let mut history = self.inner.history.lock();
        while history.len() > size {
            history.pop_front();
        }
        debug!(history_size = size, "EventBus history size changed");
    }

    /// Most recent `limit` events, oldest first, optionally restricted to an
    /// exact name.
    pub fn get_history(&self, name: Option<&str>, limit: usize) -> Vec<Event> {
        let history = self.inner.history.lock();
        let matching: Vec<&Event> = history
            .iter()
            .filter(|e| name.is_none_or(|n| e.name == n))
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }

    /// Number of live subscriptions per pattern, or only for `pattern`.
    pub fn subscriber_counts(&self, pattern: Option<&str>) -> BTreeMap<String, usize> {
        let subscribers = self.inner.subscribers.lock();
        let mut counts = BTreeMap::new();
        for s in subscribers.iter().filter(|s| pattern.is_none_or(|p| s.raw == p)) {
            *counts.entry(s.raw.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Wait for the next event matching `pattern`, up to `timeout`.
    ///
    /// Returns `None` on timeout; the temporary subscription is removed in
    /// that case.
    pub async fn wait_for(&self, pattern: &str, timeout: Duration) -> Option<Event> {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let id = self.subscribe_once(pattern, move |event| {
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send(event.clone());
            }
            Ok(())
        });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(event)) => Some(event),
            _ => {
                self.unsubscribe(pattern, id);
                debug!(pattern, ?timeout, "wait_for timed out");
                None
            }
        }
    }

    /// Stop the dispatch task of a queued bus, letting it drain what was
    /// already emitted. Later emissions are dispatched inline.
    pub async fn shutdown(&self) {
        self.inner.queue.lock().take();
        let worker = self.inner.worker.lock().take();
        if let Some(mut worker) = worker {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut worker).await.is_err() {
                warn!("EventBus dispatch task did not drain in time; aborting it");
                worker.abort();
            }
        }
        info!("EventBus shutdown complete");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("mode", &self.inner.mode)
            .field("history_size", &self.history_size())
            .field("subscribers", &self.inner.subscribers.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter(bus: &EventBus, pattern: &str) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.subscribe(pattern, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        count
    }

    #[test]
    fn wildcard_matches_children_but_not_the_prefix_itself() {
        let bus = EventBus::new();
        let count = counter(&bus, "build.*");

        bus.emit("build.started", Payload::new());
        bus.emit("build.completed", Payload::new());
        assert_eq!(count.load(Ordering::SeqCst), 2);

        bus.emit("build", Payload::new());
        bus.emit("buildx.started", Payload::new());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn global_pattern_sees_everything() {
        let bus = EventBus::new();
        let count = counter(&bus, "*");

        bus.emit("a", Payload::new());
        bus.emit("b.c", Payload::new());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn callback_on_two_patterns_fires_once_per_pattern() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        for pattern in ["deploy.done", "deploy.*"] {
            let c = Arc::clone(&count);
            bus.subscribe(pattern, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        bus.emit("deploy.done", Payload::new());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn once_subscription_fires_a_single_time() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.subscribe_once("x", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit("x", Payload::new());
        bus.emit("x", Payload::new());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(bus.subscriber_counts(None).is_empty());
    }

    #[test]
    fn failing_once_subscription_is_still_removed() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.subscribe_once("x", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("boom")
        });

        bus.emit("x", Payload::new());
        bus.emit("x", Payload::new());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_and_panicking_subscribers_do_not_block_others() {
        let bus = EventBus::new();
        bus.subscribe("evt", |_| anyhow::bail!("first fails"));
        bus.subscribe("evt", |_| panic!("second panics"));
        let count = counter(&bus, "evt");

        bus.emit("evt", Payload::new());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_requires_matching_pattern() {
        let bus = EventBus::new();
        let id = bus.subscribe("a.*", |_| Ok(()));

        assert!(!bus.unsubscribe("a.b", id));
        assert!(bus.unsubscribe("a.*", id));
        assert!(!bus.unsubscribe("a.*", id));
    }

    #[test]
    fn history_is_bounded_and_filterable() {
        let bus = EventBus::builder().history_size(3).build();
        for name in ["a", "b", "a", "c", "a"] {
            bus.emit(name, Payload::new());
        }

        let names: Vec<String> = bus
            .get_history(None, 10)
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "c", "a"]);
        assert_eq!(bus.get_history(Some("a"), 10).len(), 2);
        assert_eq!(bus.get_history(Some("a"), 1).len(), 1);

        bus.set_history_size(2);
        assert_eq!(bus.history_size(), 2);
        let names: Vec<String> = bus
            .get_history(None, 10)
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(names, vec!["c", "a"]);

        bus.clear_history();
        assert!(bus.get_history(None, 10).is_empty());
    }

    #[test]
    fn payload_and_source_reach_subscribers() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        bus.subscribe("job.done", move |event| {
            *s.lock() = Some(event.clone());
            Ok(())
        });

        bus.emit_from(
            "job.done",
            Payload::new().arg("id-1").kwarg("ok", true),
            "worker",
        );

        let event = seen.lock().clone().unwrap();
        assert_eq!(event.arg(0), Some(&Value::from("id-1")));
        assert_eq!(event.kwarg("ok"), Some(&Value::Bool(true)));
        assert_eq!(event.source(), Some("worker"));
    }

    #[test]
    fn queued_mode_without_runtime_falls_back_to_inline() {
        let bus = EventBus::builder().queued().build();
        assert_eq!(bus.mode(), DeliveryMode::Inline);

        let count = counter(&bus, "x");
        bus.emit("x", Payload::new());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn queued_mode_delivers_in_emission_order() {
        let bus = EventBus::builder().queued().build();
        assert_eq!(bus.mode(), DeliveryMode::Queued);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        bus.subscribe("tick.*", move |event| {
            s.lock().push(event.name().to_string());
            Ok(())
        });

        for i in 0..20 {
            bus.emit(format!("tick.{i}"), Payload::new());
        }
        bus.shutdown().await;

        let expected: Vec<String> = (0..20).map(|i| format!("tick.{i}")).collect();
        assert_eq!(*seen.lock(), expected);
    }

    #[tokio::test]
    async fn wait_for_returns_matching_event() {
        let bus = EventBus::new();
        let emitter = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            emitter.emit("ready", Payload::new().arg(7));
        });

        let event = bus.wait_for("ready", Duration::from_secs(2)).await.unwrap();
        assert_eq!(event.arg(0), Some(&Value::from(7)));
    }

    #[test]
    fn subscriber_counts_can_filter_by_pattern() {
        let bus = EventBus::new();
        bus.subscribe("build.*", |_| Ok(()));
        bus.subscribe("build.*", |_| Ok(()));
        bus.subscribe("*", |_| Ok(()));

        assert_eq!(bus.subscriber_counts(None).len(), 2);
        let only = bus.subscriber_counts(Some("build.*"));
        assert_eq!(only.len(), 1);
        assert_eq!(only["build.*"], 2);
        assert!(bus.subscriber_counts(Some("deploy")).is_empty());
    }

    #[tokio::test]
    async fn wait_for_times_out_and_cleans_up() {
        let bus = EventBus::new();
        let event = bus.wait_for("never", Duration::from_millis(20)).await;
        assert!(event.is_none());
        assert!(bus.subscriber_counts(None).is_empty());
    }
}
