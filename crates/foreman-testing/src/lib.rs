//! Testing utilities for foreman.
//!
//! Scripted command handlers, an event recorder and a [`Harness`] that wires
//! the bus, configuration, engine and workflow engine together.
//!
//! ```ignore
//! use foreman_testing::{Harness, FlakyHandler};
//!
//! let harness = Harness::new();
//! let flaky = FlakyHandler::new(2);
//! harness.engine.register_command("net.fetch", flaky.clone());
//!
//! let record = harness.run("net.fetch").await;
//! assert!(!record.is_success());
//! assert_eq!(flaky.calls(), 1);
//! ```

use async_trait::async_trait;
use foreman_core::{
    CommandError, CommandHandler, CommandResult, ConfigDefaults, ConfigStore, Engine, Event,
    EventBus, ExecutionContext, ExecutionMode, ExecutionRecord, Params, SubscriptionId,
    WorkflowEngine,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Handlers
// ============================================================================

/// Records the params of every call and answers with a fixed value.
#[derive(Clone)]
pub struct RecordingHandler {
    calls: Arc<Mutex<Vec<Params>>>,
    reply: Value,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::replying(Value::Null)
    }

    pub fn replying(reply: impl Into<Value>) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            reply: reply.into(),
        }
    }

    pub fn calls(&self) -> Vec<Params> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn last_call(&self) -> Option<Params> {
        self.calls.lock().last().cloned()
    }
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandHandler for RecordingHandler {
    async fn handle(&self, ctx: &mut ExecutionContext) -> CommandResult {
        self.calls.lock().push(ctx.params().clone());
        Ok(self.reply.clone())
    }
}

/// Fails its first `failures` calls, then succeeds with the attempt number.
#[derive(Clone)]
pub struct FlakyHandler {
    failures: usize,
    calls: Arc<AtomicUsize>,
}

impl FlakyHandler {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandHandler for FlakyHandler {
    async fn handle(&self, _ctx: &mut ExecutionContext) -> CommandResult {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            return Err(CommandError::failed(format!("flaky failure #{attempt}")));
        }
        Ok(Value::from(attempt))
    }
}

/// Always fails with the given message.
#[derive(Clone)]
pub struct FailingHandler {
    message: String,
    calls: Arc<AtomicUsize>,
}

impl FailingHandler {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandHandler for FailingHandler {
    async fn handle(&self, _ctx: &mut ExecutionContext) -> CommandResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CommandError::failed(self.message.clone()))
    }
}

/// Sleeps before answering and remembers the order in which calls started.
#[derive(Clone)]
pub struct SlowHandler {
    delay: Duration,
    started: Arc<Mutex<Vec<String>>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            started: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The `tag` param of every call, in start order.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    /// Highest number of calls that were running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandHandler for SlowHandler {
    async fn handle(&self, ctx: &mut ExecutionContext) -> CommandResult {
        let tag = ctx.param_str("tag").unwrap_or_default().to_string();
        self.started.lock().push(tag.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(Value::String(tag))
    }
}

// ============================================================================
// Events
// ============================================================================

/// Captures every event matching a pattern until dropped.
pub struct EventRecorder {
    bus: EventBus,
    pattern: String,
    id: SubscriptionId,
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventRecorder {
    pub fn attach(bus: &EventBus, pattern: &str) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let id = bus.subscribe(pattern, move |event: &Event| {
            sink.lock().push(event.clone());
            Ok(())
        });
        Self {
            bus: bus.clone(),
            pattern: pattern.to_string(),
            id,
            events,
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Event names in delivery order.
    pub fn names(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.name().to_string()).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Drop for EventRecorder {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.pattern, self.id);
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Bus, configuration, engine and workflow engine wired the way an
/// application would wire them, with an event recorder on `*`.
pub struct Harness {
    pub bus: EventBus,
    pub config: ConfigStore,
    pub engine: Engine,
    pub workflows: WorkflowEngine,
    pub events: EventRecorder,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_defaults(ConfigDefaults::standard())
    }

    pub fn with_defaults(defaults: ConfigDefaults) -> Self {
        let bus = EventBus::new();
        let config = ConfigStore::new(defaults, bus.clone());
        let engine = Engine::new(bus.clone(), config.clone());
        let workflows = WorkflowEngine::new(engine.clone(), config.clone(), bus.clone());
        let events = EventRecorder::attach(&bus, "*");
        Self {
            bus,
            config,
            engine,
            workflows,
            events,
        }
    }

    /// Submit a raw command line inline and return its record.
    pub async fn run(&self, line: &str) -> ExecutionRecord {
        match self.engine.submit_line(line, ExecutionMode::Inline).await.into_record() {
            Some(record) => record,
            None => panic!("inline submission of {line:?} was queued"),
        }
    }

    /// Wait until the engine history holds at least `count` records.
    pub async fn wait_for_history(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.engine.status().history_count < count {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
