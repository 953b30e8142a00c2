//! Execution Engine - handler registry, background queue, execution history.
//!
//! ```text
//!  execute(cmd, params, Inline) ──────────────► run() ──► ExecutionRecord
//!                                                 ▲
//!  execute(cmd, params, Background)               │
//!      │                                          │
//!      ▼ try_send                                 │
//!  bounded mpsc ──► worker task (FIFO, one at a time)
//! ```
//!
//! `run()` is the only place handlers are invoked. It contains every failure
//! mode (unknown command, handler error, panic, timeout) and turns it into a
//! FAILED record plus a `command_failed` event. Nothing escapes `execute`.

use crate::builtins;
use crate::bus::{EventBus, Payload, DEFAULT_HISTORY_SIZE};
use crate::command::{CommandCatalog, CommandProcessor, DEFAULT_HISTORY_LIMIT, DEFAULT_MAX_COMPLETIONS};
use crate::config::ConfigStore;
use crate::context::{Artifact, ExecutionContext, ExecutionId, ExecutionStatus, LogLine, Params};
use crate::error::{CommandError, EngineError, WorkflowError};
use crate::names;
use crate::value::{panic_message, secs_to_duration};
use crate::workflow::WorkflowDefinition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DEFAULT_ENGINE_HISTORY: usize = 100;
const DEFAULT_QUEUE_CAPACITY: usize = 100;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// What a handler returns.
pub type CommandResult = Result<Value, CommandError>;

/// A command implementation.
///
/// Handlers report failure by returning `Err`; anything that goes wrong is
/// contained by the engine, including panics.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: &mut ExecutionContext) -> CommandResult;

    /// One-line summary shown by `help`.
    fn description(&self) -> Option<&str> {
        None
    }

    /// Whether `engine.command_timeout` applies when the caller gives no
    /// explicit bound.
    fn uses_default_timeout(&self) -> bool {
        true
    }
}

/// Adapter for synchronous closures.
///
/// The closure runs on tokio's blocking pool against a copy of the context,
/// so a slow body cannot stall the runtime and timeouts still fire. The copy
/// is written back when the closure returns.
pub struct FnHandler<F> {
    f: Arc<F>,
    description: Option<String>,
}

impl<F> FnHandler<F>
where
    F: Fn(&mut ExecutionContext) -> CommandResult + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f: Arc::new(f),
            description: None,
        }
    }

    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[async_trait]
impl<F> CommandHandler for FnHandler<F>
where
    F: Fn(&mut ExecutionContext) -> CommandResult + Send + Sync + 'static,
{
    async fn handle(&self, ctx: &mut ExecutionContext) -> CommandResult {
        let f = Arc::clone(&self.f);
        let mut owned = ctx.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let result = f(&mut owned);
            (owned, result)
        })
        .await;

        match joined {
            Ok((owned, result)) => {
                *ctx = owned;
                result
            }
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(CommandError::Cancelled),
        }
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// Where a command runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Run now, on the caller's task, and return the finished record.
    #[default]
    Inline,
    /// Enqueue for the worker task and return the execution id.
    Background,
}

/// Audit entry for one execution. Immutable once terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub command: String,
    pub params: Params,
    pub submitted_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub result: Option<Value>,
    pub error: Option<CommandError>,
    pub elapsed_ms: u64,
    pub progress: f64,
    pub logs: Vec<LogLine>,
    pub outputs: Vec<Artifact>,
    pub metadata: Map<String, Value>,
}

impl ExecutionRecord {
    pub(crate) fn queued(command: impl Into<String>, params: Params) -> Self {
        Self {
            id: ExecutionId::new(),
            command: command.into(),
            params,
            submitted_at: Utc::now(),
            status: ExecutionStatus::Queued,
            result: None,
            error: None,
            elapsed_ms: 0,
            progress: 0.0,
            logs: Vec::new(),
            outputs: Vec::new(),
            metadata: Map::new(),
        }
    }

    fn fail(mut self, error: CommandError) -> Self {
        self.status = ExecutionStatus::Failed;
        self.error = Some(error);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    /// The error message, when the execution did not complete.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

/// Answer to [`Engine::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteResponse {
    Queued(ExecutionId),
    Finished(ExecutionRecord),
}

impl ExecuteResponse {
    pub fn id(&self) -> ExecutionId {
        match self {
            Self::Queued(id) => *id,
            Self::Finished(record) => record.id,
        }
    }

    pub fn into_record(self) -> Option<ExecutionRecord> {
        match self {
            Self::Queued(_) => None,
            Self::Finished(record) => Some(record),
        }
    }
}

/// Snapshot returned by [`Engine::status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub running: bool,
    pub queue_size: usize,
    pub history_count: usize,
    pub registered_commands: Vec<String>,
    pub registered_workflows: Vec<String>,
}

/// The workflow side of the engine, attached by the workflow engine.
pub trait WorkflowHost: Send + Sync {
    fn workflow_ids(&self) -> Vec<String>;
    fn register_definition(&self, definition: WorkflowDefinition) -> Result<(), WorkflowError>;
}

#[derive(Default)]
struct QueueState {
    tx: Option<mpsc::Sender<ExecutionRecord>>,
    rx: Option<mpsc::Receiver<ExecutionRecord>>,
    worker: Option<JoinHandle<()>>,
    pending: HashMap<ExecutionId, ExecutionRecord>,
    cancelled: HashSet<ExecutionId>,
}

pub(crate) struct EngineInner {
    bus: EventBus,
    config: ConfigStore,
    processor: CommandProcessor,
    handlers: DashMap<String, Arc<dyn CommandHandler>>,
    history: Mutex<VecDeque<ExecutionRecord>>,
    queue: Mutex<QueueState>,
    running: AtomicBool,
    workflow_host: RwLock<Option<Weak<dyn WorkflowHost>>>,
}

/// Cheaply cloneable handle to a shared engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// An engine with the builtin commands registered. Background executions
    /// queue up until [`start`](Self::start).
    pub fn new(bus: EventBus, config: ConfigStore) -> Self {
        let history_limit = config_usize(&config, "commands.history_limit", DEFAULT_HISTORY_LIMIT);
        let max_completions =
            config_usize(&config, "commands.max_completions", DEFAULT_MAX_COMPLETIONS);
        let capacity = config_usize(&config, "engine.max_queue_size", DEFAULT_QUEUE_CAPACITY);
        let (tx, rx) = mpsc::channel(capacity.max(1));

        apply_event_history_size(&bus, &config);
        let live = bus.clone();
        config.subscribe("events.history_size", move |_, value| {
            if let Some(size) = value.as_i64().and_then(|n| usize::try_from(n).ok()) {
                live.set_history_size(size);
            }
            Ok(())
        });

        let engine = Self {
            inner: Arc::new(EngineInner {
                bus,
                config,
                processor: CommandProcessor::with_limits(history_limit, max_completions),
                handlers: DashMap::new(),
                history: Mutex::new(VecDeque::new()),
                queue: Mutex::new(QueueState {
                    tx: Some(tx),
                    rx: Some(rx),
                    ..QueueState::default()
                }),
                running: AtomicBool::new(false),
                workflow_host: RwLock::new(None),
            }),
        };
        builtins::register(&engine);
        engine
    }

    pub(crate) fn from_inner(inner: Arc<EngineInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<EngineInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn config(&self) -> &ConfigStore {
        &self.inner.config
    }

    pub fn processor(&self) -> &CommandProcessor {
        &self.inner.processor
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    /// Register (or replace) the handler for `name`.
    pub fn register_command<H: CommandHandler>(&self, name: impl Into<String>, handler: H) {
        self.register_arc(name.into(), Arc::new(handler));
    }

    /// Register a synchronous closure as a handler.
    pub fn register_fn<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut ExecutionContext) -> CommandResult + Send + Sync + 'static,
    {
        self.register_command(name, FnHandler::new(f));
    }

    pub(crate) fn register_arc(&self, name: String, handler: Arc<dyn CommandHandler>) {
        self.inner.processor.register_known(name.clone());
        if self.inner.handlers.insert(name.clone(), handler).is_some() {
            warn!(command = %name, "Replaced existing command handler");
        } else {
            debug!(command = %name, "Registered command handler");
        }
    }

    /// Registered command names, sorted.
    pub fn registered_commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// `(name, description)` of every registered command, sorted by name.
    pub fn describe_commands(&self) -> Vec<(String, Option<String>)> {
        let mut out: Vec<(String, Option<String>)> = self
            .inner
            .handlers
            .iter()
            .map(|e| (e.key().clone(), e.value().description().map(str::to_string)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Attach the workflow side. Held weakly; the workflow engine owns the
    /// engine, not the other way round.
    pub fn set_workflow_host(&self, host: Weak<dyn WorkflowHost>) {
        *self.inner.workflow_host.write() = Some(host);
    }

    fn workflow_host(&self) -> Option<Arc<dyn WorkflowHost>> {
        self.inner.workflow_host.read().as_ref().and_then(Weak::upgrade)
    }

    /// Register a workflow definition with the attached workflow engine.
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<(), EngineError> {
        let host = self.workflow_host().ok_or(EngineError::NoWorkflowHost)?;
        host.register_definition(definition)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the background worker. Idempotent while running.
    pub fn start(&self) -> Result<(), EngineError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        // Picks up values loaded silently after construction.
        apply_event_history_size(&self.inner.bus, &self.inner.config);

        {
            let mut queue = self.inner.queue.lock();
            if queue.worker.is_some() {
                return Ok(());
            }
            let rx = match queue.rx.take() {
                Some(rx) => rx,
                None => {
                    let capacity =
                        config_usize(&self.inner.config, "engine.max_queue_size", DEFAULT_QUEUE_CAPACITY);
                    let (tx, rx) = mpsc::channel(capacity.max(1));
                    queue.tx = Some(tx);
                    rx
                }
            };
            queue.worker = Some(runtime.spawn(worker_loop(self.downgrade(), rx)));
        }

        self.inner.running.store(true, Ordering::SeqCst);
        info!(commands = self.inner.handlers.len(), "Engine started");
        self.inner
            .bus
            .emit_from(names::ENGINE_STARTED, Payload::new(), "engine");
        Ok(())
    }

    /// Close the queue, let the worker drain what was already accepted, and
    /// wait for it (bounded). Records still pending afterwards are cancelled.
    pub async fn shutdown(&self) {
        let worker = {
            let mut queue = self.inner.queue.lock();
            queue.tx = None;
            queue.rx = None;
            queue.worker.take()
        };

        if let Some(mut worker) = worker {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut worker).await.is_err() {
                warn!("Engine worker did not drain in time; aborting it");
                worker.abort();
            }
        }

        let leftovers: Vec<ExecutionRecord> = {
            let mut queue = self.inner.queue.lock();
            queue.cancelled.clear();
            queue.pending.drain().map(|(_, record)| record).collect()
        };
        for record in leftovers {
            self.finish_cancelled(record);
        }

        self.inner.running.store(false, Ordering::SeqCst);
        info!("Engine stopped");
        self.inner
            .bus
            .emit_from(names::ENGINE_STOPPED, Payload::new(), "engine");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Execute `command`. Never fails: every failure is a FAILED record.
    pub async fn execute(&self, command: &str, params: Params, mode: ExecutionMode) -> ExecuteResponse {
        match mode {
            ExecutionMode::Inline => {
                ExecuteResponse::Finished(self.execute_with_timeout(command, params, None).await)
            }
            ExecutionMode::Background => self.enqueue(ExecutionRecord::queued(command, params)),
        }
    }

    /// Execute inline with an explicit bound. `None` uses
    /// `engine.command_timeout`.
    pub async fn execute_with_timeout(
        &self,
        command: &str,
        params: Params,
        timeout: Option<Duration>,
    ) -> ExecutionRecord {
        self.run(ExecutionRecord::queued(command, params), timeout).await
    }

    /// Parse, validate and execute a raw command line. An invalid line is
    /// recorded as a FAILED execution carrying the parse diagnostic.
    pub async fn submit_line(&self, line: &str, mode: ExecutionMode) -> ExecuteResponse {
        let parsed = self.inner.processor.parse(line);
        let parsed = self.inner.processor.validate(parsed, self);
        if !parsed.is_valid {
            let reason = parsed.error.clone().unwrap_or_else(|| "invalid command".to_string());
            let command = if parsed.command.is_empty() {
                parsed.raw.clone()
            } else {
                parsed.command.clone()
            };
            let record = ExecutionRecord::queued(command, parsed.to_params())
                .fail(CommandError::InvalidCommand(reason));
            return ExecuteResponse::Finished(self.finish(record));
        }
        self.execute(&parsed.command, parsed.to_params(), mode).await
    }

    /// Cancel a queued execution that has not started. Returns `false` when
    /// the id is unknown, running or finished.
    pub fn cancel(&self, id: ExecutionId) -> bool {
        let record = {
            let mut queue = self.inner.queue.lock();
            let Some(record) = queue.pending.remove(&id) else {
                return false;
            };
            queue.cancelled.insert(id);
            record
        };
        self.finish_cancelled(record);
        true
    }

    fn enqueue(&self, record: ExecutionRecord) -> ExecuteResponse {
        let id = record.id;
        let rejected = {
            let mut queue = self.inner.queue.lock();
            match queue.tx.clone() {
                None => Some((record, "engine is shut down")),
                Some(tx) => {
                    queue.pending.insert(id, record.clone());
                    match tx.try_send(record) {
                        Ok(()) => None,
                        Err(mpsc::error::TrySendError::Full(record)) => {
                            queue.pending.remove(&id);
                            Some((record, "execution queue is full"))
                        }
                        Err(mpsc::error::TrySendError::Closed(record)) => {
                            queue.pending.remove(&id);
                            Some((record, "engine is shut down"))
                        }
                    }
                }
            }
        };

        match rejected {
            None => {
                debug!(execution_id = %id.short(), "Execution queued");
                ExecuteResponse::Queued(id)
            }
            Some((record, reason)) => {
                warn!(execution_id = %id.short(), command = %record.command, reason, "Execution rejected");
                let record = record.fail(CommandError::Unavailable(reason.to_string()));
                ExecuteResponse::Finished(self.finish(record))
            }
        }
    }

    /// Invoke the handler for `record` and fold the outcome into it.
    async fn run(&self, mut record: ExecutionRecord, timeout: Option<Duration>) -> ExecutionRecord {
        let handler = self
            .inner
            .handlers
            .get(&record.command)
            .map(|entry| Arc::clone(entry.value()));
        let Some(handler) = handler else {
            let error = CommandError::UnknownCommand(record.command.clone());
            return self.finish(record.fail(error));
        };

        record.status = ExecutionStatus::Running;
        let short_id = record.id.short();
        info!(execution_id = %short_id, command = %record.command, "Executing command");
        self.inner.bus.emit_from(
            names::COMMAND_STARTED,
            Payload::new()
                .arg(record.id.to_string())
                .arg(record.command.clone())
                .kwarg("execution_id", record.id.to_string())
                .kwarg("command", record.command.clone()),
            "engine",
        );

        let mut ctx = ExecutionContext::new(
            record.id,
            record.command.clone(),
            record.params.clone(),
            self.inner.config.clone(),
        );
        let bound = match timeout {
            Some(limit) => Some(limit),
            None if handler.uses_default_timeout() => self.default_timeout(),
            None => None,
        };

        let outcome = {
            let invocation = AssertUnwindSafe(handler.handle(&mut ctx)).catch_unwind();
            let caught = match bound {
                Some(limit) => match tokio::time::timeout(limit, invocation).await {
                    Ok(caught) => caught,
                    Err(_) => Ok(Err(CommandError::TimedOut(duration_ms(limit)))),
                },
                None => invocation.await,
            };
            match caught {
                Ok(result) => result,
                Err(panic) => Err(CommandError::Panicked(panic_message(panic.as_ref()))),
            }
        };

        match outcome {
            Ok(value) => {
                ctx.status = ExecutionStatus::Completed;
                ctx.progress = 1.0;
                record.status = ExecutionStatus::Completed;
                record.result = Some(value);
            }
            Err(err) => {
                ctx.status = ExecutionStatus::Failed;
                record.status = ExecutionStatus::Failed;
                record.error = Some(err);
            }
        }

        record.elapsed_ms = ctx.elapsed_ms();
        record.progress = ctx.progress;
        record.logs = std::mem::take(&mut ctx.logs);
        record.outputs = std::mem::take(&mut ctx.outputs);
        record.metadata = std::mem::take(&mut ctx.metadata);

        self.finish(record)
    }

    /// Append a terminal record to history and announce it.
    fn finish(&self, record: ExecutionRecord) -> ExecutionRecord {
        let short_id = record.id.short();
        match (&record.status, &record.error) {
            (ExecutionStatus::Completed, _) => {
                info!(execution_id = %short_id, command = %record.command, elapsed_ms = record.elapsed_ms, "Command completed");
                self.inner.bus.emit_from(
                    names::COMMAND_COMPLETED,
                    Payload::new()
                        .arg(record.id.to_string())
                        .arg(record.command.clone())
                        .kwarg("execution_id", record.id.to_string())
                        .kwarg("command", record.command.clone())
                        .kwarg("elapsed_ms", record.elapsed_ms)
                        .kwarg("result", record.result.clone().unwrap_or(Value::Null)),
                    "engine",
                );
            }
            (ExecutionStatus::Cancelled, _) => {
                info!(execution_id = %short_id, command = %record.command, "Command cancelled");
                self.inner.bus.emit_from(
                    names::COMMAND_CANCELLED,
                    Payload::new()
                        .arg(record.id.to_string())
                        .arg(record.command.clone())
                        .kwarg("execution_id", record.id.to_string())
                        .kwarg("command", record.command.clone()),
                    "engine",
                );
            }
            (_, error) => {
                let message = error.as_ref().map(ToString::to_string).unwrap_or_default();
                error!(execution_id = %short_id, command = %record.command, error = %message, "Command failed");
                self.inner.bus.emit_from(
                    names::COMMAND_FAILED,
                    Payload::new()
                        .arg(record.id.to_string())
                        .arg(record.command.clone())
                        .kwarg("execution_id", record.id.to_string())
                        .kwarg("command", record.command.clone())
                        .kwarg("error", message)
                        .kwarg(
                            "error_kind",
                            serde_json::to_value(&record.error).unwrap_or(Value::Null),
                        ),
                    "engine",
                );
            }
        }

        let limit = config_usize(&self.inner.config, "engine.history_limit", DEFAULT_ENGINE_HISTORY).max(1);
        let mut history = self.inner.history.lock();
        history.push_back(record.clone());
        while history.len() > limit {
            history.pop_front();
        }
        record
    }

    fn finish_cancelled(&self, mut record: ExecutionRecord) {
        record.status = ExecutionStatus::Cancelled;
        record.error = Some(CommandError::Cancelled);
        self.finish(record);
    }

    fn default_timeout(&self) -> Option<Duration> {
        self.inner
            .config
            .get_f64("engine.command_timeout")
            .and_then(secs_to_duration)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// The most recent `limit` finished records, oldest first.
    pub fn get_history(&self, limit: usize) -> Vec<ExecutionRecord> {
        let history = self.inner.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// A finished record, or the queued record while it waits.
    pub fn get_record(&self, id: ExecutionId) -> Option<ExecutionRecord> {
        if let Some(record) = self.inner.history.lock().iter().rev().find(|r| r.id == id) {
            return Some(record.clone());
        }
        self.inner.queue.lock().pending.get(&id).cloned()
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }

    pub fn status(&self) -> EngineStatus {
        let queue_size = self.inner.queue.lock().pending.len();
        let history_count = self.inner.history.lock().len();
        let mut registered_workflows = self
            .workflow_host()
            .map(|host| host.workflow_ids())
            .unwrap_or_default();
        registered_workflows.sort();
        EngineStatus {
            running: self.is_running(),
            queue_size,
            history_count,
            registered_commands: self.registered_commands(),
            registered_workflows,
        }
    }
}

impl CommandCatalog for Engine {
    fn has_command(&self, name: &str) -> bool {
        self.inner.handlers.contains_key(name)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("running", &self.is_running())
            .field("commands", &self.inner.handlers.len())
            .finish()
    }
}

async fn worker_loop(engine: Weak<EngineInner>, mut rx: mpsc::Receiver<ExecutionRecord>) {
    debug!("Engine worker started");
    while let Some(record) = rx.recv().await {
        let Some(inner) = engine.upgrade() else {
            break;
        };
        let engine = Engine::from_inner(inner);

        let runnable = {
            let mut queue = engine.inner.queue.lock();
            if queue.cancelled.remove(&record.id) {
                false
            } else {
                queue.pending.remove(&record.id).is_some()
            }
        };
        if runnable {
            engine.run(record, None).await;
        }
    }
    debug!("Engine worker stopped");
}

fn apply_event_history_size(bus: &EventBus, config: &ConfigStore) {
    bus.set_history_size(config_usize(config, "events.history_size", DEFAULT_HISTORY_SIZE));
}

fn config_usize(config: &ConfigStore, key: &str, fallback: usize) -> usize {
    config
        .get_i64(key)
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(fallback)
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
