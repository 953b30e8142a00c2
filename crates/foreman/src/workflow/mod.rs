//! Workflow Engine - dependency-graph runs over the Execution Engine.
//!
//! A run repeats one round until every step is terminal:
//!
//! ```text
//!            ┌─────────────── ready set empty, steps pending ──► skip the rest
//!            │
//!  compute ready set (PENDING, every dependency SUCCESS)
//!            │
//!            ▼ for each ready step
//!   condition? ── false ──► SKIPPED
//!            │   error ──► FAILED (fail_closed) or run anyway (fail_open)
//!            ▼
//!   interpolate params ─► execute (retry_count + 1 attempts) ─► SUCCESS | FAILED
//! ```
//!
//! Steps of one round run one after another, or concurrently when
//! `workflow.parallel_steps` is set. The next round only starts once the
//! current one is terminal.

mod condition;
mod definition;
mod interpolate;
mod run;

pub use condition::{evaluate as evaluate_condition, Condition};
pub use definition::{StepStatus, WorkflowDefinition, WorkflowStep};
pub use interpolate::{interpolate, interpolate_map};
pub use run::{RunStatus, StepRun, WorkflowRun};

use crate::bus::{EventBus, Payload};
use crate::config::ConfigStore;
use crate::context::{ExecutionContext, ExecutionId, Params};
use crate::engine::{CommandHandler, CommandResult, Engine, WorkflowHost};
use crate::error::{CommandError, WorkflowError};
use crate::names;
use crate::value::secs_to_duration;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_RUN_HISTORY: usize = 50;
const DEFAULT_STEP_TIMEOUT_SECS: f64 = 300.0;

const BUILTIN_WORKFLOWS: &[(&str, &str)] = &[
    ("build-deploy", include_str!("../../workflows/build-deploy.yaml")),
    ("quick-build", include_str!("../../workflows/quick-build.yaml")),
    ("full-ci", include_str!("../../workflows/full-ci.yaml")),
];

/// What to do when a step condition cannot be evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConditionFailure {
    /// Fail the step; dependents are skipped.
    #[default]
    FailClosed,
    /// Run the step as if the condition held.
    FailOpen,
}

impl ConditionFailure {
    fn from_config(config: &ConfigStore) -> Self {
        match config.get_str("workflow.condition_failure").as_deref() {
            Some("fail_open") => Self::FailOpen,
            _ => Self::FailClosed,
        }
    }
}

struct WorkflowInner {
    engine: Engine,
    config: ConfigStore,
    bus: EventBus,
    workflows: RwLock<BTreeMap<String, Arc<WorkflowDefinition>>>,
    runs: Mutex<VecDeque<WorkflowRun>>,
}

impl WorkflowInner {
    fn register(&self, mut definition: WorkflowDefinition) -> Result<(), WorkflowError> {
        definition.normalize();
        definition.validate()?;

        let id = definition.id.clone();
        let steps = definition.steps.len();
        if self
            .workflows
            .write()
            .insert(id.clone(), Arc::new(definition))
            .is_some()
        {
            warn!(workflow_id = %id, "Replaced existing workflow definition");
        }
        info!(workflow_id = %id, steps, "Registered workflow");
        self.bus.emit_from(
            names::WORKFLOW_REGISTERED,
            Payload::new().arg(id.clone()).kwarg("workflow_id", id),
            "workflow",
        );
        Ok(())
    }

    /// Insert or refresh the snapshot of `run`, evicting the oldest runs
    /// beyond `workflow.history_limit`.
    fn store(&self, run: &WorkflowRun) {
        let limit = self
            .config
            .get_i64("workflow.history_limit")
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(DEFAULT_RUN_HISTORY)
            .max(1);
        let mut runs = self.runs.lock();
        match runs.iter_mut().find(|r| r.run_id == run.run_id) {
            Some(slot) => *slot = run.clone(),
            None => runs.push_back(run.clone()),
        }
        while runs.len() > limit {
            runs.pop_front();
        }
    }
}

impl WorkflowHost for WorkflowInner {
    fn workflow_ids(&self) -> Vec<String> {
        self.workflows.read().keys().cloned().collect()
    }

    fn register_definition(&self, definition: WorkflowDefinition) -> Result<(), WorkflowError> {
        self.register(definition)
    }
}

/// A step that passed its guard and is about to run.
struct StepPlan {
    index: usize,
    step_id: String,
    command: String,
    params: Params,
    timeout: Option<Duration>,
    max_attempts: u32,
}

struct StepOutcome {
    index: usize,
    result: Result<Value, String>,
    attempts: u32,
    executions: Vec<ExecutionId>,
}

/// Cheaply cloneable handle to a shared workflow engine.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<WorkflowInner>,
}

impl WorkflowEngine {
    /// Create the engine, attach it to `engine` as its workflow host and
    /// register the `workflow.run` and `workflow.list` commands.
    pub fn new(engine: Engine, config: ConfigStore, bus: EventBus) -> Self {
        let inner = Arc::new(WorkflowInner {
            engine: engine.clone(),
            config,
            bus,
            workflows: RwLock::new(BTreeMap::new()),
            runs: Mutex::new(VecDeque::new()),
        });

        let weak = Arc::downgrade(&inner);
        let host: Weak<dyn WorkflowHost> = weak.clone();
        engine.set_workflow_host(host);
        engine.register_command("workflow.run", RunWorkflowCommand { workflows: weak.clone() });
        engine.register_command("workflow.list", ListWorkflowsCommand { workflows: weak });

        Self { inner }
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Validate and register a definition, replacing one with the same id.
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<(), WorkflowError> {
        self.inner.register(definition)
    }

    /// Register the bundled `build-deploy`, `quick-build` and `full-ci`
    /// definitions. Returns how many were registered.
    pub fn register_builtin_workflows(&self) -> Result<usize, WorkflowError> {
        for (name, yaml) in BUILTIN_WORKFLOWS {
            debug!(workflow_id = %name, "Loading bundled workflow");
            self.register_workflow(WorkflowDefinition::from_yaml(yaml)?)?;
        }
        Ok(BUILTIN_WORKFLOWS.len())
    }

    pub fn get_workflow(&self, id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.inner.workflows.read().get(id).cloned()
    }

    /// Registered definitions, sorted by id.
    pub fn list_workflows(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.inner.workflows.read().values().cloned().collect()
    }

    /// Latest snapshot of a run, including runs still in progress.
    pub fn get_run(&self, run_id: &str) -> Option<WorkflowRun> {
        self.inner
            .runs
            .lock()
            .iter()
            .find(|r| r.run_id == run_id)
            .cloned()
    }

    /// Most recent runs first, optionally for one workflow.
    pub fn get_run_history(&self, workflow_id: Option<&str>, limit: usize) -> Vec<WorkflowRun> {
        self.inner
            .runs
            .lock()
            .iter()
            .rev()
            .filter(|r| workflow_id.is_none_or(|id| r.workflow_id == id))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Run a registered workflow to completion.
    ///
    /// Step failures become run status, not errors; the only error is an
    /// unknown workflow id.
    pub async fn run_workflow(
        &self,
        workflow_id: &str,
        overrides: Map<String, Value>,
    ) -> Result<WorkflowRun, WorkflowError> {
        let definition = self
            .get_workflow(workflow_id)
            .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow_id.to_string()))?;

        let mut run = WorkflowRun::new(&definition, overrides);
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        self.inner.store(&run);
        let mut guard = RunGuard {
            workflows: self,
            run,
            settled: false,
        };
        let run = &mut guard.run;

        info!(workflow_id, run_id = %run.run_id, steps = run.steps.len(), "Workflow started");
        self.emit(
            names::WORKFLOW_STARTED,
            Payload::new()
                .arg(workflow_id)
                .arg(run.run_id.clone())
                .kwarg("workflow_id", workflow_id)
                .kwarg("run_id", run.run_id.clone()),
        );

        let parallel = self.inner.config.get_bool("workflow.parallel_steps").unwrap_or(false);

        while !run.is_complete() {
            let ready = run.ready_indices();
            if ready.is_empty() {
                let skipped = run.skip_pending();
                warn!(run_id = %run.run_id, steps = ?skipped, "Unsatisfiable dependencies; skipping remaining steps");
                for step_id in skipped {
                    self.step_completed(run, &step_id, StepStatus::Skipped);
                }
                break;
            }

            if parallel && ready.len() > 1 {
                let plans: Vec<StepPlan> = ready
                    .into_iter()
                    .filter_map(|index| self.prepare(run, index))
                    .collect();
                let outcomes = join_all(plans.into_iter().map(|plan| self.attempt(plan))).await;
                for outcome in outcomes {
                    self.complete(run, outcome);
                }
            } else {
                for index in ready {
                    if let Some(plan) = self.prepare(run, index) {
                        let outcome = self.attempt(plan).await;
                        self.complete(run, outcome);
                    }
                }
            }
            self.inner.store(run);
        }

        run.status = if run.is_success() {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };
        run.completed_at = Some(Utc::now());
        self.inner.store(run);
        self.run_completed(run);

        guard.settled = true;
        let run = guard.run.clone();
        drop(guard);

        self.follow_up(&definition, &run).await;
        Ok(run)
    }

    fn run_completed(&self, run: &WorkflowRun) {
        info!(
            workflow_id = %run.workflow_id,
            run_id = %run.run_id,
            status = %run.status,
            elapsed_ms = run.elapsed_ms().unwrap_or_default(),
            "Workflow completed"
        );
        self.emit(
            names::WORKFLOW_COMPLETED,
            Payload::new()
                .arg(run.workflow_id.clone())
                .arg(run.run_id.clone())
                .arg(run.status.to_string())
                .kwarg("workflow_id", run.workflow_id.clone())
                .kwarg("run_id", run.run_id.clone())
                .kwarg("status", run.status.to_string()),
        );
    }

    /// Apply the guard of step `index`. Returns a plan when the step should
    /// execute; otherwise the step is already terminal.
    fn prepare(&self, run: &mut WorkflowRun, index: usize) -> Option<StepPlan> {
        let step = run.steps[index].step.clone();

        if let Some(expression) = step.condition.as_deref() {
            let snapshot: &WorkflowRun = run;
            let verdict = evaluate_condition(expression, |name| self.lookup(snapshot, name));
            match verdict {
                Ok(true) => {}
                Ok(false) => {
                    debug!(run_id = %run.run_id, step_id = %step.id, "Condition false; skipping step");
                    let slot = &mut run.steps[index];
                    slot.status = StepStatus::Skipped;
                    slot.completed_at = Some(Utc::now());
                    self.step_completed(run, &step.id, StepStatus::Skipped);
                    return None;
                }
                Err(err) => match ConditionFailure::from_config(&self.inner.config) {
                    ConditionFailure::FailOpen => {
                        warn!(run_id = %run.run_id, step_id = %step.id, error = %err, "Condition failed to evaluate; running step anyway");
                    }
                    ConditionFailure::FailClosed => {
                        warn!(run_id = %run.run_id, step_id = %step.id, error = %err, "Condition failed to evaluate; failing step");
                        let now = Utc::now();
                        let slot = &mut run.steps[index];
                        slot.status = StepStatus::Failed;
                        slot.error = Some(err.to_string());
                        slot.started_at = Some(now);
                        slot.completed_at = Some(now);
                        self.step_completed(run, &step.id, StepStatus::Failed);
                        return None;
                    }
                },
            }
        }

        let params = {
            let snapshot: &WorkflowRun = run;
            interpolate_map(&step.params, &|name: &str| self.lookup(snapshot, name))
        };

        let slot = &mut run.steps[index];
        slot.status = StepStatus::Running;
        slot.started_at = Some(Utc::now());

        info!(run_id = %run.run_id, step_id = %step.id, command = %step.command, "Executing step");
        self.emit(
            names::WORKFLOW_STEP_STARTED,
            Payload::new()
                .arg(run.run_id.clone())
                .arg(step.id.clone())
                .kwarg("run_id", run.run_id.clone())
                .kwarg("step_id", step.id.clone())
                .kwarg("workflow_id", run.workflow_id.clone()),
        );

        let timeout_secs = step.timeout_secs.unwrap_or_else(|| {
            self.inner
                .config
                .get_f64("workflow.default_timeout")
                .unwrap_or(DEFAULT_STEP_TIMEOUT_SECS)
        });
        let timeout = secs_to_duration(timeout_secs);

        Some(StepPlan {
            index,
            step_id: step.id,
            command: step.command,
            params,
            timeout,
            max_attempts: step.retry_count.saturating_add(1),
        })
    }

    /// Execute a planned step, retrying until it succeeds or attempts run out.
    async fn attempt(&self, plan: StepPlan) -> StepOutcome {
        let retry_delay = self
            .inner
            .config
            .get_i64("workflow.retry_delay_ms")
            .and_then(|ms| u64::try_from(ms).ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        let mut executions = Vec::new();
        let mut last_error = String::from("step did not run");

        for attempt in 1..=plan.max_attempts {
            let record = self
                .inner
                .engine
                .execute_with_timeout(&plan.command, plan.params.clone(), plan.timeout)
                .await;
            executions.push(record.id);

            if record.is_success() {
                return StepOutcome {
                    index: plan.index,
                    result: Ok(record.result.unwrap_or(Value::Null)),
                    attempts: attempt,
                    executions,
                };
            }

            last_error = record.error_message().unwrap_or_else(|| "unknown error".to_string());
            warn!(
                step_id = %plan.step_id,
                attempt,
                max_attempts = plan.max_attempts,
                error = %last_error,
                "Step attempt failed"
            );
            if attempt < plan.max_attempts {
                if let Some(delay) = retry_delay {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        StepOutcome {
            index: plan.index,
            result: Err(last_error),
            attempts: plan.max_attempts,
            executions,
        }
    }

    fn complete(&self, run: &mut WorkflowRun, outcome: StepOutcome) {
        let slot = &mut run.steps[outcome.index];
        slot.attempts = outcome.attempts;
        slot.executions = outcome.executions;
        slot.completed_at = Some(Utc::now());
        let step_id = slot.step.id.clone();

        let status = match outcome.result {
            Ok(value) => {
                slot.status = StepStatus::Success;
                slot.result = Some(value.clone());
                run.step_results.insert(step_id.clone(), value);
                StepStatus::Success
            }
            Err(error) => {
                slot.status = StepStatus::Failed;
                slot.error = Some(error);
                StepStatus::Failed
            }
        };
        self.step_completed(run, &step_id, status);
    }

    fn step_completed(&self, run: &WorkflowRun, step_id: &str, status: StepStatus) {
        info!(run_id = %run.run_id, step_id, status = %status, "Step finished");
        self.emit(
            names::WORKFLOW_STEP_COMPLETED,
            Payload::new()
                .arg(run.run_id.clone())
                .arg(step_id)
                .arg(status.to_string())
                .kwarg("run_id", run.run_id.clone())
                .kwarg("step_id", step_id)
                .kwarg("status", status.to_string())
                .kwarg("workflow_id", run.workflow_id.clone()),
        );
    }

    /// Resolve `${name}`: run variables, then `steps.<id>.result|status|error`,
    /// then configuration keys.
    fn lookup(&self, run: &WorkflowRun, name: &str) -> Option<Value> {
        if let Some(value) = run.variables.get(name) {
            return Some(value.clone());
        }
        if let Some(path) = name.strip_prefix("steps.") {
            if let Some((id, field)) = path.rsplit_once('.') {
                if let Some(step) = run.step(id) {
                    return match field {
                        "result" => step.result.clone(),
                        "status" => Some(Value::String(step.status.to_string())),
                        "error" => step.error.clone().map(Value::String),
                        _ => None,
                    };
                }
            }
        }
        self.inner.config.get(name).map(Value::from)
    }

    /// Dispatch the success or failure follow-up command line, if any.
    async fn follow_up(&self, definition: &WorkflowDefinition, run: &WorkflowRun) {
        let line = match run.status {
            RunStatus::Success => definition.on_success.as_deref(),
            RunStatus::Failed => definition.on_failure.as_deref(),
            RunStatus::Pending | RunStatus::Running => None,
        };
        let Some(line) = line else {
            return;
        };

        let engine = &self.inner.engine;
        let parsed = engine.processor().parse_untracked(line);
        if !parsed.is_valid {
            warn!(run_id = %run.run_id, line, error = ?parsed.error, "Invalid follow-up command");
            return;
        }

        let mut params = parsed.to_params();
        params.insert("workflow".into(), Value::from(run.workflow_id.clone()));
        params.insert("run_id".into(), Value::from(run.run_id.clone()));
        params.insert("status".into(), Value::from(run.status.to_string()));

        debug!(run_id = %run.run_id, command = %parsed.command, "Dispatching follow-up");
        let record = engine.execute_with_timeout(&parsed.command, params, None).await;
        if !record.is_success() {
            warn!(
                run_id = %run.run_id,
                command = %parsed.command,
                error = ?record.error_message(),
                "Follow-up command failed"
            );
        }
    }

    fn emit(&self, name: &str, payload: Payload) {
        self.inner.bus.emit_from(name, payload, "workflow");
    }
}

/// Owns the state of an in-flight run. If the run future is dropped before
/// it settles (an outer timeout, an aborted worker), the run is finalized as
/// FAILED instead of staying RUNNING in the history.
struct RunGuard<'a> {
    workflows: &'a WorkflowEngine,
    run: WorkflowRun,
    settled: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let now = Utc::now();
        let mut finished = Vec::new();
        for slot in &mut self.run.steps {
            let status = match slot.status {
                StepStatus::Running => {
                    slot.error = Some("workflow run interrupted".to_string());
                    StepStatus::Failed
                }
                StepStatus::Pending => StepStatus::Skipped,
                _ => continue,
            };
            slot.status = status;
            slot.completed_at = Some(now);
            finished.push((slot.step.id.clone(), status));
        }
        self.run.status = RunStatus::Failed;
        self.run.completed_at = Some(now);

        warn!(run_id = %self.run.run_id, workflow_id = %self.run.workflow_id, "Workflow run interrupted");
        for (step_id, status) in finished {
            self.workflows.step_completed(&self.run, &step_id, status);
        }
        self.workflows.inner.store(&self.run);
        self.workflows.run_completed(&self.run);
    }
}

impl fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("workflows", &self.inner.workflows.read().len())
            .field("runs", &self.inner.runs.lock().len())
            .finish()
    }
}

fn upgrade(workflows: &Weak<WorkflowInner>) -> Result<WorkflowEngine, CommandError> {
    workflows
        .upgrade()
        .map(|inner| WorkflowEngine { inner })
        .ok_or_else(|| CommandError::Unavailable("workflow engine has been dropped".into()))
}

/// `workflow.run --workflow=<id> [--var=value ...]`
struct RunWorkflowCommand {
    workflows: Weak<WorkflowInner>,
}

#[async_trait]
impl CommandHandler for RunWorkflowCommand {
    async fn handle(&self, ctx: &mut ExecutionContext) -> CommandResult {
        let workflows = upgrade(&self.workflows)?;
        let workflow_id = ctx
            .param_str("workflow")
            .map(str::to_string)
            .or_else(|| ctx.positional().first().map(|s| s.to_string()))
            .ok_or_else(|| CommandError::failed("workflow.run requires --workflow=<id>"))?;

        let overrides: Map<String, Value> = ctx
            .params()
            .iter()
            .filter(|(k, _)| !matches!(k.as_str(), "workflow" | "_positional" | "_flags"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let run = workflows
            .run_workflow(&workflow_id, overrides)
            .await
            .map_err(|err| CommandError::failed(err.to_string()))?;

        let summary = json!({
            "run_id": run.run_id,
            "workflow": run.workflow_id,
            "status": run.status,
            "steps": run.step_statuses(),
        });
        ctx.set_metadata("run_id", run.run_id.clone());
        ctx.add_output("workflow_run", summary.clone(), Some("summary"));

        match run.status {
            RunStatus::Success => Ok(summary),
            _ => Err(CommandError::failed(format!(
                "workflow '{workflow_id}' failed (run {})",
                run.run_id
            ))),
        }
    }

    fn description(&self) -> Option<&str> {
        Some("Run a registered workflow: workflow.run --workflow=<id> [--var=value]")
    }

    // Steps are bounded individually.
    fn uses_default_timeout(&self) -> bool {
        false
    }
}

/// `workflow.list`
struct ListWorkflowsCommand {
    workflows: Weak<WorkflowInner>,
}

#[async_trait]
impl CommandHandler for ListWorkflowsCommand {
    async fn handle(&self, _ctx: &mut ExecutionContext) -> CommandResult {
        let workflows = upgrade(&self.workflows)?;
        let rows: Vec<Value> = workflows
            .list_workflows()
            .iter()
            .map(|def| {
                json!({
                    "id": def.id,
                    "name": def.name,
                    "description": def.description,
                    "steps": def.steps.len(),
                })
            })
            .collect();
        Ok(Value::Array(rows))
    }

    fn description(&self) -> Option<&str> {
        Some("List registered workflows")
    }
}
