//! Runtime state of one workflow invocation.

use super::definition::{StepStatus, WorkflowDefinition, WorkflowStep};
use crate::context::ExecutionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A step template plus its state within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRun {
    pub step: WorkflowStep,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub attempts: u32,
    /// One execution per attempt, oldest first.
    pub executions: Vec<ExecutionId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRun {
    fn new(step: WorkflowStep) -> Self {
        Self {
            step,
            status: StepStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
            executions: Vec::new(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.step.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: RunStatus,
    /// Definition defaults merged with caller overrides.
    pub variables: Map<String, Value>,
    /// Results of successful steps by step id.
    pub step_results: Map<String, Value>,
    pub steps: Vec<StepRun>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub(crate) fn new(definition: &WorkflowDefinition, overrides: Map<String, Value>) -> Self {
        let mut variables = definition.variables.clone();
        variables.extend(overrides);
        Self {
            run_id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            workflow_id: definition.id.clone(),
            workflow_name: definition.name.clone(),
            status: RunStatus::Pending,
            variables,
            step_results: Map::new(),
            steps: definition.steps.iter().cloned().map(StepRun::new).collect(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepRun> {
        self.steps.iter().find(|s| s.step.id == id)
    }

    /// Indices of PENDING steps whose every dependency is SUCCESS.
    pub(crate) fn ready_indices(&self) -> Vec<usize> {
        self.steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == StepStatus::Pending)
            .filter(|(_, s)| {
                s.step.depends_on.iter().all(|dep| {
                    self.step(dep)
                        .is_some_and(|d| d.status == StepStatus::Success)
                })
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Ids of the current ready set.
    pub fn ready_steps(&self) -> Vec<&str> {
        self.ready_indices()
            .into_iter()
            .map(|i| self.steps[i].id())
            .collect()
    }

    /// Every step terminal.
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    /// Complete and nothing FAILED.
    pub fn is_success(&self) -> bool {
        self.is_complete() && self.steps.iter().all(|s| s.status != StepStatus::Failed)
    }

    /// Step id to status.
    pub fn step_statuses(&self) -> BTreeMap<String, StepStatus> {
        self.steps
            .iter()
            .map(|s| (s.step.id.clone(), s.status))
            .collect()
    }

    /// Mark every PENDING step SKIPPED; returns their ids.
    pub(crate) fn skip_pending(&mut self) -> Vec<String> {
        let now = Utc::now();
        self.steps
            .iter_mut()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| {
                s.status = StepStatus::Skipped;
                s.completed_at = Some(now);
                s.step.id.clone()
            })
            .collect()
    }

    pub fn elapsed_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}
