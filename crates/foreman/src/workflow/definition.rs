//! Workflow definitions: step templates plus the checks run at registration.

use crate::context::Params;
use crate::error::WorkflowError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Lifecycle of one step within one run.
///
/// `Pending -> Running -> {Success | Failed}` or `Pending -> Skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// A step template. Runs clone it into fresh runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// `==`/`!=` comparison or a single operand; see the `condition` module.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Per-attempt bound in seconds. `None` uses `workflow.default_timeout`;
    /// zero or less falls back to `engine.command_timeout`.
    #[serde(default, rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
    #[serde(default)]
    pub retry_count: u32,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            command: command.into(),
            params: Params::new(),
            depends_on: Vec::new(),
            condition: None,
            timeout_secs: None,
            retry_count: 0,
        }
    }

    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, secs: f64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    #[must_use]
    pub fn retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// A registered automation: ordered step templates, default variables and
/// optional follow-up command lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    /// Command line dispatched after a successful run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<String>,
    /// Command line dispatched after a failed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            variables: Map::new(),
            on_success: None,
            on_failure: None,
        }
    }

    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn on_success(mut self, command_line: impl Into<String>) -> Self {
        self.on_success = Some(command_line.into());
        self
    }

    #[must_use]
    pub fn on_failure(mut self, command_line: impl Into<String>) -> Self {
        self.on_failure = Some(command_line.into());
        self
    }

    pub fn from_json(text: &str) -> Result<Self, WorkflowError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_yaml(text: &str) -> Result<Self, WorkflowError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_value(value: Value) -> Result<Self, WorkflowError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> Result<Value, WorkflowError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn get_step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Fill display names from ids.
    pub(crate) fn normalize(&mut self) {
        if self.name.is_empty() {
            self.name = self.id.clone();
        }
        for step in &mut self.steps {
            if step.name.is_empty() {
                step.name = step.id.clone();
            }
        }
    }

    /// Reject definitions whose dependency graph cannot run: missing ids,
    /// duplicate step ids, dependencies on unknown steps, and cycles.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.id.trim().is_empty() || self.steps.iter().any(|s| s.id.trim().is_empty()) {
            return Err(WorkflowError::MissingId);
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(WorkflowError::DuplicateStep {
                    workflow: self.id.clone(),
                    step: step.id.clone(),
                });
            }
        }

        for step in &self.steps {
            if let Some(dependency) = step.depends_on.iter().find(|d| !seen.contains(d.as_str())) {
                return Err(WorkflowError::UnknownDependency {
                    workflow: self.id.clone(),
                    step: step.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }

        // Kahn: whatever never reaches in-degree zero sits on a cycle.
        let mut in_degree: BTreeMap<&str, usize> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.depends_on.len()))
            .collect();
        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        while let Some(done) = ready.pop() {
            for step in &self.steps {
                let edges = step.depends_on.iter().filter(|d| d.as_str() == done).count();
                if edges == 0 {
                    continue;
                }
                if let Some(degree) = in_degree.get_mut(step.id.as_str()) {
                    *degree -= edges;
                    if *degree == 0 {
                        ready.push(step.id.as_str());
                    }
                }
            }
        }

        let stuck: Vec<&str> = in_degree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(id, _)| id)
            .collect();
        if !stuck.is_empty() {
            return Err(WorkflowError::Cycle {
                workflow: self.id.clone(),
                steps: stuck.join(", "),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> WorkflowDefinition {
        WorkflowDefinition::new("ci", "CI")
            .step(WorkflowStep::new("lint", "test.lint"))
            .step(WorkflowStep::new("test", "test.run").depends_on(["lint"]))
    }

    #[test]
    fn valid_chain_passes() {
        assert!(chain().validate().is_ok());
    }

    #[test]
    fn duplicate_step_is_rejected() {
        let def = chain().step(WorkflowStep::new("lint", "again"));
        assert!(matches!(def.validate(), Err(WorkflowError::DuplicateStep { step, .. }) if step == "lint"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let def = chain().step(WorkflowStep::new("ship", "deploy").depends_on(["build"]));
        assert!(matches!(
            def.validate(),
            Err(WorkflowError::UnknownDependency { dependency, .. }) if dependency == "build"
        ));
    }

    #[test]
    fn cycle_is_rejected_with_its_members() {
        let def = WorkflowDefinition::new("loop", "Loop")
            .step(WorkflowStep::new("root", "x"))
            .step(WorkflowStep::new("a", "x").depends_on(["root", "b"]))
            .step(WorkflowStep::new("b", "x").depends_on(["a"]));
        match def.validate() {
            Err(WorkflowError::Cycle { steps, .. }) => assert_eq!(steps, "a, b"),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let def = WorkflowDefinition::new("me", "Me").step(WorkflowStep::new("a", "x").depends_on(["a"]));
        assert!(matches!(def.validate(), Err(WorkflowError::Cycle { .. })));
    }

    #[test]
    fn yaml_document_with_defaults() {
        let yaml = r#"
id: release
name: Release
steps:
  - id: build
    command: build.trigger
    params: { target: "${target}" }
    timeout: 60
  - id: publish
    command: deploy.trigger
    depends_on: [build]
    condition: '${steps.build.status} == "success"'
    retry_count: 2
variables:
  target: android_release
on_failure: "echo release failed"
"#;
        let mut def = WorkflowDefinition::from_yaml(yaml).unwrap();
        def.normalize();
        assert!(def.validate().is_ok());

        let publish = def.get_step("publish").unwrap();
        assert_eq!(publish.name, "publish");
        assert_eq!(publish.retry_count, 2);
        assert_eq!(publish.timeout_secs, None);
        assert_eq!(def.get_step("build").unwrap().timeout_secs, Some(60.0));
        assert_eq!(def.on_failure.as_deref(), Some("echo release failed"));
    }

    #[test]
    fn json_keeps_timeout_field_name() {
        let def = WorkflowDefinition::new("t", "T").step(WorkflowStep::new("s", "echo").timeout(5.0));
        let value = def.to_value().unwrap();
        assert_eq!(value["steps"][0]["timeout"], serde_json::json!(5.0));

        let back = WorkflowDefinition::from_json(&value.to_string()).unwrap();
        assert_eq!(back, def);
    }
}
