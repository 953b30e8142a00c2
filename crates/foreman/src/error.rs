//! Error types for every component boundary.
//!
//! | Error | Raised by | Surfaces as |
//! |-------|-----------|-------------|
//! | [`CommandError`] | command handlers, the execution engine | `ExecutionRecord::error` |
//! | [`ConfigError`] | configuration persistence | `Result` from `load`/`save` |
//! | [`EngineError`] | engine lifecycle, workflow delegation | `Result` from `start`/`register_workflow` |
//! | [`WorkflowError`] | definition parsing, registration, run lookup | `Result` from the workflow engine |
//! | [`ConditionError`] | step condition parsing and evaluation | step failure or fail-open log |
//!
//! Parse errors of raw command lines never become errors: they are carried in
//! `ParsedCommand::error`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// The failure side of a command handler's result.
///
/// Stored in execution history and emitted with `command_failed`, so it is
/// cloneable and serializable.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CommandError {
    /// No handler is registered under the command name.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// The raw command line did not parse or validate.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The handler reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The handler panicked; the panic was contained at the engine boundary.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The handler did not finish within its bound (milliseconds).
    #[error("timed out after {0}ms")]
    TimedOut(u64),

    /// The execution was cancelled while still queued.
    #[error("execution cancelled before it started")]
    Cancelled,

    /// The engine could not accept the execution (queue full, shut down).
    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

impl CommandError {
    /// Shorthand for [`CommandError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<anyhow::Error> for CommandError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}

/// Configuration persistence error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON.
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The config file parsed, but its top level is not an object.
    #[error("config file '{path}' must contain a JSON object of dot-notation keys")]
    NotAnObject { path: PathBuf },

    /// Failed to serialize the overrides.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Failed to write the config file.
    #[error("failed to write config file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to create the config directory.
    #[error("failed to create config directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub fn read_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ReadFile {
            path: path.into(),
            source,
        }
    }

    pub fn parse(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Parse {
            path: path.into(),
            source,
        }
    }

    pub fn write_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::WriteFile {
            path: path.into(),
            source,
        }
    }

    pub fn create_dir(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::CreateDir {
            path: path.into(),
            source,
        }
    }
}

/// Engine lifecycle and delegation error.
#[derive(Debug, Error)]
pub enum EngineError {
    /// `start` was called outside a tokio runtime.
    #[error("no tokio runtime available to host the engine worker")]
    NoRuntime,

    /// No workflow engine is attached to this execution engine.
    #[error("no workflow engine attached")]
    NoWorkflowHost,

    /// The attached workflow engine rejected the request.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

/// Workflow definition and run error.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("workflow '{workflow}' defines step '{step}' more than once")]
    DuplicateStep { workflow: String, step: String },

    #[error("step '{step}' of workflow '{workflow}' depends on unknown step '{dependency}'")]
    UnknownDependency {
        workflow: String,
        step: String,
        dependency: String,
    },

    #[error("workflow '{workflow}' has a dependency cycle through: {steps}")]
    Cycle { workflow: String, steps: String },

    #[error("workflow definition is missing an id")]
    MissingId,

    #[error("invalid workflow JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid workflow YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Step condition parse or evaluation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("cannot parse condition '{expression}': {reason}")]
    Parse { expression: String, reason: String },

    #[error("unknown variable '{0}' in condition")]
    UnknownVariable(String),
}

impl ConditionError {
    pub(crate) fn parse(expression: &str, reason: impl Into<String>) -> Self {
        Self::Parse {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}
