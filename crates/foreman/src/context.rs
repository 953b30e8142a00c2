//! Per-execution state handed to command handlers.

use crate::config::ConfigStore;
use crate::value::Scalar;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

/// Parameters of one execution.
pub type Params = Map<String, Value>;

/// Unique identifier of one command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, for log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One line written through [`ExecutionContext::log`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// An output produced by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: String,
    pub name: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// Everything a handler sees about its own execution.
///
/// Owned exclusively by one execution; the engine folds it into an
/// `ExecutionRecord` when the handler returns.
#[derive(Clone)]
pub struct ExecutionContext {
    id: ExecutionId,
    command: String,
    params: Params,
    config: ConfigStore,
    started: Instant,
    started_at: DateTime<Utc>,
    pub(crate) status: ExecutionStatus,
    pub(crate) progress: f64,
    pub(crate) logs: Vec<LogLine>,
    pub(crate) outputs: Vec<Artifact>,
    pub(crate) metadata: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new(id: ExecutionId, command: impl Into<String>, params: Params, config: ConfigStore) -> Self {
        Self {
            id,
            command: command.into(),
            params,
            config,
            started: Instant::now(),
            started_at: Utc::now(),
            status: ExecutionStatus::Running,
            progress: 0.0,
            logs: Vec::new(),
            outputs: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn id(&self) -> ExecutionId {
        self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn param_i64(&self, key: &str) -> Option<i64> {
        self.params.get(key).and_then(Value::as_i64)
    }

    /// Positional tokens of a parsed command line.
    pub fn positional(&self) -> Vec<&str> {
        self.string_list("_positional")
    }

    /// Whether `--name` or `-n` was given as a bare flag.
    pub fn has_flag(&self, name: &str) -> bool {
        self.string_list("_flags").contains(&name)
    }

    fn string_list(&self, key: &str) -> Vec<&str> {
        self.params
            .get(key)
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn get_config(&self, key: &str) -> Option<Scalar> {
        self.config.get(key)
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub fn logs(&self) -> &[LogLine] {
        &self.logs
    }

    pub fn outputs(&self) -> &[Artifact] {
        &self.outputs
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Append a log line and forward it to `tracing`.
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        let execution_id = self.id.short();
        match level {
            LogLevel::Debug => tracing::debug!(%execution_id, command = %self.command, "{message}"),
            LogLevel::Info => tracing::info!(%execution_id, command = %self.command, "{message}"),
            LogLevel::Warn => tracing::warn!(%execution_id, command = %self.command, "{message}"),
            LogLevel::Error => tracing::error!(%execution_id, command = %self.command, "{message}"),
        }
        self.logs.push(LogLine {
            timestamp: Utc::now(),
            level,
            message,
        });
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// Clamp to `0.0..=1.0`; an optional message is logged with the
    /// percentage.
    pub fn set_progress(&mut self, progress: f64, message: Option<&str>) {
        self.progress = if progress.is_nan() {
            self.progress
        } else {
            progress.clamp(0.0, 1.0)
        };
        if let Some(message) = message {
            let pct = (self.progress * 100.0).round();
            self.info(format!("Progress {pct}%: {message}"));
        }
    }

    /// Attach an output. Unnamed outputs are called `output_<n>`.
    pub fn add_output(&mut self, kind: impl Into<String>, data: impl Into<Value>, name: Option<&str>) {
        let name = name.map_or_else(|| format!("output_{}", self.outputs.len()), str::to_string);
        self.outputs.push(Artifact {
            kind: kind.into(),
            name,
            data: data.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("status", &self.status)
            .field("progress", &self.progress)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::config::ConfigDefaults;
    use serde_json::json;

    fn ctx(params: Value) -> ExecutionContext {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let config = ConfigStore::new(ConfigDefaults::standard(), EventBus::new());
        ExecutionContext::new(ExecutionId::new(), "test.run", params, config)
    }

    #[test]
    fn progress_is_clamped() {
        let mut c = ctx(json!({}));
        c.set_progress(1.7, None);
        assert_eq!(c.progress(), 1.0);
        c.set_progress(-3.0, Some("rewound"));
        assert_eq!(c.progress(), 0.0);
        assert_eq!(c.logs().len(), 1);
        assert!(c.logs()[0].message.contains("rewound"));
    }

    #[test]
    fn unnamed_outputs_are_numbered() {
        let mut c = ctx(json!({}));
        c.add_output("text", "a", None);
        c.add_output("file", json!({"path": "/tmp/x"}), Some("apk"));
        c.add_output("text", "b", None);

        let names: Vec<&str> = c.outputs().iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["output_0", "apk", "output_2"]);
    }

    #[test]
    fn parsed_positional_and_flags_are_readable() {
        let c = ctx(json!({"_positional": ["a", "b"], "_flags": ["v"], "n": 3}));
        assert_eq!(c.positional(), vec!["a", "b"]);
        assert!(c.has_flag("v"));
        assert!(!c.has_flag("q"));
        assert_eq!(c.param_i64("n"), Some(3));
    }

    #[test]
    fn config_is_reachable_from_the_context() {
        let c = ctx(json!({}));
        assert_eq!(c.get_config("app.name"), Some(Scalar::from("foreman")));
    }

    #[test]
    fn short_id_is_eight_chars() {
        assert_eq!(ExecutionId::new().short().len(), 8);
    }
}
