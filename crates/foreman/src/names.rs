//! Event names emitted by the built-in components.
//!
//! Lifecycle names are flat (no dot), so subscribe to them by exact name or
//! through the global `*` pattern. User events are free to use dotted
//! namespaces such as `build.started` and `build.*` subscriptions.

pub const COMMAND_STARTED: &str = "command_started";
pub const COMMAND_COMPLETED: &str = "command_completed";
pub const COMMAND_FAILED: &str = "command_failed";
pub const COMMAND_CANCELLED: &str = "command_cancelled";

pub const ENGINE_STARTED: &str = "engine_started";
pub const ENGINE_STOPPED: &str = "engine_stopped";

pub const CONFIG_CHANGED: &str = "config_changed";
pub const CONFIG_RESET: &str = "config_reset";
pub const CONFIG_IMPORTED: &str = "config_imported";

pub const WORKFLOW_REGISTERED: &str = "workflow_registered";
pub const WORKFLOW_STARTED: &str = "workflow_started";
pub const WORKFLOW_STEP_STARTED: &str = "workflow_step_started";
pub const WORKFLOW_STEP_COMPLETED: &str = "workflow_step_completed";
pub const WORKFLOW_COMPLETED: &str = "workflow_completed";
