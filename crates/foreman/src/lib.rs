//! # Foreman
//!
//! A command-driven automation core: text commands come in, get parsed,
//! executed by registered handlers, strung together into workflows, and
//! every step is announced on an event bus.
//!
//! ## Core Concepts
//!
//! - [`CommandProcessor`] turns a raw line into a [`ParsedCommand`]
//! - [`Engine`] runs commands inline or through a bounded FIFO queue
//! - [`WorkflowEngine`] runs dependency graphs of commands
//! - [`ConfigStore`] holds live, observable settings
//! - [`EventBus`] tells everyone what happened
//!
//! ## Architecture
//!
//! ```text
//! "build.trigger --target=ios"
//!     │
//!     ▼ parse()
//! CommandProcessor ── aliases, @shell/@workflow/@ai/@remote, validation
//!     │
//!     ▼ submit_line()
//! Engine ──────────────────────────────────────────┐
//!     │                                            │
//!     ├─► Inline ─────► handler.handle(ctx) ──┐    │
//!     │                                       │    │
//!     └─► Background ─► queue ─► worker ──────┤    │
//!                                             ▼    │
//!                                      ExecutionRecord
//!                                             │    │
//!      WorkflowEngine ── steps ──► execute() ─┘    │
//!                                                  ▼
//! ConfigStore ── config_changed ──────────────► EventBus ─► subscribers
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Execution never throws** - every failure is a FAILED record plus a
//!    `command_failed` event
//! 2. **Subscribers are isolated** - a failing callback is logged and the
//!    rest still run
//! 3. **Steps start only after their dependencies succeed** - a failed
//!    dependency skips everything downstream
//! 4. **Conditions are data** - guards are parsed by a closed grammar, never
//!    evaluated as code
//!
//! ## Example
//!
//! ```
//! use foreman_core::{params, ConfigDefaults, ConfigStore, Engine, EventBus, ExecutionMode};
//!
//! # async fn demo() {
//! let bus = EventBus::new();
//! let config = ConfigStore::new(ConfigDefaults::standard(), bus.clone());
//! let engine = Engine::new(bus.clone(), config);
//!
//! engine.register_fn("greet", |ctx| {
//!     let who = ctx.param_str("who").unwrap_or("world").to_string();
//!     Ok(format!("hello {who}").into())
//! });
//!
//! let record = engine
//!     .execute("greet", params! { "who" => "crew" }, ExecutionMode::Inline)
//!     .await
//!     .into_record();
//! assert!(record.is_some_and(|r| r.is_success()));
//! # }
//! ```

mod builtins;
mod bus;
mod command;
mod config;
mod context;
mod engine;
mod error;
mod params_macro;
mod value;

pub mod global;
pub mod names;
pub mod workflow;

// Re-export bus types
pub use bus::{
    DeliveryMode, Event, EventBus, EventBusBuilder, EventCallback, Pattern, Payload,
    SubscriptionId, DEFAULT_HISTORY_SIZE,
};

// Re-export command parsing
pub use command::{
    CommandCatalog, CommandCategory, CommandProcessor, ParsedCommand, DEFAULT_HISTORY_LIMIT,
    DEFAULT_MAX_COMPLETIONS,
};

// Re-export configuration
pub use config::{ConfigCallback, ConfigDefaults, ConfigStore, ValidationRule, ENV_PREFIX};

// Re-export execution types
pub use context::{
    Artifact, ExecutionContext, ExecutionId, ExecutionStatus, LogLevel, LogLine, Params,
};
pub use engine::{
    CommandHandler, CommandResult, Engine, EngineStatus, ExecuteResponse, ExecutionMode,
    ExecutionRecord, FnHandler, WorkflowHost,
};

// Re-export workflow types (primary entry point for automation)
pub use workflow::{
    ConditionFailure, RunStatus, StepRun, StepStatus, WorkflowDefinition, WorkflowEngine,
    WorkflowRun, WorkflowStep,
};

// Re-export error types
pub use error::{CommandError, ConditionError, ConfigError, EngineError, WorkflowError};

pub use value::Scalar;

// Re-export commonly used external types
pub use async_trait::async_trait;

#[doc(hidden)]
pub use serde_json as __serde_json;
