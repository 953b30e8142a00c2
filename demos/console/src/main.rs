//! # Console Example
//!
//! An interactive shell over the foreman core: type command lines, watch the
//! events they produce. Build, test and deploy handlers are simulated with
//! short sleeps so the bundled workflows have something to run.
//!
//! ```text
//! foreman> b --target=ios
//! foreman> @workflow build-deploy --version=2.0.0
//! foreman> &build.trigger        (prefix with & to run in the background)
//! foreman> config.list build
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use foreman_core::{
    names, CommandHandler, CommandResult, ConfigDefaults, ConfigStore, Engine, Event, EventBus,
    ExecuteResponse, ExecutionContext, ExecutionMode, WorkflowEngine, ENV_PREFIX,
};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Simulated handlers
// ============================================================================

/// Pretends to do `label` work for `millis`, reporting progress as it goes.
struct Simulated {
    label: &'static str,
    millis: u64,
}

#[async_trait]
impl CommandHandler for Simulated {
    async fn handle(&self, ctx: &mut ExecutionContext) -> CommandResult {
        let target = ctx
            .param_str("target")
            .or_else(|| ctx.param_str("suite"))
            .unwrap_or("default")
            .to_string();
        ctx.info(format!("{} started for {target}", self.label));

        for tick in 1..=4u32 {
            tokio::time::sleep(Duration::from_millis(self.millis / 4)).await;
            ctx.set_progress(f64::from(tick) / 4.0, None);
        }

        ctx.info(format!("{} finished", self.label));
        Ok(json!({ "action": self.label, "target": target }))
    }

    fn description(&self) -> Option<&str> {
        Some(self.label)
    }
}

fn register_simulated(engine: &Engine) {
    let handlers = [
        ("build.trigger", "build", 400),
        ("build.status", "build status", 20),
        ("test.lint", "lint", 150),
        ("test.run", "tests", 300),
        ("deploy.trigger", "deploy", 250),
        ("git.status", "git status", 20),
        ("git.pull", "git pull", 100),
        ("git.push", "git push", 100),
        ("git.checkout", "checkout", 80),
        ("system.install_deps", "dependency install", 200),
    ];
    for (name, label, millis) in handlers {
        engine.register_command(name, Simulated { label, millis });
    }
}

// ============================================================================
// Event printing
// ============================================================================

fn print_event(event: &Event) -> Result<()> {
    let detail = match event.name() {
        names::COMMAND_COMPLETED => format!(
            "{} ok ({}ms)",
            event.kwarg("command").and_then(|v| v.as_str()).unwrap_or("?"),
            event.kwarg("elapsed_ms").and_then(|v| v.as_u64()).unwrap_or_default()
        ),
        names::COMMAND_FAILED => format!(
            "{} failed: {}",
            event.kwarg("command").and_then(|v| v.as_str()).unwrap_or("?"),
            event.kwarg("error").and_then(|v| v.as_str()).unwrap_or("?")
        ),
        names::WORKFLOW_STEP_COMPLETED => format!(
            "step {} {}",
            event.kwarg("step_id").and_then(|v| v.as_str()).unwrap_or("?"),
            event.kwarg("status").and_then(|v| v.as_str()).unwrap_or("?")
        ),
        names::CONFIG_CHANGED => format!(
            "{} = {}",
            event.arg(0).and_then(|v| v.as_str()).unwrap_or("?"),
            event.arg(1).cloned().unwrap_or_default()
        ),
        _ => return Ok(()),
    };
    println!("  [{}] {detail}", event.name());
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let bus = EventBus::builder().queued().build();

    let config_path = std::env::var_os("FOREMAN_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("foreman.json"));
    let config = ConfigStore::with_file(ConfigDefaults::standard(), bus.clone(), &config_path);
    config
        .load()
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.overlay_env(ENV_PREFIX);

    let level = config.get_str("logging.level").unwrap_or_else(|| "info".into());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("foreman_core={level}"))),
        )
        .with_target(false)
        .init();

    for problem in config.validate() {
        tracing::warn!(%problem, "Configuration problem");
    }

    let engine = Engine::new(bus.clone(), config.clone());
    register_simulated(&engine);
    let workflows = WorkflowEngine::new(engine.clone(), config.clone(), bus.clone());
    workflows.register_builtin_workflows()?;
    engine.start()?;

    for pattern in ["command_completed", "command_failed", "workflow_step_completed", "config_changed"] {
        bus.subscribe(pattern, print_event);
    }

    println!("foreman console - 'help' lists commands, 'quit' exits");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"foreman> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "quit" | "exit" => break,
            _ => {}
        }

        let (line, mode) = match line.strip_prefix('&') {
            Some(rest) => (rest.trim(), ExecutionMode::Background),
            None => (line, ExecutionMode::Inline),
        };

        match engine.submit_line(line, mode).await {
            ExecuteResponse::Queued(id) => println!("queued {}", id.short()),
            ExecuteResponse::Finished(record) => {
                // Let queued deliveries land before the result line.
                tokio::time::sleep(Duration::from_millis(10)).await;
                match (&record.result, record.error_message()) {
                    (Some(result), _) => println!("{}", serde_json::to_string_pretty(result)?),
                    (None, Some(error)) => println!("error: {error}"),
                    (None, None) => {}
                }
            }
        }
    }

    engine.shutdown().await;
    bus.shutdown().await;
    config.save().context("saving configuration")?;
    Ok(())
}
