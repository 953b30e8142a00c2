//! Commands every engine ships with.

use crate::context::ExecutionContext;
use crate::engine::{CommandResult, Engine, EngineInner, FnHandler};
use crate::error::CommandError;
use crate::value::Scalar;
use serde_json::{json, Map, Value};
use std::sync::Weak;

const DEFAULT_HISTORY_ROWS: i64 = 20;

pub(crate) fn register(engine: &Engine) {
    engine.register_command(
        "echo",
        FnHandler::new(echo).describe("Print the given text back"),
    );
    engine.register_command(
        "config.get",
        FnHandler::new(config_get).describe("Read one setting: config.get <key>"),
    );
    engine.register_command(
        "config.set",
        FnHandler::new(config_set).describe("Change one setting: config.set <key> <value>"),
    );
    engine.register_command(
        "config.list",
        FnHandler::new(config_list).describe("List settings, optionally under a prefix"),
    );
    engine.register_command(
        "config.reset",
        FnHandler::new(config_reset).describe("Reset one setting, or all of them"),
    );

    let weak = engine.downgrade();
    engine.register_command(
        "help",
        FnHandler::new(move |ctx| help(&weak, ctx)).describe("List available commands and aliases"),
    );
    let weak = engine.downgrade();
    engine.register_command(
        "system.status",
        FnHandler::new(move |ctx| system_status(&weak, ctx)).describe("Engine and configuration health"),
    );
    let weak = engine.downgrade();
    engine.register_command(
        "history",
        FnHandler::new(move |ctx| history(&weak, ctx)).describe("Recent executions: history [--limit=N]"),
    );
}

fn upgrade(engine: &Weak<EngineInner>) -> Result<Engine, CommandError> {
    engine
        .upgrade()
        .map(Engine::from_inner)
        .ok_or_else(|| CommandError::Unavailable("engine has been dropped".into()))
}

/// Named parameter, or the positional token at `index`.
fn param_or_positional(ctx: &ExecutionContext, name: &str, index: usize) -> Option<Value> {
    ctx.param(name)
        .cloned()
        .or_else(|| ctx.positional().get(index).map(|s| Value::from(*s)))
}

fn echo(ctx: &mut ExecutionContext) -> CommandResult {
    let text = ctx
        .param_str("message")
        .or_else(|| ctx.param_str("text"))
        .map(str::to_string)
        .unwrap_or_else(|| ctx.positional().join(" "));
    ctx.add_output("text", text.clone(), None);
    Ok(Value::String(text))
}

fn config_get(ctx: &mut ExecutionContext) -> CommandResult {
    let key = param_or_positional(ctx, "key", 0)
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| CommandError::failed("config.get requires a key"))?;
    ctx.config()
        .get(&key)
        .map(Value::from)
        .ok_or_else(|| CommandError::failed(format!("Unknown config key: {key}")))
}

fn config_set(ctx: &mut ExecutionContext) -> CommandResult {
    let key = param_or_positional(ctx, "key", 0)
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| CommandError::failed("config.set requires a key"))?;

    let value = match ctx.param("value") {
        Some(value) => Scalar::from_json(value)
            .ok_or_else(|| CommandError::failed("config values must be booleans, numbers or strings"))?,
        None => ctx
            .positional()
            .get(1)
            .map(|raw| Scalar::coerce(raw))
            .ok_or_else(|| CommandError::failed("config.set requires a value"))?,
    };

    let changed = ctx.config().set(&key, value.clone());
    ctx.info(format!("{key} = {value}"));
    Ok(json!({ "key": key, "value": value, "changed": changed }))
}

fn config_list(ctx: &mut ExecutionContext) -> CommandResult {
    let prefix = param_or_positional(ctx, "prefix", 0).and_then(|v| v.as_str().map(str::to_string));
    let entries = match prefix {
        Some(prefix) => ctx.config().get_section(&prefix),
        None => ctx.config().export_all(),
    };
    let object: Map<String, Value> = entries.into_iter().map(|(k, v)| (k, v.to_json())).collect();
    Ok(Value::Object(object))
}

fn config_reset(ctx: &mut ExecutionContext) -> CommandResult {
    let key = param_or_positional(ctx, "key", 0).and_then(|v| v.as_str().map(str::to_string));
    ctx.config().reset(key.as_deref());
    Ok(json!({ "reset": key.unwrap_or_else(|| "all".to_string()) }))
}

fn help(engine: &Weak<EngineInner>, ctx: &mut ExecutionContext) -> CommandResult {
    let engine = upgrade(engine)?;
    let commands: Vec<Value> = engine
        .describe_commands()
        .into_iter()
        .map(|(name, description)| json!({ "name": name, "description": description }))
        .collect();
    let aliases = engine.processor().aliases();
    ctx.info(format!("{} commands, {} aliases", commands.len(), aliases.len()));
    Ok(json!({ "commands": commands, "aliases": aliases }))
}

fn system_status(engine: &Weak<EngineInner>, ctx: &mut ExecutionContext) -> CommandResult {
    let engine = upgrade(engine)?;
    let status = serde_json::to_value(engine.status())
        .map_err(|err| CommandError::failed(format!("cannot encode status: {err}")))?;
    Ok(json!({
        "app": ctx.get_config("app.name"),
        "version": ctx.get_config("app.version"),
        "engine": status,
        "config_errors": ctx.config().validate(),
    }))
}

fn history(engine: &Weak<EngineInner>, ctx: &mut ExecutionContext) -> CommandResult {
    let engine = upgrade(engine)?;
    let limit = ctx
        .param_i64("limit")
        .unwrap_or(DEFAULT_HISTORY_ROWS)
        .max(0);
    let rows: Vec<Value> = engine
        .get_history(usize::try_from(limit).unwrap_or(0))
        .into_iter()
        .map(|r| {
            json!({
                "id": r.id,
                "command": r.command,
                "status": r.status,
                "elapsed_ms": r.elapsed_ms,
                "error": r.error_message(),
            })
        })
        .collect();
    Ok(Value::Array(rows))
}

#[cfg(test)]
mod tests {
    use crate::bus::EventBus;
    use crate::config::{ConfigDefaults, ConfigStore};
    use crate::engine::{Engine, ExecutionMode};
    use serde_json::{json, Value};

    fn engine() -> Engine {
        let bus = EventBus::new();
        let config = ConfigStore::new(ConfigDefaults::standard(), bus.clone());
        Engine::new(bus, config)
    }

    async fn run(engine: &Engine, line: &str) -> crate::engine::ExecutionRecord {
        engine
            .submit_line(line, ExecutionMode::Inline)
            .await
            .into_record()
            .unwrap()
    }

    #[tokio::test]
    async fn echo_joins_positional_tokens() {
        let engine = engine();
        let record = run(&engine, "echo hello there").await;
        assert_eq!(record.result, Some(json!("hello there")));
        assert_eq!(record.outputs.len(), 1);
    }

    #[tokio::test]
    async fn config_commands_round_trip() {
        let engine = engine();

        let set = run(&engine, "config.set build.target ios").await;
        assert_eq!(set.result.unwrap()["changed"], json!(true));

        let get = run(&engine, "c build.target").await;
        assert_eq!(get.result, Some(json!("ios")));

        let list = run(&engine, "config.list --prefix=build").await;
        assert_eq!(list.result.unwrap()["build.target"], json!("ios"));

        run(&engine, "config.reset build.target").await;
        assert_eq!(engine.config().get_str("build.target").as_deref(), Some("android"));
    }

    #[tokio::test]
    async fn config_set_types_positional_values() {
        let engine = engine();
        run(&engine, "config.set network.timeout 45").await;
        assert_eq!(engine.config().get_i64("network.timeout"), Some(45));
    }

    #[tokio::test]
    async fn config_get_unknown_key_fails() {
        let engine = engine();
        let record = run(&engine, "config.get no.such.key").await;
        assert!(!record.is_success());
        assert!(record.error_message().unwrap().contains("no.such.key"));
    }

    #[tokio::test]
    async fn help_and_status_describe_the_engine() {
        let engine = engine();

        let help = run(&engine, "help").await.result.unwrap();
        let names: Vec<&str> = help["commands"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|c| c["name"].as_str())
            .collect();
        assert!(names.contains(&"echo"));
        assert!(names.contains(&"system.status"));
        assert_eq!(help["aliases"]["b"], json!("build.trigger"));

        let status = run(&engine, "s").await.result.unwrap();
        assert_eq!(status["app"], json!("foreman"));
        assert_eq!(status["config_errors"], json!([]));
        assert_eq!(status["engine"]["running"], Value::Bool(false));
    }

    #[tokio::test]
    async fn history_lists_recent_executions() {
        let engine = engine();
        run(&engine, "echo one").await;
        run(&engine, "echo two").await;
        run(&engine, "echo three").await;

        let rows = run(&engine, "history --limit=2").await.result.unwrap();
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["command"], json!("echo"));
        assert_eq!(rows[0]["status"], json!("completed"));
    }
}
