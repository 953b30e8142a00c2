//! Command Processor - raw command lines to structured descriptors.
//!
//! # Surface syntaxes
//!
//! Tried in this order against the alias-expanded input:
//!
//! ```text
//! @shell <cmd>                      shell         {cmd}
//! @workflow <id> [args]             workflow.run  {workflow, ..args}
//! @ai <action> [prompt] [args]      ai.<action>   {action, prompt, ..args}
//! @remote <target> <cmd>            remote.execute {target, command}
//! <namespace.command> [args]        as written, lowercased
//! ```
//!
//! # Argument grammar
//!
//! ```text
//! --key=value    typed parameter
//! --key value    typed parameter (when `value` does not start with '-')
//! --key          flag
//! -k             short flag
//! anything else  positional
//! ```
//!
//! Values are coerced with [`Scalar::coerce`]. Parsing never fails: a bad
//! line yields `is_valid == false` and a diagnostic in `error`.

use crate::value::Scalar;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use tracing::debug;

pub const DEFAULT_HISTORY_LIMIT: usize = 1000;
pub const DEFAULT_MAX_COMPLETIONS: usize = 20;

/// Command names known to the processor before any handler is registered.
const KNOWN_COMMANDS: &[&str] = &[
    "echo",
    "help",
    "history",
    "config.get",
    "config.set",
    "config.list",
    "config.reset",
    "system.status",
    "build.trigger",
    "build.status",
    "git.status",
    "git.pull",
    "git.push",
    "workflow.run",
    "workflow.list",
    "ai.generate",
    "ai.refactor",
    "ai.explain",
];

const DEFAULT_ALIASES: &[(&str, &str)] = &[
    ("b", "build.trigger"),
    ("s", "system.status"),
    ("c", "config.get"),
    ("h", "help"),
    ("g", "ai.generate"),
];

/// Which surface syntax produced a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandCategory {
    Builtin,
    Workflow,
    Shell,
    Remote,
    Ai,
}

impl fmt::Display for CommandCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Builtin => "builtin",
            Self::Workflow => "workflow",
            Self::Shell => "shell",
            Self::Remote => "remote",
            Self::Ai => "ai",
        };
        f.write_str(name)
    }
}

/// The structured form of one command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedCommand {
    /// The input after alias expansion.
    pub raw: String,
    pub command: String,
    pub category: CommandCategory,
    pub params: BTreeMap<String, Scalar>,
    pub positional: Vec<String>,
    pub flags: Vec<String>,
    pub is_valid: bool,
    pub error: Option<String>,
}

impl ParsedCommand {
    fn valid(raw: &str, command: impl Into<String>, category: CommandCategory) -> Self {
        Self {
            raw: raw.to_string(),
            command: command.into(),
            category,
            params: BTreeMap::new(),
            positional: Vec::new(),
            flags: Vec::new(),
            is_valid: true,
            error: None,
        }
    }

    fn invalid(
        raw: &str,
        command: impl Into<String>,
        category: CommandCategory,
        error: impl Into<String>,
    ) -> Self {
        Self {
            is_valid: false,
            error: Some(error.into()),
            ..Self::valid(raw, command, category)
        }
    }

    fn with_args(mut self, args: Args) -> Self {
        self.params.extend(args.params);
        self.positional = args.positional;
        self.flags = args.flags;
        self
    }

    /// Engine parameters: typed params as JSON, positional tokens under
    /// `_positional` and flags under `_flags` (each only when non-empty).
    pub fn to_params(&self) -> Map<String, Value> {
        let mut params: Map<String, Value> = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        if !self.positional.is_empty() {
            params.insert("_positional".into(), Value::from(self.positional.clone()));
        }
        if !self.flags.is_empty() {
            params.insert("_flags".into(), Value::from(self.flags.clone()));
        }
        params
    }
}

/// Lookup of registered command names, used by [`CommandProcessor::validate`].
pub trait CommandCatalog {
    fn has_command(&self, name: &str) -> bool;
}

impl CommandCatalog for BTreeSet<String> {
    fn has_command(&self, name: &str) -> bool {
        self.contains(name)
    }
}

/// Parses command lines and keeps the state that makes parsing friendlier:
/// aliases, input history, known command names.
pub struct CommandProcessor {
    aliases: RwLock<BTreeMap<String, String>>,
    history: Mutex<VecDeque<String>>,
    known: RwLock<BTreeSet<String>>,
    history_limit: usize,
    max_completions: usize,
}

impl CommandProcessor {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_HISTORY_LIMIT, DEFAULT_MAX_COMPLETIONS)
    }

    pub fn with_limits(history_limit: usize, max_completions: usize) -> Self {
        let aliases = DEFAULT_ALIASES
            .iter()
            .map(|(a, e)| (a.to_string(), e.to_string()))
            .collect();
        let known = KNOWN_COMMANDS.iter().map(|c| c.to_string()).collect();
        Self {
            aliases: RwLock::new(aliases),
            history: Mutex::new(VecDeque::new()),
            known: RwLock::new(known),
            history_limit: history_limit.max(1),
            max_completions,
        }
    }

    /// Parse a command line and record it in the input history.
    ///
    /// Blank input is reported invalid and is not recorded.
    pub fn parse(&self, input: &str) -> ParsedCommand {
        let input = input.trim();
        if input.is_empty() {
            return ParsedCommand::invalid("", "", CommandCategory::Builtin, "Empty command");
        }
        self.record(input);
        self.parse_untracked(input)
    }

    /// Parse without touching the history. Used for generated command lines
    /// such as workflow follow-ups.
    pub fn parse_untracked(&self, input: &str) -> ParsedCommand {
        let input = input.trim();
        if input.is_empty() {
            return ParsedCommand::invalid("", "", CommandCategory::Builtin, "Empty command");
        }

        let expanded = self.expand_alias(input);
        let (head, rest) = split_head(&expanded);

        let parsed = match head.to_ascii_lowercase().as_str() {
            "@shell" => parse_shell(&expanded, rest),
            "@workflow" => parse_workflow(&expanded, rest),
            "@ai" => parse_ai(&expanded, rest),
            "@remote" => parse_remote(&expanded, rest),
            _ => parse_dotted(&expanded, head, rest),
        };

        debug!(
            input,
            command = %parsed.command,
            category = %parsed.category,
            valid = parsed.is_valid,
            "Parsed command"
        );
        parsed
    }

    /// Mark a dot-notation command invalid when its name is neither known to
    /// the processor nor present in `catalog`. Other categories pass through.
    pub fn validate(&self, mut parsed: ParsedCommand, catalog: &dyn CommandCatalog) -> ParsedCommand {
        if !parsed.is_valid || parsed.category != CommandCategory::Builtin {
            return parsed;
        }
        let known = self.known.read().contains(&parsed.command);
        if !known && !catalog.has_command(&parsed.command) {
            parsed.is_valid = false;
            parsed.error = Some(format!("Unknown command: {}", parsed.command));
        }
        parsed
    }

    /// Completion candidates for `partial`: known command names, then aliases,
    /// then past inputs (most recent first), without duplicates.
    pub fn get_completions(&self, partial: &str) -> Vec<String> {
        let needle = partial.to_ascii_lowercase();
        let mut out: Vec<String> = Vec::new();

        let known = self.known.read();
        out.extend(known.iter().filter(|c| c.starts_with(&needle)).cloned());
        drop(known);

        let aliases = self.aliases.read();
        for alias in aliases.keys().filter(|a| a.starts_with(&needle)) {
            if !out.contains(alias) {
                out.push(alias.clone());
            }
        }
        drop(aliases);

        let history = self.history.lock();
        for past in history.iter().rev() {
            if past.to_ascii_lowercase().starts_with(&needle) && !out.contains(past) {
                out.push(past.clone());
            }
        }

        out.truncate(self.max_completions);
        out
    }

    /// Add or replace an alias. The alias must be a single token.
    pub fn add_alias(&self, alias: impl Into<String>, expansion: impl Into<String>) {
        let alias = alias.into();
        let expansion = expansion.into();
        debug!(alias = %alias, expansion = %expansion, "Alias added");
        self.aliases.write().insert(alias, expansion);
    }

    pub fn aliases(&self) -> BTreeMap<String, String> {
        self.aliases.read().clone()
    }

    /// Make a command name known for validation and completion.
    pub fn register_known(&self, name: impl Into<String>) {
        self.known.write().insert(name.into());
    }

    /// The most recent `limit` inputs, oldest first.
    pub fn history(&self, limit: usize) -> Vec<String> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    fn record(&self, input: &str) {
        let mut history = self.history.lock();
        history.push_back(input.to_string());
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    fn expand_alias(&self, input: &str) -> String {
        let (head, rest) = split_head(input);
        match self.aliases.read().get(head) {
            Some(expansion) if rest.is_empty() => expansion.clone(),
            Some(expansion) => format!("{expansion} {rest}"),
            None => input.to_string(),
        }
    }
}

impl Default for CommandProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommandProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandProcessor")
            .field("aliases", &self.aliases.read().len())
            .field("history", &self.history.lock().len())
            .field("known", &self.known.read().len())
            .finish()
    }
}

/// First whitespace-delimited token and the trimmed remainder.
fn split_head(input: &str) -> (&str, &str) {
    match input.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (input, ""),
    }
}

fn parse_shell(raw: &str, rest: &str) -> ParsedCommand {
    if rest.is_empty() {
        return ParsedCommand::invalid(raw, "shell", CommandCategory::Shell, "Invalid shell command");
    }
    let mut parsed = ParsedCommand::valid(raw, "shell", CommandCategory::Shell);
    parsed.params.insert("cmd".into(), Scalar::String(rest.to_string()));
    parsed
}

fn parse_workflow(raw: &str, rest: &str) -> ParsedCommand {
    let (name, args) = split_head(rest);
    if name.is_empty() {
        return ParsedCommand::invalid(
            raw,
            "workflow",
            CommandCategory::Workflow,
            "Invalid workflow command",
        );
    }
    let mut parsed =
        ParsedCommand::valid(raw, "workflow.run", CommandCategory::Workflow).with_args(parse_args(args));
    parsed
        .params
        .insert("workflow".into(), Scalar::String(name.to_string()));
    parsed
}

fn parse_ai(raw: &str, rest: &str) -> ParsedCommand {
    let (action, args) = split_head(rest);
    if action.is_empty() {
        return ParsedCommand::invalid(raw, "ai", CommandCategory::Ai, "Invalid AI command");
    }
    let action = action.to_ascii_lowercase();
    let args = parse_args(args);
    let prompt = args.positional.join(" ");

    let mut parsed =
        ParsedCommand::valid(raw, format!("ai.{action}"), CommandCategory::Ai).with_args(args);
    parsed.params.insert("action".into(), Scalar::String(action));
    parsed.params.insert("prompt".into(), Scalar::String(prompt));
    parsed
}

fn parse_remote(raw: &str, rest: &str) -> ParsedCommand {
    let (target, command) = split_head(rest);
    if target.is_empty() || command.is_empty() {
        return ParsedCommand::invalid(raw, "remote", CommandCategory::Remote, "Invalid remote command");
    }
    let mut parsed = ParsedCommand::valid(raw, "remote.execute", CommandCategory::Remote);
    parsed
        .params
        .insert("target".into(), Scalar::String(target.to_string()));
    parsed
        .params
        .insert("command".into(), Scalar::String(command.to_string()));
    parsed
}

/// Names are a letter followed by at least one of `[A-Za-z0-9_.]`.
fn parse_dotted(raw: &str, head: &str, rest: &str) -> ParsedCommand {
    let mut chars = head.chars();
    let well_formed = head.len() >= 2
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if !well_formed {
        return ParsedCommand::invalid(raw, raw, CommandCategory::Builtin, "Invalid command format");
    }
    ParsedCommand::valid(raw, head.to_ascii_lowercase(), CommandCategory::Builtin)
        .with_args(parse_args(rest))
}

#[derive(Debug, Default)]
struct Args {
    params: BTreeMap<String, Scalar>,
    positional: Vec<String>,
    flags: Vec<String>,
}

fn parse_args(input: &str) -> Args {
    let mut args = Args::default();
    let tokens = tokenize(input).unwrap_or_else(|| input.split_whitespace().map(str::to_string).collect());

    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];
        if let Some(body) = token.strip_prefix("--").filter(|b| !b.is_empty()) {
            if let Some((key, value)) = body.split_once('=') {
                args.params.insert(key.to_string(), Scalar::coerce(value));
            } else if let Some(next) = tokens.get(i + 1).filter(|n| !n.starts_with('-')) {
                args.params.insert(body.to_string(), Scalar::coerce(next));
                i += 1;
            } else {
                args.flags.push(body.to_string());
            }
        } else if token.len() == 2 && token.starts_with('-') && token != "--" {
            args.flags.push(token[1..].to_string());
        } else {
            args.positional.push(token.clone());
        }
        i += 1;
    }
    args
}

/// Shell-style tokenizer: single quotes are literal, double quotes allow
/// backslash escapes, backslash escapes outside quotes. `None` when a quote
/// is left open or the input ends in a lone backslash.
fn tokenize(input: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next()? {
                        '\'' => break,
                        c => current.push(c),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next()? {
                        '"' => break,
                        '\\' => match chars.next()? {
                            c @ ('"' | '\\' | '$' | '`') => current.push(c),
                            c => {
                                current.push('\\');
                                current.push(c);
                            }
                        },
                        c => current.push(c),
                    }
                }
            }
            '\\' => {
                in_token = true;
                current.push(chars.next()?);
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    Some(tokens)
}
