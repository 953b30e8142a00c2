//! Configuration Store - hierarchical, live settings.
//!
//! Keys are dot-notation strings (`build.target`), values are [`Scalar`]s.
//! The store always holds the full merged set: compiled defaults, then file
//! overrides ([`ConfigStore::load`]), then environment overrides
//! ([`ConfigStore::overlay_env`]).
//!
//! # Change propagation
//!
//! [`ConfigStore::set`] notifies only when the value actually changed:
//!
//! 1. subscribers of the exact key,
//! 2. ancestor wildcards, most specific first (`a.b.*` then `a.*` for
//!    `a.b.c`),
//! 3. a bus-level `config_changed` event with `[key, value]`.
//!
//! Subscriber failures are logged and swallowed.

use crate::bus::{EventBus, Payload, SubscriptionId};
use crate::error::ConfigError;
use crate::names;
use crate::value::{panic_message, Scalar};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Environment prefix used by [`ConfigStore::overlay_env`] callers.
pub const ENV_PREFIX: &str = "FOREMAN_";

const ENV_SEPARATOR: &str = "__";

/// Callback invoked with `(key, new_value)` after a change.
pub type ConfigCallback = Arc<dyn Fn(&str, &Scalar) -> anyhow::Result<()> + Send + Sync>;

/// A structural check run by [`ConfigStore::validate`].
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationRule {
    /// The key must be present and non-empty (empty strings and `false`
    /// count as missing).
    Required(String),
    /// The key must hold a number `>= min`.
    Min { key: String, min: f64 },
    /// The key must hold a number `<= max`.
    Max { key: String, max: f64 },
}

impl ValidationRule {
    pub fn required(key: impl Into<String>) -> Self {
        Self::Required(key.into())
    }

    pub fn min(key: impl Into<String>, min: f64) -> Self {
        Self::Min {
            key: key.into(),
            min,
        }
    }

    pub fn max(key: impl Into<String>, max: f64) -> Self {
        Self::Max {
            key: key.into(),
            max,
        }
    }

    fn check(&self, values: &BTreeMap<String, Scalar>) -> Option<String> {
        match self {
            Self::Required(key) => {
                let present = match values.get(key) {
                    None => false,
                    Some(Scalar::String(s)) => !s.is_empty(),
                    Some(Scalar::Bool(b)) => *b,
                    Some(_) => true,
                };
                (!present).then(|| format!("Missing required config: {key}"))
            }
            Self::Min { key, min } => match values.get(key).and_then(Scalar::as_f64) {
                Some(n) if n >= *min => None,
                Some(_) => Some(format!("{key} must be >= {min}")),
                None => Some(format!("{key} must be a number >= {min}")),
            },
            Self::Max { key, max } => match values.get(key).and_then(Scalar::as_f64) {
                Some(n) if n <= *max => None,
                Some(_) => Some(format!("{key} must be <= {max}")),
                None => Some(format!("{key} must be a number <= {max}")),
            },
        }
    }
}

/// Compiled defaults plus the validation rules that go with them.
#[derive(Debug, Clone, Default)]
pub struct ConfigDefaults {
    values: BTreeMap<String, Scalar>,
    rules: Vec<ValidationRule>,
}

impl ConfigDefaults {
    /// No defaults, no rules.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The settings foreman itself reads, plus the plain settings carried for
    /// external command handlers.
    pub fn standard() -> Self {
        Self::empty()
            .with("app.name", "foreman")
            .with("app.version", env!("CARGO_PKG_VERSION"))
            .with("app.debug", false)
            .with("engine.max_queue_size", 100)
            .with("engine.command_timeout", 300)
            .with("engine.history_limit", 100)
            .with("events.history_size", 100)
            .with("commands.history_limit", 1000)
            .with("commands.max_completions", 20)
            .with("workflow.history_limit", 50)
            .with("workflow.default_timeout", 300)
            .with("workflow.retry_delay_ms", 0)
            .with("workflow.parallel_steps", false)
            .with("workflow.condition_failure", "fail_closed")
            .with("build.target", "android")
            .with("build.debug", true)
            .with("build.min_sdk", 21)
            .with("build.target_sdk", 33)
            .with("github.enabled", true)
            .with("github.branch", "main")
            .with("ai.enabled", true)
            .with("ai.model", "local")
            .with("ai.temperature", 0.7)
            .with("logging.level", "info")
            .with("network.timeout", 30)
            .with("network.retry_count", 3)
            .rule(ValidationRule::required("app.name"))
            .rule(ValidationRule::required("app.version"))
            .rule(ValidationRule::min("engine.max_queue_size", 1.0))
            .rule(ValidationRule::min("engine.history_limit", 1.0))
            .rule(ValidationRule::min("build.min_sdk", 21.0))
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn rule(mut self, rule: ValidationRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Scalar> {
        self.values.get(key)
    }
}

#[derive(Default)]
struct StoreState {
    values: BTreeMap<String, Scalar>,
    subscribers: HashMap<String, Vec<(SubscriptionId, ConfigCallback)>>,
}

struct StoreInner {
    defaults: ConfigDefaults,
    path: Option<PathBuf>,
    bus: EventBus,
    state: Mutex<StoreState>,
    next_id: AtomicU64,
}

/// Cheaply cloneable handle to a shared configuration store.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<StoreInner>,
}

impl ConfigStore {
    /// A store seeded with `defaults` and no backing file.
    pub fn new(defaults: ConfigDefaults, bus: EventBus) -> Self {
        Self::build(defaults, bus, None)
    }

    /// A store backed by `path` for [`load`](Self::load) and
    /// [`save`](Self::save). Nothing is read until `load` is called.
    pub fn with_file(defaults: ConfigDefaults, bus: EventBus, path: impl Into<PathBuf>) -> Self {
        Self::build(defaults, bus, Some(path.into()))
    }

    fn build(defaults: ConfigDefaults, bus: EventBus, path: Option<PathBuf>) -> Self {
        let state = StoreState {
            values: defaults.values.clone(),
            subscribers: HashMap::new(),
        };
        info!(settings = state.values.len(), "ConfigStore initialized");
        Self {
            inner: Arc::new(StoreInner {
                defaults,
                path,
                bus,
                state: Mutex::new(state),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn defaults(&self) -> &ConfigDefaults {
        &self.inner.defaults
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn get(&self, key: &str) -> Option<Scalar> {
        self.inner.state.lock().values.get(key).cloned()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_i64())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.state.lock().values.contains_key(key)
    }

    /// Every entry whose key is `prefix` or starts with `prefix.`, with full
    /// keys.
    pub fn get_section(&self, prefix: &str) -> BTreeMap<String, Scalar> {
        let dotted = format!("{prefix}.");
        self.inner
            .state
            .lock()
            .values
            .iter()
            .filter(|(k, _)| k.starts_with(&dotted) || k.as_str() == prefix)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Snapshot of the full merged set.
    pub fn export_all(&self) -> BTreeMap<String, Scalar> {
        self.inner.state.lock().values.clone()
    }

    /// Whether `key` currently equals its default.
    pub fn is_default(&self, key: &str) -> bool {
        let state = self.inner.state.lock();
        state.values.get(key) == self.inner.defaults.values.get(key)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Set `key` and notify on change. Returns whether the value changed.
    pub fn set(&self, key: &str, value: impl Into<Scalar>) -> bool {
        self.set_with(key, value, true)
    }

    /// Set `key`; with `notify == false` the value is stored silently.
    pub fn set_with(&self, key: &str, value: impl Into<Scalar>, notify: bool) -> bool {
        let value = value.into();
        let (changed, callbacks) = {
            let mut state = self.inner.state.lock();
            let old = state.values.insert(key.to_string(), value.clone());
            let changed = !old.as_ref().is_some_and(|old| old.same_value(&value));
            let callbacks = if changed && notify {
                collect_callbacks(&state.subscribers, key)
            } else {
                Vec::new()
            };
            (changed, callbacks)
        };

        debug!(key, value = %value, changed, "Config set");

        if changed && notify {
            for (pattern, callback) in &callbacks {
                match catch_unwind(AssertUnwindSafe(|| callback(key, &value))) {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        error!(key, pattern = %pattern, error = %err, "Config subscriber failed");
                    }
                    Err(panic) => {
                        error!(
                            key,
                            pattern = %pattern,
                            panic = %panic_message(panic.as_ref()),
                            "Config subscriber panicked"
                        );
                    }
                }
            }

            self.inner.bus.emit_from(
                names::CONFIG_CHANGED,
                Payload::new().arg(key).arg(value),
                "config",
            );
        }

        changed
    }

    /// Set every `(relative_key, value)` under `prefix`.
    pub fn set_section<I, K, V>(&self, prefix: &str, values: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Scalar>,
    {
        for (key, value) in values {
            let key = key.as_ref();
            let full = if prefix.is_empty() {
                key.to_string()
            } else {
                format!("{prefix}.{key}")
            };
            self.set(&full, value);
        }
    }

    /// Reset one key to its default (notifying as a normal `set`), or every
    /// key when `key` is `None`.
    ///
    /// Keys without a default are left untouched by a single-key reset. A full
    /// reset drops them and emits `config_reset` instead of per-key
    /// notifications.
    pub fn reset(&self, key: Option<&str>) {
        match key {
            Some(key) => {
                if let Some(default) = self.inner.defaults.values.get(key) {
                    self.set(key, default.clone());
                }
            }
            None => {
                self.inner.state.lock().values = self.inner.defaults.values.clone();
                info!("Config reset to defaults");
                self.inner
                    .bus
                    .emit_from(names::CONFIG_RESET, Payload::new(), "config");
            }
        }
    }

    /// Import `values` silently. `merge == false` first restores the defaults.
    pub fn import_all(&self, values: BTreeMap<String, Scalar>, merge: bool) {
        let count = values.len();
        {
            let mut state = self.inner.state.lock();
            if !merge {
                state.values = self.inner.defaults.values.clone();
            }
            state.values.extend(values);
        }
        info!(count, merge, "Config imported");
        self.inner.bus.emit_from(
            names::CONFIG_IMPORTED,
            Payload::new().kwarg("count", count).kwarg("merge", merge),
            "config",
        );
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Watch an exact key, or `prefix.*` for everything below `prefix`.
    pub fn subscribe<F>(&self, key: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &Scalar) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId::next(&self.inner.next_id);
        self.inner
            .state
            .lock()
            .subscribers
            .entry(key.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, key: &str, id: SubscriptionId) -> bool {
        let mut state = self.inner.state.lock();
        let Some(list) = state.subscribers.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sid, _)| *sid != id);
        let removed = before != list.len();
        if list.is_empty() {
            state.subscribers.remove(key);
        }
        removed
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    /// Run every validation rule. Never fails; callers decide what is fatal.
    pub fn validate(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        self.inner
            .defaults
            .rules
            .iter()
            .filter_map(|rule| rule.check(&state.values))
            .collect()
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Restore defaults, then overlay the backing file. A store without a
    /// file, or a missing file, loads nothing. Returns the number of
    /// overrides applied.
    pub fn load(&self) -> Result<usize, ConfigError> {
        match self.inner.path.clone() {
            Some(path) => self.load_from(&path),
            None => Ok(0),
        }
    }

    /// Restore defaults, then overlay the overrides stored at `path`.
    pub fn load_from(&self, path: &Path) -> Result<usize, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file; using defaults");
                return Ok(0);
            }
            Err(err) => return Err(ConfigError::read_file(path, err)),
        };

        let parsed: Value =
            serde_json::from_str(&text).map_err(|err| ConfigError::parse(path, err))?;
        let Value::Object(object) = parsed else {
            return Err(ConfigError::NotAnObject {
                path: path.to_path_buf(),
            });
        };

        let mut overrides = BTreeMap::new();
        for (key, value) in object {
            match Scalar::from_json(&value) {
                Some(scalar) => {
                    overrides.insert(key, scalar);
                }
                None => warn!(path = %path.display(), key = %key, "Skipping non-scalar config value"),
            }
        }

        let count = overrides.len();
        {
            let mut state = self.inner.state.lock();
            state.values = self.inner.defaults.values.clone();
            state.values.extend(overrides);
        }
        info!(path = %path.display(), overrides = count, "Loaded config");
        Ok(count)
    }

    /// Persist non-default entries to the backing file. A store without a
    /// file saves nothing.
    pub fn save(&self) -> Result<(), ConfigError> {
        match self.inner.path.clone() {
            Some(path) => self.save_to(&path),
            None => Ok(()),
        }
    }

    /// Persist non-default entries to `path` as a JSON object.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let overrides: Map<String, Value> = {
            let state = self.inner.state.lock();
            state
                .values
                .iter()
                .filter(|(k, v)| !self.inner.defaults.values.get(k.as_str()).is_some_and(|d| d.same_value(v)))
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect()
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| ConfigError::create_dir(parent, err))?;
        }

        let text = serde_json::to_string_pretty(&Value::Object(overrides))?;
        std::fs::write(path, text).map_err(|err| ConfigError::write_file(path, err))?;
        info!(path = %path.display(), "Saved config");
        Ok(())
    }

    /// Overlay `FOREMAN_`-style environment variables. See
    /// [`overlay_vars`](Self::overlay_vars) for the mapping.
    pub fn overlay_env(&self, prefix: &str) -> usize {
        self.overlay_vars(prefix, std::env::vars())
    }

    /// Overlay `(name, value)` pairs whose name starts with `prefix`.
    ///
    /// `FOREMAN_ENGINE__MAX_QUEUE_SIZE=5` sets `engine.max_queue_size` to the
    /// integer 5. Values are coerced like command arguments. Changes notify
    /// as a normal `set`. Returns the number of variables applied.
    pub fn overlay_vars<I>(&self, prefix: &str, vars: I) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut applied = 0;
        for (name, raw) in vars {
            let Some(rest) = name.strip_prefix(prefix) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            let key = rest
                .split(ENV_SEPARATOR)
                .map(str::to_ascii_lowercase)
                .collect::<Vec<_>>()
                .join(".");
            debug!(var = %name, key = %key, "Config override from environment");
            self.set(&key, Scalar::coerce(&raw));
            applied += 1;
        }
        applied
    }
}

/// Exact-key callbacks, then ancestor wildcards from most to least specific.
fn collect_callbacks(
    subscribers: &HashMap<String, Vec<(SubscriptionId, ConfigCallback)>>,
    key: &str,
) -> Vec<(String, ConfigCallback)> {
    let mut patterns = vec![key.to_string()];
    let mut end = key.len();
    while let Some(dot) = key[..end].rfind('.') {
        patterns.push(format!("{}.*", &key[..dot]));
        end = dot;
    }

    patterns
        .into_iter()
        .flat_map(|pattern| {
            subscribers
                .get(&pattern)
                .into_iter()
                .flatten()
                .map(move |(_, cb)| (pattern.clone(), Arc::clone(cb)))
                .collect::<Vec<_>>()
        })
        .collect()
}

impl fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ConfigStore")
            .field("path", &self.inner.path)
            .field("settings", &state.values.len())
            .field("watched_keys", &state.subscribers.len())
            .finish()
    }
}
