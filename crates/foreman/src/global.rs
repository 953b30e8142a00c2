//! Optional process-wide bus.
//!
//! Components never reach for this; they take an [`EventBus`] at
//! construction. The wrapper exists for leaf code (plugins, scripts) that has
//! no handle to thread through. Install the composed bus once at startup:
//!
//! ```
//! use foreman_core::{global, EventBus, Payload};
//!
//! let bus = EventBus::new();
//! let _ = global::install(bus.clone());
//! global::emit("plugin.loaded", Payload::new().arg("lint"));
//! assert_eq!(bus.get_history(Some("plugin.loaded"), 1).len(), 1);
//! ```

use crate::bus::{Event, EventBus, Payload, SubscriptionId};
use std::sync::OnceLock;

static GLOBAL_BUS: OnceLock<EventBus> = OnceLock::new();

/// Install `bus` as the process-wide bus. Returns the bus back if one was
/// already installed.
pub fn install(bus: EventBus) -> Result<(), EventBus> {
    GLOBAL_BUS.set(bus)
}

/// The installed bus, or a default inline bus created on first use.
pub fn bus() -> &'static EventBus {
    GLOBAL_BUS.get_or_init(EventBus::new)
}

pub fn emit(name: impl Into<String>, payload: Payload) {
    bus().emit(name, payload);
}

pub fn subscribe<F>(pattern: &str, callback: F) -> SubscriptionId
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
{
    bus().subscribe(pattern, callback)
}

pub fn unsubscribe(pattern: &str, id: SubscriptionId) -> bool {
    bus().unsubscribe(pattern, id)
}
