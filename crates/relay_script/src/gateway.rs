//! The `gateway` capability module
//!
//! Statically linked into every runtime at bring-up and visible to scripts as
//! the global `gateway` (and through `require("gateway")`). Scripts use it to
//! log through the host and to reach host-side storage and events.

use dashmap::DashMap;
use rquickjs::convert::Coerced;
use rquickjs::function::{Opt, Rest};
use rquickjs::{Ctx, Function, Object};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Name of the global the module is installed under.
pub const MODULE_NAME: &str = "gateway";

const SCRIPT_LOG_TARGET: &str = "coprocess::script";

/// Host capabilities scripts may call into.
pub trait GatewayServices: Send + Sync {
    fn store_data(&self, key: &str, value: &str, ttl: Option<Duration>);
    fn get_data(&self, key: &str) -> Option<String>;
    fn trigger_event(&self, name: &str, payload: &str);
}

/// An event raised by a script through `gateway.trigger_event`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEvent {
    pub name: String,
    pub payload: String,
}

#[derive(Debug)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

/// Process-local services: a concurrent key/value store with TTLs and an
/// in-memory event log.
#[derive(Debug, Default)]
pub struct InMemoryServices {
    data: DashMap<String, StoredValue>,
    events: Mutex<Vec<GatewayEvent>>,
}

impl InMemoryServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<GatewayEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl GatewayServices for InMemoryServices {
    fn store_data(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.data.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at,
            },
        );
    }

    fn get_data(&self, key: &str) -> Option<String> {
        let expired = match self.data.get(key) {
            Some(entry) => match entry.expires_at {
                Some(deadline) if Instant::now() >= deadline => true,
                _ => return Some(entry.value.clone()),
            },
            None => return None,
        };

        if expired {
            self.data.remove(key);
        }
        None
    }

    fn trigger_event(&self, name: &str, payload: &str) {
        tracing::info!(target: "coprocess", event = name, bytes = payload.len(), "Script event");
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(GatewayEvent {
                name: name.to_string(),
                payload: payload.to_string(),
            });
    }
}

fn log_at(level: &str, message: &str) {
    match level.to_ascii_lowercase().as_str() {
        "trace" => tracing::trace!(target: SCRIPT_LOG_TARGET, "{message}"),
        "debug" => tracing::debug!(target: SCRIPT_LOG_TARGET, "{message}"),
        "warn" | "warning" => tracing::warn!(target: SCRIPT_LOG_TARGET, "{message}"),
        "error" => tracing::error!(target: SCRIPT_LOG_TARGET, "{message}"),
        _ => tracing::info!(target: SCRIPT_LOG_TARGET, "{message}"),
    }
}

/// Build the module object and install it as a global.
pub(crate) fn install<'js>(
    ctx: &Ctx<'js>,
    services: &Arc<dyn GatewayServices>,
) -> rquickjs::Result<()> {
    let module = Object::new(ctx.clone())?;

    module.set(
        "log",
        Function::new(ctx.clone(), |message: Coerced<String>, level: Opt<String>| {
            log_at(level.0.as_deref().unwrap_or("info"), &message.0);
        })?,
    )?;

    module.set(
        "log_error",
        Function::new(ctx.clone(), |parts: Rest<Coerced<String>>| {
            let message = parts
                .0
                .into_iter()
                .map(|part| part.0)
                .collect::<Vec<_>>()
                .join(" ");
            log_at("error", &message);
        })?,
    )?;

    let store = Arc::clone(services);
    module.set(
        "store_data",
        Function::new(
            ctx.clone(),
            move |key: String, value: Coerced<String>, ttl: Opt<f64>| {
                let ttl = ttl
                    .0
                    .filter(|secs| secs.is_finite() && *secs > 0.0)
                    .map(Duration::from_secs_f64);
                store.store_data(&key, &value.0, ttl);
            },
        )?,
    )?;

    let fetch = Arc::clone(services);
    module.set(
        "get_data",
        Function::new(ctx.clone(), move |key: String| fetch.get_data(&key))?,
    )?;

    let events = Arc::clone(services);
    module.set(
        "trigger_event",
        Function::new(ctx.clone(), move |name: String, payload: Coerced<String>| {
            events.trigger_event(&name, &payload.0);
        })?,
    )?;

    ctx.globals().set(MODULE_NAME, module)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_get() {
        let services = InMemoryServices::new();
        services.store_data("session", "abc", None);
        assert_eq!(services.get_data("session").as_deref(), Some("abc"));
        assert_eq!(services.get_data("missing"), None);
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let services = InMemoryServices::new();
        services.store_data("short", "lived", Some(Duration::ZERO));
        assert_eq!(services.get_data("short"), None);
        assert!(services.data.get("short").is_none());
    }

    #[test]
    fn test_events_are_recorded_in_order() {
        let services = InMemoryServices::new();
        services.trigger_event("QuotaExceeded", "{}");
        services.trigger_event("AuthFailure", "key=1");
        let names: Vec<_> = services.events().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["QuotaExceeded", "AuthFailure"]);
    }
}
