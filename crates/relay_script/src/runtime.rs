//! Script runtime management
//!
//! One [`RuntimeHandle`] owns the embedded QuickJS engine for the process. It
//! is created uninitialized, brought up exactly once, then shared behind an
//! `Arc` by everything that needs to enter the engine. All entry goes through
//! [`RuntimeHandle::with`], which holds the global execution lock.

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::ffi::ScriptHandle;
use crate::gateway::{self, GatewayServices, InMemoryServices};
use crate::loader;
use rquickjs::{CatchResultExt, Context, Ctx, Object, Runtime, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Environment variable the search path is published under before bring-up.
pub const SEARCH_PATH_ENV: &str = "RELAY_SCRIPT_PATH";

/// Hidden global holding host-owned references into the script heap.
const REGISTRY_KEY: &str = "__relay_registry";
const HANDLES_KEY: &str = "handles";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Uninitialized,
    Initialized,
    Failed,
}

struct Engine {
    #[allow(dead_code)] // Kept alive for context lifetime
    runtime: Runtime,
    context: Context,
}

/// Owner of the embedded interpreter. Not `Clone`: share it with `Arc`.
pub struct RuntimeHandle {
    config: RuntimeConfig,
    services: Arc<dyn GatewayServices>,
    state: RuntimeState,
    engine: Option<Engine>,
    exec_lock: Mutex<()>,
    next_handle: AtomicU64,
}

impl RuntimeHandle {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_services(config, Arc::new(InMemoryServices::new()))
    }

    pub fn with_services(config: RuntimeConfig, services: Arc<dyn GatewayServices>) -> Self {
        Self {
            config,
            services,
            state: RuntimeState::Uninitialized,
            engine: None,
            exec_lock: Mutex::new(()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.config.search_paths
    }

    pub fn services(&self) -> &Arc<dyn GatewayServices> {
        &self.services
    }

    /// Bring the interpreter up. Allowed once per handle.
    pub fn initialize(&mut self) -> Result<(), RuntimeError> {
        match self.state {
            RuntimeState::Uninitialized => {}
            RuntimeState::Initialized => return Err(RuntimeError::AlreadyInitialized),
            RuntimeState::Failed => return Err(RuntimeError::NotInitialized),
        }

        match self.bring_up() {
            Ok(engine) => {
                self.engine = Some(engine);
                self.state = RuntimeState::Initialized;
                Ok(())
            }
            Err(err) => {
                tracing::error!(target: "coprocess", error = %err, "Interpreter initialization failed");
                self.state = RuntimeState::Failed;
                Err(err)
            }
        }
    }

    fn bring_up(&self) -> Result<Engine, RuntimeError> {
        publish_search_path(&self.config.search_paths)?;

        tracing::info!(target: "coprocess", "Initializing interpreter");

        for path in &self.config.search_paths {
            if !path.is_dir() {
                return Err(RuntimeError::InitFailed(format!(
                    "search path '{}' is not a directory",
                    path.display()
                )));
            }
        }

        let runtime = Runtime::new().map_err(|err| RuntimeError::InitFailed(err.to_string()))?;
        if let Some(limit) = self.config.memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(size) = self.config.max_stack_size {
            runtime.set_max_stack_size(size);
        }

        let context =
            Context::full(&runtime).map_err(|err| RuntimeError::InitFailed(err.to_string()))?;

        let services = Arc::clone(&self.services);
        let search_paths = self.config.search_paths.clone();
        context.with(|ctx| -> Result<(), RuntimeError> {
            install_registry(&ctx)
                .and_then(|_| gateway::install(&ctx, &services))
                .and_then(|_| loader::install_require(&ctx, search_paths))
                .catch(&ctx)
                .map_err(|err| RuntimeError::InitFailed(err.to_string()))
        })?;

        Ok(Engine { runtime, context })
    }

    fn engine(&self) -> Result<&Engine, RuntimeError> {
        match (&self.state, &self.engine) {
            (RuntimeState::Initialized, Some(engine)) => Ok(engine),
            _ => Err(RuntimeError::NotInitialized),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.exec_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the script context while holding the global execution lock.
    pub fn with<F, R>(&self, f: F) -> Result<R, RuntimeError>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> R + Send,
        R: Send,
    {
        let engine = self.engine()?;
        let _guard = self.lock();
        Ok(engine.context.with(f))
    }

    pub fn execute_file(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let source = std::fs::read_to_string(path)?;
        self.execute(&source)?;
        Ok(())
    }

    pub fn execute(&self, source: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.with(|ctx| {
            ctx.eval::<(), _>(source)
                .catch(&ctx)
                .map_err(|err| err.to_string())
        })??;
        Ok(())
    }

    /// Evaluate an expression and convert the result to JSON.
    pub fn eval_json(&self, source: &str) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
        let text = self.with(|ctx| {
            ctx.eval::<Value, _>(source)
                .and_then(|value| ctx.json_stringify(value))
                .catch(&ctx)
                .map(|json| json.and_then(|s| s.to_string().ok()))
                .map_err(|err| err.to_string())
        })??;
        Ok(match text {
            Some(text) => serde_json::from_str(&text)?,
            None => serde_json::Value::Null,
        })
    }

    /// Keep `value` alive on the script side and return a host handle to it.
    pub(crate) fn store<'js>(
        &self,
        ctx: &Ctx<'js>,
        value: Value<'js>,
    ) -> rquickjs::Result<ScriptHandle> {
        let handle = ScriptHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        handles(ctx)?.set(handle.key(), value)?;
        Ok(handle)
    }

    pub(crate) fn fetch<'js>(
        &self,
        ctx: &Ctx<'js>,
        handle: ScriptHandle,
    ) -> rquickjs::Result<Value<'js>> {
        handles(ctx)?.get(handle.key())
    }

    /// Drop the script-side reference behind `handle`.
    pub(crate) fn release(&self, handle: ScriptHandle) {
        let released = self.with(move |ctx| {
            handles(&ctx)
                .and_then(|h| h.remove(handle.key()))
                .map_err(|err| err.to_string())
        });
        if let Ok(Err(err)) = released {
            tracing::warn!(target: "coprocess", handle = handle.0, error = %err, "Failed to release script handle");
        }
    }
}

fn publish_search_path(paths: &[PathBuf]) -> Result<(), RuntimeError> {
    let joined = std::env::join_paths(paths)
        .map_err(|err| RuntimeError::InitFailed(format!("invalid search path: {err}")))?;
    tracing::info!(
        target: "coprocess",
        "Setting {} to '{}'",
        SEARCH_PATH_ENV,
        joined.to_string_lossy()
    );
    std::env::set_var(SEARCH_PATH_ENV, &joined);
    Ok(())
}

fn install_registry<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<()> {
    let registry = Object::new(ctx.clone())?;
    registry.set(HANDLES_KEY, Object::new(ctx.clone())?)?;
    registry.set(loader::CACHE_KEY, Object::new(ctx.clone())?)?;
    ctx.globals().set(REGISTRY_KEY, registry)
}

pub(crate) fn registry<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
    ctx.globals().get(REGISTRY_KEY)
}

fn handles<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
    registry(ctx)?.get(HANDLES_KEY)
}
