//! Dispatcher instances
//!
//! A [`Dispatcher`] is the script object built from a resolved
//! [`DispatcherType`] and bound to one middleware directory, plus its hook
//! method resolved once at construction. Requests go through
//! [`Dispatcher::dispatch`] (see `invoker.rs`).

use crate::error::ConstructError;
use crate::ffi::ScriptHandle;
use crate::invoker::{DispatchStats, HookMetrics};
use crate::loader::DispatcherType;
use crate::runtime::RuntimeHandle;
use rquickjs::function::Constructor;
use rquickjs::{CatchResultExt, Object, Value};
use std::sync::{Arc, Mutex, PoisonError};

pub struct Dispatcher {
    pub(crate) runtime: Arc<RuntimeHandle>,
    pub(crate) instance: ScriptHandle,
    pub(crate) hook: ScriptHandle,
    pub(crate) metrics: Mutex<HookMetrics>,
    middleware_path: String,
    hook_name: String,
}

impl Dispatcher {
    /// Construct `ty` with `middleware_path` as its only argument and bind
    /// its `hook_name` method.
    pub fn new(
        ty: &DispatcherType,
        middleware_path: &str,
        hook_name: &str,
    ) -> Result<Self, ConstructError> {
        let runtime = Arc::clone(ty.runtime());
        let class_name = ty.class_name();

        let built = runtime
            .with(|ctx| -> Result<(ScriptHandle, ScriptHandle), ConstructError> {
                let class = runtime.fetch(&ctx, ty.class_handle()).map_err(|err| {
                    ConstructError::ConstructionFailed {
                        class: class_name.to_string(),
                        reason: err.to_string(),
                    }
                })?;

                let constructor: Constructor =
                    class
                        .get()
                        .map_err(|_| ConstructError::NotConstructible {
                            class: class_name.to_string(),
                        })?;

                let instance: Object = constructor
                    .construct((middleware_path,))
                    .catch(&ctx)
                    .map_err(|err| ConstructError::ConstructionFailed {
                        class: class_name.to_string(),
                        reason: err.to_string(),
                    })?;

                let hook: Value = instance.get(hook_name).catch(&ctx).map_err(|err| {
                    ConstructError::ConstructionFailed {
                        class: class_name.to_string(),
                        reason: format!("reading '{hook_name}' raised: {err}"),
                    }
                })?;
                if !hook.is_function() {
                    return Err(ConstructError::HookAttributeMissing {
                        hook: hook_name.to_string(),
                    });
                }

                let keep = |value| {
                    runtime.store(&ctx, value).map_err(|err| {
                        ConstructError::ConstructionFailed {
                            class: class_name.to_string(),
                            reason: err.to_string(),
                        }
                    })
                };
                Ok((keep(instance.into_value())?, keep(hook)?))
            })
            .map_err(ConstructError::from)
            .and_then(|built| built);

        match built {
            Ok((instance, hook)) => {
                tracing::info!(
                    target: "coprocess",
                    class = class_name,
                    hook = hook_name,
                    middleware_path,
                    "Dispatcher ready"
                );
                Ok(Self {
                    runtime,
                    instance,
                    hook,
                    metrics: Mutex::new(HookMetrics::default()),
                    middleware_path: middleware_path.to_string(),
                    hook_name: hook_name.to_string(),
                })
            }
            Err(err) => {
                tracing::error!(
                    target: "coprocess",
                    class = class_name,
                    middleware_path,
                    error = %err,
                    "Can't initialize a dispatcher"
                );
                Err(err)
            }
        }
    }

    pub fn middleware_path(&self) -> &str {
        &self.middleware_path
    }

    pub fn hook_name(&self) -> &str {
        &self.hook_name
    }

    pub fn runtime(&self) -> &Arc<RuntimeHandle> {
        &self.runtime
    }

    pub fn stats(&self) -> DispatchStats {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("middleware_path", &self.middleware_path)
            .field("hook_name", &self.hook_name)
            .finish_non_exhaustive()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.runtime.release(self.hook);
        self.runtime.release(self.instance);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RuntimeConfig, DEFAULT_HOOK_NAME};
    use crate::loader::load_dispatcher_type;
    use std::fs;

    fn load(source: &str) -> (tempfile::TempDir, DispatcherType) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("dispatcher.js"), source).unwrap();
        let mut runtime = RuntimeHandle::new(RuntimeConfig::with_search_paths([dir.path()]));
        runtime.initialize().unwrap();
        let ty = load_dispatcher_type(&Arc::new(runtime), "dispatcher", "Dispatcher").unwrap();
        (dir, ty)
    }

    #[test]
    fn test_constructor_receives_middleware_path() {
        let (_dir, ty) = load(
            r#"
            exports.Dispatcher = class {
                constructor(path) {
                    globalThis.seenArgs = Array.from(arguments);
                    this.path = path;
                }
                dispatch_hook(msg) { return [msg, msg.length]; }
            };
            "#,
        );

        let dispatcher = Dispatcher::new(&ty, "/srv/middleware", DEFAULT_HOOK_NAME).unwrap();
        assert_eq!(dispatcher.middleware_path(), "/srv/middleware");
        assert_eq!(
            dispatcher.runtime().eval_json("seenArgs").unwrap(),
            serde_json::json!(["/srv/middleware"])
        );
    }

    #[test]
    fn test_function_style_constructor() {
        let (_dir, ty) = load(
            r#"
            function Dispatcher(path) { this.path = path; }
            Dispatcher.prototype.dispatch_hook = function (msg) { return [msg, msg.length]; };
            exports.Dispatcher = Dispatcher;
            "#,
        );
        assert!(Dispatcher::new(&ty, "/mw", DEFAULT_HOOK_NAME).is_ok());
    }

    #[test]
    fn test_not_constructible() {
        let (_dir, ty) = load("exports.Dispatcher = 42;");
        let err = Dispatcher::new(&ty, "/mw", DEFAULT_HOOK_NAME).unwrap_err();
        assert!(matches!(err, ConstructError::NotConstructible { ref class } if class == "Dispatcher"));
    }

    #[test]
    fn test_plain_object_is_not_constructible() {
        let (_dir, ty) = load("exports.Dispatcher = { dispatch_hook() {} };");
        let err = Dispatcher::new(&ty, "/mw", DEFAULT_HOOK_NAME).unwrap_err();
        assert!(matches!(err, ConstructError::NotConstructible { .. }));
    }

    #[test]
    fn test_constructor_failure() {
        let (_dir, ty) = load(
            r#"
            exports.Dispatcher = class {
                constructor(path) {
                    if (path === "/missing") throw new Error("no middleware at " + path);
                }
                dispatch_hook(msg) { return [msg, msg.length]; }
            };
            "#,
        );

        match Dispatcher::new(&ty, "/missing", DEFAULT_HOOK_NAME).unwrap_err() {
            ConstructError::ConstructionFailed { class, reason } => {
                assert_eq!(class, "Dispatcher");
                assert!(reason.contains("no middleware at /missing"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(Dispatcher::new(&ty, "/present", DEFAULT_HOOK_NAME).is_ok());
    }

    #[test]
    fn test_missing_hook() {
        let (_dir, ty) = load("exports.Dispatcher = class { other() {} };");
        let err = Dispatcher::new(&ty, "/mw", DEFAULT_HOOK_NAME).unwrap_err();
        assert!(matches!(err, ConstructError::HookAttributeMissing { ref hook } if hook == "dispatch_hook"));
    }

    #[test]
    fn test_non_callable_hook_attribute() {
        let (_dir, ty) = load(
            "exports.Dispatcher = class { constructor() { this.dispatch_hook = 'nope'; } };",
        );
        let err = Dispatcher::new(&ty, "/mw", DEFAULT_HOOK_NAME).unwrap_err();
        assert!(matches!(err, ConstructError::HookAttributeMissing { .. }));
    }

    #[test]
    fn test_throwing_hook_getter_keeps_exception_text() {
        let (_dir, ty) = load(
            r#"
            exports.Dispatcher = class {
                get dispatch_hook() { throw new Error("hook getter exploded"); }
            };
            "#,
        );
        let err = Dispatcher::new(&ty, "/mw", DEFAULT_HOOK_NAME).unwrap_err();
        match err {
            ConstructError::ConstructionFailed { ref class, ref reason } => {
                assert_eq!(class, "Dispatcher");
                assert!(reason.contains("hook getter exploded"), "{reason}");
            }
            other => panic!("expected ConstructionFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_custom_hook_name() {
        let (_dir, ty) = load(
            "exports.Dispatcher = class { on_request(msg) { return [msg, msg.length]; } };",
        );
        let dispatcher = Dispatcher::new(&ty, "/mw", "on_request").unwrap();
        assert_eq!(dispatcher.hook_name(), "on_request");
    }
}
