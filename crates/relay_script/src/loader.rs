//! Dispatcher loader
//!
//! Script modules are plain files on the runtime's search path, evaluated
//! CommonJS style: each file sees `module`, `exports`, `require` and `gateway`
//! and publishes its namespace through `module.exports`. A module is evaluated
//! once; later imports hit the cache.

use crate::error::LoadError;
use crate::ffi::ScriptHandle;
use crate::gateway;
use crate::runtime::{self, RuntimeHandle};
use rquickjs::{CatchResultExt, Ctx, Exception, Function, Object, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub(crate) const CACHE_KEY: &str = "modules";
const REQUIRE: &str = "require";

/// A dispatcher type resolved from a module, ready to be constructed.
pub struct DispatcherType {
    runtime: Arc<RuntimeHandle>,
    namespace: ScriptHandle,
    class: ScriptHandle,
    module_name: String,
    class_name: String,
}

impl DispatcherType {
    pub fn runtime(&self) -> &Arc<RuntimeHandle> {
        &self.runtime
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub(crate) fn class_handle(&self) -> ScriptHandle {
        self.class
    }
}

impl std::fmt::Debug for DispatcherType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherType")
            .field("module_name", &self.module_name)
            .field("class_name", &self.class_name)
            .finish_non_exhaustive()
    }
}

impl Drop for DispatcherType {
    fn drop(&mut self) {
        self.runtime.release(self.class);
        self.runtime.release(self.namespace);
    }
}

/// Import `module_name` from the search path and resolve `class_name` in it.
pub fn load_dispatcher_type(
    runtime: &Arc<RuntimeHandle>,
    module_name: &str,
    class_name: &str,
) -> Result<DispatcherType, LoadError> {
    let resolved = runtime
        .with(|ctx| -> Result<(ScriptHandle, ScriptHandle), LoadError> {
            let namespace = import(&ctx, runtime.search_paths(), module_name)?;
            let type_not_found = |reason| LoadError::TypeNotFound {
                module: module_name.to_string(),
                class: class_name.to_string(),
                reason,
            };
            let class = namespace
                .as_object()
                .map(|exports| exports.get::<_, Value>(class_name))
                .transpose()
                .catch(&ctx)
                .map_err(|err| type_not_found(Some(err.to_string())))?
                .filter(|class| !class.is_undefined())
                .ok_or_else(|| type_not_found(None))?;

            let store = |value| {
                runtime
                    .store(&ctx, value)
                    .map_err(|err| LoadError::ModuleNotFound {
                        module: module_name.to_string(),
                        reason: err.to_string(),
                    })
            };
            Ok((store(namespace)?, store(class)?))
        })
        .map_err(LoadError::from)
        .and_then(|resolved| resolved);

    match resolved {
        Ok((namespace, class)) => {
            tracing::debug!(target: "coprocess", module = module_name, class = class_name, "Dispatcher type resolved");
            Ok(DispatcherType {
                runtime: Arc::clone(runtime),
                namespace,
                class,
                module_name: module_name.to_string(),
                class_name: class_name.to_string(),
            })
        }
        Err(err) => {
            tracing::error!(target: "coprocess", module = module_name, class = class_name, error = %err, "Can't load dispatcher");
            Err(err)
        }
    }
}

/// Locate `name` on the search path: `<dir>/<name>.js`, then `<dir>/<name>/index.js`.
pub fn resolve_module_path(search_paths: &[PathBuf], name: &str) -> Option<PathBuf> {
    let candidates = |dir: &Path| -> Vec<PathBuf> {
        if name.ends_with(".js") {
            vec![dir.join(name)]
        } else {
            vec![dir.join(format!("{name}.js")), dir.join(name).join("index.js")]
        }
    };

    if Path::new(name).is_absolute() {
        return candidates(Path::new("/"))
            .into_iter()
            .find(|path| path.is_file());
    }

    search_paths
        .iter()
        .flat_map(|dir| candidates(dir))
        .find(|path| path.is_file())
}

/// Evaluate a module (or fetch it from the cache) and return its exports.
pub(crate) fn import<'js>(
    ctx: &Ctx<'js>,
    search_paths: &[PathBuf],
    name: &str,
) -> Result<Value<'js>, LoadError> {
    let not_found = |reason: String| LoadError::ModuleNotFound {
        module: name.to_string(),
        reason,
    };

    if name == gateway::MODULE_NAME {
        return ctx
            .globals()
            .get(gateway::MODULE_NAME)
            .map_err(|err| not_found(err.to_string()));
    }

    let path = resolve_module_path(search_paths, name)
        .ok_or_else(|| not_found("not found on the search path".to_string()))?;
    let key = path.display().to_string();

    let cache: Object = runtime::registry(ctx)
        .and_then(|registry| registry.get(CACHE_KEY))
        .map_err(|err| not_found(err.to_string()))?;
    if let Ok(cached) = cache.get::<_, Value>(key.as_str()) {
        if !cached.is_undefined() {
            return Ok(cached);
        }
    }

    let source = std::fs::read_to_string(&path)
        .map_err(|err| not_found(format!("{}: {err}", path.display())))?;
    let wrapped = format!("(function (module, exports, require, gateway) {{\n{source}\n}})");

    evaluate(ctx, &cache, &key, wrapped)
        .catch(ctx)
        .map_err(|err| not_found(format!("{}: {err}", path.display())))
}

fn evaluate<'js>(
    ctx: &Ctx<'js>,
    cache: &Object<'js>,
    key: &str,
    wrapped: String,
) -> rquickjs::Result<Value<'js>> {
    let factory: Function = ctx.eval(wrapped)?;
    let module = Object::new(ctx.clone())?;
    let exports = Object::new(ctx.clone())?;
    module.set("exports", exports.clone())?;

    // Cached before running so import cycles see the partial exports.
    cache.set(key, exports.clone())?;

    let globals = ctx.globals();
    let require: Value = globals.get(REQUIRE)?;
    let gateway: Value = globals.get(gateway::MODULE_NAME)?;
    let ran = factory.call::<_, ()>((module.clone(), exports, require, gateway));
    if let Err(err) = ran {
        cache.remove(key)?;
        return Err(err);
    }

    let exports: Value = module.get("exports")?;
    cache.set(key, exports.clone())?;
    Ok(exports)
}

/// Expose `require` to scripts, resolving against `search_paths`.
pub(crate) fn install_require<'js>(
    ctx: &Ctx<'js>,
    search_paths: Vec<PathBuf>,
) -> rquickjs::Result<()> {
    let require = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, name: String| -> rquickjs::Result<Value<'js>> {
            import(&ctx, &search_paths, &name)
                .map_err(|err| Exception::throw_message(&ctx, &err.to_string()))
        },
    )?;
    ctx.globals().set(REQUIRE, require)
}
