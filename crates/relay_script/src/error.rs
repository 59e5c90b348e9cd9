use thiserror::Error;

/// Runtime bring-up and state errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("script runtime failed to initialize: {0}")]
    InitFailed(String),

    #[error("script runtime is already initialized")]
    AlreadyInitialized,

    #[error("script runtime is not initialized")]
    NotInitialized,
}

/// Errors resolving the dispatcher type from a script module.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("module '{module}' could not be imported: {reason}")]
    ModuleNotFound { module: String, reason: String },

    #[error("module '{module}' does not export '{class}'{}", lookup_suffix(.reason))]
    TypeNotFound {
        module: String,
        class: String,
        /// Set when the lookup itself raised.
        reason: Option<String>,
    },

    #[error(transparent)]
    RuntimeUnavailable(#[from] RuntimeError),
}

fn lookup_suffix(reason: &Option<String>) -> String {
    reason
        .as_ref()
        .map(|reason| format!(" (lookup raised: {reason})"))
        .unwrap_or_default()
}

/// Errors constructing the dispatcher instance.
#[derive(Debug, Error)]
pub enum ConstructError {
    #[error("'{class}' is not a constructor")]
    NotConstructible { class: String },

    #[error("constructing '{class}' failed: {reason}")]
    ConstructionFailed { class: String, reason: String },

    #[error("dispatcher has no callable '{hook}' hook")]
    HookAttributeMissing { hook: String },

    #[error(transparent)]
    RuntimeUnavailable(#[from] RuntimeError),
}

/// A contained per-call failure. Never escapes [`crate::Dispatcher::dispatch`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvocationFault {
    #[error("hook raised: {0}")]
    Exception(String),

    #[error("hook returned a malformed result: {0}")]
    MalformedResult(String),

    #[error("engine error during hook call: {0}")]
    Engine(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no base_dir set and the working directory is unreadable: {0}")]
    WorkingDir(#[source] std::io::Error),
}

/// Any startup failure. The gateway must refuse to serve through the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Construct(#[from] ConstructError),
}
