//! Bridge configuration
//!
//! Loaded from JSON; every field has a default so an empty object (or no file
//! at all) yields the conventional layout under the working directory:
//!
//! ```text
//! <base>/coprocess/js         dispatcher module
//! <base>/middleware/js        middleware scripts
//! <base>/coprocess/js/proto   message definitions
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_MODULE_NAME: &str = "dispatcher";
pub const DEFAULT_CLASS_NAME: &str = "Dispatcher";
pub const DEFAULT_HOOK_NAME: &str = "dispatch_hook";

/// Directory name used under `coprocess/` and `middleware/`.
pub const LANGUAGE_DIR: &str = "js";

/// Settings consumed by [`crate::RuntimeHandle`] at bring-up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub search_paths: Vec<PathBuf>,
    pub memory_limit: Option<usize>,
    pub max_stack_size: Option<usize>,
}

impl RuntimeConfig {
    pub fn with_search_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            search_paths: paths.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Root the default paths hang off. Empty means the working directory.
    pub base_dir: PathBuf,
    /// Explicit module search paths; derived from `base_dir` when empty.
    pub search_paths: Vec<PathBuf>,
    pub module_name: String,
    pub class_name: String,
    pub hook_name: String,
    /// Directory handed to the dispatcher constructor.
    pub middleware_path: Option<PathBuf>,
    /// Heap limit for the engine, in bytes.
    pub memory_limit: Option<usize>,
    pub max_stack_size: Option<usize>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::new(),
            search_paths: Vec::new(),
            module_name: DEFAULT_MODULE_NAME.to_string(),
            class_name: DEFAULT_CLASS_NAME.to_string(),
            hook_name: DEFAULT_HOOK_NAME.to_string(),
            middleware_path: None,
            memory_limit: None,
            max_stack_size: None,
        }
    }
}

impl BridgeConfig {
    pub fn from_json_str(source: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&source)
    }

    /// Config rooted at `base_dir` with all other fields defaulted.
    pub fn rooted_at(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    fn base(&self) -> Result<PathBuf, ConfigError> {
        base_or_working_dir(&self.base_dir, std::env::current_dir)
    }

    pub fn resolved_middleware_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.middleware_path {
            Some(path) => Ok(path.clone()),
            None => Ok(self.base()?.join("middleware").join(LANGUAGE_DIR)),
        }
    }

    pub fn resolved_search_paths(&self) -> Result<Vec<PathBuf>, ConfigError> {
        if !self.search_paths.is_empty() {
            return Ok(self.search_paths.clone());
        }

        let dispatcher_path = self.base()?.join("coprocess").join(LANGUAGE_DIR);
        let proto_path = dispatcher_path.join("proto");
        Ok(vec![dispatcher_path, self.resolved_middleware_path()?, proto_path])
    }

    pub fn runtime_config(&self) -> Result<RuntimeConfig, ConfigError> {
        Ok(RuntimeConfig {
            search_paths: self.resolved_search_paths()?,
            memory_limit: self.memory_limit,
            max_stack_size: self.max_stack_size,
        })
    }
}

/// An empty `base_dir` stands for the working directory. Failing to read it is
/// an error rather than a silent fallback to relative paths.
fn base_or_working_dir(
    base_dir: &Path,
    working_dir: impl FnOnce() -> std::io::Result<PathBuf>,
) -> Result<PathBuf, ConfigError> {
    if !base_dir.as_os_str().is_empty() {
        return Ok(base_dir.to_path_buf());
    }
    working_dir().map_err(ConfigError::WorkingDir)
}
