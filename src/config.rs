//! Runtime configuration.
//!
//! Settings come from `EVALBRIDGE_*` environment variables and can be
//! overridden by command-line flags (see `main.rs`).

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Dependency directory linked into the resolution root.
pub const ENV_MODULES_DIR: &str = "EVALBRIDGE_MODULES_DIR";
/// Directory module imports and file reads resolve against.
pub const ENV_ROOT: &str = "EVALBRIDGE_ROOT";
/// Any non-empty value turns on fail-fast mode.
pub const ENV_EXIT_ON_EVAL_ERROR: &str = "EVALBRIDGE_EXIT_ON_EVAL_ERROR";
/// JSON object with [`EngineLimits`] fields.
pub const ENV_LIMITS: &str = "EVALBRIDGE_LIMITS";

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Pre-existing dependency directory to link in before serving.
    pub modules_dir: Option<PathBuf>,

    /// Resolution root for imports and `rt.read_file`.
    pub root: PathBuf,

    /// Terminate the session after reporting any `EvalFailure`.
    pub exit_on_eval_error: bool,

    /// Scripting engine limits.
    pub limits: EngineLimits,
}

/// Limits applied to the scripting engine. Zero means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineLimits {
    /// Maximum number of operations per evaluation.
    pub max_operations: u64,
    /// Maximum call stack depth.
    pub max_call_levels: usize,
    /// Maximum expression nesting depth.
    pub max_expr_depth: usize,
    /// Maximum expression nesting depth inside functions.
    pub max_function_expr_depth: usize,
    /// Maximum size of any string value.
    pub max_string_size: usize,
    /// Maximum size of any array or blob.
    pub max_array_size: usize,
    /// Maximum size of any object map.
    pub max_map_size: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_operations: 0,
            max_call_levels: 64,
            max_expr_depth: 64,
            max_function_expr_depth: 32,
            max_string_size: 0,
            max_array_size: 0,
            max_map_size: 0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            modules_dir: None,
            root: PathBuf::from("."),
            exit_on_eval_error: false,
            limits: EngineLimits::default(),
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load configuration through a variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let set = |name: &str| var(name).filter(|v| !v.is_empty());

        let root = match set(ENV_ROOT) {
            Some(root) => PathBuf::from(root),
            None => std::env::current_dir().context("Failed to read current directory")?,
        };

        let limits = match set(ENV_LIMITS) {
            Some(json) => serde_json::from_str(&json)
                .with_context(|| format!("Failed to parse {ENV_LIMITS}"))?,
            None => EngineLimits::default(),
        };

        Ok(Self {
            modules_dir: set(ENV_MODULES_DIR).map(PathBuf::from),
            root,
            exit_on_eval_error: set(ENV_EXIT_ON_EVAL_ERROR).is_some(),
            limits,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_without_vars() {
        let config = load(&[]).unwrap();
        assert!(config.modules_dir.is_none());
        assert!(!config.exit_on_eval_error);
        assert_eq!(config.limits, EngineLimits::default());
        assert_eq!(config.root, std::env::current_dir().unwrap());
    }

    #[test]
    fn reads_all_vars() {
        let config = load(&[
            (ENV_MODULES_DIR, "/opt/deps"),
            (ENV_ROOT, "/srv/eval"),
            (ENV_EXIT_ON_EVAL_ERROR, "1"),
            (ENV_LIMITS, r#"{"max_operations": 5000, "max_call_levels": 8}"#),
        ])
        .unwrap();
        assert_eq!(config.modules_dir, Some(PathBuf::from("/opt/deps")));
        assert_eq!(config.root, PathBuf::from("/srv/eval"));
        assert!(config.exit_on_eval_error);
        assert_eq!(config.limits.max_operations, 5000);
        assert_eq!(config.limits.max_call_levels, 8);
        // Missing keys keep their defaults
        assert_eq!(config.limits.max_expr_depth, 64);
    }

    #[test]
    fn empty_vars_are_unset() {
        let config = load(&[(ENV_EXIT_ON_EVAL_ERROR, ""), (ENV_MODULES_DIR, "")]).unwrap();
        assert!(!config.exit_on_eval_error);
        assert!(config.modules_dir.is_none());
    }

    #[test]
    fn bad_limits_json_is_an_error() {
        let err = load(&[(ENV_LIMITS, r#"{"max_operations": "many"}"#)]).unwrap_err();
        assert!(err.to_string().contains(ENV_LIMITS));

        assert!(load(&[(ENV_LIMITS, r#"{"max_sheep": 1}"#)]).is_err());
    }
}
