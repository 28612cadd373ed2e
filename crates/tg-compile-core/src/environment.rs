//! Execution environment assembly.
//!
//! The process environment is snapshotted once into a [`BaseEnvironment`].
//! Every attempt clones that snapshot and layers its own additions on top,
//! so the ambient environment is never mutated and attempts stay independent.
//! Names and values are kept as `OsString` so nothing inherited is lost.

use crate::overlay::EnvironmentOverlay;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::Path;

/// Module search path variable extended with the compiler root.
pub const MODULE_SEARCH_PATH_VAR: &str = "PYTHONPATH";

/// Platform path-list separator.
#[cfg(windows)]
pub const PATH_LIST_SEPARATOR: &str = ";";
#[cfg(not(windows))]
pub const PATH_LIST_SEPARATOR: &str = ":";

/// Accelerator-selection keys removed from the base environment before the
/// fallback attempt.
pub const ACCELERATOR_KEYS: &[&str] = &[
    "GPU", "METAL", "CPU", "IMAGE", "JIT", "AMD", "NV", "CUDA", "QCOM", "LLVM", "CLANG", "DSP",
    "WEBGPU", "BEAM", "NOLOCALS",
];

/// A complete child environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvVars {
    vars: BTreeMap<OsString, OsString>,
}

impl EnvVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<OsString>, value: impl Into<OsString>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<OsString> {
        self.vars.remove(OsStr::new(key))
    }

    pub fn get(&self, key: &str) -> Option<&OsStr> {
        self.vars.get(OsStr::new(key)).map(OsString::as_os_str)
    }

    /// Value as UTF-8, `None` when unset or not valid UTF-8.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(OsStr::to_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.vars.contains_key(OsStr::new(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl<K: Into<OsString>, V: Into<OsString>> FromIterator<(K, V)> for EnvVars {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Read-only snapshot of the process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaseEnvironment {
    vars: EnvVars,
}

impl BaseEnvironment {
    /// Snapshot the current process environment, byte for byte.
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars_os().collect(),
        }
    }

    /// Build a base environment from explicit pairs.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        Self {
            vars: vars.into_iter().collect(),
        }
    }

    /// UTF-8 value of an inherited variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get_str(key)
    }

    /// Environment for the primary attempt: base + search path + overlay.
    pub fn primary_env(&self, compiler_root: &Path, overlay: &EnvironmentOverlay) -> EnvVars {
        let mut env = self.vars.clone();
        extend_module_search_path(&mut env, compiler_root);
        apply_overlay(&mut env, overlay);
        env
    }

    /// Environment for the fallback attempt.
    ///
    /// Starts from the base, drops every accelerator key, then applies the
    /// search path and the fallback overlay. Primary overlay values never
    /// reach it since the base is cloned afresh.
    pub fn fallback_env(
        &self,
        compiler_root: &Path,
        fallback_overlay: &EnvironmentOverlay,
    ) -> EnvVars {
        let mut env = self.vars.clone();
        for key in ACCELERATOR_KEYS {
            env.remove(key);
        }
        extend_module_search_path(&mut env, compiler_root);
        apply_overlay(&mut env, fallback_overlay);
        env
    }
}

/// Append `compiler_root` to the module search path, or set it if empty.
fn extend_module_search_path(env: &mut EnvVars, compiler_root: &Path) {
    let value = match env.get(MODULE_SEARCH_PATH_VAR) {
        Some(existing) if !existing.is_empty() => {
            let mut joined = existing.to_os_string();
            joined.push(PATH_LIST_SEPARATOR);
            joined.push(compiler_root.as_os_str());
            joined
        }
        _ => compiler_root.as_os_str().to_os_string(),
    };
    env.insert(MODULE_SEARCH_PATH_VAR, value);
}

fn apply_overlay(env: &mut EnvVars, overlay: &EnvironmentOverlay) {
    for (key, value) in overlay.iter() {
        env.insert(key, value);
    }
}
