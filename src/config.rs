//! Runtime configuration for isolation managers

use serde::Deserialize;
use std::env;
use std::path::PathBuf;

use crate::error::Error;
use crate::native::default_library_name;

/// Process-level toggles, fixed while an isolation context is alive
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Unload the library whenever the last converter is disposed
    pub dynamic_loading: bool,
    /// Confine every native call to one dedicated worker thread
    pub synchronized: bool,
    /// Let the library use the windowing system (X11 on Linux)
    pub use_graphics: bool,
    pub library_path: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            dynamic_loading: false,
            synchronized: true,
            use_graphics: false,
            library_path: PathBuf::from(default_library_name()),
        }
    }
}

impl RuntimeConfig {
    /// Read `WKBRIDGE_*` variables, falling back to defaults for unset ones
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = RuntimeConfig::default();
        let flag = |key: &str, default: bool| -> Result<bool, Error> {
            match lookup(key) {
                None => Ok(default),
                Some(value) => parse_flag(&value)
                    .ok_or_else(|| Error::InvalidConfig(format!("{} must be a boolean, got {:?}", key, value))),
            }
        };

        Ok(RuntimeConfig {
            dynamic_loading: flag("WKBRIDGE_DYNAMIC_LOADING", defaults.dynamic_loading)?,
            synchronized: flag("WKBRIDGE_SYNCHRONIZED", defaults.synchronized)?,
            use_graphics: flag("WKBRIDGE_USE_GRAPHICS", defaults.use_graphics)?,
            library_path: lookup("WKBRIDGE_LIBRARY")
                .filter(|path| !path.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.library_path),
        })
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
