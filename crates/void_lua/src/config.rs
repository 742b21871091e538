//! Bridge configuration
//!
//! # Configuration Sources (in priority order)
//!
//! 1. Environment variables: `VOID_LUA_PRELOAD`, `VOID_LUA_UNKNOWN_FIELDS`,
//!    `VOID_LUA_TRACEBACK`
//! 2. Config file named by `VOID_LUA_CONFIG`
//! 3. Defaults
//!
//! # Example Config File
//!
//! ```toml
//! open_stdlibs = true
//! preload = ["scripts/lib.lua", "scripts/game.lua"]
//! unknown_fields = "ignore"  # ignore, error
//! traceback = false
//! log_call_errors = true
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BindError, Result};

/// What a script write to an undeclared field does
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownFieldPolicy {
    /// Discard the write silently; nothing is stored anywhere
    #[default]
    Ignore,
    /// Raise a script error naming the field
    Error,
}

impl std::fmt::Display for UnknownFieldPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ignore => write!(f, "ignore"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for UnknownFieldPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ignore" | "" => Ok(Self::Ignore),
            "error" | "strict" => Ok(Self::Error),
            _ => Err(format!("Unknown field policy: {}", s)),
        }
    }
}

/// Configuration of one [`crate::LuaBridge`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Open the standard Lua libraries
    pub open_stdlibs: bool,
    /// Scripts executed in order when the bridge is created
    pub preload: Vec<PathBuf>,
    /// Policy for writes to undeclared fields
    pub unknown_fields: UnknownFieldPolicy,
    /// Append a traceback to call diagnostics
    pub traceback: bool,
    /// Log failed calls at error level
    pub log_call_errors: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            open_stdlibs: true,
            preload: Vec::new(),
            unknown_fields: UnknownFieldPolicy::Ignore,
            traceback: false,
            log_call_errors: true,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from all sources
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var_os("VOID_LUA_CONFIG") {
            Some(path) => {
                let config = Self::from_file(&path)?;
                log::info!("Loaded bridge config from {}", Path::new(&path).display());
                config
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| BindError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Apply overrides from a variable lookup
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(paths) = lookup("VOID_LUA_PRELOAD") {
            self.preload = std::env::split_paths(&paths)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
            log::info!("Preload scripts from env: {:?}", self.preload);
        }

        if let Some(policy) = lookup("VOID_LUA_UNKNOWN_FIELDS") {
            match policy.parse() {
                Ok(policy) => self.unknown_fields = policy,
                Err(e) => log::warn!("Ignoring VOID_LUA_UNKNOWN_FIELDS: {}", e),
            }
        }

        if let Some(value) = lookup("VOID_LUA_TRACEBACK") {
            self.traceback = matches!(value.as_str(), "1" | "true" | "yes");
        }
    }

    /// Builder: add a preload script
    pub fn with_preload(mut self, path: impl Into<PathBuf>) -> Self {
        self.preload.push(path.into());
        self
    }

    /// Builder: set the unknown-field policy
    pub fn with_unknown_fields(mut self, policy: UnknownFieldPolicy) -> Self {
        self.unknown_fields = policy;
        self
    }

    /// Builder: enable tracebacks on call errors
    pub fn with_traceback(mut self, enabled: bool) -> Self {
        self.traceback = enabled;
        self
    }
}
