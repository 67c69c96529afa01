//! Configuration for the stepguard harness.
//!
//! Settings are layered: defaults, then an optional TOML file, then
//! `STEPGUARD_*` environment variables, then CLI flags applied by the
//! binary. Each layer only overrides what it sets.

pub mod env;
pub mod settings;

pub use env::{EnvError, EnvParser};
pub use settings::{
    ENV_PREFIX, HarnessSettings, LoggingSettings, ScenarioSettings, TargetSettings,
    TimeoutSettings, duration_str,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Where a configuration value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// Kept from the layer below (file or built-in default).
    Inherited,
    Environment,
}

/// A value together with its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
    pub env_var: Option<String>,
}

impl<T> Sourced<T> {
    pub fn from_env(value: T, env_var: String) -> Self {
        Self {
            value,
            source: ConfigSource::Environment,
            env_var: Some(env_var),
        }
    }

    pub fn inherited(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Inherited,
            env_var: None,
        }
    }

    /// Unwrap the value, logging `setting` at debug level when the
    /// environment overrode it.
    pub fn apply_to(self, setting: &str) -> T
    where
        T: std::fmt::Debug,
    {
        if let (ConfigSource::Environment, Some(env_var)) = (self.source, &self.env_var) {
            debug!(setting, env_var = %env_var, value = ?self.value, "Setting overridden by environment");
        }
        self.value
    }

    pub fn is_overridden(&self) -> bool {
        self.source == ConfigSource::Environment
    }
}
