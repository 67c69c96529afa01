//! Harness settings file.
//!
//! ```toml
//! [target]
//! endpoint = "127.0.0.1:27017"
//!
//! [scenario]
//! database = "test"
//! collection = "coll"
//! step_down_secs = 100
//!
//! [timeouts]
//! poll_timeout = "30s"
//! join_timeout = "1m"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::env::EnvParser;
use crate::errors::{HarnessError, HarnessResult};
use crate::failpoint::{WAIT_AFTER_PINNING_CURSOR_BEFORE_GET_MORE_BATCH, WAIT_IN_FIND_BEFORE_MAKING_BATCH};
use crate::logwatch::STEP_DOWN_INTERRUPT_MARKER;
use crate::poller::PollPolicy;
use crate::scenario::ScenarioConfig;
use crate::types::{Endpoint, MemberState, Namespace};

/// Prefix of every harness environment variable.
pub const ENV_PREFIX: &str = "STEPGUARD_";

/// Serde adapter for humantime duration strings (`"250ms"`, `"30s"`).
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSettings {
    pub endpoint: String,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:27017".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioSettings {
    pub database: String,
    pub collection: String,
    pub step_down_secs: u64,
    pub force: bool,
    pub expected_role: MemberState,
    pub interruption_marker: String,
    /// Log position to search for the marker from, instead of the run start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker_since: Option<u64>,
    pub get_more_fail_point: String,
    pub find_fail_point: String,
    pub release_fail_points: bool,
}

impl Default for ScenarioSettings {
    fn default() -> Self {
        Self {
            database: "test".to_string(),
            collection: "coll".to_string(),
            step_down_secs: 100,
            force: true,
            expected_role: MemberState::Secondary,
            interruption_marker: STEP_DOWN_INTERRUPT_MARKER.to_string(),
            marker_since: None,
            get_more_fail_point: WAIT_AFTER_PINNING_CURSOR_BEFORE_GET_MORE_BATCH.to_string(),
            find_fail_point: WAIT_IN_FIND_BEFORE_MAKING_BATCH.to_string(),
            release_fail_points: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    #[serde(with = "duration_str")]
    pub poll_timeout: Duration,
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
    #[serde(with = "duration_str")]
    pub join_timeout: Duration,
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,
    /// Deadline for each command the orchestrator sends itself.
    #[serde(with = "duration_str")]
    pub command_timeout: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            join_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Everything the `stepguard` binary needs to run a scenario.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessSettings {
    pub target: TargetSettings,
    pub scenario: ScenarioSettings,
    pub timeouts: TimeoutSettings,
    pub logging: LoggingSettings,
}

impl HarnessSettings {
    pub fn from_toml_str(raw: &str) -> HarnessResult<Self> {
        toml::from_str(raw).map_err(|e| HarnessError::Config(format!("invalid settings: {e}")))
    }

    pub fn from_file(path: &Path) -> HarnessResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "Loaded settings file");
        Self::from_toml_str(&raw)
    }

    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> HarnessResult<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(&mut EnvParser::new(ENV_PREFIX))?;
        Ok(settings)
    }

    /// Overlay environment variables, reporting every invalid one at once.
    pub fn apply_env(&mut self, env: &mut EnvParser) -> HarnessResult<()> {
        self.target.endpoint = env
            .get_string("ENDPOINT", &self.target.endpoint)
            .apply_to("target.endpoint");
        self.scenario.database = env
            .get_string("DATABASE", &self.scenario.database)
            .apply_to("scenario.database");
        self.scenario.collection = env
            .get_string("COLLECTION", &self.scenario.collection)
            .apply_to("scenario.collection");
        self.scenario.step_down_secs = env
            .get_u64_range("STEP_DOWN_SECS", self.scenario.step_down_secs, 0, 86_400)
            .apply_to("scenario.step_down_secs");
        self.scenario.force = env
            .get_bool("FORCE", self.scenario.force)
            .apply_to("scenario.force");
        self.scenario.expected_role = env
            .get_parsed(
                "EXPECTED_ROLE",
                self.scenario.expected_role,
                "PRIMARY, SECONDARY or STARTUP",
            )
            .apply_to("scenario.expected_role");
        self.timeouts.poll_timeout = env
            .get_duration("POLL_TIMEOUT", self.timeouts.poll_timeout)
            .apply_to("timeouts.poll_timeout");
        self.timeouts.poll_interval = env
            .get_duration("POLL_INTERVAL", self.timeouts.poll_interval)
            .apply_to("timeouts.poll_interval");
        self.timeouts.join_timeout = env
            .get_duration("JOIN_TIMEOUT", self.timeouts.join_timeout)
            .apply_to("timeouts.join_timeout");
        self.timeouts.connect_timeout = env
            .get_duration("CONNECT_TIMEOUT", self.timeouts.connect_timeout)
            .apply_to("timeouts.connect_timeout");
        self.timeouts.command_timeout = env
            .get_duration("COMMAND_TIMEOUT", self.timeouts.command_timeout)
            .apply_to("timeouts.command_timeout");
        self.logging.level = env
            .get_log_level("LOG_LEVEL", &self.logging.level)
            .apply_to("logging.level");

        let errors = env.take_errors();
        if errors.is_empty() {
            Ok(())
        } else {
            let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
            Err(HarnessError::Config(joined.join("; ")))
        }
    }

    /// Build the orchestrator input, validating what the file cannot express.
    pub fn to_scenario_config(&self) -> HarnessResult<ScenarioConfig> {
        if self.scenario.database.is_empty() || self.scenario.database.contains('.') {
            return Err(HarnessError::Config(format!(
                "invalid database name '{}'",
                self.scenario.database
            )));
        }
        if self.scenario.collection.is_empty() {
            return Err(HarnessError::Config("collection name is empty".to_string()));
        }
        if self.timeouts.poll_interval.is_zero() {
            return Err(HarnessError::Config("poll_interval must be non-zero".to_string()));
        }
        if self.timeouts.command_timeout.is_zero() {
            return Err(HarnessError::Config("command_timeout must be non-zero".to_string()));
        }

        let mut config = ScenarioConfig::new(
            Endpoint::new(self.target.endpoint.clone()),
            Namespace::new(self.scenario.database.clone(), self.scenario.collection.clone()),
        );
        config.get_more_fail_point = self.scenario.get_more_fail_point.clone();
        config.find_fail_point = self.scenario.find_fail_point.clone();
        config.interruption_marker = self.scenario.interruption_marker.clone();
        config.marker_since = self.scenario.marker_since;
        config.expected_role = self.scenario.expected_role;
        config.step_down_secs = self.scenario.step_down_secs;
        config.force = self.scenario.force;
        config.release_fail_points = self.scenario.release_fail_points;
        config.poll = PollPolicy::new(self.timeouts.poll_timeout, self.timeouts.poll_interval);
        config.join_timeout = self.timeouts.join_timeout;
        config.connect_timeout = self.timeouts.connect_timeout;
        config.command_timeout = self.timeouts.command_timeout;
        Ok(config)
    }
}
