//! Node configuration: defaults, optional TOML file, `STEPGUARDD_*`
//! environment, then CLI flags.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stepguard_common::config::{EnvParser, duration_str};

use crate::error::{NodeError, NodeResult};

pub const ENV_PREFIX: &str = "STEPGUARDD_";

/// Default number of retained server log lines.
pub const DEFAULT_LOG_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub listen: String,
    pub set_name: String,
    /// Simulated secondaries. All have priority 0.
    pub secondaries: u32,
    #[serde(with = "duration_str")]
    pub replication_lag: Duration,
    pub log_capacity: usize,
    pub close_connections_on_step_down: bool,
    pub interrupt_reads_on_step_down: bool,
    /// How long a non-forced step-down waits for a caught-up secondary.
    #[serde(with = "duration_str")]
    pub catch_up_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:27017".to_string(),
            set_name: "rs0".to_string(),
            secondaries: 1,
            replication_lag: Duration::from_millis(20),
            log_capacity: DEFAULT_LOG_CAPACITY,
            close_connections_on_step_down: false,
            interrupt_reads_on_step_down: false,
            catch_up_timeout: Duration::from_secs(10),
        }
    }
}

impl NodeConfig {
    /// Config for in-process tests: ephemeral port, fast replication.
    pub fn ephemeral() -> Self {
        Self {
            listen: "127.0.0.1:0".to_string(),
            replication_lag: Duration::from_millis(5),
            ..Self::default()
        }
    }

    pub fn from_toml_str(raw: &str) -> NodeResult<Self> {
        toml::from_str(raw).map_err(|e| NodeError::Config(e.to_string()))
    }

    pub fn load(path: Option<&Path>) -> NodeResult<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    NodeError::Config(format!("failed to read {}: {e}", path.display()))
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(&mut EnvParser::new(ENV_PREFIX))?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self, env: &mut EnvParser) -> NodeResult<()> {
        self.listen = env.get_string("LISTEN", &self.listen).apply_to("listen");
        self.set_name = env
            .get_string("SET_NAME", &self.set_name)
            .apply_to("set_name");
        self.secondaries = env
            .get_u64_range("SECONDARIES", u64::from(self.secondaries), 0, 6)
            .apply_to("secondaries") as u32;
        self.replication_lag = env
            .get_duration("REPLICATION_LAG", self.replication_lag)
            .apply_to("replication_lag");
        self.log_capacity = env
            .get_u64_range("LOG_CAPACITY", self.log_capacity as u64, 1, 1_000_000)
            .apply_to("log_capacity") as usize;
        self.close_connections_on_step_down = env
            .get_bool(
                "CLOSE_CONNECTIONS_ON_STEP_DOWN",
                self.close_connections_on_step_down,
            )
            .apply_to("close_connections_on_step_down");
        self.interrupt_reads_on_step_down = env
            .get_bool(
                "INTERRUPT_READS_ON_STEP_DOWN",
                self.interrupt_reads_on_step_down,
            )
            .apply_to("interrupt_reads_on_step_down");

        let errors = env.take_errors();
        if errors.is_empty() {
            Ok(())
        } else {
            let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
            Err(NodeError::Config(joined.join("; ")))
        }
    }

    pub fn validate(&self) -> NodeResult<()> {
        if self.set_name.is_empty() {
            return Err(NodeError::Config("set_name is empty".to_string()));
        }
        if self.log_capacity == 0 {
            return Err(NodeError::Config("log_capacity must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Members in the set, this node included.
    pub fn member_count(&self) -> u32 {
        self.secondaries + 1
    }
}
