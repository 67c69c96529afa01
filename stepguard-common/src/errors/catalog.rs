//! Error catalog for stepguard.
//!
//! Each [`ErrorCode`] has a unique `SG-Exxx` code, a message template and
//! remediation steps. Scenario failure reports embed the catalog entry of
//! the root cause.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code enumeration covering the harness failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // Config (E001-E099)
    /// Settings file or environment contained an invalid value
    ConfigInvalid,

    // Connection (E100-E199)
    /// Could not open a connection to the target node
    ConnectFailed,
    /// An established connection was closed or reset
    ConnectionLost,
    /// The node sent something that is not a valid protocol frame
    ProtocolViolation,
    /// The node accepted a command and never answered it
    CommandUnanswered,

    // Command (E200-E299)
    /// configureFailPoint or replSetStepDown was rejected
    AdminCommandRejected,
    /// A data command was rejected
    CommandRejected,

    // Coordination (E300-E399)
    /// A polled condition never became true
    ConditionTimeout,
    /// An actor's unit of work failed or panicked
    ActorFailed,
    /// An actor did not finish before its join deadline
    JoinTimeout,
    /// The transition marker was logged before the operations were parked
    OrderingViolation,

    // Verification (E400-E499)
    /// A result set differed from the expected one
    VerificationMismatch,
}

impl ErrorCode {
    /// Returns the numeric part of the code.
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            Self::ConfigInvalid => 1,
            Self::ConnectFailed => 100,
            Self::ConnectionLost => 101,
            Self::ProtocolViolation => 102,
            Self::CommandUnanswered => 103,
            Self::AdminCommandRejected => 200,
            Self::CommandRejected => 201,
            Self::ConditionTimeout => 300,
            Self::ActorFailed => 301,
            Self::JoinTimeout => 302,
            Self::OrderingViolation => 303,
            Self::VerificationMismatch => 400,
        }
    }

    /// Returns the formatted code (e.g. `SG-E300`).
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("SG-E{:03}", self.code_number())
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() {
            1..=99 => ErrorCategory::Config,
            100..=199 => ErrorCategory::Connection,
            200..=299 => ErrorCategory::Command,
            300..=399 => ErrorCategory::Coordination,
            _ => ErrorCategory::Verification,
        }
    }

    /// Returns the message template.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::ConfigInvalid => "Invalid harness configuration",
            Self::ConnectFailed => "Could not connect to the target node",
            Self::ConnectionLost => "Connection to the target node was lost",
            Self::ProtocolViolation => "Target node sent an invalid protocol frame",
            Self::CommandUnanswered => "Target node did not answer a command in time",
            Self::AdminCommandRejected => "Administrative command rejected by the target node",
            Self::CommandRejected => "Command rejected by the target node",
            Self::ConditionTimeout => "Condition did not become true before the deadline",
            Self::ActorFailed => "A concurrent actor failed",
            Self::JoinTimeout => "A concurrent actor did not finish in time",
            Self::OrderingViolation => "Transition started before operations were parked",
            Self::VerificationMismatch => "Result set differs from the expected result set",
        }
    }

    /// Returns remediation steps.
    #[must_use]
    pub fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::ConfigInvalid => &[
                "Check STEPGUARD_* environment variables",
                "Validate the settings file with `stepguard run --config <file>`",
            ],
            Self::ConnectFailed | Self::ConnectionLost => &[
                "Confirm the node is running and listening on the endpoint",
                "Check whether the node closes connections on step-down",
            ],
            Self::ProtocolViolation => &["Confirm client and node versions match"],
            Self::CommandUnanswered => &[
                "Check the node log for a command stuck behind replication or a lock",
                "Raise timeouts.command_timeout if the node is slow",
            ],
            Self::AdminCommandRejected => &[
                "Check the fail point name against the node's registered fail points",
                "Confirm the node is primary before stepping it down",
            ],
            Self::CommandRejected => &["Inspect the server error code in the report"],
            Self::ConditionTimeout => &[
                "Inspect the last diagnostic snapshot in the report",
                "Raise the poll timeout if the node is slow to schedule operations",
            ],
            Self::ActorFailed => &["Inspect the actor's root cause in the report"],
            Self::JoinTimeout => &[
                "Confirm every armed fail point was turned off",
                "Check the node log for a transition that never completed",
            ],
            Self::OrderingViolation => &[
                "Trigger the transition only after every actor is confirmed parked",
            ],
            Self::VerificationMismatch => &[
                "Compare the expected and actual batches in the report",
                "Check whether the transition invalidated the cursor",
            ],
        }
    }

    /// Returns the catalog entry for this code.
    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code_string())
    }
}

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Config,
    Connection,
    Command,
    Coordination,
    Verification,
}

/// Catalog entry with code, message and remediation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    pub remediation: Vec<String>,
}

impl ErrorEntry {
    /// Formats the entry with numbered remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n", self.code, self.message);
        if !self.remediation.is_empty() {
            output.push_str("Remediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }
        output
    }
}
