//! Error taxonomy for the stepguard harness.
//!
//! Every harness error is fatal to the scenario that raised it. The
//! catalog assigns each variant a stable code and remediation hints so
//! failure reports can be read without re-running the scenario.
//!
//! # Error Code Ranges
//!
//! | Range      | Category      | Description                              |
//! |------------|---------------|------------------------------------------|
//! | E001-E099  | Config        | Settings and environment errors          |
//! | E100-E199  | Connection    | Transport and wire protocol errors       |
//! | E200-E299  | Command       | Commands rejected by the target node     |
//! | E300-E399  | Coordination  | Poller, actor and ordering failures      |
//! | E400-E499  | Verification  | Result sets that differ from expected    |

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};

use std::io;
use std::time::Duration;

use crate::protocol::{ServerError, ServerErrorCode};

/// Error type for harness operations.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Timed out after {timeout:?} ({attempts} attempts) waiting for: {description}. Last diagnostic: {diagnostic}")]
    ConditionTimeout {
        description: String,
        timeout: Duration,
        attempts: u32,
        diagnostic: String,
    },

    #[error("Administrative command {command} ({target}) was rejected: {source}")]
    AdminCommandFailed {
        command: &'static str,
        target: String,
        #[source]
        source: ServerError,
    },

    #[error("Actor '{actor}' failed: {source}")]
    ActorFailure {
        actor: String,
        #[source]
        source: Box<HarnessError>,
    },

    #[error("Actor '{actor}' did not finish within {waited:?}")]
    JoinTimeout { actor: String, waited: Duration },

    #[error("Verification mismatch in {context}: expected {expected}, got {actual}")]
    VerificationMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    #[error(
        "Ordering violation: marker '{marker}' logged at #{marker_seq}, before operations were confirmed parked at #{parked_at}"
    )]
    OrderingViolation {
        marker: String,
        marker_seq: u64,
        parked_at: u64,
    },

    #[error("Command {command} failed: {source}")]
    CommandFailed {
        command: &'static str,
        #[source]
        source: ServerError,
    },

    #[error("Command {command} to {endpoint} got no response within {waited:?}")]
    CommandTimeout {
        command: &'static str,
        endpoint: String,
        waited: Duration,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection to {endpoint} closed by peer")]
    Disconnected { endpoint: String },

    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("panicked: {0}")]
    Panicked(String),
}

/// Result type for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;

impl HarnessError {
    /// Whether the poller may retry after this error on a non-final attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Disconnected { .. } | Self::Connect { .. } => true,
            Self::Io(err) => is_transient_io(err.kind()),
            Self::CommandFailed { source, .. } => source.code_name.is_state_change(),
            _ => false,
        }
    }

    /// Server error code carried by this error, if any.
    pub fn server_code(&self) -> Option<ServerErrorCode> {
        match self {
            Self::AdminCommandFailed { source, .. } | Self::CommandFailed { source, .. } => {
                Some(source.code_name)
            }
            Self::ActorFailure { source, .. } => source.server_code(),
            _ => None,
        }
    }

    /// Innermost error, looking through actor wrappers.
    pub fn root_cause(&self) -> &HarnessError {
        match self {
            Self::ActorFailure { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Catalog code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Config(_) => ErrorCode::ConfigInvalid,
            Self::Connect { .. } => ErrorCode::ConnectFailed,
            Self::Disconnected { .. } | Self::Io(_) => ErrorCode::ConnectionLost,
            Self::Protocol(_) => ErrorCode::ProtocolViolation,
            Self::CommandTimeout { .. } => ErrorCode::CommandUnanswered,
            Self::AdminCommandFailed { .. } => ErrorCode::AdminCommandRejected,
            Self::CommandFailed { .. } => ErrorCode::CommandRejected,
            Self::ConditionTimeout { .. } => ErrorCode::ConditionTimeout,
            Self::ActorFailure { .. } | Self::Panicked(_) => ErrorCode::ActorFailed,
            Self::JoinTimeout { .. } => ErrorCode::JoinTimeout,
            Self::OrderingViolation { .. } => ErrorCode::OrderingViolation,
            Self::VerificationMismatch { .. } => ErrorCode::VerificationMismatch,
        }
    }
}

fn is_transient_io(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
            | io::ErrorKind::NotConnected
    )
}
