//! Shared types and harness core for stepguard.
//!
//! stepguard verifies that reads in flight during a replica-set step-down
//! survive the transition. This crate holds the wire protocol spoken with
//! the target node, a typed client, and the building blocks of the
//! verification scenario: a bounded poller, fail-point control, current-op
//! introspection, log-marker waits, concurrent actors and the orchestrator.

pub mod actor;
pub mod client;
pub mod config;
pub mod errors;
pub mod failpoint;
pub mod introspection;
pub mod logwatch;
pub mod poller;
pub mod protocol;
pub mod scenario;
pub mod testing;
pub mod types;

pub use actor::{ActorHandle, ActorOutcome, ActorSummary, ensure_batch_eq, spawn_actor};
pub use client::Connection;
pub use config::{EnvParser, HarnessSettings};
pub use errors::{ErrorCode, HarnessError, HarnessResult};
pub use failpoint::{ArmedFailPoints, set_fail_point};
pub use introspection::{OperationParkedProbe, is_operation_blocked_at};
pub use logwatch::{LogTail, check_causal_order, wait_for_log_marker};
pub use poller::{PollPolicy, Probe, probe_fn, wait_until};
pub use protocol::{Command, Reply, Request, Response, ServerError, ServerErrorCode};
pub use scenario::{
    ReadOpsDuringStepDown, ScenarioConfig, ScenarioFailure, ScenarioPhase, ScenarioReport,
};
pub use types::{
    CursorId, Document, Endpoint, FailPointMode, MemberState, Namespace, WriteAck, WriteConcern,
};
