//! Fail-point controller.
//!
//! Fail points are rendezvous markers: arming one guarantees that the next
//! operation reaching its checkpoint parks there until the fail point is
//! turned off. This module only sends the administrative command; confirming
//! that an operation actually parked is done with
//! [`crate::introspection::OperationParkedProbe`].

use tracing::{debug, info};

use crate::client::Connection;
use crate::errors::{HarnessError, HarnessResult};
use crate::protocol::FailPointReply;
use crate::types::FailPointMode;

/// Parks a getMore after its cursor is pinned, before the batch is built.
pub const WAIT_AFTER_PINNING_CURSOR_BEFORE_GET_MORE_BATCH: &str =
    "waitAfterPinningCursorBeforeGetMoreBatch";
/// Parks a find before its first batch is built.
pub const WAIT_IN_FIND_BEFORE_MAKING_BATCH: &str = "waitInFindBeforeMakingBatch";
/// Parks an insert before any document is applied.
pub const HANG_DURING_BATCH_INSERT: &str = "hangDuringBatchInsert";

/// Set `name` to `mode` on the node behind `conn`.
///
/// Returns once the node has applied the new mode. A rejection (unknown
/// name, insufficient privileges) is [`HarnessError::AdminCommandFailed`].
pub async fn set_fail_point(
    conn: &mut Connection,
    name: &str,
    mode: FailPointMode,
) -> HarnessResult<FailPointReply> {
    debug!(fail_point = name, %mode, "Configuring fail point");
    match conn.configure_fail_point(name, mode).await? {
        Ok(reply) => {
            info!(
                fail_point = name,
                %mode,
                previous = %reply.previous_mode,
                times_entered = reply.times_entered,
                "Fail point configured"
            );
            Ok(reply)
        }
        Err(source) => Err(HarnessError::AdminCommandFailed {
            command: "configureFailPoint",
            target: name.to_string(),
            source,
        }),
    }
}

/// Fail points armed during one scenario, released on teardown.
#[derive(Debug, Default, Clone)]
pub struct ArmedFailPoints {
    names: Vec<String>,
}

impl ArmedFailPoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `name` may be armed on the node.
    pub fn record(&mut self, name: &str) {
        if !self.names.iter().any(|n| n == name) {
            self.names.push(name.to_string());
        }
    }

    /// Record that `name` was turned off.
    pub fn forget(&mut self, name: &str) {
        self.names.retain(|n| n != name);
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Turn every recorded fail point off, collecting failures instead of
    /// stopping at the first one.
    pub async fn release_all(&mut self, conn: &mut Connection) -> Vec<HarnessError> {
        let mut errors = Vec::new();
        for name in std::mem::take(&mut self.names) {
            if let Err(err) = set_fail_point(conn, &name, FailPointMode::Off).await {
                errors.push(err);
            }
        }
        errors
    }
}
