//! Current-op introspection.
//!
//! Answers "is exactly one operation on this namespace parked at this
//! checkpoint right now?" from a point-in-time snapshot of the node's
//! running operations.

use std::future::Future;

use crate::client::Connection;
use crate::errors::HarnessResult;
use crate::poller::Probe;
use crate::protocol::{CurrentOpReply, OperationInfo, ReplSetStatus};
use crate::types::{MemberState, Namespace};

/// Operations in `snapshot` on exactly `ns` whose diagnostic message is exactly `marker`.
pub fn matching_operations<'a>(
    snapshot: &'a CurrentOpReply,
    ns: &Namespace,
    marker: &str,
) -> Vec<&'a OperationInfo> {
    snapshot
        .inprog
        .iter()
        .filter(|op| &op.ns == ns && op.msg.as_deref() == Some(marker))
        .collect()
}

/// True iff exactly one running operation on `ns` reports `marker`.
///
/// Zero matches (the operation has not been scheduled yet) is `Ok(false)`.
pub async fn is_operation_blocked_at(
    conn: &mut Connection,
    ns: &Namespace,
    marker: &str,
) -> HarnessResult<bool> {
    let snapshot = conn.current_op(None, None).await?;
    Ok(matching_operations(&snapshot, ns, marker).len() == 1)
}

/// Probe that succeeds once an operation is parked at `marker`.
///
/// Remembers the log position of the confirming snapshot. Every log line
/// with a sequence number at or above it was written after the operation
/// was seen parked.
pub struct OperationParkedProbe<'c> {
    conn: &'c mut Connection,
    ns: Namespace,
    marker: String,
    confirmed_at: Option<u64>,
}

impl<'c> OperationParkedProbe<'c> {
    pub fn new(conn: &'c mut Connection, ns: Namespace, marker: impl Into<String>) -> Self {
        Self {
            conn,
            ns,
            marker: marker.into(),
            confirmed_at: None,
        }
    }

    /// Log position of the snapshot that saw the operation parked.
    pub fn confirmed_at(&self) -> Option<u64> {
        self.confirmed_at
    }
}

impl Probe for OperationParkedProbe<'_> {
    fn check(&mut self) -> impl Future<Output = HarnessResult<bool>> + Send {
        async move {
            let snapshot = self.conn.current_op(None, None).await?;
            let parked = matching_operations(&snapshot, &self.ns, &self.marker).len() == 1;
            if parked {
                self.confirmed_at = Some(snapshot.log_position);
            }
            Ok(parked)
        }
    }

    fn on_timeout_message(&mut self) -> impl Future<Output = String> + Send {
        async move {
            match self.conn.current_op(Some(&self.ns), None).await {
                Ok(snapshot) => format!(
                    "Failed to find operation at '{}' on {} in current-op output: {}",
                    self.marker,
                    self.ns,
                    serde_json::to_string(&snapshot.inprog).unwrap_or_default()
                ),
                Err(err) => format!(
                    "Failed to find operation at '{}' on {}; current-op query failed: {err}",
                    self.marker, self.ns
                ),
            }
        }
    }
}

/// Probe that succeeds once every member has applied `op_time`.
pub struct ReplicationProbe<'c> {
    conn: &'c mut Connection,
    op_time: u64,
    last: Option<ReplSetStatus>,
}

impl<'c> ReplicationProbe<'c> {
    pub fn new(conn: &'c mut Connection, op_time: u64) -> Self {
        Self {
            conn,
            op_time,
            last: None,
        }
    }
}

impl Probe for ReplicationProbe<'_> {
    fn check(&mut self) -> impl Future<Output = HarnessResult<bool>> + Send {
        async move {
            let status = self.conn.repl_set_get_status().await?;
            let done = status.fully_replicated(self.op_time);
            self.last = Some(status);
            Ok(done)
        }
    }

    fn on_timeout_message(&mut self) -> impl Future<Output = String> + Send {
        async move {
            match &self.last {
                Some(status) => {
                    let members: Vec<String> = status
                        .members
                        .iter()
                        .map(|m| format!("{}={}@{}", m.name, m.state, m.applied_op_time))
                        .collect();
                    format!(
                        "members have not applied op time {}: [{}]",
                        self.op_time,
                        members.join(", ")
                    )
                }
                None => format!("no replication status received for op time {}", self.op_time),
            }
        }
    }
}

/// Probe that succeeds once the node reports `expected` as its own state.
pub struct MemberStateProbe<'c> {
    conn: &'c mut Connection,
    expected: MemberState,
    last: Option<MemberState>,
}

impl<'c> MemberStateProbe<'c> {
    pub fn new(conn: &'c mut Connection, expected: MemberState) -> Self {
        Self {
            conn,
            expected,
            last: None,
        }
    }
}

impl Probe for MemberStateProbe<'_> {
    fn check(&mut self) -> impl Future<Output = HarnessResult<bool>> + Send {
        async move {
            let hello = self.conn.hello().await?;
            self.last = Some(hello.state);
            Ok(hello.state == self.expected)
        }
    }

    fn on_timeout_message(&mut self) -> impl Future<Output = String> + Send {
        async move {
            match self.last {
                Some(state) => format!("node is {state}, expected {}", self.expected),
                None => format!("node state unknown, expected {}", self.expected),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(opid: u64, ns: &str, msg: Option<&str>) -> OperationInfo {
        OperationInfo {
            opid,
            ns: ns.parse().unwrap(),
            op: "query".to_string(),
            msg: msg.map(str::to_string),
            secs_running: 0,
            connection_id: opid,
            killable_on_step_down: false,
        }
    }

    fn snapshot(inprog: Vec<OperationInfo>) -> CurrentOpReply {
        CurrentOpReply {
            inprog,
            log_position: 10,
        }
    }

    #[test]
    fn test_matches_exact_namespace_and_marker() {
        let snap = snapshot(vec![
            op(1, "test.coll", Some("waitInFindBeforeMakingBatch")),
            op(2, "test.other", Some("waitInFindBeforeMakingBatch")),
            op(3, "test.coll", None),
            op(4, "test.coll", Some("waitInFindBeforeMakingBatchX")),
        ]);
        let ns = Namespace::new("test", "coll");
        let found = matching_operations(&snap, &ns, "waitInFindBeforeMakingBatch");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].opid, 1);
    }

    #[test]
    fn test_zero_matches_is_empty() {
        let snap = snapshot(vec![]);
        let ns = Namespace::new("test", "coll");
        assert!(matching_operations(&snap, &ns, "waitInFindBeforeMakingBatch").is_empty());
    }

    #[test]
    fn test_two_matches_are_both_reported() {
        let snap = snapshot(vec![
            op(1, "test.coll", Some("hangDuringBatchInsert")),
            op(2, "test.coll", Some("hangDuringBatchInsert")),
        ]);
        let ns = Namespace::new("test", "coll");
        assert_eq!(
            matching_operations(&snap, &ns, "hangDuringBatchInsert").len(),
            2
        );
    }
}
