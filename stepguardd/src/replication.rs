//! Simulated replication to priority-0 secondaries.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use stepguard_common::protocol::{MemberStatus, ReplSetStatus, ServerError, ServerErrorCode};
use stepguard_common::types::{MemberState, WriteAck};
use tokio::sync::watch;
use tracing::{debug, warn};

pub struct Replication {
    set_name: String,
    lag: Duration,
    last_op_time: AtomicU64,
    /// Applied op time of each secondary.
    applied: watch::Sender<Vec<u64>>,
}

impl Replication {
    pub fn new(set_name: impl Into<String>, secondaries: u32, lag: Duration) -> Self {
        let (applied, _) = watch::channel(vec![0; secondaries as usize]);
        Self {
            set_name: set_name.into(),
            lag,
            last_op_time: AtomicU64::new(0),
            applied,
        }
    }

    pub fn member_count(&self) -> usize {
        self.applied.borrow().len() + 1
    }

    pub fn last_op_time(&self) -> u64 {
        self.last_op_time.load(Ordering::SeqCst)
    }

    /// Assign the next op time and schedule it on every secondary.
    pub fn record_write(self: &Arc<Self>) -> u64 {
        let op_time = self.last_op_time.fetch_add(1, Ordering::SeqCst) + 1;
        let secondaries = self.applied.borrow().len();
        for member in 0..secondaries {
            let replication = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(replication.lag).await;
                replication.applied.send_modify(|applied| {
                    applied[member] = applied[member].max(op_time);
                });
                debug!(member = member + 1, op_time, "Secondary applied write");
            });
        }
        op_time
    }

    fn acknowledged(applied: &[u64], op_time: u64) -> usize {
        1 + applied.iter().filter(|a| **a >= op_time).count()
    }

    /// Wait until `ack` members have applied `op_time`.
    pub async fn wait_for(
        &self,
        op_time: u64,
        ack: WriteAck,
        timeout: Option<Duration>,
    ) -> Result<(), ServerError> {
        let members = self.member_count();
        let required = match ack {
            WriteAck::Majority => members / 2 + 1,
            WriteAck::Nodes(n) => n as usize,
        };
        if required > members {
            return Err(ServerError::new(
                ServerErrorCode::BadValue,
                format!("Not enough data-bearing nodes: need {required}, have {members}"),
            ));
        }

        let mut rx = self.applied.subscribe();
        let wait = rx.wait_for(|applied| Self::acknowledged(applied, op_time) >= required);
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.ok().map(|r| r.map(drop)),
            None => Some(wait.await.map(drop)),
        };
        match outcome {
            Some(Ok(_)) => Ok(()),
            Some(Err(_)) => Err(ServerError::new(
                ServerErrorCode::WriteConcernFailed,
                "replication stopped",
            )),
            None => {
                warn!(op_time, required, "Write concern timed out");
                Err(ServerError::new(
                    ServerErrorCode::WriteConcernFailed,
                    format!("waiting for replication timed out (op time {op_time}, {required} members)"),
                ))
            }
        }
    }

    /// Whether some secondary has applied every write.
    pub fn has_caught_up_secondary(&self) -> bool {
        let last = self.last_op_time();
        self.applied.borrow().iter().any(|a| *a >= last)
    }

    /// Wait up to `limit` for a caught-up secondary.
    pub async fn wait_for_caught_up_secondary(&self, limit: Duration) -> bool {
        let last = self.last_op_time();
        let mut rx = self.applied.subscribe();
        let wait = rx.wait_for(|applied| applied.iter().any(|a| *a >= last));
        matches!(tokio::time::timeout(limit, wait).await, Ok(Ok(_)))
    }

    pub fn status(&self, my_state: MemberState) -> ReplSetStatus {
        let mut members = vec![MemberStatus {
            name: "node0".to_string(),
            state: my_state,
            applied_op_time: self.last_op_time(),
            priority: 1,
        }];
        members.extend(
            self.applied
                .borrow()
                .iter()
                .enumerate()
                .map(|(i, applied)| MemberStatus {
                    name: format!("node{}", i + 1),
                    state: MemberState::Secondary,
                    applied_op_time: *applied,
                    priority: 0,
                }),
        );
        ReplSetStatus {
            set_name: self.set_name.clone(),
            my_state,
            members,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_majority_waits_for_lag() {
        let repl = Arc::new(Replication::new("rs0", 2, Duration::from_millis(20)));
        let op_time = repl.record_write();
        assert!(!repl.status(MemberState::Primary).fully_replicated(op_time));
        repl.wait_for(op_time, WriteAck::Majority, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(repl.status(MemberState::Primary).fully_replicated(op_time));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_concern_timeout() {
        let repl = Arc::new(Replication::new("rs0", 1, Duration::from_secs(10)));
        let op_time = repl.record_write();
        let err = repl
            .wait_for(op_time, WriteAck::Nodes(2), Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert_eq!(err.code_name, ServerErrorCode::WriteConcernFailed);
    }

    #[tokio::test]
    async fn test_unsatisfiable_node_count() {
        let repl = Replication::new("rs0", 1, Duration::ZERO);
        let err = repl.wait_for(0, WriteAck::Nodes(3), None).await.unwrap_err();
        assert_eq!(err.code_name, ServerErrorCode::BadValue);
    }

    #[test]
    fn test_status_lists_priority_zero_secondaries() {
        let repl = Replication::new("rs0", 2, Duration::ZERO);
        let status = repl.status(MemberState::Primary);
        assert_eq!(status.members.len(), 3);
        assert!(status.members[1..].iter().all(|m| m.priority == 0));
        assert!(repl.has_caught_up_secondary());
    }
}
