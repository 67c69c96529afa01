//! Waiting for marker lines in the server log.
//!
//! The server log is append-only and every line carries a sequence number,
//! so "the marker appeared after X" is a comparison of sequence numbers
//! rather than of wall-clock timestamps.

use std::future::Future;

use tracing::debug;

use crate::client::Connection;
use crate::errors::{HarnessError, HarnessResult};
use crate::poller::{PollPolicy, Probe, wait_until};
use crate::protocol::{LogLine, LogReply};

/// Logged by the node when a step-down starts interrupting user operations.
pub const STEP_DOWN_INTERRUPT_MARKER: &str = "Starting to kill user operations";

/// Source of server log lines.
pub trait LogTail: Send {
    /// Lines with `seq >= since` (all retained lines when `None`).
    fn read_since(&mut self, since: Option<u64>)
    -> impl Future<Output = HarnessResult<LogReply>> + Send;
}

impl LogTail for Connection {
    fn read_since(
        &mut self,
        since: Option<u64>,
    ) -> impl Future<Output = HarnessResult<LogReply>> + Send {
        self.get_log(since)
    }
}

/// Probe that succeeds once a line containing `marker` is logged at or after `since`.
pub struct LogMarkerProbe<'t, T: LogTail> {
    tail: &'t mut T,
    marker: String,
    cursor: Option<u64>,
    found: Option<LogLine>,
    last_seen: Vec<LogLine>,
}

/// How many trailing lines to keep for the timeout diagnostic.
const DIAGNOSTIC_TAIL: usize = 20;

impl<'t, T: LogTail> LogMarkerProbe<'t, T> {
    pub fn new(tail: &'t mut T, marker: impl Into<String>, since: Option<u64>) -> Self {
        Self {
            tail,
            marker: marker.into(),
            cursor: since,
            found: None,
            last_seen: Vec::new(),
        }
    }

    pub fn into_found(self) -> Option<LogLine> {
        self.found
    }
}

impl<T: LogTail> Probe for LogMarkerProbe<'_, T> {
    fn check(&mut self) -> impl Future<Output = HarnessResult<bool>> + Send {
        async move {
            let reply = self.tail.read_since(self.cursor).await?;
            // Only fetch what we have not scanned yet on the next attempt.
            self.cursor = Some(reply.next_seq);
            for line in reply.lines {
                if self.found.is_none() && line.message.contains(&self.marker) {
                    debug!(seq = line.seq, marker = %self.marker, "Found log marker");
                    self.found = Some(line.clone());
                }
                self.last_seen.push(line);
            }
            if self.last_seen.len() > DIAGNOSTIC_TAIL {
                let excess = self.last_seen.len() - DIAGNOSTIC_TAIL;
                self.last_seen.drain(..excess);
            }
            Ok(self.found.is_some())
        }
    }

    fn on_timeout_message(&mut self) -> impl Future<Output = String> + Send {
        async move {
            let tail: Vec<String> = self.last_seen.iter().map(ToString::to_string).collect();
            format!(
                "log marker '{}' not found; last {} lines: [{}]",
                self.marker,
                tail.len(),
                tail.join(" | ")
            )
        }
    }
}

/// Wait until the log contains `marker` at or after `since`, returning the matching line.
pub async fn wait_for_log_marker<T: LogTail>(
    tail: &mut T,
    marker: &str,
    since: Option<u64>,
    policy: PollPolicy,
) -> HarnessResult<LogLine> {
    let description = format!("log marker '{marker}'");
    let mut probe = LogMarkerProbe::new(tail, marker, since);
    wait_until(&description, policy, &mut probe).await?;
    probe.into_found().ok_or_else(|| {
        HarnessError::Protocol(format!("log marker '{marker}' reported found but missing"))
    })
}

/// Check that `marker_line` was logged no earlier than `parked_at`.
///
/// `parked_at` is the log position of the snapshot that confirmed the last
/// actor parked. A marker with a smaller sequence number means the
/// transition started before every actor was parked.
pub fn check_causal_order(marker_line: &LogLine, parked_at: u64) -> HarnessResult<()> {
    if marker_line.seq < parked_at {
        return Err(HarnessError::OrderingViolation {
            marker: marker_line.message.clone(),
            marker_seq: marker_line.seq,
            parked_at,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use std::time::Duration;

    fn line(seq: u64, message: &str) -> LogLine {
        LogLine {
            seq,
            ts: Utc::now(),
            component: "REPL".to_string(),
            message: message.to_string(),
        }
    }

    /// Log tail whose contents grow by one scripted line per read.
    struct ScriptedTail {
        pending: Vec<LogLine>,
        log: Vec<LogLine>,
        reads: u32,
    }

    impl ScriptedTail {
        fn new(initial: Vec<LogLine>, pending: Vec<LogLine>) -> Self {
            Self {
                pending,
                log: initial,
                reads: 0,
            }
        }
    }

    impl LogTail for ScriptedTail {
        fn read_since(
            &mut self,
            since: Option<u64>,
        ) -> impl Future<Output = HarnessResult<LogReply>> + Send {
            self.reads += 1;
            if !self.pending.is_empty() {
                let next = self.pending.remove(0);
                self.log.push(next);
            }
            let from = since.unwrap_or(0);
            let lines: Vec<LogLine> = self.log.iter().filter(|l| l.seq >= from).cloned().collect();
            let next_seq = self.log.last().map_or(0, |l| l.seq + 1);
            async move { Ok(LogReply { lines, next_seq }) }
        }
    }

    fn policy() -> PollPolicy {
        PollPolicy::new(Duration::from_secs(1), Duration::from_millis(50))
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_until_marker_is_logged() {
        let mut tail = ScriptedTail::new(
            vec![line(0, "node started")],
            vec![
                line(1, "replSetStepDown received"),
                line(2, "Starting to kill user operations"),
            ],
        );
        let found = wait_for_log_marker(&mut tail, STEP_DOWN_INTERRUPT_MARKER, Some(0), policy())
            .await
            .unwrap();
        assert_eq!(found.seq, 2);
        assert_eq!(tail.reads, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_marker_before_since_is_ignored() {
        let mut tail = ScriptedTail::new(
            vec![line(0, "Starting to kill user operations"), line(1, "x")],
            vec![],
        );
        let err = wait_for_log_marker(&mut tail, STEP_DOWN_INTERRUPT_MARKER, Some(1), policy())
            .await
            .unwrap_err();
        match err {
            HarnessError::ConditionTimeout { diagnostic, .. } => {
                assert!(diagnostic.contains("not found"));
                assert!(diagnostic.contains("#1"));
            }
            other => panic!("expected ConditionTimeout, got {other:?}"),
        }
    }

    #[test]
    fn test_marker_after_parking_is_ordered() {
        assert!(check_causal_order(&line(12, STEP_DOWN_INTERRUPT_MARKER), 12).is_ok());
        assert!(check_causal_order(&line(13, STEP_DOWN_INTERRUPT_MARKER), 12).is_ok());
    }

    #[test]
    fn test_marker_before_parking_is_violation() {
        let err = check_causal_order(&line(7, STEP_DOWN_INTERRUPT_MARKER), 9).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::OrderingViolation {
                marker_seq: 7,
                parked_at: 9,
                ..
            }
        ));
    }

    proptest! {
        #[test]
        fn prop_causal_order_matches_seq_comparison(marker_seq in 0u64..1000, parked_at in 0u64..1000) {
            let ok = check_causal_order(&line(marker_seq, "m"), parked_at).is_ok();
            prop_assert_eq!(ok, marker_seq >= parked_at);
        }
    }
}
