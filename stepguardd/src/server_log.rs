//! Sequenced server log.
//!
//! Bounded ring buffer of log lines, each with a monotonically increasing
//! sequence number. Lines are mirrored to `tracing` under the
//! `stepguardd::server_log` target.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;
use stepguard_common::protocol::{LogLine, LogReply};
use tracing::info;

struct LogState {
    lines: VecDeque<LogLine>,
    next_seq: u64,
}

pub struct ServerLog {
    state: Mutex<LogState>,
    capacity: usize,
}

impl ServerLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LogState {
                lines: VecDeque::with_capacity(capacity.min(1024)),
                next_seq: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Append a line, returning its sequence number.
    pub fn append(&self, component: &str, message: impl Into<String>) -> u64 {
        let message = message.into();
        let seq = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let seq = state.next_seq;
            state.next_seq += 1;
            if state.lines.len() >= self.capacity {
                state.lines.pop_front();
            }
            state.lines.push_back(LogLine {
                seq,
                ts: Utc::now(),
                component: component.to_string(),
                message: message.clone(),
            });
            seq
        };
        info!(target: "stepguardd::server_log", seq, component, "{message}");
        seq
    }

    /// Retained lines with `seq >= since`.
    pub fn since(&self, since: Option<u64>) -> LogReply {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let from = since.unwrap_or(0);
        LogReply {
            lines: state
                .lines
                .iter()
                .filter(|line| line.seq >= from)
                .cloned()
                .collect(),
            next_seq: state.next_seq,
        }
    }

    /// Sequence number the next line will receive.
    pub fn position(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).next_seq
    }

    /// Run `f` with appends excluded, returning its result and the log position.
    ///
    /// Every line appended after this returns has a sequence number at or
    /// above the returned position, and every line appended before it below.
    pub fn at_position<R>(&self, f: impl FnOnce() -> R) -> (R, u64) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let result = f();
        (result, state.next_seq)
    }
}
