//! Named pause points compiled into the command handlers.

use std::collections::BTreeMap;
use std::sync::Mutex;

use stepguard_common::failpoint::{
    HANG_DURING_BATCH_INSERT, WAIT_AFTER_PINNING_CURSOR_BEFORE_GET_MORE_BATCH,
    WAIT_IN_FIND_BEFORE_MAKING_BATCH,
};
use stepguard_common::protocol::{FailPointReply, ServerError, ServerErrorCode};
use stepguard_common::types::FailPointMode;
use tokio::sync::watch;
use tracing::debug;

use crate::ops::OpGuard;

/// Every fail point the node knows about.
pub const REGISTERED: [&str; 3] = [
    WAIT_AFTER_PINNING_CURSOR_BEFORE_GET_MORE_BATCH,
    WAIT_IN_FIND_BEFORE_MAKING_BATCH,
    HANG_DURING_BATCH_INSERT,
];

struct FailPointState {
    mode: FailPointMode,
    /// Operations still to catch under `Times(n)`.
    remaining: Option<u32>,
    times_entered: u64,
    /// Bumped each time the fail point is turned off. A caught operation
    /// waits for the generation to move past the one it was caught under.
    releases: watch::Sender<u64>,
}

pub struct FailPointRegistry {
    points: Mutex<BTreeMap<&'static str, FailPointState>>,
}

impl Default for FailPointRegistry {
    fn default() -> Self {
        let points = REGISTERED
            .iter()
            .map(|name| {
                let (releases, _) = watch::channel(0);
                (
                    *name,
                    FailPointState {
                        mode: FailPointMode::Off,
                        remaining: None,
                        times_entered: 0,
                        releases,
                    },
                )
            })
            .collect();
        Self {
            points: Mutex::new(points),
        }
    }
}

impl FailPointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure(&self, name: &str, mode: FailPointMode) -> Result<FailPointReply, ServerError> {
        let mut points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        let Some(point) = points.get_mut(name) else {
            return Err(ServerError::new(
                ServerErrorCode::BadValue,
                format!("Cannot find failpoint named {name}"),
            ));
        };
        let previous_mode = point.mode;
        point.mode = mode;
        point.remaining = match mode {
            FailPointMode::Times(n) => Some(n),
            _ => None,
        };
        if mode.is_off() {
            point.releases.send_modify(|generation| *generation += 1);
        }
        Ok(FailPointReply {
            name: name.to_string(),
            previous_mode,
            times_entered: point.times_entered,
        })
    }

    /// Decide whether the operation reaching `name` is caught.
    fn catch(&self, name: &str) -> Option<watch::Receiver<u64>> {
        let mut points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        let point = points.get_mut(name)?;
        match (point.mode, point.remaining) {
            (FailPointMode::Off, _) => return None,
            (FailPointMode::Times(_), Some(0)) => return None,
            (FailPointMode::Times(_), Some(n)) => point.remaining = Some(n - 1),
            _ => {}
        }
        point.times_entered += 1;
        Some(point.releases.subscribe())
    }

    /// Park `op` at `name` until the fail point is turned off or the operation is interrupted.
    ///
    /// While parked the operation's current-op message is the fail point name.
    pub async fn pause(&self, name: &str, op: &mut OpGuard) -> Result<(), ServerError> {
        let Some(releases) = self.catch(name) else {
            return Ok(());
        };
        op.set_msg(Some(name));
        debug!(fail_point = name, opid = op.opid(), "Operation paused at fail point");

        let result = tokio::select! {
            () = released(releases) => Ok(()),
            err = op.interrupted() => Err(err),
        };

        op.set_msg(None);
        debug!(fail_point = name, opid = op.opid(), ok = result.is_ok(), "Operation left fail point");
        result
    }
}

async fn released(mut releases: watch::Receiver<u64>) {
    // The generation at subscription is already marked seen.
    let _ = releases.changed().await;
}
