//! Registry of running user operations.
//!
//! Every insert, find and getMore is registered for its lifetime through an
//! [`OpGuard`]. The registry answers current-op snapshots and lets the
//! step-down interrupt operations it is allowed to kill.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use stepguard_common::protocol::{OperationInfo, ServerError, ServerErrorCode};
use stepguard_common::types::Namespace;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

struct OpEntry {
    ns: Namespace,
    op: &'static str,
    msg: Option<String>,
    started: Instant,
    connection_id: u64,
    killable_on_step_down: bool,
    kill: watch::Sender<Option<ServerError>>,
}

#[derive(Default)]
pub struct OpRegistry {
    ops: Mutex<BTreeMap<u64, OpEntry>>,
    next_opid: AtomicU64,
}

impl OpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation; it stays visible until the guard is dropped.
    pub fn register(
        self: &Arc<Self>,
        ns: Namespace,
        op: &'static str,
        connection_id: u64,
        killable_on_step_down: bool,
    ) -> OpGuard {
        let opid = self.next_opid.fetch_add(1, Ordering::SeqCst) + 1;
        let (kill, killed) = watch::channel(None);
        let entry = OpEntry {
            ns,
            op,
            msg: None,
            started: Instant::now(),
            connection_id,
            killable_on_step_down,
            kill,
        };
        self.ops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(opid, entry);
        OpGuard {
            registry: Arc::clone(self),
            opid,
            killed,
        }
    }

    /// Operations matching the optional equality filters.
    pub fn snapshot(&self, ns: Option<&Namespace>, msg: Option<&str>) -> Vec<OperationInfo> {
        let ops = self.ops.lock().unwrap_or_else(|e| e.into_inner());
        ops.iter()
            .filter(|(_, e)| ns.is_none_or(|ns| &e.ns == ns))
            .filter(|(_, e)| msg.is_none_or(|msg| e.msg.as_deref() == Some(msg)))
            .map(|(opid, e)| OperationInfo {
                opid: *opid,
                ns: e.ns.clone(),
                op: e.op.to_string(),
                msg: e.msg.clone(),
                secs_running: e.started.elapsed().as_secs(),
                connection_id: e.connection_id,
                killable_on_step_down: e.killable_on_step_down,
            })
            .collect()
    }

    /// Interrupt every operation killable on step-down, returning how many were signalled.
    pub fn kill_for_step_down(&self, error: &ServerError) -> usize {
        let ops = self.ops.lock().unwrap_or_else(|e| e.into_inner());
        let mut killed = 0;
        for (opid, entry) in ops.iter().filter(|(_, e)| e.killable_on_step_down) {
            debug!(opid, op = entry.op, ns = %entry.ns, "Interrupting operation");
            entry.kill.send_replace(Some(error.clone()));
            killed += 1;
        }
        killed
    }

    pub fn len(&self) -> usize {
        self.ops.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_msg(&self, opid: u64, msg: Option<String>) {
        if let Some(entry) = self
            .ops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&opid)
        {
            entry.msg = msg;
        }
    }

    fn remove(&self, opid: u64) {
        self.ops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&opid);
    }
}

/// Registration of one running operation.
pub struct OpGuard {
    registry: Arc<OpRegistry>,
    opid: u64,
    killed: watch::Receiver<Option<ServerError>>,
}

impl OpGuard {
    pub fn opid(&self) -> u64 {
        self.opid
    }

    /// Set the diagnostic message shown in current-op.
    pub fn set_msg(&self, msg: Option<&str>) {
        self.registry.set_msg(self.opid, msg.map(str::to_string));
    }

    /// Error the operation was interrupted with, if any.
    pub fn check_for_interrupt(&self) -> Result<(), ServerError> {
        match self.killed.borrow().as_ref() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Resolves once the operation is interrupted.
    pub async fn interrupted(&mut self) -> ServerError {
        let fallback = || ServerError::new(ServerErrorCode::Interrupted, "operation was interrupted");
        let result = match self.killed.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        result.unwrap_or_else(fallback)
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.registry.remove(self.opid);
    }
}
