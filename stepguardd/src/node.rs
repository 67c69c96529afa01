//! The simulated replica-set member.
//!
//! User operations (insert, find, getMore) run under a shared hold of the
//! transition lock. A step-down first interrupts the operations it may kill,
//! then takes the lock exclusively, so it waits for every surviving
//! operation to finish and makes new user operations queue behind it.
//! Administrative commands never touch the lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use stepguard_common::failpoint::{
    HANG_DURING_BATCH_INSERT, WAIT_AFTER_PINNING_CURSOR_BEFORE_GET_MORE_BATCH,
    WAIT_IN_FIND_BEFORE_MAKING_BATCH,
};
use stepguard_common::logwatch::STEP_DOWN_INTERRUPT_MARKER;
use stepguard_common::protocol::{
    Command, CurrentOpReply, CursorReply, DEFAULT_BATCH_SIZE, HelloReply, Reply, ServerError,
    ServerErrorCode,
};
use stepguard_common::types::{
    CursorId, Document, FailPointMode, MemberState, Namespace, WriteConcern,
};
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::cursors::CursorManager;
use crate::fail_points::FailPointRegistry;
use crate::ops::OpRegistry;
use crate::replication::Replication;
use crate::server_log::ServerLog;
use crate::store::Store;

const REPL: &str = "REPL";
const COMMAND: &str = "COMMAND";

pub struct Node {
    config: NodeConfig,
    role: watch::Sender<MemberState>,
    transition: RwLock<()>,
    /// Serializes step-down and step-up.
    stepping: Mutex<()>,
    log: ServerLog,
    fail_points: FailPointRegistry,
    ops: Arc<OpRegistry>,
    cursors: Arc<CursorManager>,
    store: Store,
    replication: Arc<Replication>,
    close_epoch: watch::Sender<u64>,
    /// Bumped on every role change so a stale freeze timer does nothing.
    freeze_gen: AtomicU64,
    next_connection_id: AtomicU64,
}

impl Node {
    pub fn new(config: NodeConfig) -> Arc<Self> {
        let (role, _) = watch::channel(MemberState::Startup);
        let (close_epoch, _) = watch::channel(0);
        let node = Arc::new(Self {
            log: ServerLog::new(config.log_capacity),
            replication: Arc::new(Replication::new(
                config.set_name.clone(),
                config.secondaries,
                config.replication_lag,
            )),
            config,
            role,
            transition: RwLock::new(()),
            stepping: Mutex::new(()),
            fail_points: FailPointRegistry::new(),
            ops: Arc::new(OpRegistry::new()),
            cursors: Arc::new(CursorManager::new()),
            store: Store::new(),
            close_epoch,
            freeze_gen: AtomicU64::new(0),
            next_connection_id: AtomicU64::new(0),
        });
        node.set_role(MemberState::Primary);
        node
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn role(&self) -> MemberState {
        *self.role.borrow()
    }

    pub fn subscribe_role(&self) -> watch::Receiver<MemberState> {
        self.role.subscribe()
    }

    /// Changes whenever client connections must be closed.
    pub fn subscribe_close(&self) -> watch::Receiver<u64> {
        self.close_epoch.subscribe()
    }

    pub fn close_all_connections(&self) {
        self.close_epoch.send_modify(|epoch| *epoch += 1);
    }

    pub fn log(&self) -> &ServerLog {
        &self.log
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn set_role(&self, to: MemberState) {
        let from = self.role.send_replace(to);
        self.freeze_gen.fetch_add(1, Ordering::SeqCst);
        if from != to {
            self.log.append(REPL, format!("transition to {to} from {from}"));
        }
    }

    /// Execute one command on behalf of connection `connection_id`.
    pub async fn execute(
        self: &Arc<Self>,
        connection_id: u64,
        command: Command,
    ) -> Result<Reply, ServerError> {
        let _transition = if command.is_admin() {
            None
        } else {
            Some(self.transition.read().await)
        };
        match command {
            Command::Ping => Ok(Reply::Ack),
            Command::Insert {
                ns,
                documents,
                write_concern,
            } => self.insert(connection_id, ns, documents, write_concern).await,
            Command::Find {
                ns,
                filter,
                batch_size,
                secondary_ok,
            } => self
                .find(connection_id, ns, filter, batch_size, secondary_ok)
                .await
                .map(Reply::Cursor),
            Command::GetMore {
                cursor_id,
                ns,
                batch_size,
            } => self
                .get_more(connection_id, cursor_id, ns, batch_size)
                .await
                .map(Reply::Cursor),
            Command::KillCursors { ns, cursor_ids } => {
                let (killed, not_found) = self.cursors.kill(&ns, &cursor_ids);
                Ok(Reply::CursorsKilled { killed, not_found })
            }
            Command::ConfigureFailPoint { name, mode } => self.configure_fail_point(&name, mode),
            Command::ReplSetStepDown {
                step_down_secs,
                force,
            } => self.step_down(step_down_secs, force).await.map(|()| Reply::Ack),
            Command::ReplSetStepUp => self.step_up().await.map(|()| Reply::Ack),
            Command::ReplSetGetStatus => Ok(Reply::Status(self.replication.status(self.role()))),
            Command::Hello => Ok(Reply::Hello(self.hello())),
            Command::CurrentOp { ns, msg } => Ok(Reply::CurrentOp(self.current_op(ns, msg))),
            Command::GetLog { since } => Ok(Reply::Log(self.log.since(since))),
        }
    }

    pub fn hello(&self) -> HelloReply {
        let state = self.role();
        HelloReply {
            set_name: self.config.set_name.clone(),
            state,
            is_writable_primary: state == MemberState::Primary,
            secondary: state == MemberState::Secondary,
        }
    }

    /// Snapshot of running operations, stamped with the log position at the
    /// instant it was taken.
    pub fn current_op(&self, ns: Option<Namespace>, msg: Option<String>) -> CurrentOpReply {
        let (inprog, log_position) = self
            .log
            .at_position(|| self.ops.snapshot(ns.as_ref(), msg.as_deref()));
        CurrentOpReply {
            inprog,
            log_position,
        }
    }

    fn configure_fail_point(&self, name: &str, mode: FailPointMode) -> Result<Reply, ServerError> {
        let reply = self.fail_points.configure(name, mode)?;
        self.log.append(
            COMMAND,
            format!("Fail point {name} set to {mode} (was {})", reply.previous_mode),
        );
        Ok(Reply::FailPoint(reply))
    }

    fn require_primary(&self) -> Result<(), ServerError> {
        match self.role() {
            MemberState::Primary => Ok(()),
            _ => Err(ServerError::new(ServerErrorCode::NotWritablePrimary, "not primary")),
        }
    }

    async fn insert(
        &self,
        connection_id: u64,
        ns: Namespace,
        documents: Vec<Document>,
        write_concern: Option<WriteConcern>,
    ) -> Result<Reply, ServerError> {
        self.require_primary()?;
        let mut op = self.ops.register(ns.clone(), "insert", connection_id, true);
        self.fail_points.pause(HANG_DURING_BATCH_INSERT, &mut op).await?;
        op.check_for_interrupt()?;

        let n = self.store.insert(&ns, documents)?;
        let op_time = self.replication.record_write();
        debug!(ns = %ns, n, op_time, "Inserted documents");

        if let Some(wc) = write_concern {
            let timeout = wc.wtimeout_ms.map(Duration::from_millis);
            tokio::select! {
                result = self.replication.wait_for(op_time, wc.w, timeout) => result?,
                err = op.interrupted() => return Err(err),
            }
        }
        Ok(Reply::Write {
            n: n as u64,
            op_time,
        })
    }

    async fn find(
        &self,
        connection_id: u64,
        ns: Namespace,
        filter: Option<Document>,
        batch_size: Option<u32>,
        secondary_ok: bool,
    ) -> Result<CursorReply, ServerError> {
        match self.role() {
            MemberState::Primary => {}
            MemberState::Secondary if secondary_ok => {}
            MemberState::Secondary => {
                return Err(ServerError::new(
                    ServerErrorCode::NotPrimaryNoSecondaryOk,
                    "not primary and secondaryOk=false",
                ));
            }
            MemberState::Startup => {
                return Err(ServerError::new(
                    ServerErrorCode::NotYetInitialized,
                    "node is still starting up",
                ));
            }
        }
        let mut op = self.ops.register(
            ns.clone(),
            "query",
            connection_id,
            self.config.interrupt_reads_on_step_down,
        );
        self.fail_points
            .pause(WAIT_IN_FIND_BEFORE_MAKING_BATCH, &mut op)
            .await?;
        op.check_for_interrupt()?;

        let docs = self.store.find(&ns, filter.as_ref());
        Ok(self
            .cursors
            .open(ns, docs, batch_size.unwrap_or(DEFAULT_BATCH_SIZE)))
    }

    async fn get_more(
        &self,
        connection_id: u64,
        cursor_id: CursorId,
        ns: Namespace,
        batch_size: Option<u32>,
    ) -> Result<CursorReply, ServerError> {
        let mut op = self.ops.register(
            ns.clone(),
            "getmore",
            connection_id,
            self.config.interrupt_reads_on_step_down,
        );
        let pin = self.cursors.pin(cursor_id, &ns)?;
        self.fail_points
            .pause(WAIT_AFTER_PINNING_CURSOR_BEFORE_GET_MORE_BATCH, &mut op)
            .await?;
        op.check_for_interrupt()?;
        pin.next_batch(batch_size)
    }

    /// Step down from primary and stay frozen for `step_down_secs`.
    async fn step_down(self: &Arc<Self>, step_down_secs: u64, force: bool) -> Result<(), ServerError> {
        let _stepping = self.stepping.lock().await;
        if self.role() != MemberState::Primary {
            return Err(ServerError::new(
                ServerErrorCode::NotWritablePrimary,
                "not primary so can't step down",
            ));
        }
        if !force
            && !self
                .replication
                .wait_for_caught_up_secondary(self.config.catch_up_timeout)
                .await
        {
            return Err(ServerError::new(
                ServerErrorCode::ExceededTimeLimit,
                "No electable secondaries caught up",
            ));
        }

        self.log.append(
            REPL,
            format!(
                "Stepping down from primary in response to replSetStepDown (stepDownSecs: {step_down_secs}, force: {force})"
            ),
        );
        self.log.append(REPL, STEP_DOWN_INTERRUPT_MARKER);
        let interrupted = self.ops.kill_for_step_down(&ServerError::new(
            ServerErrorCode::InterruptedDueToReplStateChange,
            "operation was interrupted because a replica set state change occurred",
        ));
        self.log.append(
            REPL,
            format!("Stopped killing user operations (numOpsKilled: {interrupted})"),
        );

        // Surviving user operations drain before the role changes.
        let _exclusive = self.transition.write().await;
        if self.config.close_connections_on_step_down {
            info!("Closing client connections on step-down");
            self.close_all_connections();
        }
        self.set_role(MemberState::Secondary);
        self.schedule_unfreeze(Duration::from_secs(step_down_secs));
        Ok(())
    }

    /// Step back up once the freeze expires, unless the role changed in between.
    fn schedule_unfreeze(self: &Arc<Self>, freeze: Duration) {
        let generation = self.freeze_gen.load(Ordering::SeqCst);
        let node: Weak<Node> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(freeze).await;
            let Some(node) = node.upgrade() else {
                return;
            };
            let _stepping = node.stepping.lock().await;
            if node.freeze_gen.load(Ordering::SeqCst) != generation {
                return;
            }
            let _exclusive = node.transition.write().await;
            node.log.append(REPL, "Stepdown period expired, electing self");
            node.set_role(MemberState::Primary);
        });
    }

    async fn step_up(&self) -> Result<(), ServerError> {
        let _stepping = self.stepping.lock().await;
        if self.role() == MemberState::Primary {
            warn!("replSetStepUp on a node that is already primary");
            return Ok(());
        }
        let _exclusive = self.transition.write().await;
        self.log.append(REPL, "Stepping up in response to replSetStepUp");
        self.set_role(MemberState::Primary);
        Ok(())
    }
}
