//! Wire protocol shared by the harness client and the simulated node.
//!
//! Requests and responses are newline-delimited JSON objects. A request is
//! `{"request_id": N, "command": "<name>", ...}`, a response is
//! `{"request_id": N, "ok": bool, "error"?: {...}, "reply"?: {"kind": ...}}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::types::{CursorId, Document, FailPointMode, MemberState, Namespace, WriteConcern};

/// Maximum accepted size of a single protocol line.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Read one newline-terminated frame into `buf`, consuming at most
/// `MAX_FRAME_BYTES + 1` bytes. Returns 0 at end of stream and
/// `InvalidData` for a frame over the limit.
pub async fn read_frame<R>(reader: &mut R, buf: &mut String) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let n = (&mut *reader)
        .take(MAX_FRAME_BYTES as u64 + 1)
        .read_line(buf)
        .await?;
    if buf.len() > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame exceeds {MAX_FRAME_BYTES} bytes"),
        ));
    }
    Ok(n)
}

/// Batch size used by `find` when the client does not specify one.
pub const DEFAULT_BATCH_SIZE: u32 = 101;

/// A command sent to the target node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    Ping,
    Insert {
        ns: Namespace,
        documents: Vec<Document>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        write_concern: Option<WriteConcern>,
    },
    Find {
        ns: Namespace,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<Document>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        batch_size: Option<u32>,
        #[serde(default)]
        secondary_ok: bool,
    },
    GetMore {
        cursor_id: CursorId,
        ns: Namespace,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        batch_size: Option<u32>,
    },
    KillCursors {
        ns: Namespace,
        cursor_ids: Vec<CursorId>,
    },
    ConfigureFailPoint {
        name: String,
        mode: FailPointMode,
    },
    ReplSetStepDown {
        step_down_secs: u64,
        #[serde(default)]
        force: bool,
    },
    ReplSetStepUp,
    ReplSetGetStatus,
    Hello,
    CurrentOp {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ns: Option<Namespace>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg: Option<String>,
    },
    GetLog {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<u64>,
    },
}

impl Command {
    /// Wire name of the command, used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Insert { .. } => "insert",
            Self::Find { .. } => "find",
            Self::GetMore { .. } => "getMore",
            Self::KillCursors { .. } => "killCursors",
            Self::ConfigureFailPoint { .. } => "configureFailPoint",
            Self::ReplSetStepDown { .. } => "replSetStepDown",
            Self::ReplSetStepUp => "replSetStepUp",
            Self::ReplSetGetStatus => "replSetGetStatus",
            Self::Hello => "hello",
            Self::CurrentOp { .. } => "currentOp",
            Self::GetLog { .. } => "getLog",
        }
    }

    /// Administrative commands never queue behind a state transition.
    pub fn is_admin(&self) -> bool {
        !matches!(
            self,
            Self::Insert { .. } | Self::Find { .. } | Self::GetMore { .. }
        )
    }
}

/// One request line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub request_id: u64,
    #[serde(flatten)]
    pub command: Command,
}

/// One response line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ServerError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<Reply>,
}

impl Response {
    pub fn success(request_id: u64, reply: Reply) -> Self {
        Self {
            request_id,
            ok: true,
            error: None,
            reply: Some(reply),
        }
    }

    pub fn failure(request_id: u64, error: ServerError) -> Self {
        Self {
            request_id,
            ok: false,
            error: Some(error),
            reply: None,
        }
    }

    /// Split into the reply or the server error.
    pub fn into_result(self) -> Result<Reply, ServerError> {
        match (self.ok, self.error, self.reply) {
            (true, _, Some(reply)) => Ok(reply),
            (true, _, None) => Ok(Reply::Ack),
            (false, Some(error), _) => Err(error),
            (false, None, _) => Err(ServerError::new(
                ServerErrorCode::FailedToParse,
                "response had ok=false without an error",
            )),
        }
    }
}

/// Successful command payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    Ack,
    Write {
        n: u64,
        op_time: u64,
    },
    Cursor(CursorReply),
    CursorsKilled {
        killed: Vec<CursorId>,
        not_found: Vec<CursorId>,
    },
    FailPoint(FailPointReply),
    Status(ReplSetStatus),
    Hello(HelloReply),
    CurrentOp(CurrentOpReply),
    Log(LogReply),
}

impl Reply {
    /// Short name of the reply kind, used in protocol error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Write { .. } => "write",
            Self::Cursor(_) => "cursor",
            Self::CursorsKilled { .. } => "cursors_killed",
            Self::FailPoint(_) => "fail_point",
            Self::Status(_) => "status",
            Self::Hello(_) => "hello",
            Self::CurrentOp(_) => "current_op",
            Self::Log(_) => "log",
        }
    }
}

/// A batch of documents plus the cursor that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorReply {
    pub id: CursorId,
    pub ns: Namespace,
    pub batch: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailPointReply {
    pub name: String,
    pub previous_mode: FailPointMode,
    pub times_entered: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberStatus {
    pub name: String,
    pub state: MemberState,
    pub applied_op_time: u64,
    #[serde(default)]
    pub priority: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplSetStatus {
    pub set_name: String,
    pub my_state: MemberState,
    pub members: Vec<MemberStatus>,
}

impl ReplSetStatus {
    /// True when every member has applied at least `op_time`.
    pub fn fully_replicated(&self, op_time: u64) -> bool {
        self.members.iter().all(|m| m.applied_op_time >= op_time)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloReply {
    pub set_name: String,
    pub state: MemberState,
    pub is_writable_primary: bool,
    pub secondary: bool,
}

/// One entry of a current-op snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationInfo {
    pub opid: u64,
    pub ns: Namespace,
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    pub secs_running: u64,
    pub connection_id: u64,
    pub killable_on_step_down: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentOpReply {
    pub inprog: Vec<OperationInfo>,
    /// Sequence number the next server log line will receive.
    pub log_position: u64,
}

/// One line of the server log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub component: String,
    pub message: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} [{}] {}",
            self.seq,
            self.ts.to_rfc3339(),
            self.component,
            self.message
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogReply {
    pub lines: Vec<LogLine>,
    pub next_seq: u64,
}

/// Error codes returned by the target node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerErrorCode {
    BadValue,
    FailedToParse,
    CursorNotFound,
    CursorInUse,
    DuplicateKey,
    Interrupted,
    InterruptedDueToReplStateChange,
    NotWritablePrimary,
    NotPrimaryNoSecondaryOk,
    PrimarySteppedDown,
    ExceededTimeLimit,
    WriteConcernFailed,
    NotYetInitialized,
    Unauthorized,
}

impl ServerErrorCode {
    /// Numeric code, aligned with the conventional server codes.
    pub fn code(&self) -> i32 {
        match self {
            Self::BadValue => 2,
            Self::FailedToParse => 9,
            Self::Unauthorized => 13,
            Self::CursorNotFound => 43,
            Self::ExceededTimeLimit => 50,
            Self::WriteConcernFailed => 64,
            Self::NotYetInitialized => 94,
            Self::PrimarySteppedDown => 189,
            Self::CursorInUse => 292,
            Self::DuplicateKey => 11000,
            Self::Interrupted => 11601,
            Self::InterruptedDueToReplStateChange => 11602,
            Self::NotWritablePrimary => 10107,
            Self::NotPrimaryNoSecondaryOk => 13435,
        }
    }

    /// Codes a client may see while a node changes role.
    pub fn is_state_change(&self) -> bool {
        matches!(
            self,
            Self::InterruptedDueToReplStateChange
                | Self::PrimarySteppedDown
                | Self::NotWritablePrimary
        )
    }
}

impl fmt::Display for ServerErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A command failure reported by the target node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code_name} ({code}): {errmsg}")]
pub struct ServerError {
    pub code: i32,
    pub code_name: ServerErrorCode,
    pub errmsg: String,
}

impl ServerError {
    pub fn new(code_name: ServerErrorCode, errmsg: impl Into<String>) -> Self {
        Self {
            code: code_name.code(),
            code_name,
            errmsg: errmsg.into(),
        }
    }
}
