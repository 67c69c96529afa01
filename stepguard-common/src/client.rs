//! Client connection to a target node.
//!
//! A [`Connection`] owns one TCP stream and issues one command at a time.
//! It connects lazily on the first command and drops the stream after any
//! transport failure, so the next command reconnects. Actors each own their
//! own `Connection`.
//!
//! A connection built with [`Connection::with_command_timeout`] gives up on
//! any command the node has not answered in time. Actors leave it unset
//! because their commands are expected to park on fail points.

use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::errors::{HarnessError, HarnessResult};
use crate::protocol::{
    Command, CurrentOpReply, CursorReply, FailPointReply, HelloReply, LogReply, Reply,
    ReplSetStatus, Request, Response, ServerError, read_frame,
};
use crate::types::{CursorId, Document, Endpoint, FailPointMode, Namespace, WriteConcern};

/// Default time allowed for establishing a TCP connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct Stream {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// A single logical client of the target node.
pub struct Connection {
    endpoint: Endpoint,
    stream: Option<Stream>,
    next_request_id: u64,
    connect_timeout: Duration,
    command_timeout: Option<Duration>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.stream.is_some())
            .field("next_request_id", &self.next_request_id)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl Connection {
    /// Create an unconnected client for `endpoint`.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            stream: None,
            next_request_id: 1,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: None,
        }
    }

    /// Create a client and establish the TCP connection immediately.
    pub async fn connect(endpoint: Endpoint) -> HarnessResult<Self> {
        let mut conn = Self::new(endpoint);
        conn.ensure_connected().await?;
        Ok(conn)
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Bound every command, connecting included, by `command_timeout`.
    pub fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = Some(command_timeout);
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn ensure_connected(&mut self) -> HarnessResult<&mut Stream> {
        if self.stream.is_none() {
            let addr = self.endpoint.as_str().to_string();
            let tcp = match timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(tcp)) => tcp,
                Ok(Err(source)) => {
                    return Err(HarnessError::Connect {
                        endpoint: addr,
                        source,
                    });
                }
                Err(_) => {
                    return Err(HarnessError::Connect {
                        endpoint: addr,
                        source: std::io::Error::from(std::io::ErrorKind::TimedOut),
                    });
                }
            };
            tcp.set_nodelay(true)?;
            let (reader, writer) = tcp.into_split();
            debug!(endpoint = %self.endpoint, "Connected to target node");
            self.stream = Some(Stream {
                reader: BufReader::new(reader),
                writer,
            });
        }
        self.stream
            .as_mut()
            .ok_or_else(|| HarnessError::Disconnected {
                endpoint: self.endpoint.to_string(),
            })
    }

    /// Send one command and wait for its response.
    ///
    /// Transport failures surface as `Err`; a server-side rejection is
    /// returned inside the `Ok` response.
    pub async fn send(&mut self, command: Command) -> HarnessResult<Response> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let name = command.name();
        let request = Request {
            request_id,
            command,
        };
        let mut line = serde_json::to_string(&request)
            .map_err(|e| HarnessError::Protocol(format!("failed to encode {name}: {e}")))?;
        line.push('\n');

        let endpoint = self.endpoint.to_string();
        let target = endpoint.clone();
        let command_timeout = self.command_timeout;
        let exchange = async {
            let stream = self.ensure_connected().await?;
            stream.writer.write_all(line.as_bytes()).await?;
            stream.writer.flush().await?;
            trace!(request_id, command = name, "Sent request");

            let mut buf = String::new();
            let n = read_frame(&mut stream.reader, &mut buf)
                .await
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::InvalidData => {
                        HarnessError::Protocol(format!("{name} response: {e}"))
                    }
                    _ => HarnessError::Io(e),
                })?;
            if n == 0 {
                return Err(HarnessError::Disconnected { endpoint });
            }
            let response: Response = serde_json::from_str(buf.trim_end()).map_err(|e| {
                HarnessError::Protocol(format!("failed to decode {name} response: {e}"))
            })?;
            if response.request_id != request_id {
                return Err(HarnessError::Protocol(format!(
                    "{name} response id {} does not match request id {request_id}",
                    response.request_id
                )));
            }
            Ok(response)
        };
        let result = match command_timeout {
            Some(limit) => {
                let outcome = timeout(limit, exchange).await;
                outcome.unwrap_or_else(|_| {
                    Err(HarnessError::CommandTimeout {
                        command: name,
                        endpoint: target,
                        waited: limit,
                    })
                })
            }
            None => exchange.await,
        };

        if result.is_err() {
            // Any transport or framing failure leaves the stream unusable.
            self.stream = None;
        }
        result
    }

    /// Run a command, mapping a server rejection to [`HarnessError::CommandFailed`].
    pub async fn run_command(&mut self, command: Command) -> HarnessResult<Reply> {
        let name = command.name();
        self.send(command)
            .await?
            .into_result()
            .map_err(|source| HarnessError::CommandFailed {
                command: name,
                source,
            })
    }

    /// Run a command, returning the server rejection unmapped.
    pub async fn run_command_raw(
        &mut self,
        command: Command,
    ) -> HarnessResult<Result<Reply, ServerError>> {
        Ok(self.send(command).await?.into_result())
    }

    pub async fn ping(&mut self) -> HarnessResult<()> {
        self.run_command(Command::Ping).await.map(|_| ())
    }

    /// Insert documents, returning the op time of the write.
    pub async fn insert(
        &mut self,
        ns: &Namespace,
        documents: Vec<Document>,
        write_concern: Option<WriteConcern>,
    ) -> HarnessResult<u64> {
        match self
            .run_command(Command::Insert {
                ns: ns.clone(),
                documents,
                write_concern,
            })
            .await?
        {
            Reply::Write { op_time, .. } => Ok(op_time),
            other => Err(unexpected("insert", &other)),
        }
    }

    /// Open a cursor over `ns`.
    pub async fn find(
        &mut self,
        ns: &Namespace,
        filter: Option<Document>,
        batch_size: Option<u32>,
    ) -> HarnessResult<CursorReply> {
        self.find_with(ns, filter, batch_size, false).await
    }

    pub async fn find_with(
        &mut self,
        ns: &Namespace,
        filter: Option<Document>,
        batch_size: Option<u32>,
        secondary_ok: bool,
    ) -> HarnessResult<CursorReply> {
        let command = Command::Find {
            ns: ns.clone(),
            filter,
            batch_size,
            secondary_ok,
        };
        match self.run_command(command).await? {
            Reply::Cursor(cursor) => Ok(cursor),
            other => Err(unexpected("find", &other)),
        }
    }

    /// Resume an open cursor.
    pub async fn get_more(
        &mut self,
        ns: &Namespace,
        cursor_id: CursorId,
        batch_size: Option<u32>,
    ) -> HarnessResult<CursorReply> {
        let command = Command::GetMore {
            cursor_id,
            ns: ns.clone(),
            batch_size,
        };
        match self.run_command(command).await? {
            Reply::Cursor(cursor) => Ok(cursor),
            other => Err(unexpected("getMore", &other)),
        }
    }

    pub async fn kill_cursors(
        &mut self,
        ns: &Namespace,
        cursor_ids: Vec<CursorId>,
    ) -> HarnessResult<Vec<CursorId>> {
        let command = Command::KillCursors {
            ns: ns.clone(),
            cursor_ids,
        };
        match self.run_command(command).await? {
            Reply::CursorsKilled { killed, .. } => Ok(killed),
            other => Err(unexpected("killCursors", &other)),
        }
    }

    /// Send `configureFailPoint`, returning the server rejection unmapped.
    pub async fn configure_fail_point(
        &mut self,
        name: &str,
        mode: FailPointMode,
    ) -> HarnessResult<Result<FailPointReply, ServerError>> {
        let command = Command::ConfigureFailPoint {
            name: name.to_string(),
            mode,
        };
        match self.run_command_raw(command).await? {
            Ok(Reply::FailPoint(reply)) => Ok(Ok(reply)),
            Ok(other) => Err(unexpected("configureFailPoint", &other)),
            Err(err) => Ok(Err(err)),
        }
    }

    pub async fn hello(&mut self) -> HarnessResult<HelloReply> {
        match self.run_command(Command::Hello).await? {
            Reply::Hello(hello) => Ok(hello),
            other => Err(unexpected("hello", &other)),
        }
    }

    pub async fn repl_set_get_status(&mut self) -> HarnessResult<ReplSetStatus> {
        match self.run_command(Command::ReplSetGetStatus).await? {
            Reply::Status(status) => Ok(status),
            other => Err(unexpected("replSetGetStatus", &other)),
        }
    }

    pub async fn current_op(
        &mut self,
        ns: Option<&Namespace>,
        msg: Option<&str>,
    ) -> HarnessResult<CurrentOpReply> {
        let command = Command::CurrentOp {
            ns: ns.cloned(),
            msg: msg.map(str::to_string),
        };
        match self.run_command(command).await? {
            Reply::CurrentOp(snapshot) => Ok(snapshot),
            other => Err(unexpected("currentOp", &other)),
        }
    }

    pub async fn get_log(&mut self, since: Option<u64>) -> HarnessResult<LogReply> {
        match self.run_command(Command::GetLog { since }).await? {
            Reply::Log(log) => Ok(log),
            other => Err(unexpected("getLog", &other)),
        }
    }

    pub async fn step_up(&mut self) -> HarnessResult<()> {
        self.run_command(Command::ReplSetStepUp).await.map(|_| ())
    }
}

fn unexpected(command: &str, reply: &Reply) -> HarnessError {
    HarnessError::Protocol(format!(
        "unexpected '{}' reply to {command}",
        reply.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    async fn one_shot_server(reply_line: &'static str) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            writer.write_all(reply_line.as_bytes()).await.unwrap();
            writer.flush().await.unwrap();
        });
        Endpoint::from(addr)
    }

    #[tokio::test]
    async fn test_new_connection_is_lazy() {
        let conn = Connection::new(Endpoint::new("127.0.0.1:1"));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_hello_decodes_reply() {
        let endpoint = one_shot_server(
            "{\"request_id\":1,\"ok\":true,\"reply\":{\"kind\":\"hello\",\"set_name\":\"rs0\",\"state\":\"PRIMARY\",\"is_writable_primary\":true,\"secondary\":false}}\n",
        )
        .await;
        let mut conn = Connection::new(endpoint);
        let hello = conn.hello().await.unwrap();
        assert!(hello.is_writable_primary);
        assert_eq!(hello.set_name, "rs0");
    }

    #[tokio::test]
    async fn test_server_rejection_maps_to_command_failed() {
        let endpoint = one_shot_server(
            "{\"request_id\":1,\"ok\":false,\"error\":{\"code\":43,\"code_name\":\"CursorNotFound\",\"errmsg\":\"cursor id 9 not found\"}}\n",
        )
        .await;
        let mut conn = Connection::new(endpoint);
        let err = conn
            .get_more(&Namespace::new("test", "coll"), CursorId(9), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::CommandFailed {
                command: "getMore",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_mismatched_request_id_is_protocol_error_and_drops_stream() {
        let endpoint = one_shot_server("{\"request_id\":42,\"ok\":true}\n").await;
        let mut conn = Connection::new(endpoint);
        let err = conn.ping().await.unwrap_err();
        assert!(matches!(err, HarnessError::Protocol(_)));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_eof_is_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });
        let mut conn = Connection::new(Endpoint::from(addr));
        let err = conn.ping().await.unwrap_err();
        assert!(err.is_transient(), "expected transient error, got {err}");
    }

    #[tokio::test]
    async fn test_connect_refused_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = Connection::connect(Endpoint::from(addr)).await.unwrap_err();
        assert!(matches!(err, HarnessError::Connect { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unanswered_command_times_out_and_drops_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and read, but never answer.
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        let mut conn =
            Connection::new(Endpoint::from(addr)).with_command_timeout(Duration::from_millis(200));
        let err = conn.ping().await.unwrap_err();
        assert!(
            matches!(err, HarnessError::CommandTimeout { command: "ping", .. }),
            "unexpected error: {err}"
        );
        assert!(!err.is_transient());
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_oversized_response_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let chunk = vec![b'x'; 64 * 1024];
            // Never terminated by a newline; the client must stop reading first.
            while writer.write_all(&chunk).await.is_ok() {}
        });
        let mut conn = Connection::new(Endpoint::from(addr));
        let err = conn.ping().await.unwrap_err();
        assert!(matches!(err, HarnessError::Protocol(_)), "unexpected error: {err}");
        assert!(!conn.is_connected());
    }
}
