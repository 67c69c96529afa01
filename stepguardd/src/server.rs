//! TCP front end: one task per client connection.

use std::net::SocketAddr;
use std::sync::Arc;

use stepguard_common::protocol::{Request, Response, ServerError, ServerErrorCode, read_frame};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};
use crate::node::Node;

/// A node bound to a socket and accepting connections.
pub struct RunningNode {
    addr: SocketAddr,
    node: Arc<Node>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl RunningNode {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Stop accepting, close every connection and wait for the accept loop to exit.
    pub async fn shutdown(mut self) {
        self.shutdown.send_replace(true);
        self.node.close_all_connections();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RunningNode {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.node.close_all_connections();
        }
    }
}

/// Bind `config.listen` and serve the node in the background.
pub async fn spawn_node(config: NodeConfig) -> NodeResult<RunningNode> {
    let listener = TcpListener::bind(&config.listen)
        .await
        .map_err(|source| NodeError::Bind {
            addr: config.listen.clone(),
            source,
        })?;
    let addr = listener.local_addr()?;
    let node = Node::new(config);
    info!(%addr, set_name = %node.config().set_name, "Node listening");

    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(accept_loop(listener, Arc::clone(&node), shutdown_rx));
    Ok(RunningNode {
        addr,
        node,
        shutdown,
        task: Some(task),
    })
}

async fn accept_loop(listener: TcpListener, node: Arc<Node>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => {
                debug!("Accept loop stopping");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let node = Arc::clone(&node);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, node).await {
                            warn!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Accept error: {}", e);
                }
            }
        }
    }
}

/// Serve one client until it disconnects or the node closes connections.
///
/// Commands are processed in order. A close request is only honoured while
/// the connection is idle, so a command already running still gets its
/// response written. A user operation whose client hangs up is dropped,
/// which unregisters it and releases any cursor it pinned.
async fn handle_connection(stream: TcpStream, peer: SocketAddr, node: Arc<Node>) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let connection_id = node.next_connection_id();
    let mut close = node.subscribe_close();
    debug!(connection_id, %peer, "Connection accepted");

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let read = tokio::select! {
            biased;
            _ = close.changed() => {
                debug!(connection_id, "Closing connection");
                return Ok(());
            }
            read = read_frame(&mut reader, &mut line) => read?,
        };
        if read == 0 {
            debug!(connection_id, "Client disconnected");
            return Ok(());
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => {
                let name = request.command.name();
                let mut watching = !request.command.is_admin();
                debug!(connection_id, request_id = request.request_id, command = name, "Executing");
                let execute = node.execute(connection_id, request.command);
                tokio::pin!(execute);
                let result = loop {
                    tokio::select! {
                        result = &mut execute => break Some(result),
                        open = peer_open(&mut reader), if watching => match open {
                            Ok(true) => watching = false,
                            Ok(false) | Err(_) => break None,
                        },
                    }
                };
                let Some(result) = result else {
                    debug!(connection_id, command = name, "Client went away, abandoning operation");
                    return Ok(());
                };
                match result {
                    Ok(reply) => Response::success(request.request_id, reply),
                    Err(err) => {
                        debug!(connection_id, command = name, error = %err, "Command failed");
                        Response::failure(request.request_id, err)
                    }
                }
            }
            Err(e) => Response::failure(
                request_id_of(trimmed),
                ServerError::new(ServerErrorCode::FailedToParse, e.to_string()),
            ),
        };

        let mut out = serde_json::to_string(&response)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
    }
}

/// Resolves once the client sends more data (`true`) or hangs up (`false`).
/// Nothing is consumed, so a pipelined request is read after the current one.
async fn peer_open<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<bool> {
    Ok(!reader.fill_buf().await?.is_empty())
}

/// Best-effort request id of an unparseable request.
fn request_id_of(raw: &str) -> u64 {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.get("request_id").and_then(serde_json::Value::as_u64))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_of_malformed_command() {
        assert_eq!(request_id_of(r#"{"request_id": 4, "command": "bogus"}"#), 4);
        assert_eq!(request_id_of("not json"), 0);
    }

    #[tokio::test]
    async fn test_peer_open_does_not_consume() {
        let mut closed: &[u8] = b"";
        assert!(!peer_open(&mut closed).await.unwrap());

        let mut pending: &[u8] = b"{\"request_id\":2}\n";
        assert!(peer_open(&mut pending).await.unwrap());
        let mut line = String::new();
        read_frame(&mut pending, &mut line).await.unwrap();
        assert_eq!(line, "{\"request_id\":2}\n");
    }
}
