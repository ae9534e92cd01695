//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with MCP server child processes:
//! - Writing newline-delimited JSON-RPC messages to stdin
//! - A background reader that owns stdout and routes each response to the
//!   caller waiting on its `id`, so any number of requests can be in flight
//! - Failing every pending request once the stream closes

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::{
    error_codes, IncomingMessage, JsonRpcError, JsonRpcNotification, JsonRpcReply,
    JsonRpcRequest, JsonRpcResponse,
};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Pending Table ───────────────────────────────────────────────────────────

type Waiter = oneshot::Sender<Result<JsonRpcResponse, McpError>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Callers waiting for a response, keyed by request id.
///
/// Once `closed` is set no new waiter may be inserted, so a request issued
/// after the stream died fails immediately instead of waiting for its timeout.
#[derive(Default)]
struct PendingTable {
    waiters: HashMap<u64, Waiter>,
    closed: Option<String>,
}

struct Shared {
    server_name: String,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    pending: Mutex<PendingTable>,
    closed_tx: watch::Sender<bool>,
}

impl Shared {
    fn pending(&self) -> std::sync::MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_error(&self, reason: &str) -> McpError {
        McpError::TransportClosed {
            server: self.server_name.clone(),
            reason: reason.to_string(),
        }
    }

    /// Mark the stream closed and fail every waiter. Idempotent.
    fn close(&self, reason: &str) {
        let drained: Vec<(u64, Waiter)> = {
            let mut table = self.pending();
            if table.closed.is_none() {
                table.closed = Some(reason.to_string());
            }
            table.waiters.drain().collect()
        };

        if !drained.is_empty() {
            tracing::warn!(
                server = %self.server_name,
                pending = drained.len(),
                reason,
                "failing pending requests on closed transport"
            );
        }
        for (_, waiter) in drained {
            let _ = waiter.send(Err(self.closed_error(reason)));
        }

        self.closed_tx.send_replace(true);
    }

    async fn write_message<T: Serialize>(&self, message: &T) -> Result<(), McpError> {
        let mut json = serde_json::to_string(message).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        json.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) => writer,
            None => return Err(self.closed_error("stdin already closed")),
        };

        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer.flush().await.map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to flush stdin: {e}"),
        })
    }

    /// Route one stdout line.
    async fn dispatch_line(&self, line: &str) {
        let message: IncomingMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(_) => {
                // Servers sometimes log to stdout; that is not protocol traffic.
                tracing::debug!(server = %self.server_name, line, "skipping non-JSON stdout line");
                return;
            }
        };

        match (message.method, message.id) {
            (Some(method), Some(id)) => self.answer_server_request(&method, id).await,
            (Some(method), None) => {
                tracing::debug!(server = %self.server_name, method = %method, "server notification");
            }
            (None, Some(id)) => {
                let Some(id) = id.as_u64() else {
                    tracing::warn!(server = %self.server_name, %id, "response with non-numeric id");
                    return;
                };
                let waiter = self.pending().waiters.remove(&id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(JsonRpcResponse {
                            id,
                            result: message.result,
                            error: message.error,
                        }));
                    }
                    None => {
                        tracing::warn!(
                            server = %self.server_name,
                            id,
                            "dropping response with no waiting caller (late or unknown id)"
                        );
                    }
                }
            }
            (None, None) => {
                tracing::debug!(server = %self.server_name, "ignoring message without id or method");
            }
        }
    }

    /// Answer requests the server sends to us. Only `ping` is supported.
    async fn answer_server_request(&self, method: &str, id: serde_json::Value) {
        let reply = if method == "ping" {
            JsonRpcReply {
                jsonrpc: "2.0".into(),
                id,
                result: Some(serde_json::json!({})),
                error: None,
            }
        } else {
            tracing::debug!(server = %self.server_name, method, "rejecting unsupported server request");
            JsonRpcReply {
                jsonrpc: "2.0".into(),
                id,
                result: None,
                error: Some(JsonRpcError {
                    code: error_codes::METHOD_NOT_FOUND,
                    message: format!("method not supported by client: {method}"),
                    data: None,
                }),
            }
        };

        if let Err(e) = self.write_message(&reply).await {
            tracing::warn!(server = %self.server_name, error = %e, "failed to answer server request");
        }
    }
}

/// Removes its request's waiter if the caller stops waiting early.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending().waiters.remove(&self.id);
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    shared: Arc<Shared>,
    closed_rx: watch::Receiver<bool>,
    reader_task: JoinHandle<()>,
}

impl StdioTransport {
    /// Create a transport and start its reader task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<W, R>(server_name: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (closed_tx, closed_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            server_name: server_name.to_string(),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            pending: Mutex::new(PendingTable::default()),
            closed_tx,
        });

        let reader_task = tokio::spawn(read_loop(Arc::clone(&shared), reader));

        Self {
            shared,
            closed_rx,
            reader_task,
        }
    }

    /// Send a request and wait up to `timeout` for the response with its id.
    ///
    /// Responses may arrive in any order; each is matched by id.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let (tx, rx) = oneshot::channel();

        {
            let mut table = self.shared.pending();
            if let Some(reason) = &table.closed {
                return Err(self.shared.closed_error(reason));
            }
            table.waiters.insert(id, tx);
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        self.shared
            .write_message(&JsonRpcRequest::new(id, method, params))
            .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.shared.closed_error("response channel dropped")),
            Err(_) => Err(McpError::Timeout {
                tool: method.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.shared
            .write_message(&JsonRpcNotification::new(method, params))
            .await
    }

    /// Close stdin. A well-behaved server exits when its input ends.
    pub async fn close_writer(&self) {
        let mut guard = self.shared.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Fail all pending requests and refuse new ones.
    pub fn close(&self, reason: &str) {
        self.shared.close(reason);
    }

    /// Whether the stream has closed.
    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Why the stream closed, if it has.
    pub fn close_reason(&self) -> Option<String> {
        self.shared.pending().closed.clone()
    }

    /// Resolve once the stream has closed.
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending().waiters.len()
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.shared.close("transport dropped");
    }
}

async fn read_loop<R>(shared: Arc<Shared>, reader: R)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    let reason = loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break "server stdout closed (process may have exited)".to_string(),
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    shared.dispatch_line(trimmed).await;
                }
            }
            Err(e) => break format!("failed to read from stdout: {e}"),
        }
    };

    tracing::debug!(server = %shared.server_name, reason = %reason, "reader loop finished");
    shared.close(&reason);
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Transport wired to an in-memory peer: returns the peer's reader and writer.
    fn wired() -> (StdioTransport, BufReader<DuplexStream>, DuplexStream) {
        let (client_write, server_read) = tokio::io::duplex(64 * 1024);
        let (server_write, client_read) = tokio::io::duplex(64 * 1024);
        let transport = StdioTransport::new("mock", client_write, client_read);
        (transport, BufReader::new(server_read), server_write)
    }

    async fn read_request(reader: &mut BufReader<DuplexStream>) -> serde_json::Value {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn reply(writer: &mut DuplexStream, id: &serde_json::Value, result: serde_json::Value) {
        let line = serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result});
        writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
    }

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_match_by_id() {
        let (transport, mut peer_read, mut peer_write) = wired();

        let peer = tokio::spawn(async move {
            let first = read_request(&mut peer_read).await;
            let second = read_request(&mut peer_read).await;
            // Answer in reverse order, echoing the method back.
            reply(&mut peer_write, &second["id"], second["method"].clone()).await;
            reply(&mut peer_write, &first["id"], first["method"].clone()).await;
            (peer_read, peer_write)
        });

        let timeout = Duration::from_secs(5);
        let (a, b) = tokio::join!(
            transport.request("alpha", None, timeout),
            transport.request("beta", None, timeout),
        );

        assert_eq!(extract_result(a.unwrap()).unwrap(), "alpha");
        assert_eq!(extract_result(b.unwrap()).unwrap(), "beta");
        assert_eq!(transport.pending_count(), 0);
        let _keep_open = peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_close_fails_pending_requests() {
        let (transport, mut peer_read, peer_write) = wired();

        let peer = tokio::spawn(async move {
            let _request = read_request(&mut peer_read).await;
            drop(peer_write);
            peer_read
        });

        let err = transport
            .request("tools/call", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::TransportClosed { .. }));

        transport.closed().await;
        assert!(transport.is_closed());
        assert!(transport.close_reason().is_some());

        // New requests fail immediately once closed.
        let err = transport
            .request("tools/list", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::TransportClosed { .. }));
        let _ = peer.await;
    }

    #[tokio::test]
    async fn test_timeout_leaves_no_pending_entry() {
        let (transport, _peer_read, _peer_write) = wired();

        let err = transport
            .request("slow", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        match err {
            McpError::Timeout { tool, timeout_ms } => {
                assert_eq!(tool, "slow");
                assert_eq!(timeout_ms, 50);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert_eq!(transport.pending_count(), 0);
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn test_non_json_lines_and_notifications_are_skipped() {
        let (transport, mut peer_read, mut peer_write) = wired();

        let peer = tokio::spawn(async move {
            let request = read_request(&mut peer_read).await;
            peer_write.write_all(b"starting server...\n").await.unwrap();
            peer_write
                .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\"}\n")
                .await
                .unwrap();
            reply(&mut peer_write, &request["id"], serde_json::json!({"ok": true})).await;
            (peer_read, peer_write)
        });

        let resp = transport
            .request("tools/list", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(extract_result(resp).unwrap()["ok"], true);
        let _keep_open = peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_ping_is_answered() {
        let (_transport, mut peer_read, mut peer_write) = wired();

        peer_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":\"p1\",\"method\":\"ping\"}\n")
            .await
            .unwrap();
        let answer = read_request(&mut peer_read).await;
        assert_eq!(answer["id"], "p1");
        assert_eq!(answer["result"], serde_json::json!({}));

        peer_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"sampling/createMessage\"}\n")
            .await
            .unwrap();
        let answer = read_request(&mut peer_read).await;
        assert_eq!(answer["id"], 7);
        assert_eq!(answer["error"]["code"], error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            id: 1,
            result: None,
            error: Some(JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        match extract_result(resp).unwrap_err() {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            id: 1,
            result: None,
            error: None,
        };
        assert!(matches!(
            extract_result(resp).unwrap_err(),
            McpError::ServerError { .. }
        ));
    }
}
