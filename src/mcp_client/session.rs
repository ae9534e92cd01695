//! One managed connection to a tool server subprocess.
//!
//! A `Session` exclusively owns its child process and the stdio stream to it.
//! Lifecycle: `Pending → Initializing → Ready → Degraded/Closed`. A supervisor
//! task keeps the process for the session's whole lifetime and is cancelled
//! exactly once, by `shutdown` (or by dropping the session).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use super::config::{GatewaySettings, ServerDescriptor};
use super::errors::McpError;
use super::transport::{extract_result, StdioTransport};
use super::types::{
    error_codes, CallToolResult, InitializeResult, ListToolsResult, McpToolDefinition,
    ServerInfo, PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Stderr lines kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Upper bound on `tools/list` pages, against servers that loop on cursors.
const MAX_TOOL_PAGES: usize = 100;

/// How long to wait for buffered stdout after the process has exited.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Process spawned, handshake not started.
    Pending,
    /// `initialize` / `tools/list` in progress.
    Initializing,
    /// Handshake complete, tools published.
    Ready,
    /// Handshake failed or timed out. Never re-enters `Ready`.
    Degraded,
    /// Stream closed or session shut down.
    Closed,
}

type StderrTail = Arc<Mutex<VecDeque<String>>>;

// ─── Session ─────────────────────────────────────────────────────────────────

/// A running tool server with its transport and declared tools.
pub struct Session {
    name: String,
    transport: Arc<StdioTransport>,
    state: Arc<watch::Sender<SessionState>>,
    tools: Vec<McpToolDefinition>,
    server_info: Option<ServerInfo>,
    settings: GatewaySettings,
    stderr_tail: StderrTail,
    pid: Option<u32>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Spawn the server process and wire its stdio. No protocol traffic yet.
    pub fn open(descriptor: &ServerDescriptor, settings: GatewaySettings) -> Result<Self, McpError> {
        let name = descriptor.name.as_str();

        let mut cmd = Command::new(&descriptor.command);
        cmd.args(&descriptor.args);
        for (key, value) in &descriptor.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &descriptor.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{e}"),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let stderr_tail: StderrTail = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(name.to_string(), stderr, Arc::clone(&stderr_tail)));
        }

        let pid = child.id();
        let transport = Arc::new(StdioTransport::new(name, stdin, stdout));
        let (state_tx, _) = watch::channel(SessionState::Pending);
        let state = Arc::new(state_tx);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let supervisor = tokio::spawn(supervise(
            name.to_string(),
            child,
            Arc::clone(&transport),
            shutdown_rx,
            Arc::clone(&state),
            settings.shutdown_timeout,
        ));

        tracing::debug!(server = name, pid, command = %descriptor.command, "spawned server process");

        Ok(Self {
            name: name.to_string(),
            transport,
            state,
            tools: Vec::new(),
            server_info: None,
            settings,
            stderr_tail,
            pid,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    /// Open, handshake, and list tools. On any failure the process is stopped.
    pub async fn connect(
        descriptor: &ServerDescriptor,
        settings: GatewaySettings,
    ) -> Result<Self, McpError> {
        let mut session = Self::open(descriptor, settings)?;

        let outcome = match session.initialize().await {
            Ok(()) => session.list_tools().await.map(|_| ()),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => Ok(session),
            Err(e) => {
                session.shutdown().await;
                Err(e)
            }
        }
    }

    /// Perform the MCP initialization handshake within the handshake timeout.
    ///
    /// On failure the session is marked `Degraded`.
    pub async fn initialize(&mut self) -> Result<(), McpError> {
        self.set_state(SessionState::Initializing);
        let timeout = self.settings.handshake_timeout;

        match tokio::time::timeout(timeout, self.handshake()).await {
            Ok(Ok(init)) => {
                tracing::debug!(
                    server = %self.name,
                    protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
                    "handshake complete"
                );
                self.server_info = init.server_info;
                Ok(())
            }
            Ok(Err(e)) => {
                self.set_state(SessionState::Degraded);
                Err(McpError::InitFailed {
                    name: self.name.clone(),
                    reason: format!("{e}{}", self.stderr_suffix()),
                })
            }
            Err(_) => {
                self.set_state(SessionState::Degraded);
                Err(McpError::InitFailed {
                    name: self.name.clone(),
                    reason: format!(
                        "initialization timed out after {}ms{}",
                        timeout.as_millis(),
                        self.stderr_suffix()
                    ),
                })
            }
        }
    }

    async fn handshake(&self) -> Result<InitializeResult, McpError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let response = self
            .transport
            .request("initialize", Some(params), self.settings.handshake_timeout)
            .await?;
        let result = extract_result(response)?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::InitFailed {
                name: self.name.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;

        self.transport
            .notify("notifications/initialized", None)
            .await?;
        Ok(init)
    }

    /// Fetch the server's tools (following pagination) and mark the session `Ready`.
    ///
    /// The list is cached; later calls return it without protocol traffic.
    pub async fn list_tools(&mut self) -> Result<&[McpToolDefinition], McpError> {
        if self.state() == SessionState::Ready {
            return Ok(&self.tools);
        }

        match self.fetch_tools().await {
            Ok(tools) => {
                self.tools = tools;
                self.set_state(SessionState::Ready);
                tracing::info!(server = %self.name, tools = self.tools.len(), "server ready");
                Ok(&self.tools)
            }
            Err(e) => {
                self.set_state(SessionState::Degraded);
                Err(McpError::InitFailed {
                    name: self.name.clone(),
                    reason: format!("tools/list failed: {e}{}", self.stderr_suffix()),
                })
            }
        }
    }

    async fn fetch_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));
            let response = self
                .transport
                .request("tools/list", params, self.settings.handshake_timeout)
                .await?;
            let page: ListToolsResult =
                serde_json::from_value(extract_result(response)?).map_err(|e| {
                    McpError::InitFailed {
                        name: self.name.clone(),
                        reason: format!("failed to parse tools/list response: {e}"),
                    }
                })?;

            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        tracing::warn!(server = %self.name, pages = MAX_TOOL_PAGES, "tools/list pagination cut off");
        Ok(tools)
    }

    /// Call a tool with the default call timeout.
    pub async fn call(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        self.call_with_timeout(tool_name, arguments, self.settings.call_timeout)
            .await
    }

    /// Call a tool, failing with `Timeout` after `timeout`.
    ///
    /// A timeout does not close the session. Calls may be issued concurrently.
    pub async fn call_with_timeout(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        match self.state() {
            SessionState::Ready => {}
            state => {
                let reason = self
                    .transport
                    .close_reason()
                    .unwrap_or_else(|| format!("session is {state:?}"));
                return Err(McpError::TransportClosed {
                    server: self.name.clone(),
                    reason,
                });
            }
        }

        let arguments = if arguments.is_null() {
            serde_json::json!({})
        } else {
            arguments
        };
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });

        let response = self
            .transport
            .request("tools/call", Some(params), timeout)
            .await
            .map_err(|e| match e {
                McpError::Timeout { timeout_ms, .. } => McpError::Timeout {
                    tool: tool_name.to_string(),
                    timeout_ms,
                },
                other => other,
            })?;

        let result = extract_result(response)?;
        let parsed: CallToolResult =
            serde_json::from_value(result.clone()).map_err(|e| McpError::ServerError {
                code: error_codes::PARSE_ERROR,
                message: format!("malformed tools/call result from '{}': {e}", self.name),
                data: Some(result.clone()),
            })?;

        if parsed.is_error {
            let text = parsed.text();
            return Err(McpError::ServerError {
                code: error_codes::TOOL_ERROR,
                message: if text.is_empty() {
                    format!("tool '{tool_name}' reported an error")
                } else {
                    text
                },
                data: Some(result),
            });
        }

        Ok(result)
    }

    /// Stop the server: close stdin, wait, then kill. Only the first call acts.
    pub async fn shutdown(&self) {
        let shutdown_tx = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(());
        }

        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
    }

    // ─── Accessors ───────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tools declared at `Ready` (empty before).
    pub fn tools(&self) -> &[McpToolDefinition] {
        &self.tools
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Why the stream closed, if it has.
    pub fn close_reason(&self) -> Option<String> {
        self.transport.close_reason()
    }

    fn set_state(&self, next: SessionState) {
        self.state.send_modify(|state| {
            // Closed is terminal.
            if *state != SessionState::Closed {
                *state = next;
            }
        });
    }

    fn stderr_suffix(&self) -> String {
        let tail = self
            .stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        format_stderr_suffix(&tail.iter().cloned().collect::<Vec<_>>().join("\n"))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("tools", &self.tools.len())
            .field("pid", &self.pid)
            .finish()
    }
}

// ─── Background Tasks ────────────────────────────────────────────────────────

/// Keep the process for the session's lifetime; close everything when it ends.
async fn supervise(
    name: String,
    mut child: Child,
    transport: Arc<StdioTransport>,
    mut shutdown_rx: oneshot::Receiver<()>,
    state: Arc<watch::Sender<SessionState>>,
    shutdown_timeout: Duration,
) {
    let reason = tokio::select! {
        status = child.wait() => {
            // Let the reader deliver whatever the process wrote before exiting.
            let _ = tokio::time::timeout(DRAIN_GRACE, transport.closed()).await;
            match status {
                Ok(status) => format!("server process exited ({status})"),
                Err(e) => format!("failed to wait on server process: {e}"),
            }
        }
        _ = transport.closed() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            transport
                .close_reason()
                .unwrap_or_else(|| "server stdout closed".to_string())
        }
        _ = &mut shutdown_rx => {
            transport.close_writer().await;
            if tokio::time::timeout(shutdown_timeout, child.wait()).await.is_err() {
                tracing::warn!(server = %name, "server ignored shutdown, killing");
                let _ = child.kill().await;
            }
            "session shut down".to_string()
        }
    };

    transport.close(&reason);
    state.send_modify(|current| {
        // Degraded sessions keep their state so status shows why they never came up.
        if *current != SessionState::Degraded {
            *current = SessionState::Closed;
        }
    });
    tracing::info!(server = %name, reason = %reason, "session closed");
}

async fn forward_stderr(name: String, stderr: ChildStderr, tail: StderrTail) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %name, line = %line, "server stderr");
        let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::mcp_client::test_support::{
        fast_settings, hanging_server, missing_binary, mock_server,
    };
    use tempfile::TempDir;

    #[test]
    fn test_format_stderr_suffix() {
        assert_eq!(format_stderr_suffix(""), "");
        assert_eq!(format_stderr_suffix(" boom \n"), " | stderr: boom");
    }

    #[tokio::test]
    async fn test_connect_lists_tools_and_reaches_ready() {
        let tmp = TempDir::new().unwrap();
        let descriptor = mock_server(&tmp, "github", &["search_repositories", "get_issue"]);

        let session = Session::connect(&descriptor, fast_settings()).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        let names: Vec<&str> = session.tools().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["search_repositories", "get_issue"]);
        assert_eq!(
            session.server_info().and_then(|i| i.name.as_deref()),
            Some("github")
        );

        session.shutdown().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_launch_failure() {
        let err = Session::connect(&missing_binary("ghost"), fast_settings())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::SpawnFailed { .. }));
        assert_eq!(err.kind(), "launch_failure");
    }

    #[tokio::test]
    async fn test_handshake_timeout_degrades_session() {
        let tmp = TempDir::new().unwrap();
        let descriptor = hanging_server(&tmp, "silent");

        let mut session = Session::open(&descriptor, fast_settings()).unwrap();
        let err = session.initialize().await.unwrap_err();
        assert!(matches!(err, McpError::InitFailed { .. }));
        assert!(err.to_string().contains("timed out"));
        assert_eq!(session.state(), SessionState::Degraded);

        session.shutdown().await;
        assert_eq!(session.state(), SessionState::Degraded);
    }

    #[tokio::test]
    async fn test_pipelined_calls_complete_out_of_order() {
        let tmp = TempDir::new().unwrap();
        let descriptor = mock_server(&tmp, "mixed", &["slow_report", "quick"]);
        let session = Session::connect(&descriptor, fast_settings()).await.unwrap();

        let started = tokio::time::Instant::now();
        let slow = session.call("slow_report", serde_json::json!({}));
        let quick = async {
            let result = session.call("quick", serde_json::json!({})).await;
            (result, started.elapsed())
        };
        let (slow_result, (quick_result, quick_elapsed)) = tokio::join!(slow, quick);

        assert_eq!(
            quick_result.unwrap()["content"][0]["text"],
            "called quick"
        );
        assert!(quick_elapsed < Duration::from_millis(1500));
        assert_eq!(
            slow_result.unwrap()["content"][0]["text"],
            "called slow_report"
        );
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_call_timeout_keeps_session_open() {
        let tmp = TempDir::new().unwrap();
        let descriptor = mock_server(&tmp, "mixed", &["slow_report", "quick"]);
        let session = Session::connect(&descriptor, fast_settings()).await.unwrap();

        let err = session
            .call_with_timeout("slow_report", serde_json::json!({}), Duration::from_millis(100))
            .await
            .unwrap_err();
        match err {
            McpError::Timeout { tool, timeout_ms } => {
                assert_eq!(tool, "slow_report");
                assert_eq!(timeout_ms, 100);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }

        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.call("quick", serde_json::json!({})).await.is_ok());
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_tool_error_and_rpc_error_are_remote_errors() {
        let tmp = TempDir::new().unwrap();
        let descriptor = mock_server(&tmp, "flaky", &["fail", "boom"]);
        let session = Session::connect(&descriptor, fast_settings()).await.unwrap();

        match session.call("fail", serde_json::json!({})).await.unwrap_err() {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, error_codes::TOOL_ERROR);
                assert_eq!(message, "rate limit exceeded");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }

        match session.call("boom", serde_json::json!({})).await.unwrap_err() {
            McpError::ServerError { code, .. } => assert_eq!(code, error_codes::INVALID_PARAMS),
            other => panic!("expected ServerError, got {other:?}"),
        }

        assert_eq!(session.state(), SessionState::Ready);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_crash_fails_pending_calls_and_closes() {
        let tmp = TempDir::new().unwrap();
        let descriptor = mock_server(&tmp, "fragile", &["slow_report", "crash"]);
        let session = Session::connect(&descriptor, fast_settings()).await.unwrap();
        let mut state = session.subscribe();

        let (slow, crash) = tokio::join!(
            session.call("slow_report", serde_json::json!({})),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                session.call("crash", serde_json::json!({})).await
            }
        );

        assert!(matches!(slow.unwrap_err(), McpError::TransportClosed { .. }));
        assert!(matches!(crash.unwrap_err(), McpError::TransportClosed { .. }));

        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == SessionState::Closed),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(session.close_reason().is_some());

        let err = session.call("slow_report", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::TransportClosed { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let descriptor = mock_server(&tmp, "once", &["quick"]);
        let session = Session::connect(&descriptor, fast_settings()).await.unwrap();

        session.shutdown().await;
        session.shutdown().await;
        assert_eq!(session.state(), SessionState::Closed);
    }
}
