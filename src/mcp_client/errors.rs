//! MCP gateway error types.
//!
//! Failures local to one server (spawn, handshake, transport) are absorbed by the
//! registry and reported as status entries. Failures during a tool call are
//! returned to the caller as one of these variants and never retried here.

use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while managing servers or dispatching tool calls.
#[derive(Debug, Error)]
pub enum McpError {
    /// A server process failed to start (bad command, missing binary).
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialization handshake failed or timed out.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// Writing to the server failed (serialization or stdin I/O).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// The server's stream closed; every pending call on it fails with this.
    #[error("transport to server '{server}' closed: {reason}")]
    TransportClosed {
        server: String,
        reason: String,
    },

    /// The server reported a failure (JSON-RPC error or `isError` tool result).
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Tool not present in the catalog.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
        suggestions: Vec<String>,
    },

    /// A request did not complete within its bound.
    #[error("tool call '{tool}' timed out after {timeout_ms}ms")]
    Timeout {
        tool: String,
        timeout_ms: u64,
    },

    /// Configuration error (unreadable file, invalid descriptor).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// All restart attempts exhausted for a server.
    #[error("server '{name}' failed after {attempts} restart attempts")]
    RestartExhausted {
        name: String,
        attempts: u32,
    },
}

impl McpError {
    /// Stable, snake_case failure kind for display and logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SpawnFailed { .. } => "launch_failure",
            Self::InitFailed { .. } => "protocol_error",
            Self::TransportError { .. } => "transport_error",
            Self::TransportClosed { .. } => "transport_closed",
            Self::ServerError { .. } => "remote_error",
            Self::UnknownTool { .. } => "unknown_tool",
            Self::Timeout { .. } => "timeout",
            Self::ConfigError { .. } => "config_error",
            Self::RestartExhausted { .. } => "restart_exhausted",
        }
    }

    /// Build the structured failure record for a call to `tool_name`.
    pub fn to_failure(&self, tool_name: &str) -> ToolCallFailure {
        ToolCallFailure {
            tool_name: tool_name.to_string(),
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// What a UI needs to show for a failed tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCallFailure {
    pub tool_name: String,
    pub kind: &'static str,
    pub message: String,
}
