//! MCP Client: JSON-RPC over stdio to a set of tool servers.
//!
//! This module handles:
//! - Spawning and supervising one server subprocess per configured server
//! - JSON-RPC 2.0 communication over process stdio, with pipelined requests
//! - Aggregating every ready server's tools into one catalog
//! - Routing a tool call by name to the server that owns it
//!
//! [`Gateway`] is the entry point; the other types are exposed for callers
//! that need finer control.

pub mod catalog;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(all(test, unix))]
pub(crate) mod test_support;

// Re-exports for convenience
pub use catalog::{CatalogEntry, Collision, ToolCatalog};
pub use config::{load_config, GatewaySettings, McpServersConfig, ServerDescriptor};
pub use errors::{McpError, ToolCallFailure};
pub use gateway::Gateway;
pub use registry::{ConnectOutcome, ServerRegistry, ServerStatus, ServerStatusEntry};
pub use session::{Session, SessionState};
pub use types::McpToolDefinition;
