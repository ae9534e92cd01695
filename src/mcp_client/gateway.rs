//! Gateway: the single entry point for callers.
//!
//! Composes the server registry and the tool catalog: connect everything,
//! expose the unified catalog, execute a tool by name. The gateway never
//! retries a call; retry policy belongs to the caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::Instrument;

use super::catalog::{CatalogEntry, ToolCatalog};
use super::config::{GatewaySettings, McpServersConfig, ServerDescriptor};
use super::errors::McpError;
use super::registry::{ConnectOutcome, ServerRegistry, ServerStatusEntry};

// ─── Gateway ─────────────────────────────────────────────────────────────────

/// High-level facade over every configured tool server.
///
/// Cheap to clone; clones share the same registry and catalog. Safe to call
/// concurrently, including for the same tool.
#[derive(Clone)]
pub struct Gateway {
    registry: ServerRegistry,
    catalog: Arc<ToolCatalog>,
    settings: GatewaySettings,
}

impl Gateway {
    pub fn new(settings: GatewaySettings) -> Self {
        let catalog = Arc::new(ToolCatalog::new());
        Self {
            registry: ServerRegistry::new(settings, Arc::clone(&catalog)),
            catalog,
            settings,
        }
    }

    /// Build a gateway using the settings from a loaded config.
    pub fn from_config(config: &McpServersConfig) -> Self {
        Self::new(config.settings)
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect every enabled server in `config` concurrently.
    pub async fn connect_all(&self, config: &McpServersConfig) -> Vec<ConnectOutcome> {
        self.connect(&config.enabled_servers()).await
    }

    /// Connect an explicit list of descriptors (disabled ones are skipped).
    pub async fn connect(&self, descriptors: &[ServerDescriptor]) -> Vec<ConnectOutcome> {
        self.registry.connect_all(descriptors).await
    }

    /// Restart one server. See [`ServerRegistry::restart`].
    pub async fn restart(&self, server_name: &str) -> Result<usize, McpError> {
        self.registry.restart(server_name).await
    }

    /// Shut down all servers gracefully.
    pub async fn shutdown(&self) {
        self.registry.shutdown_all().await;
    }

    // ─── Catalog ─────────────────────────────────────────────────────────

    /// The unified tool catalog.
    pub fn catalog(&self) -> Vec<CatalogEntry> {
        self.catalog.snapshot()
    }

    /// The catalog in OpenAI function-calling format.
    pub fn openai_tools(&self) -> Vec<serde_json::Value> {
        self.catalog.to_openai_tools()
    }

    /// Direct access to the router, e.g. for collision reporting.
    pub fn tool_catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn status(&self) -> Vec<ServerStatusEntry> {
        self.registry.status()
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Execute a tool by name with the default call timeout.
    ///
    /// Resolves the owning server, then awaits that server's response. The raw
    /// `tools/call` result is returned untouched.
    pub async fn execute(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        self.execute_with_timeout(tool_name, arguments, self.settings.call_timeout)
            .await
    }

    /// Execute a tool by name, failing with `Timeout` after `timeout`.
    pub async fn execute_with_timeout(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        let call_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("execute", %call_id, tool = tool_name);

        async move {
            let start = Instant::now();

            let server_name = self.catalog.resolve(tool_name)?;
            let session =
                self.registry
                    .session(&server_name)
                    .ok_or_else(|| McpError::TransportClosed {
                        server: server_name.clone(),
                        reason: "server not running".into(),
                    })?;

            let result = session.call_with_timeout(tool_name, arguments, timeout).await;
            let elapsed_ms = start.elapsed().as_millis() as u64;

            match &result {
                Ok(_) => tracing::info!(server = %server_name, elapsed_ms, "tool call succeeded"),
                Err(e) => tracing::warn!(
                    server = %server_name,
                    elapsed_ms,
                    kind = e.kind(),
                    error = %e,
                    "tool call failed"
                ),
            }
            result
        }
        .instrument(span)
        .await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
