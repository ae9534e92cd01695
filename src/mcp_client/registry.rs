//! Server registry: supervises one session per configured server.
//!
//! Servers connect concurrently and fail independently: a server that cannot
//! launch or never completes its handshake shows up in [`ServerRegistry::status`]
//! and nowhere else. Ready sessions publish their tools to the shared
//! [`ToolCatalog`]; a watcher task unregisters them when they close.
//!
//! The slot table is guarded by a std mutex that is never held across an
//! await point.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::sleep;

use super::catalog::ToolCatalog;
use super::config::{GatewaySettings, ServerDescriptor};
use super::errors::McpError;
use super::session::{Session, SessionState};

/// Base delay between restart attempts (doubles each time).
const RESTART_BASE_DELAY: Duration = Duration::from_secs(1);

// ─── Public Types ────────────────────────────────────────────────────────────

/// Observable state of one configured server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ServerStatus {
    /// Connection in progress.
    Pending,
    Ready { tool_count: usize },
    /// Handshake failed or timed out; excluded from the catalog.
    Degraded { reason: String },
    /// Never launched, or its stream closed.
    Closed { reason: String },
}

/// One row of [`ServerRegistry::status`].
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatusEntry {
    pub name: String,
    pub display_name: String,
    #[serde(flatten)]
    pub status: ServerStatus,
    /// When the server entered this status.
    pub since: DateTime<Utc>,
}

/// Result of connecting one descriptor.
#[derive(Debug)]
pub struct ConnectOutcome {
    pub name: String,
    /// Tool count on success.
    pub result: Result<usize, McpError>,
}

// ─── Internals ───────────────────────────────────────────────────────────────

struct ServerSlot {
    descriptor: ServerDescriptor,
    session: Option<Arc<Session>>,
    status: ServerStatus,
    since: DateTime<Utc>,
}

impl ServerSlot {
    fn set_status(&mut self, status: ServerStatus) {
        self.status = status;
        self.since = Utc::now();
    }
}

struct RegistryInner {
    settings: GatewaySettings,
    catalog: Arc<ToolCatalog>,
    /// Configuration order.
    slots: Mutex<Vec<ServerSlot>>,
}

impl RegistryInner {
    fn slots(&self) -> MutexGuard<'_, Vec<ServerSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark a server pending. A live session it had is unpublished and
    /// returned so the caller can shut it down.
    fn upsert_pending(&self, descriptor: &ServerDescriptor) -> Option<Arc<Session>> {
        let mut slots = self.slots();
        match slots.iter_mut().find(|s| s.descriptor.name == descriptor.name) {
            Some(slot) => {
                slot.descriptor = descriptor.clone();
                slot.set_status(ServerStatus::Pending);
                let previous = slot.session.take();
                if previous.is_some() {
                    self.catalog.unregister(&descriptor.name);
                }
                previous
            }
            None => {
                slots.push(ServerSlot {
                    descriptor: descriptor.clone(),
                    session: None,
                    status: ServerStatus::Pending,
                    since: Utc::now(),
                });
                None
            }
        }
    }

    /// Connect one server and publish it. Failures are recorded, then returned.
    async fn connect_one(self: Arc<Self>, descriptor: ServerDescriptor) -> Result<usize, McpError> {
        let name = descriptor.name.clone();

        match Session::connect(&descriptor, self.settings).await {
            Ok(session) => {
                let session = Arc::new(session);
                let tool_count = session.tools().len();
                {
                    let mut slots = self.slots();
                    self.catalog.register(&name, session.tools().to_vec());
                    if let Some(slot) = slots.iter_mut().find(|s| s.descriptor.name == name) {
                        slot.session = Some(Arc::clone(&session));
                        slot.set_status(ServerStatus::Ready { tool_count });
                    }
                }
                tracing::info!(
                    server = %name,
                    pid = session.pid(),
                    remote = session.server_info().and_then(|i| i.name.as_deref()),
                    tool_count,
                    "server published"
                );
                tokio::spawn(watch_session(Arc::clone(&self), session));
                Ok(tool_count)
            }
            Err(e) => {
                tracing::warn!(server = %name, kind = e.kind(), error = %e, "server failed to connect");
                let status = match &e {
                    McpError::SpawnFailed { .. } => ServerStatus::Closed {
                        reason: e.to_string(),
                    },
                    _ => ServerStatus::Degraded {
                        reason: e.to_string(),
                    },
                };
                if let Some(slot) = self.slots().iter_mut().find(|s| s.descriptor.name == name) {
                    slot.set_status(status);
                }
                Err(e)
            }
        }
    }
}

/// Unregister a session once it leaves `Ready`.
async fn watch_session(inner: Arc<RegistryInner>, session: Arc<Session>) {
    let mut state = session.subscribe();
    let _ = state
        .wait_for(|s| matches!(s, SessionState::Closed | SessionState::Degraded))
        .await;

    let reason = session
        .close_reason()
        .unwrap_or_else(|| "session closed".to_string());

    let mut slots = inner.slots();
    let Some(slot) = slots
        .iter_mut()
        .find(|s| s.session.as_ref().is_some_and(|live| Arc::ptr_eq(live, &session)))
    else {
        // Already replaced by a restart or removed by shutdown.
        return;
    };

    inner.catalog.unregister(session.name());
    slot.session = None;
    slot.set_status(ServerStatus::Closed {
        reason: reason.clone(),
    });
    tracing::warn!(server = %session.name(), reason = %reason, "server closed, tools unregistered");
}

// ─── ServerRegistry ──────────────────────────────────────────────────────────

/// Supervises the set of server sessions.
#[derive(Clone)]
pub struct ServerRegistry {
    inner: Arc<RegistryInner>,
}

impl ServerRegistry {
    /// Create an empty registry publishing into `catalog`.
    pub fn new(settings: GatewaySettings, catalog: Arc<ToolCatalog>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                settings,
                catalog,
                slots: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Connect every enabled descriptor concurrently.
    ///
    /// Returns one outcome per enabled descriptor, in input order. A failure in
    /// one server never affects the others. A server that is already running
    /// is shut down and reconnected.
    pub async fn connect_all(&self, descriptors: &[ServerDescriptor]) -> Vec<ConnectOutcome> {
        let enabled: Vec<&ServerDescriptor> = descriptors.iter().filter(|d| d.enabled).collect();
        let replaced: Vec<Arc<Session>> = enabled
            .iter()
            .filter_map(|descriptor| self.inner.upsert_pending(descriptor))
            .collect();
        if !replaced.is_empty() {
            tracing::info!(servers = replaced.len(), "replacing running servers");
            futures::future::join_all(replaced.iter().map(|s| s.shutdown())).await;
        }

        let handles: Vec<_> = enabled
            .iter()
            .map(|descriptor| {
                tokio::spawn(Arc::clone(&self.inner).connect_one((*descriptor).clone()))
            })
            .collect();

        let results = futures::future::join_all(handles).await;

        let outcomes: Vec<ConnectOutcome> = enabled
            .into_iter()
            .zip(results)
            .map(|(descriptor, joined)| ConnectOutcome {
                name: descriptor.name.clone(),
                result: joined.unwrap_or_else(|e| {
                    Err(McpError::SpawnFailed {
                        name: descriptor.name.clone(),
                        reason: format!("join error: {e}"),
                    })
                }),
            })
            .collect();

        let ready = outcomes.iter().filter(|o| o.result.is_ok()).count();
        tracing::info!(
            ready,
            failed = outcomes.len() - ready,
            tools = self.inner.catalog.len(),
            "connect_all finished"
        );
        outcomes
    }

    /// Restart a server by name with exponential backoff (1s, 2s, 4s, ...).
    ///
    /// Never called automatically. Any running session is shut down first.
    pub async fn restart(&self, name: &str) -> Result<usize, McpError> {
        let descriptor = self
            .inner
            .slots()
            .iter()
            .find(|s| s.descriptor.name == name)
            .map(|slot| slot.descriptor.clone())
            .ok_or(McpError::ConfigError {
                reason: format!("no configuration for server '{name}'"),
            })?;

        if let Some(session) = self.inner.upsert_pending(&descriptor) {
            session.shutdown().await;
        }

        let max_attempts = self.inner.settings.max_restart_attempts;
        for attempt in 0..max_attempts {
            let delay = RESTART_BASE_DELAY * 2u32.saturating_pow(attempt);
            sleep(delay).await;

            self.inner.upsert_pending(&descriptor);
            match Arc::clone(&self.inner).connect_one(descriptor.clone()).await {
                Ok(tool_count) => {
                    tracing::info!(server = name, attempt = attempt + 1, "server restarted");
                    return Ok(tool_count);
                }
                Err(e) => {
                    tracing::warn!(server = name, attempt = attempt + 1, error = %e, "restart attempt failed");
                }
            }
        }

        Err(McpError::RestartExhausted {
            name: name.to_string(),
            attempts: max_attempts,
        })
    }

    /// Shut down every session and clear the catalog.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .inner
            .slots()
            .iter()
            .filter_map(|slot| slot.session.clone())
            .collect();

        futures::future::join_all(sessions.iter().map(|s| s.shutdown())).await;

        let mut slots = self.inner.slots();
        for slot in slots.iter_mut().filter(|s| s.session.is_some()) {
            self.inner.catalog.unregister(&slot.descriptor.name);
            slot.session = None;
            slot.set_status(ServerStatus::Closed {
                reason: "gateway shut down".to_string(),
            });
        }
        tracing::info!(servers = sessions.len(), "all servers shut down");
    }

    /// Per-server status, in configuration order.
    pub fn status(&self) -> Vec<ServerStatusEntry> {
        self.inner
            .slots()
            .iter()
            .map(|slot| ServerStatusEntry {
                name: slot.descriptor.name.clone(),
                display_name: slot.descriptor.display_name.clone(),
                status: slot.status.clone(),
                since: slot.since,
            })
            .collect()
    }

    /// The ready session for a server, if any.
    pub fn session(&self, name: &str) -> Option<Arc<Session>> {
        self.inner
            .slots()
            .iter()
            .find(|s| s.descriptor.name == name)
            .and_then(|s| s.session.clone())
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.inner.catalog
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
