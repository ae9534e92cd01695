//! Tool catalog: the unified, name-addressable table of tools across all
//! live sessions, plus the tool → owning-server router.
//!
//! The table is copy-on-write: writers build a new table under a writer lock
//! and swap an `Arc`; readers clone the current `Arc` and never observe a
//! half-applied update. No lock is held across I/O.
//!
//! Collision rule: when two servers declare the same tool name, the server
//! registered most recently owns it. The shadowed pair is recorded and
//! reported by [`ToolCatalog::collisions`]. Unregistering the owner hands the
//! name back to the next most recent server that declares it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;

use super::errors::McpError;
use super::types::McpToolDefinition;

/// Suggestions below this similarity are not offered.
const MIN_SUGGESTION_SIMILARITY: f64 = 0.3;

/// Maximum number of suggestions carried by `UnknownTool`.
const MAX_SUGGESTIONS: usize = 3;

// ─── Public Types ────────────────────────────────────────────────────────────

/// One entry of the unified catalog, in function-calling shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    /// Owning server. Not part of the function-calling contract.
    #[serde(skip)]
    pub server: String,
}

/// A tool name declared by more than one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collision {
    pub tool: String,
    /// Server whose declaration is hidden.
    pub shadowed: String,
    /// Server that currently owns the name.
    pub owner: String,
}

// ─── Table ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ServerTools {
    server: String,
    tools: Vec<McpToolDefinition>,
}

/// Immutable once published.
#[derive(Debug, Clone, Default)]
struct CatalogTable {
    /// Registration order.
    servers: Vec<ServerTools>,
    /// `tool_name → owning server`.
    routes: HashMap<String, String>,
    collisions: Vec<Collision>,
}

impl CatalogTable {
    fn rebuild_routes(&mut self) {
        let mut routes: HashMap<String, String> = HashMap::new();
        let mut collisions = Vec::new();

        for entry in &self.servers {
            for tool in &entry.tools {
                if let Some(previous) = routes.insert(tool.name.clone(), entry.server.clone()) {
                    if previous != entry.server {
                        collisions.push(Collision {
                            tool: tool.name.clone(),
                            shadowed: previous,
                            owner: entry.server.clone(),
                        });
                    }
                }
            }
        }

        // A server shadowed twice should report the final owner only.
        for collision in &mut collisions {
            if let Some(owner) = routes.get(&collision.tool) {
                collision.owner.clone_from(owner);
            }
        }
        collisions.retain(|c| c.shadowed != c.owner);

        self.routes = routes;
        self.collisions = collisions;
    }

    fn owner(&self, tool_name: &str) -> Option<&str> {
        self.routes.get(tool_name).map(String::as_str)
    }
}

// ─── ToolCatalog ─────────────────────────────────────────────────────────────

/// Aggregated tool table across all ready sessions.
#[derive(Debug, Default)]
pub struct ToolCatalog {
    table: RwLock<Arc<CatalogTable>>,
    writer: Mutex<()>,
}

impl ToolCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a server's tools, replacing any earlier registration by it.
    ///
    /// The server moves to the end of the registration order, so it wins
    /// every name it shares with other servers. A name the server declares
    /// more than once keeps only its last declaration.
    pub fn register(&self, server_name: &str, tools: Vec<McpToolDefinition>) {
        let declared = tools.len();
        let tools = dedupe_last_wins(tools);
        if tools.len() < declared {
            tracing::warn!(
                server = server_name,
                dropped = declared - tools.len(),
                "server declared duplicate tool names, keeping the last declaration"
            );
        }

        let (before, after) = self.update(|table| {
            table.servers.retain(|entry| entry.server != server_name);
            table.servers.push(ServerTools {
                server: server_name.to_string(),
                tools,
            });
        });

        for collision in after.iter().filter(|c| !before.contains(c)) {
            tracing::warn!(
                tool = %collision.tool,
                owner = %collision.owner,
                shadowed = %collision.shadowed,
                "tool name collision, most recently registered server wins"
            );
        }
        tracing::debug!(server = server_name, "registered server tools");
    }

    /// Remove every tool owned by a server.
    pub fn unregister(&self, server_name: &str) {
        self.update(|table| {
            table.servers.retain(|entry| entry.server != server_name);
        });
        tracing::debug!(server = server_name, "unregistered server tools");
    }

    /// Resolve a tool name to its owning server.
    pub fn resolve(&self, tool_name: &str) -> Result<String, McpError> {
        let table = self.current();
        match table.owner(tool_name) {
            Some(owner) => Ok(owner.to_string()),
            None => Err(McpError::UnknownTool {
                name: tool_name.to_string(),
                suggestions: find_similar(&table, tool_name, MAX_SUGGESTIONS),
            }),
        }
    }

    /// The unified catalog, ordered by server registration then tool order.
    ///
    /// Shadowed declarations are omitted. Identical for identical state.
    pub fn snapshot(&self) -> Vec<CatalogEntry> {
        let table = self.current();
        table
            .servers
            .iter()
            .flat_map(|entry| {
                let table = &table;
                entry
                    .tools
                    .iter()
                    .filter(move |tool| table.owner(&tool.name) == Some(entry.server.as_str()))
                    .map(move |tool| catalog_entry(&entry.server, tool))
            })
            .collect()
    }

    /// Serialize the catalog into OpenAI function-calling format.
    pub fn to_openai_tools(&self) -> Vec<serde_json::Value> {
        self.snapshot()
            .into_iter()
            .map(|entry| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": entry.name,
                        "description": entry.description,
                        "parameters": entry.parameters,
                    }
                })
            })
            .collect()
    }

    /// Shadowed tool names, in registration order.
    pub fn collisions(&self) -> Vec<Collision> {
        self.current().collisions.clone()
    }

    /// Number of routable tools.
    pub fn len(&self) -> usize {
        self.current().routes.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.current().routes.is_empty()
    }

    fn current(&self) -> Arc<CatalogTable> {
        Arc::clone(&self.table.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Apply a mutation to a copy of the table and publish it.
    ///
    /// Returns the collision lists before and after the update.
    fn update<F>(&self, mutate: F) -> (Vec<Collision>, Vec<Collision>)
    where
        F: FnOnce(&mut CatalogTable),
    {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.current();
        let mut next = CatalogTable::clone(&current);
        mutate(&mut next);
        next.rebuild_routes();
        let collisions = (current.collisions.clone(), next.collisions.clone());
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        collisions
    }
}

/// Keep the last declaration of each name, at that declaration's position.
fn dedupe_last_wins(tools: Vec<McpToolDefinition>) -> Vec<McpToolDefinition> {
    let mut seen = HashSet::new();
    let mut kept: Vec<McpToolDefinition> = tools
        .into_iter()
        .rev()
        .filter(|tool| seen.insert(tool.name.clone()))
        .collect();
    kept.reverse();
    kept
}

fn catalog_entry(server: &str, tool: &McpToolDefinition) -> CatalogEntry {
    let description = tool
        .description
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(String::from)
        .unwrap_or_else(|| format!("Tool from {server}"));

    let parameters = if tool.input_schema.is_object() {
        tool.input_schema.clone()
    } else {
        serde_json::json!({ "type": "object", "properties": {} })
    };

    CatalogEntry {
        name: tool.name.clone(),
        description,
        parameters,
        server: server.to_string(),
    }
}

// ─── Suggestions ─────────────────────────────────────────────────────────────

/// Up to `max_results` routable tool names most similar to `name`.
fn find_similar(table: &CatalogTable, name: &str, max_results: usize) -> Vec<String> {
    let mut scored: Vec<(&str, f64)> = table
        .routes
        .keys()
        .map(|candidate| (candidate.as_str(), similarity(name, candidate)))
        .filter(|(_, score)| *score > MIN_SUGGESTION_SIMILARITY)
        .collect();

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });
    scored.truncate(max_results);
    scored.into_iter().map(|(name, _)| name.to_string()).collect()
}

/// Levenshtein edit distance over characters.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Normalized similarity between two strings (0.0 = completely different, 1.0 = identical).
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str) -> McpToolDefinition {
        McpToolDefinition {
            name: name.to_string(),
            description: Some(format!("Does {name}")),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": { "query": { "type": "string" } }
            }),
        }
    }

    fn names(entries: &[CatalogEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn test_register_and_resolve() {
        let catalog = ToolCatalog::new();
        catalog.register("github", vec![tool("search_repositories"), tool("get_issue")]);
        catalog.register("weather", vec![tool("get_forecast")]);

        assert_eq!(catalog.resolve("get_issue").unwrap(), "github");
        assert_eq!(catalog.resolve("get_forecast").unwrap(), "weather");
        assert_eq!(catalog.len(), 3);
        assert_eq!(
            names(&catalog.snapshot()),
            vec!["search_repositories", "get_issue", "get_forecast"]
        );
    }

    #[test]
    fn test_unregister_makes_tools_unknown() {
        let catalog = ToolCatalog::new();
        catalog.register("github", vec![tool("get_issue")]);
        catalog.register("weather", vec![tool("get_forecast")]);

        catalog.unregister("github");

        let err = catalog.resolve("get_issue").unwrap_err();
        assert!(matches!(err, McpError::UnknownTool { .. }));
        assert_eq!(catalog.resolve("get_forecast").unwrap(), "weather");
    }

    #[test]
    fn test_collision_last_registered_wins_and_is_recorded() {
        let catalog = ToolCatalog::new();
        catalog.register("alpha", vec![tool("search"), tool("alpha_only")]);
        catalog.register("beta", vec![tool("search")]);

        assert_eq!(catalog.resolve("search").unwrap(), "beta");
        assert_eq!(
            catalog.collisions(),
            vec![Collision {
                tool: "search".into(),
                shadowed: "alpha".into(),
                owner: "beta".into(),
            }]
        );

        // The shadowed declaration is not in the catalog.
        let snapshot = catalog.snapshot();
        assert_eq!(names(&snapshot), vec!["alpha_only", "search"]);
        assert_eq!(snapshot[1].server, "beta");
    }

    #[test]
    fn test_unregister_owner_restores_shadowed_tool() {
        let catalog = ToolCatalog::new();
        catalog.register("alpha", vec![tool("search")]);
        catalog.register("beta", vec![tool("search")]);

        catalog.unregister("beta");

        assert_eq!(catalog.resolve("search").unwrap(), "alpha");
        assert!(catalog.collisions().is_empty());
    }

    #[test]
    fn test_reregistration_moves_server_to_end() {
        let catalog = ToolCatalog::new();
        catalog.register("alpha", vec![tool("search")]);
        catalog.register("beta", vec![tool("search")]);
        catalog.register("alpha", vec![tool("search"), tool("alpha_only")]);

        assert_eq!(catalog.resolve("search").unwrap(), "alpha");
        let servers: Vec<String> = catalog.snapshot().into_iter().map(|e| e.server).collect();
        assert_eq!(servers, vec!["alpha", "alpha"]);
        assert_eq!(
            catalog.collisions(),
            vec![Collision {
                tool: "search".into(),
                shadowed: "beta".into(),
                owner: "alpha".into(),
            }]
        );
    }

    #[test]
    fn test_snapshot_is_ordered_and_stable() {
        let catalog = ToolCatalog::new();
        catalog.register("zeta", vec![tool("z_two"), tool("z_one")]);
        catalog.register("alpha", vec![tool("a_one")]);

        let first = catalog.snapshot();
        let second = catalog.snapshot();
        assert_eq!(first, second);
        assert_eq!(names(&first), vec!["z_two", "z_one", "a_one"]);
    }

    #[test]
    fn test_unknown_tool_suggests_similar_names() {
        let catalog = ToolCatalog::new();
        catalog.register(
            "github",
            vec![tool("search_repositories"), tool("get_issue"), tool("create_issue")],
        );

        match catalog.resolve("search_repository").unwrap_err() {
            McpError::UnknownTool { name, suggestions } => {
                assert_eq!(name, "search_repository");
                assert_eq!(suggestions.first().map(String::as_str), Some("search_repositories"));
                assert!(suggestions.len() <= MAX_SUGGESTIONS);
            }
            other => panic!("expected UnknownTool, got {other:?}"),
        }

        match catalog.resolve("xyz").unwrap_err() {
            McpError::UnknownTool { suggestions, .. } => assert!(suggestions.is_empty()),
            other => panic!("expected UnknownTool, got {other:?}"),
        }
    }

    #[test]
    fn test_openai_tools_fill_missing_description_and_schema() {
        let catalog = ToolCatalog::new();
        catalog.register(
            "weather",
            vec![McpToolDefinition {
                name: "get_forecast".into(),
                description: None,
                input_schema: serde_json::Value::Null,
            }],
        );

        let tools = catalog.to_openai_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["type"], "function");
        assert_eq!(tools[0]["function"]["name"], "get_forecast");
        assert_eq!(tools[0]["function"]["description"], "Tool from weather");
        assert_eq!(tools[0]["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn test_duplicate_declarations_keep_the_last_one() {
        let catalog = ToolCatalog::new();
        let mut second = tool("dup");
        second.description = Some("Second declaration".into());
        catalog.register("s", vec![tool("dup"), tool("other"), second]);

        let snapshot = catalog.snapshot();
        assert_eq!(names(&snapshot), vec!["other", "dup"]);
        assert_eq!(snapshot.len(), catalog.len());
        assert_eq!(snapshot[1].description, "Second declaration");
        assert!(catalog.collisions().is_empty());
        assert_eq!(catalog.to_openai_tools().len(), 2);
    }

    #[test]
    fn test_readers_never_see_partial_registration() {
        let catalog = Arc::new(ToolCatalog::new());
        let batch: Vec<McpToolDefinition> = (0..50).map(|i| tool(&format!("t{i}"))).collect();

        let writer = {
            let catalog = Arc::clone(&catalog);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    catalog.register("bulk", batch.clone());
                    catalog.unregister("bulk");
                }
            })
        };

        for _ in 0..1000 {
            let len = catalog.snapshot().len();
            assert!(len == 0 || len == 50, "torn snapshot with {len} entries");
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_similarity_counts_characters() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("café", "cafe"), 1);
        assert!((similarity("", "") - 1.0).abs() < f64::EPSILON);
    }
}
