//! Server configuration loading.
//!
//! Reads the ordered server list from JSON or YAML and resolves `${VAR}` /
//! `${VAR:-default}` references against the process environment. Server order
//! in the file is the registration order used for catalog ordering.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::errors::McpError;

// ─── Public Types ────────────────────────────────────────────────────────────

/// Static description of one tool server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescriptor {
    pub name: String,
    pub display_name: String,
    pub icon: Option<String>,
    pub enabled: bool,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl ServerDescriptor {
    /// Minimal enabled descriptor, mostly useful for tests and embedding.
    pub fn new(name: &str, command: &str, args: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            display_name: name.to_string(),
            icon: None,
            enabled: true,
            command: command.to_string(),
            args,
            env: HashMap::new(),
            cwd: None,
        }
    }
}

/// Timeouts and restart policy shared by every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewaySettings {
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub max_restart_attempts: u32,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(default_handshake_timeout_secs()),
            call_timeout: Duration::from_secs(default_call_timeout_secs()),
            shutdown_timeout: Duration::from_secs(default_shutdown_timeout_secs()),
            max_restart_attempts: default_max_restart_attempts(),
        }
    }
}

/// Loaded configuration: every server (enabled or not) plus settings.
#[derive(Debug, Clone, Default)]
pub struct McpServersConfig {
    pub servers: Vec<ServerDescriptor>,
    pub settings: GatewaySettings,
}

impl McpServersConfig {
    /// Servers that should be handed to `connect_all`.
    pub fn enabled_servers(&self) -> Vec<ServerDescriptor> {
        self.servers.iter().filter(|s| s.enabled).cloned().collect()
    }

    /// Every configured server, disabled ones included (for display).
    pub fn all_servers(&self) -> &[ServerDescriptor] {
        &self.servers
    }
}

// ─── Raw File Format ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    servers: Vec<RawServer>,
    #[serde(default)]
    settings: RawSettings,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    name: String,
    #[serde(default, alias = "displayName")]
    display_name: Option<String>,
    #[serde(default)]
    icon: Option<String>,
    #[serde(default)]
    enabled: Option<EnabledFlag>,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    cwd: Option<String>,
}

/// `enabled` may be a literal bool or an env-var reference string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EnabledFlag {
    Bool(bool),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default = "default_handshake_timeout_secs")]
    handshake_timeout_secs: u64,
    #[serde(default = "default_call_timeout_secs")]
    call_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    shutdown_timeout_secs: u64,
    #[serde(default = "default_max_restart_attempts")]
    max_restart_attempts: u32,
}

impl Default for RawSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            max_restart_attempts: default_max_restart_attempts(),
        }
    }
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

fn default_max_restart_attempts() -> u32 {
    3
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load and validate a server configuration file.
///
/// `.yaml`/`.yml` files are parsed as YAML, everything else as JSON.
pub fn load_config(path: &Path) -> Result<McpServersConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    );

    let parsed: RawConfig = if is_yaml {
        serde_yaml::from_str(&raw).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    } else {
        serde_json::from_str(&raw).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    };

    let config = resolve_config(parsed)?;
    tracing::info!(
        path = %path.display(),
        servers = config.servers.len(),
        enabled = config.servers.iter().filter(|s| s.enabled).count(),
        "loaded MCP server config"
    );
    Ok(config)
}

fn resolve_config(raw: RawConfig) -> Result<McpServersConfig, McpError> {
    let mut seen = HashSet::new();
    let mut servers = Vec::with_capacity(raw.servers.len());

    for server in raw.servers {
        let name = server.name.trim().to_string();
        if name.is_empty() {
            return Err(McpError::ConfigError {
                reason: "server entry with empty name".into(),
            });
        }
        if !seen.insert(name.clone()) {
            return Err(McpError::ConfigError {
                reason: format!("duplicate server name '{name}'"),
            });
        }

        let command = interpolate_env_vars(&server.command);
        if command.trim().is_empty() {
            return Err(McpError::ConfigError {
                reason: format!("server '{name}' has an empty command"),
            });
        }

        let enabled = match server.enabled {
            None => true,
            Some(EnabledFlag::Bool(flag)) => flag,
            Some(EnabledFlag::Text(text)) => resolve_enabled(&text),
        };

        servers.push(ServerDescriptor {
            display_name: server.display_name.unwrap_or_else(|| name.clone()),
            name,
            icon: server.icon,
            enabled,
            command,
            args: server.args.iter().map(|a| interpolate_env_vars(a)).collect(),
            env: server
                .env
                .iter()
                .map(|(k, v)| (k.clone(), interpolate_env_vars(v)))
                .collect(),
            cwd: server.cwd.map(|c| PathBuf::from(interpolate_env_vars(&c))),
        });
    }

    Ok(McpServersConfig {
        servers,
        settings: GatewaySettings {
            handshake_timeout: Duration::from_secs(raw.settings.handshake_timeout_secs),
            call_timeout: Duration::from_secs(raw.settings.call_timeout_secs),
            shutdown_timeout: Duration::from_secs(raw.settings.shutdown_timeout_secs),
            max_restart_attempts: raw.settings.max_restart_attempts,
        },
    })
}

/// Resolve an `enabled` string: env references default to `true` when unset.
fn resolve_enabled(text: &str) -> bool {
    let value = match text.strip_prefix("${").and_then(|t| t.strip_suffix('}')) {
        Some(expr) if !expr.contains(":-") => {
            std::env::var(expr).unwrap_or_else(|_| "true".to_string())
        }
        _ => interpolate_env_vars(text),
    };
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes")
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
pub(crate) fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                var_expr.push(c);
            }
            if closed {
                result.push_str(&resolve_var_expr(&var_expr));
            } else {
                // Unterminated reference is kept literally.
                result.push_str("${");
                result.push_str(&var_expr);
            }
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => std::env::var(var_name).unwrap_or_else(|_| default.to_string()),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, file: &str, body: &str) -> PathBuf {
        let path = dir.path().join(file);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_load_json_preserves_order_and_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = write(
            &tmp,
            "mcp_config.json",
            r#"{
                "servers": [
                    {"name": "github", "display_name": "GitHub", "command": "npx",
                     "args": ["-y", "@modelcontextprotocol/server-github"]},
                    {"name": "brave-search", "command": "npx", "enabled": false}
                ]
            }"#,
        );

        let config = load_config(&path).unwrap();
        let names: Vec<&str> = config.servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["github", "brave-search"]);
        assert_eq!(config.servers[0].display_name, "GitHub");
        assert_eq!(config.servers[1].display_name, "brave-search");
        assert_eq!(config.enabled_servers().len(), 1);
        assert_eq!(config.all_servers().len(), 2);
        assert_eq!(config.settings, GatewaySettings::default());
    }

    #[test]
    fn test_load_yaml_with_settings() {
        let tmp = TempDir::new().unwrap();
        let path = write(
            &tmp,
            "servers.yaml",
            "servers:\n  - name: files\n    command: mcp-files\nsettings:\n  handshake_timeout_secs: 2\n  call_timeout_secs: 7\n",
        );

        let config = load_config(&path).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.settings.handshake_timeout, Duration::from_secs(2));
        assert_eq!(config.settings.call_timeout, Duration::from_secs(7));
        assert_eq!(config.settings.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_env_expansion_in_args_and_env() {
        std::env::set_var("WISPR_TEST_TOKEN", "secret");
        std::env::remove_var("WISPR_TEST_MISSING");
        let tmp = TempDir::new().unwrap();
        let path = write(
            &tmp,
            "mcp_config.json",
            r#"{"servers": [{"name": "gh", "command": "npx",
                "args": ["${WISPR_TEST_TOKEN}", "${WISPR_TEST_MISSING:-fallback}"],
                "env": {"GITHUB_TOKEN": "${WISPR_TEST_TOKEN}", "EMPTY": "${WISPR_TEST_MISSING}"}}]}"#,
        );

        let config = load_config(&path).unwrap();
        let server = &config.servers[0];
        assert_eq!(server.args, vec!["secret", "fallback"]);
        assert_eq!(server.env["GITHUB_TOKEN"], "secret");
        assert_eq!(server.env["EMPTY"], "");
    }

    #[test]
    fn test_enabled_from_env() {
        std::env::set_var("WISPR_TEST_ENABLED_OFF", "false");
        std::env::set_var("WISPR_TEST_ENABLED_YES", "Yes");
        std::env::remove_var("WISPR_TEST_ENABLED_UNSET");

        assert!(!resolve_enabled("${WISPR_TEST_ENABLED_OFF}"));
        assert!(resolve_enabled("${WISPR_TEST_ENABLED_YES}"));
        assert!(resolve_enabled("${WISPR_TEST_ENABLED_UNSET}"));
        assert!(!resolve_enabled("${WISPR_TEST_ENABLED_UNSET:-0}"));
        assert!(resolve_enabled("1"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = write(
            &tmp,
            "mcp_config.json",
            r#"{"servers": [{"name": "a", "command": "x"}, {"name": "a", "command": "y"}]}"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_empty_command_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = write(&tmp, "c.json", r#"{"servers": [{"name": "a", "command": " "}]}"#);
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = load_config(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
    }

    #[test]
    fn test_interpolate_keeps_unterminated_reference() {
        assert_eq!(interpolate_env_vars("abc ${OOPS"), "abc ${OOPS");
        assert_eq!(interpolate_env_vars("no vars"), "no vars");
    }
}
