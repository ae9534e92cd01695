//! Scripted stdio servers for subprocess tests.
//!
//! Each mock is a POSIX `sh` script speaking newline-delimited JSON-RPC.
//! Tool behaviour is keyed by name: `crash` exits, `slow_*` answers after 2s,
//! `fail` returns `isError`, `boom` returns a JSON-RPC error, `repos` returns a
//! repository search payload, anything else echoes `called <tool>`.

use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;

use super::config::{GatewaySettings, ServerDescriptor};

const MOCK_SERVER: &str = r#"#!/bin/sh
TOOLS='@TOOLS@'
REPOS='{\"items\":[{\"name\":\"react\",\"description\":\"A JS library\",\"html_url\":\"https://github.com/facebook/react\",\"stargazers_count\":220000,\"id\":12345}]}'
echo "@NAME@ mock ready" >&2
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9][0-9]*\),.*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"@NAME@","version":"1.0.0"}}}\n' "$id"
      ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":%s}}\n' "$id" "$TOOLS"
      ;;
    *'"method":"tools/call"'*)
      tool=$(printf '%s\n' "$line" | sed -n 's/.*"params":{"name":"\([^"]*\)".*/\1/p')
      case "$tool" in
        crash)
          exit 3
          ;;
        slow_*)
          ( sleep 2; printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"called %s"}],"isError":false}}\n' "$id" "$tool" ) &
          ;;
        fail)
          printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"rate limit exceeded"}],"isError":true}}\n' "$id"
          ;;
        boom)
          printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32602,"message":"invalid arguments"}}\n' "$id"
          ;;
        repos)
          printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"%s"}],"isError":false}}\n' "$id" "$REPOS"
          ;;
        *)
          printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"called %s"}],"isError":false}}\n' "$id" "$tool"
          ;;
      esac
      ;;
  esac
done
"#;

const HANGING_SERVER: &str = r#"#!/bin/sh
echo "waiting for a license key" >&2
while IFS= read -r line; do :; done
"#;

/// Short timeouts so failure paths finish quickly.
pub(crate) fn fast_settings() -> GatewaySettings {
    GatewaySettings {
        handshake_timeout: Duration::from_millis(1500),
        call_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(1),
        max_restart_attempts: 1,
    }
}

/// A well-behaved server declaring `tools`.
pub(crate) fn mock_server(dir: &TempDir, name: &str, tools: &[&str]) -> ServerDescriptor {
    let tools_json = serde_json::Value::Array(
        tools
            .iter()
            .map(|tool| {
                serde_json::json!({
                    "name": tool,
                    "description": format!("Mock tool {tool}"),
                    "inputSchema": { "type": "object", "properties": {} },
                })
            })
            .collect(),
    )
    .to_string();

    let script = MOCK_SERVER
        .replace("@TOOLS@", &tools_json)
        .replace("@NAME@", name);
    script_descriptor(dir, name, &script)
}

/// A server that reads requests and never answers.
pub(crate) fn hanging_server(dir: &TempDir, name: &str) -> ServerDescriptor {
    script_descriptor(dir, name, HANGING_SERVER)
}

/// A descriptor whose command does not exist.
pub(crate) fn missing_binary(name: &str) -> ServerDescriptor {
    ServerDescriptor::new(name, "/nonexistent/wispr-mock-server", vec![])
}

fn script_descriptor(dir: &TempDir, name: &str, script: &str) -> ServerDescriptor {
    let path: PathBuf = dir.path().join(format!("{name}.sh"));
    std::fs::write(&path, script).expect("write mock server script");
    ServerDescriptor::new(name, "sh", vec![path.to_string_lossy().into_owned()])
}
