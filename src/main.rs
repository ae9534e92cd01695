//! Entry point for the wispr-gateway CLI.
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use wispr_gateway::mcp_client::{load_config, Gateway, McpServersConfig};
use wispr_gateway::{bind_failure, bind_tool_result, init_tracing, LogTarget};

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Unified gateway over stdio MCP tool servers",
    long_about = None
)]
struct Cli {
    /// Server configuration file (JSON or YAML).
    #[arg(long, env = "WISPR_MCP_CONFIG", default_value = "mcp_config.json")]
    config: PathBuf,
    /// Write logs to a file instead of stderr (data directory when no path is given).
    #[arg(long, num_args = 0..=1)]
    log_file: Option<Option<PathBuf>>,
    /// Emit logs as JSON.
    #[arg(long, default_value_t = false)]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List configured servers without connecting.
    Servers,
    /// Connect all enabled servers and print the unified tool catalog.
    Tools,
    /// Connect all enabled servers and print per-server status.
    Status,
    /// Execute one tool and print its display tree.
    Call(CallArgs),
}

/// Arguments for `call`.
#[derive(Debug, Args)]
struct CallArgs {
    /// Tool name as listed by `tools`.
    tool: String,
    /// Tool arguments as a JSON object.
    #[arg(long, default_value = "{}")]
    args: String,
}

#[derive(Serialize)]
struct ServerListing<'a> {
    name: &'a str,
    display_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<&'a str>,
    enabled: bool,
    command: &'a str,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    let target = match &cli.log_file {
        None => LogTarget::Stderr,
        Some(None) => LogTarget::DataDir,
        Some(Some(path)) => LogTarget::File(path.clone()),
    };
    init_tracing(&target, cli.log_json).context("failed to initialize logging")?;

    let config = load_config(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match cli.command {
        Command::Servers => {
            print_servers(&config)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Tools => {
            let gateway = connect(&config).await;
            let printed = print_json(&gateway.catalog());
            gateway.shutdown().await;
            printed.map(|_| ExitCode::SUCCESS)
        }
        Command::Status => {
            let gateway = connect(&config).await;
            let printed = print_json(&gateway.status());
            gateway.shutdown().await;
            printed.map(|_| ExitCode::SUCCESS)
        }
        Command::Call(call) => {
            let arguments: serde_json::Value = serde_json::from_str(&call.args)
                .with_context(|| format!("--args is not valid JSON: {}", call.args))?;

            let gateway = connect(&config).await;
            let outcome = gateway.execute(&call.tool, arguments).await;
            gateway.shutdown().await;

            match outcome {
                Ok(raw) => {
                    print_json(&bind_tool_result(&raw))?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => {
                    print_json(&bind_failure(&err.to_failure(&call.tool)))?;
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

async fn connect(config: &McpServersConfig) -> Gateway {
    let gateway = Gateway::from_config(config);
    for outcome in gateway.connect_all(config).await {
        if let Err(err) = outcome.result {
            tracing::warn!(server = %outcome.name, kind = err.kind(), error = %err, "server unavailable");
        }
    }
    gateway
}

fn print_servers(config: &McpServersConfig) -> Result<()> {
    let listing: Vec<ServerListing<'_>> = config
        .all_servers()
        .iter()
        .map(|server| ServerListing {
            name: &server.name,
            display_name: &server.display_name,
            icon: server.icon.as_deref(),
            enabled: server.enabled,
            command: &server.command,
        })
        .collect();
    print_json(&listing)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{text}");
    Ok(())
}
