pub mod data_binding;
pub mod mcp_client;

use std::path::{Path, PathBuf};

pub use data_binding::{bind, bind_failure, bind_tool_result, DisplayNode};
pub use mcp_client::{Gateway, McpError};

/// Log file name used when no explicit path is given.
const LOG_FILE_NAME: &str = "gateway.log";

/// Rotated log files kept next to the active one.
const LOG_FILES_KEPT: u32 = 3;

/// Return the platform-standard data directory for the gateway.
///
/// - macOS: `~/Library/Application Support/wispr-gateway/`
/// - Windows: `{FOLDERID_RoamingAppData}\wispr-gateway\`
/// - Linux: `$XDG_DATA_HOME/wispr-gateway/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.wispr-gateway/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("wispr-gateway");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".wispr-gateway")
}

/// Where log output goes. Stdout is never used; it belongs to command output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    /// `gateway.log` in [`data_dir`].
    DataDir,
    File(PathBuf),
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` overrides the default filter. File targets are rotated on each
/// start (keeps the last 3) and written through a line-flushing writer.
pub fn init_tracing(target: &LogTarget, json: bool) -> std::io::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("wispr_gateway=info,warn"));

    let log_path = match target {
        LogTarget::Stderr => None,
        LogTarget::DataDir => Some(data_dir().join(LOG_FILE_NAME)),
        LogTarget::File(path) => Some(path.clone()),
    };

    let result = match &log_path {
        None => {
            let builder = fmt::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true);
            if json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            rotate_log_file(path, LOG_FILES_KEPT);

            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;

            let builder = fmt::fmt()
                .with_env_filter(filter)
                .with_writer(FlushingWriter::new(log_file))
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(false);
            if json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
    };
    result.map_err(|e| std::io::Error::other(format!("failed to install subscriber: {e}")))?;

    let destination = log_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "stderr".to_string());
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %destination,
        pid = std::process::id(),
        "=== wispr-gateway starting ==="
    );
    Ok(())
}

/// Rotate log files: `gateway.log` → `gateway.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Log lines reach the disk immediately, so a crash does not lose the tail.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
