//! Logging setup for sortie.
//!
//! Log levels:
//! - ERROR: failures that abort an operation iteration
//! - WARN: recoverable conditions (rejected heartbeats, stale results, timeouts)
//! - INFO: operation lifecycle and agent enrollment
//! - DEBUG: decision loop and dispatch traces
//! - TRACE: per-heartbeat detail
//!
//! Debug mode can be enabled with the `--debug` flag or `SORTIE_DEBUG=1`.
//! `SORTIE_LOG` takes an `EnvFilter` directive and overrides both.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

const FILTER_ENV: &str = "SORTIE_LOG";
const DEBUG_ENV: &str = "SORTIE_DEBUG";

/// Initialize logging to ~/.sortie/sortie.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
pub fn init_with_debug(debug: bool) {
    let filter = build_filter(debug || env_debug());

    match log_file() {
        Some(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
}

/// Path of the log file, if a home directory exists.
pub fn log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".sortie").join("sortie.log"))
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "sortie=debug"
    } else {
        "sortie=info"
    }
}

fn build_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new(default_directive(debug)))
}

// Truncated on startup.
fn log_file() -> Option<File> {
    let path = log_path()?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).ok()?;
    }
    File::create(path).ok()
}
