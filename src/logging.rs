//! Tracing setup: console output plus a daily rolling log file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log files kept in the log directory, newest first.
pub const MAX_LOG_FILES: usize = 10;

const LOG_PREFIX: &str = "sync";
const DEFAULT_FILTER: &str = "info,pos_offline_sync=debug";

fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Platform data directory for client logs.
pub fn default_log_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("pos-offline-sync").join("logs")
}

/// Install the global subscriber: `RUST_LOG`-driven filter, console layer and
/// a non-blocking daily file under `log_dir`. Fails if a subscriber is
/// already installed.
pub fn init(log_dir: &Path) -> Result<(), String> {
    fs::create_dir_all(log_dir).map_err(|e| format!("create log dir: {e}"))?;
    prune_old_logs(log_dir, MAX_LOG_FILES);

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter(DEFAULT_FILTER))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| format!("install tracing subscriber: {e}"))?;

    // The writer flushes on drop; the process owns it until exit.
    std::mem::forget(guard);

    info!(log_dir = %log_dir.display(), "Logging initialised (v{})", env!("CARGO_PKG_VERSION"));
    Ok(())
}

/// Console-only subscriber for the server binary, optionally emitting JSON
/// lines. `default_level` applies when `RUST_LOG` is unset.
pub fn init_server(json: bool, default_level: &str) -> Result<(), String> {
    let fallback = format!("{default_level},pos_offline_sync={default_level}");
    let registry = tracing_subscriber::registry().with(env_filter(&fallback));
    let result = if json {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    result.map_err(|e| format!("install tracing subscriber: {e}"))
}

/// Remove `sync.*` log files beyond the newest `keep`. Returns how many were
/// removed.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> usize {
    if !log_dir.exists() {
        return 0;
    }

    let mut log_files: Vec<(PathBuf, SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|name| name.starts_with("sync."))
                .unwrap_or(false);
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}
