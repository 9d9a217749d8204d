//! Structured logging.
//!
//! # Responsibilities
//! - Build the subscriber from `LogConfig`
//! - Console output (compact or JSON) and optional JSON file output
//! - Rotate the log file by size, keep a bounded set of (gzipped) backups
//! - Log level from config, overridable by `RUST_LOG`
//!
//! # Design Decisions
//! - Backups older than `max_age_days` are pruned when the sink is built;
//!   every upgrade starts a new process, so pruning runs at each handoff
//! - Rotated files are stamped in local time

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use file_rotate::compression::Compression;
use file_rotate::suffix::{AppendTimestamp, FileLimit};
use file_rotate::{ContentLimit, FileRotate};
use thiserror::Error;
use tracing::Dispatch;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer};

use crate::config::LogConfig;

const BYTES_PER_MB: u64 = 1024 * 1024;
const SECS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{directive}': {source}")]
    Filter {
        directive: String,
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("cannot open log file {path}: {source}")]
    File {
        path: String,
        source: std::io::Error,
    },

    #[error("a global logger is already installed")]
    AlreadyInstalled,
}

/// Build a dispatcher for the given configuration without installing it.
pub fn build_dispatch(config: &LogConfig) -> Result<Dispatch, LoggingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|source| LoggingError::Filter {
            directive: config.level.clone(),
            source,
        })?,
    };

    let file_layer = match &config.file {
        Some(path) => {
            let file = open_log_file(Path::new(path), config).map_err(|source| {
                LoggingError::File {
                    path: path.clone(),
                    source,
                }
            })?;
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    let console_layer = config.console.then(|| {
        if config.json {
            tracing_subscriber::fmt::layer().json().boxed()
        } else {
            tracing_subscriber::fmt::layer().compact().boxed()
        }
    });

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer);

    Ok(Dispatch::new(subscriber))
}

/// Install the dispatcher as the process-wide default. Called once by the binary.
pub fn install(dispatch: Dispatch) -> Result<(), LoggingError> {
    tracing::dispatcher::set_global_default(dispatch).map_err(|_| LoggingError::AlreadyInstalled)
}

fn open_log_file(path: &Path, config: &LogConfig) -> io::Result<FileRotate<AppendTimestamp>> {
    let limit = usize::try_from(config.max_size_mb.saturating_mul(BYTES_PER_MB)).unwrap_or(usize::MAX);
    rotating_file(path, limit, config)
}

fn rotating_file(
    path: &Path,
    limit_bytes: usize,
    config: &LogConfig,
) -> io::Result<FileRotate<AppendTimestamp>> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    if config.max_age_days > 0 {
        prune_expired(path, Duration::from_secs(config.max_age_days.saturating_mul(SECS_PER_DAY)))?;
    }

    let backups = match config.max_backups {
        0 => FileLimit::Unlimited,
        n => FileLimit::MaxFiles(n),
    };
    let compression = if config.compress {
        Compression::OnRotate(0)
    } else {
        Compression::None
    };

    Ok(FileRotate::new(
        path,
        AppendTimestamp::default(backups),
        ContentLimit::Bytes(limit_bytes.max(1)),
        compression,
        None,
    ))
}

/// Remove rotated siblings of `path` last written more than `max_age` ago.
/// Returns how many were removed.
fn prune_expired(path: &Path, max_age: Duration) -> io::Result<usize> {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(0);
    };
    let prefix = format!("{name}.");
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with(&prefix) {
            continue;
        }
        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age > max_age);
        if expired && fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
