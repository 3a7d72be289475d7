//! Logging setup for processes embedding the sync engines.
//!
//! Output goes to the console, to a `run.log` file in a log directory, or both.
//! The file from the previous run is archived on startup and old archives are pruned.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{LoggingError, LoggingResult};

const ARCHIVE_PREFIX: &str = "spv-sync.";
const ARCHIVE_SUFFIX: &str = ".log";
const ACTIVE_LOG_NAME: &str = "run.log";
const ARCHIVE_TIME_FORMAT: &str = "%Y-%m-%d.%H%M%S";

/// Keeps the background log writer alive. Dropping it flushes buffered entries.
#[derive(Debug)]
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

/// Configuration for logging output.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level filter. If None, `RUST_LOG` is consulted, then INFO.
    pub level: Option<LevelFilter>,
    /// Whether to output logs to stderr.
    pub console: bool,
    /// Optional file output.
    pub file: Option<LogFileConfig>,
}

impl LoggingConfig {
    /// Console output at the given level, no file.
    pub fn console_only(level: LevelFilter) -> Self {
        Self {
            level: Some(level),
            console: true,
            file: None,
        }
    }
}

/// Configuration for log file output.
#[derive(Debug, Clone)]
pub struct LogFileConfig {
    /// Directory holding `run.log` and its archives.
    pub log_dir: PathBuf,
    /// Number of archived files to retain.
    pub max_files: usize,
}

impl LogFileConfig {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            max_files: 10,
        }
    }
}

/// Initialize console-only logging with the given level.
pub fn init_console_logging(level: LevelFilter) -> LoggingResult<LoggingGuard> {
    init_logging(LoggingConfig::console_only(level))
}

/// Install the global tracing subscriber described by `config`.
///
/// With neither console nor file output enabled this is a no-op and tracing macros
/// discard everything.
///
/// # Errors
///
/// Fails if the log directory cannot be prepared or a global subscriber is already set.
pub fn init_logging(config: LoggingConfig) -> LoggingResult<LoggingGuard> {
    if !config.console && config.file.is_none() {
        return Ok(LoggingGuard {
            _worker_guard: None,
        });
    }

    let env_filter = match config.level {
        Some(level) => EnvFilter::new(level.to_string()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(LevelFilter::INFO.to_string())),
    };

    let (file_layer, worker_guard) = match config.file {
        Some(ref file_config) => {
            let (writer, guard) = open_log_writer(file_config)?;
            let layer = fmt::layer().with_target(true).with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let console_layer = config.console.then(|| fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| LoggingError::SubscriberInit(e.to_string()))?;

    Ok(LoggingGuard {
        _worker_guard: worker_guard,
    })
}

fn open_log_writer(config: &LogFileConfig) -> LoggingResult<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(&config.log_dir)?;
    archive_active_log(&config.log_dir)?;
    prune_archives(&config.log_dir, config.max_files)?;

    let file = File::create(config.log_dir.join(ACTIVE_LOG_NAME))?;
    Ok(tracing_appender::non_blocking(file))
}

/// Rename an existing `run.log` to `spv-sync.<mtime>.log`.
fn archive_active_log(log_dir: &Path) -> LoggingResult<()> {
    let active = log_dir.join(ACTIVE_LOG_NAME);
    if !active.exists() {
        return Ok(());
    }

    let stamp = modified_time(&active).unwrap_or_else(Local::now).format(ARCHIVE_TIME_FORMAT);
    let base = format!("{ARCHIVE_PREFIX}{stamp}");

    let target = std::iter::once(format!("{base}{ARCHIVE_SUFFIX}"))
        .chain((1..=999).map(|i| format!("{base}-{i}{ARCHIVE_SUFFIX}")))
        .map(|name| log_dir.join(name))
        .find(|path| !path.exists())
        .ok_or_else(|| LoggingError::RotationFailed(format!("no free archive name for {base}")))?;

    fs::rename(&active, &target).map_err(|e| LoggingError::RotationFailed(e.to_string()))
}

fn modified_time(path: &Path) -> Option<DateTime<Local>> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::from(modified))
}

fn is_archive(name: &str) -> bool {
    name.starts_with(ARCHIVE_PREFIX) && name.ends_with(ARCHIVE_SUFFIX)
}

/// Remove the oldest archives until at most `max_files` remain.
fn prune_archives(log_dir: &Path, max_files: usize) -> LoggingResult<()> {
    let mut archives: Vec<_> = fs::read_dir(log_dir)
        .map_err(|e| LoggingError::RotationFailed(format!("failed to read log dir: {e}")))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_str().map(is_archive).unwrap_or(false))
        .map(|entry| {
            let modified = entry.metadata().and_then(|m| m.modified()).ok();
            (modified, entry.path())
        })
        .collect();

    if archives.len() <= max_files {
        return Ok(());
    }

    archives.sort();
    let excess = archives.len() - max_files;
    for (_, path) in archives.into_iter().take(excess) {
        if let Err(e) = fs::remove_file(&path) {
            tracing::warn!("Failed to remove old log file {:?}: {}", path, e);
        }
    }

    Ok(())
}
