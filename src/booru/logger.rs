//! Structured Logging
//!
//! This module provides functionality for:
//! 1. Initializing `tracing` with a daily rolling file and an optional terminal layer
//! 2. Logging searches, downloads and library scans with consistent fields
//! 3. Writing logs in JSON or line format

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self as tracing_fmt, format::FmtSpan},
    prelude::*,
    EnvFilter, Layer, Registry,
};
use uuid::Uuid;

use crate::booru::config_loader::{Logging, Paths};

pub const LOG_FILE_PREFIX: &str = "booru_downloader.log";

/// Error types for logging
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type for logging operations
pub type LoggerResult<T> = Result<T, LoggerError>;

/// Log entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEntryType {
    Search,
    Download,
    Library,
    Dataset,
    System,
}

impl fmt::Display for LogEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEntryType::Search => write!(f, "search"),
            LogEntryType::Download => write!(f, "download"),
            LogEntryType::Library => write!(f, "library"),
            LogEntryType::Dataset => write!(f, "dataset"),
            LogEntryType::System => write!(f, "system"),
        }
    }
}

/// Status of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Started,
    Completed,
    Failed,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::Started => write!(f, "started"),
            OperationStatus::Completed => write!(f, "completed"),
            OperationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Keeps the non-blocking file writer alive. Logs written after this is
/// dropped may be lost.
pub struct Logger {
    log_dir: PathBuf,
    _guard: Option<WorkerGuard>,
}

impl Logger {
    /// Installs the global subscriber.
    pub fn new(logging: &Logging, paths: &Paths) -> LoggerResult<Self> {
        let log_dir = PathBuf::from(&paths.log_directory);
        if logging.log_to_file && !log_dir.exists() {
            std::fs::create_dir_all(&log_dir)?;
        }

        let guard = Self::init_logger(&log_dir, logging)?;
        Ok(Self {
            log_dir,
            _guard: guard,
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    fn init_logger(log_dir: &Path, logging: &Logging) -> LoggerResult<Option<WorkerGuard>> {
        // RUST_LOG wins over the configured level
        let filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(&logging.log_level)?,
        };
        let json = logging.log_format.eq_ignore_ascii_case("json");

        let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
        let mut guard = None;

        if logging.log_to_file {
            let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_PREFIX);
            let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
            guard = Some(file_guard);

            let layer = tracing_fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_span_events(FmtSpan::CLOSE);
            layers.push(if json { layer.json().boxed() } else { layer.boxed() });
        }

        if logging.log_to_terminal {
            let layer = tracing_fmt::layer().with_writer(std::io::stderr);
            layers.push(if json { layer.json().boxed() } else { layer.boxed() });
        }

        tracing_subscriber::registry()
            .with(layers)
            .with(filter)
            .try_init()
            .map_err(|e| LoggerError::Logging(e.to_string()))?;

        info!(
            log_format = %logging.log_format,
            log_level = %logging.log_level,
            message = "Logger initialized",
        );

        Ok(guard)
    }
}

/// Log a search against a source
pub fn log_search(source: &str, page: u32, query: &str, status: OperationStatus, results: Option<usize>) {
    info!(
        entry_type = %LogEntryType::Search,
        source = source,
        page = page,
        query = query,
        status = %status,
        results = results,
        message = format!("Search {} on {}", status, source),
    );
}

/// Log a download group transition
pub fn log_download(group_id: Uuid, source: Option<&str>, status: OperationStatus, entries: usize) {
    info!(
        entry_type = %LogEntryType::Download,
        group_id = %group_id,
        source = source,
        status = %status,
        entries = entries,
        message = format!("Download group {} {}", group_id, status),
    );
}

/// Log a library scan
pub fn log_library_scan(directory: &Path, status: OperationStatus, posts: Option<usize>) {
    info!(
        entry_type = %LogEntryType::Library,
        directory = %directory.display(),
        status = %status,
        posts = posts,
        message = format!("Library scan {}", status),
    );
}

/// Log a dataset export
pub fn log_dataset_export(directory: &Path, status: OperationStatus, exported: Option<usize>, failed: Option<usize>) {
    info!(
        entry_type = %LogEntryType::Dataset,
        directory = %directory.display(),
        status = %status,
        exported = exported,
        failed = failed,
        message = format!("Dataset export {}", status),
    );
}

/// Log a system event
pub fn log_system_event(event_type: &str, details: &str) {
    info!(
        entry_type = %LogEntryType::System,
        event_type = event_type,
        details = details,
        message = format!("System event: {}", event_type),
    );
}

/// Log an error
pub fn log_error(error_type: &str, message: &str, details: Option<&str>) {
    error!(
        entry_type = "error",
        error_type = error_type,
        details = details,
        message = format!("Error: {}", message),
    );
}

/// Initializes logging for the lifetime of the returned [`Logger`].
pub fn init_logger(logging: &Logging, paths: &Paths) -> LoggerResult<Logger> {
    Logger::new(logging, paths)
}
