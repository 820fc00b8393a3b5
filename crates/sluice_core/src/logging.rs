//! Structured logging setup with console and file output.
//!
//! - Daily rotating log files under the data directory
//! - Build-type conditional default levels
//! - Console-only fallback when the log directory is unusable
//! - Filter override via `SLUICE_LOG` or `RUST_LOG`
//!
//! The engine itself only emits `tracing` events; the application root
//! decides whether to install this subscriber.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Environment variable with the highest-priority filter override.
pub const LOG_ENV: &str = "SLUICE_LOG";

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory for log files
    pub log_dir: PathBuf,
    /// Whether stdout is a terminal; interactive runs log to stdout only
    pub is_pty: bool,
    /// Explicit filter, overriding the environment
    pub log_filter: Option<String>,
}

impl LogConfig {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir, is_pty: atty::is(atty::Stream::Stdout), log_filter: None }
    }

    /// Set custom log filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    /// Force file logging even when attached to a terminal.
    pub fn with_file_output(mut self) -> Self {
        self.is_pty = false;
        self
    }
}

/// Keeps the non-blocking file writer alive.
///
/// Dropping this guard flushes pending log entries.
pub struct LoggingGuard {
    worker_guard: Option<WorkerGuard>,
}

impl LoggingGuard {
    /// Whether log lines are also written to a file.
    pub fn has_file_output(&self) -> bool {
        self.worker_guard.is_some()
    }
}

/// Install the global subscriber.
///
/// Falls back to console-only output if the file appender cannot be built.
/// A subscriber installed earlier (by a host application or a test harness)
/// is left in place.
pub fn init_logging(config: LogConfig) -> LoggingGuard {
    if config.is_pty {
        return init_stdout_logging(config.log_filter.as_deref());
    }

    match init_file_logging(&config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Warning: Failed to initialize file logging: {e}. Using console only.");
            init_stdout_logging(config.log_filter.as_deref())
        }
    }
}

/// Initialize with the default log directory.
pub fn init_logging_default() -> LoggingGuard {
    init_logging(LogConfig::new(log_dir()))
}

fn init_stdout_logging(filter: Option<&str>) -> LoggingGuard {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(filter))
        .with_ansi(true)
        .with_target(false)
        .with_thread_ids(false)
        .try_init();

    if installed.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
    LoggingGuard { worker_guard: None }
}

fn init_file_logging(
    config: &LogConfig,
) -> Result<LoggingGuard, Box<dyn std::error::Error + Send + Sync>> {
    std::fs::create_dir_all(&config.log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("sluice")
        .filename_suffix("log")
        .build(&config.log_dir)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let stdout = std::io::stdout.with_max_level(tracing::Level::INFO);

    tracing_subscriber::fmt()
        .with_writer(stdout.and(non_blocking))
        .with_env_filter(build_env_filter(config.log_filter.as_deref()))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()?;

    tracing::info!(log_dir = %config.log_dir.display(), "File logging enabled");
    Ok(LoggingGuard { worker_guard: Some(guard) })
}

/// Priority: explicit filter > `SLUICE_LOG` > `RUST_LOG` > build default.
fn build_env_filter(custom_filter: Option<&str>) -> EnvFilter {
    if let Some(filter) = custom_filter {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(default_log_filter()));
    }

    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(default_log_filter()))
}

/// Default filter for the build type.
///
/// Driver crates are kept at `warn`; sqlx logs every statement at `info`.
pub fn default_log_filter() -> &'static str {
    #[cfg(debug_assertions)]
    {
        "debug,sluice_core=trace,sqlx=warn,tokio_postgres=warn,russh=warn,russh_keys=warn"
    }
    #[cfg(not(debug_assertions))]
    {
        "info,sluice_core=info,sqlx=warn,tokio_postgres=warn,russh=warn,russh_keys=warn"
    }
}

/// Default log directory.
///
/// `./sluice_data/logs` in debug builds, the platform data directory otherwise.
pub fn log_dir() -> PathBuf {
    #[cfg(debug_assertions)]
    {
        PathBuf::from("./sluice_data").join("logs")
    }

    #[cfg(not(debug_assertions))]
    {
        dirs::data_dir()
            .map(|d| d.join("sluice"))
            .unwrap_or_else(|| PathBuf::from("./sluice_data"))
            .join("logs")
    }
}
