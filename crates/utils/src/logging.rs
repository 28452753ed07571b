//! provides logging helpers

use std::path::Path;
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::InitError;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Overrides the directory the rotating log files are written to.
pub const LOG_DIR_ENV_VAR: &str = "CSE_LOG_DIR";

/// Target used for HTTP request/response wire logging.
pub const WIRE_TARGET: &str = "cse::wire";

const DEFAULT_LOG_DIR: &str = "cse-logs";
const MAX_LOG_FILES: usize = 7;

/// Keeps the non-blocking file writers alive. Dropping it flushes the logs.
pub struct LogGuards {
    _main: WorkerGuard,
    _wire: WorkerGuard,
}

/// Resolves the log directory: explicit argument, then env var, then default.
pub fn log_dir(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(LOG_DIR_ENV_VAR).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR))
}

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

fn rolling_appender(dir: &Path, prefix: &str) -> Result<RollingFileAppender, InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(MAX_LOG_FILES)
        .build(dir)
}

/// initiate the global tracing subscriber
///
/// Console output goes to stderr, everything at DEBUG and above goes to a
/// daily rotating `{file_prefix}` file, and `cse::wire` events go to their
/// own `{file_prefix}-wire` file.
pub fn init(log_dir: &Path, file_prefix: &str) -> Result<LogGuards, InitError> {
    let not_wire = || filter::filter_fn(|metadata| metadata.target() != WIRE_TARGET);

    let console_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(env_filter().and(not_wire()));

    let (main_writer, main_guard) =
        tracing_appender::non_blocking(rolling_appender(log_dir, file_prefix)?);
    let main_layer = layer()
        .with_writer(main_writer)
        .with_ansi(false)
        .with_filter(filter::LevelFilter::DEBUG.and(not_wire()));

    let (wire_writer, wire_guard) = tracing_appender::non_blocking(rolling_appender(
        log_dir,
        &format!("{file_prefix}-wire"),
    )?);
    let wire_layer = layer()
        .with_writer(wire_writer)
        .with_ansi(false)
        .with_filter(filter::filter_fn(|metadata| {
            metadata.target() == WIRE_TARGET
        }));

    registry()
        .with(console_layer)
        .with(main_layer)
        .with(wire_layer)
        .init();

    Ok(LogGuards {
        _main: main_guard,
        _wire: wire_guard,
    })
}

/// Stderr-only subscriber, for commands that must not touch the file system.
pub fn init_stderr() {
    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    registry().with(fmt_layer).init();
}
