//! Generic logger utility functions

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External imports
use colored::{ColoredString, Colorize};
use log::{self, info};
use thiserror::Error;

// Internal imports
use crate::session;

// Re-exports
pub use log::LevelFilter;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Targets which are always capped at `Info`.
const CAPPED_TARGETS: [&str; 1] = ["zmq"];

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Errors associated with initialising the logger.
#[derive(Debug, Error)]
pub enum LoggerInitError {
    #[error("Expected a log level of at least `INFO`, found `{0}`")]
    InvalidMinLogLevel(log::LevelFilter),

    #[error("Error initialising the log file: {0}")]
    LogFileInitError(std::io::Error),

    #[error("An error occured while setting up the logger: {0}")]
    FernInitError(log::SetLoggerError)
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Initialise the logger for this execution.
///
/// # Notes
///
/// - `min_level` must be at least `log::Level::Info`.
/// - Traffic from the zmq crate is capped at `Info` regardless of `min_level`.
///
/// # Safety
///
/// - This function must only be called once to prevent corrupting logs.
pub fn logger_init(
    min_level: LevelFilter,
    session: &session::Session
) -> Result<(), LoggerInitError> {
    logger_init_with(min_level, &[], session)
}

/// Initialise the logger with per-target levels.
///
/// Each `(target, level)` pair sets the level of a module path prefix, for example
/// `("platoon_lib::control_law", LevelFilter::Debug)` keeps the per-tick traces of the control laws
/// out of a trace level log.
pub fn logger_init_with(
    min_level: LevelFilter,
    targets: &[(&str, LevelFilter)],
    session: &session::Session
) -> Result<(), LoggerInitError> {

    if min_level < log::Level::Info {
        return Err(LoggerInitError::InvalidMinLogLevel(min_level))
    }

    let log_file = fern::log_file(session.log_file_path.clone())
        .map_err(LoggerInitError::LogFileInitError)?;

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}",
                format_line(
                    session::get_elapsed_seconds(),
                    record.level(),
                    record.target(),
                    message
                )
            ))
        })
        .level(min_level);

    for target in CAPPED_TARGETS.iter() {
        dispatch = dispatch.level_for(*target, LevelFilter::Info);
    }
    for (target, level) in targets {
        dispatch = dispatch.level_for(target.to_string(), *level);
    }

    dispatch
        .chain(std::io::stdout())
        .chain(log_file)
        .apply()
        .map_err(LoggerInitError::FernInitError)?;

    info!("Logging initialised");
    if let Ok(epoch) = session::get_epoch() {
        info!("    Session epoch: {}", epoch);
    }
    info!("    Log level: {:?}", min_level);
    for (target, level) in targets {
        info!("    Log level of {}: {:?}", target, level);
    }
    info!("    Log file path: {:?}", session.log_file_path);

    Ok(())
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

/// Format one log line.
///
/// The target is only included on debug and trace lines, where it identifies the emitting
/// component.
fn format_line(
    elapsed_s: f64,
    level: log::Level,
    target: &str,
    message: &std::fmt::Arguments
) -> String {
    if level > log::Level::Info {
        format!("[{:10.6} {}] {}: {}", elapsed_s, level_to_str(level), target, message)
    }
    else {
        format!("[{:10.6} {}] {}", elapsed_s, level_to_str(level), message)
    }
}

/// Get the string representation of a log level
fn level_to_str(level: log::Level) -> ColoredString {
    match level {
        log::Level::Trace => "TRC".dimmed().italic(),
        log::Level::Debug => "DBG".dimmed(),
        log::Level::Info  => "INF".normal(),
        log::Level::Warn  => "WRN".yellow(),
        log::Level::Error => "ERR".red().bold()
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------
