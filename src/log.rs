//! Logging utils. See the ["log" crate documentation](https://docs.rs/log/)
//! for the facade this module plugs into.
//!
//! The runtime never prints directly; instead it goes through the standard
//! `log` macros, and the process installs a [`RuntimeLogger`] once at
//! startup via [`init`]. Every record is prefixed with a wall-clock
//! timestamp and the name of whichever fiber is currently running, matching
//! the "two process-global settings: stdout/stderr echo, optional log file"
//! surface the runtime is required to expose.
//!
//! ```no_run
//! use microcord::log::{self, LogConfig};
//!
//! log::init(LogConfig::stdout_only()).unwrap();
//! log::info!("scheduler starting");
//! ```

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;

use once_cell::sync::OnceCell;
pub use log::{debug, error, info, trace, warn, Level, LevelFilter};
use log::{Log, Metadata, Record, SetLoggerError};

use crate::clock;

/// Process-global logging configuration: whether to echo to stdout/stderr,
/// and an optional file to additionally write to.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub echo_stdout: bool,
    pub file: Option<PathBuf>,
    pub level: Option<LevelFilter>,
}

impl LogConfig {
    pub fn stdout_only() -> Self {
        Self {
            echo_stdout: true,
            file: None,
            level: Some(LevelFilter::Info),
        }
    }
}

/// [`log::Log`] implementation backing the runtime's logging surface.
pub struct RuntimeLogger {
    echo_stdout: bool,
    file: Option<Mutex<File>>,
}

impl RuntimeLogger {
    fn new(config: &LogConfig) -> std::io::Result<Self> {
        let file = match &config.file {
            Some(path) => Some(Mutex::new(
                OpenOptions::new().create(true).append(true).open(path)?,
            )),
            None => None,
        };
        Ok(Self {
            echo_stdout: config.echo_stdout,
            file,
        })
    }

    fn write_line(&self, line: &str) {
        if self.echo_stdout {
            println!("{line}");
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = writeln!(file, "{line}");
            }
        }
    }
}

impl Log for RuntimeLogger {
    #[inline]
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let tag = crate::fiber::current_tag().unwrap_or_else(|| "main".to_string());
        let line = format!(
            "{:.6} [{}] {}: {}",
            clock::time(),
            tag,
            record.level(),
            record.args()
        );
        self.write_line(&line);
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}

static LOGGER: OnceCell<RuntimeLogger> = OnceCell::new();

/// Install the runtime logger as the global `log` backend. Must be called
/// at most once per process, typically at the very start of `main`.
pub fn init(config: LogConfig) -> Result<(), InitError> {
    let max_level = config.level.unwrap_or(LevelFilter::Info);
    let logger = RuntimeLogger::new(&config)?;
    let logger = LOGGER.get_or_init(|| logger);
    log::set_logger(logger)?;
    log::set_max_level(max_level);
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("failed to open log file: {0}")]
    Io(#[from] std::io::Error),
    #[error("a logger was already installed: {0}")]
    AlreadySet(#[from] SetLoggerError),
}
