use super::GlobalConfig;
use super::launch::LaunchLogLevel;
use core::fmt::Display;
use hashbrown::HashMap;
use std::sync::Arc;
use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::PathBuf,
};

/// Configuration for logging in tilemma, parameterized by a log level type.
///
/// Note that you can use multiple outputs at the same time.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(bound = "")]
pub struct LoggerConfig<L: LogLevel> {
    /// Path to the log file, if file logging is enabled.
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Whether to append to the log file (true) or overwrite it (false). Defaults to true.
    #[serde(default = "append_default")]
    pub append: bool,

    /// Whether to log to standard output.
    #[serde(default)]
    pub stdout: bool,

    /// Whether to log to standard error.
    #[serde(default)]
    pub stderr: bool,

    /// Optional crate-level logging configuration (e.g., info, debug, trace).
    #[serde(default)]
    pub log: Option<LogCrateLevel>,

    /// The log level for this logger, determining verbosity.
    #[serde(default)]
    pub level: L,
}

impl<L: LogLevel> Default for LoggerConfig<L> {
    fn default() -> Self {
        Self {
            file: None,
            append: true,
            stdout: false,
            stderr: false,
            log: None,
            level: L::default(),
        }
    }
}

/// Log levels using the `log` crate.
#[derive(
    Clone, Copy, Debug, Default, serde::Serialize, serde::Deserialize, Hash, PartialEq, Eq,
)]
pub enum LogCrateLevel {
    /// Logs informational messages.
    #[default]
    #[serde(rename = "info")]
    Info,

    /// Logs debugging messages.
    #[serde(rename = "debug")]
    Debug,

    /// Logs trace-level messages.
    #[serde(rename = "trace")]
    Trace,
}

fn append_default() -> bool {
    true
}

/// Trait for types that can be used as log levels in `LoggerConfig`.
pub trait LogLevel:
    serde::de::DeserializeOwned + serde::Serialize + Clone + Copy + core::fmt::Debug + Default
{
}

/// Launch logger, fanning each message out to every configured output.
#[derive(Debug)]
pub struct Logger {
    loggers: Vec<LoggerKind>,
    level: LaunchLogLevel,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    /// Creates a new `Logger` based on the global configuration.
    ///
    /// Note that creating a logger opens the configured files.
    pub fn new() -> Self {
        Self::from_config(&GlobalConfig::get())
    }

    /// Creates a new `Logger` from an explicit configuration.
    pub fn from_config(config: &Arc<GlobalConfig>) -> Self {
        let settings = &config.launch.logger;
        let level = settings.level;
        let mut loggers = Vec::new();

        if let LaunchLogLevel::Disabled = level {
            return Self { loggers, level };
        }

        #[derive(Hash, PartialEq, Eq)]
        enum LoggerId {
            File(PathBuf),
            Stdout,
            Stderr,
            LogCrate(LogCrateLevel),
        }

        let mut registered = HashMap::<LoggerId, ()>::new();
        let mut register = |id: LoggerId, logger: &dyn Fn() -> Option<LoggerKind>| {
            if registered.insert(id, ()).is_none() {
                if let Some(logger) = logger() {
                    loggers.push(logger);
                }
            }
        };

        if let Some(file) = &settings.file {
            register(LoggerId::File(file.clone()), &|| {
                FileLogger::new(file, settings.append).map(LoggerKind::File)
            });
        }
        if settings.stdout {
            register(LoggerId::Stdout, &|| Some(LoggerKind::Stdout));
        }
        if settings.stderr {
            register(LoggerId::Stderr, &|| Some(LoggerKind::Stderr));
        }
        if let Some(crate_level) = settings.log {
            register(LoggerId::LogCrate(crate_level), &|| {
                Some(LoggerKind::Log(crate_level))
            });
        }

        Self { loggers, level }
    }

    /// Logs a launch related message to all configured outputs.
    pub fn log_launch<S: Display>(&mut self, msg: &S) {
        match self.loggers.len() {
            0 => {}
            1 => self.loggers[0].log(msg),
            _ => {
                let msg = msg.to_string();
                for logger in self.loggers.iter_mut() {
                    logger.log(&msg);
                }
            }
        }
    }

    /// Returns the configured launch log level.
    pub fn log_level_launch(&self) -> LaunchLogLevel {
        self.level
    }
}

/// Represents different types of loggers.
#[derive(Debug)]
enum LoggerKind {
    /// Logs to a file.
    File(FileLogger),

    /// Logs to standard output.
    Stdout,

    /// Logs to standard error.
    Stderr,

    /// Logs using the `log` crate with a specified level.
    Log(LogCrateLevel),
}

impl LoggerKind {
    fn log<S: Display>(&mut self, msg: &S) {
        match self {
            LoggerKind::File(file_logger) => file_logger.log(msg),
            LoggerKind::Stdout => println!("{msg}"),
            LoggerKind::Stderr => eprintln!("{msg}"),
            LoggerKind::Log(level) => match level {
                LogCrateLevel::Info => log::info!("{msg}"),
                LogCrateLevel::Debug => log::debug!("{msg}"),
                LogCrateLevel::Trace => log::trace!("{msg}"),
            },
        }
    }
}

/// Logger that writes messages to a file.
#[derive(Debug)]
struct FileLogger {
    writer: BufWriter<File>,
}

impl FileLogger {
    // Opens the file; a file that can't be opened disables this output instead of failing.
    fn new(path: &PathBuf, append: bool) -> Option<Self> {
        let file = OpenOptions::new()
            .write(true)
            .append(append)
            .truncate(!append)
            .create(true)
            .open(path);

        match file {
            Ok(file) => Some(Self {
                writer: BufWriter::new(file),
            }),
            Err(err) => {
                log::warn!("Unable to open launch log file {path:?}: {err}");
                None
            }
        }
    }

    fn log<S: Display>(&mut self, msg: &S) {
        if writeln!(self.writer, "{msg}")
            .and_then(|_| self.writer.flush())
            .is_err()
        {
            log::warn!("Unable to write to the launch log file");
        }
    }
}
