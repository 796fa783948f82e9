// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logging configuration (the "log" top-level object in a component's
//! configuration file)

use crate::FileKv;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use serde::Deserialize;
use serde::Serialize;
use slog::o;
use slog::Drain;
use slog::Level;
use slog::Logger;
use std::fs::OpenOptions;

#[derive(Debug, thiserror::Error)]
#[error("initializing logger: {0}")]
pub struct LogInitError(String);

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "mode")]
pub enum ConfigLogging {
    #[serde(rename = "stderr-terminal")]
    StderrTerminal { level: ConfigLoggingLevel },

    #[serde(rename = "file")]
    File {
        level: ConfigLoggingLevel,
        path: Utf8PathBuf,
        if_exists: ConfigLoggingIfExists,
    },
}

impl Default for ConfigLogging {
    fn default() -> Self {
        ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Info }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigLoggingIfExists {
    Fail,
    Truncate,
    Append,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigLoggingLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl From<ConfigLoggingLevel> for Level {
    fn from(config_level: ConfigLoggingLevel) -> Level {
        match config_level {
            ConfigLoggingLevel::Trace => Level::Trace,
            ConfigLoggingLevel::Debug => Level::Debug,
            ConfigLoggingLevel::Info => Level::Info,
            ConfigLoggingLevel::Warn => Level::Warning,
            ConfigLoggingLevel::Error => Level::Error,
            ConfigLoggingLevel::Critical => Level::Critical,
        }
    }
}

impl ConfigLogging {
    /// Create the root logger based on the requested configuration.
    ///
    /// `name` is recorded as the bunyan "name" field when logging to a file.
    pub fn to_logger(
        &self,
        name: &'static str,
    ) -> Result<Logger, LogInitError> {
        match self {
            ConfigLogging::StderrTerminal { level } => {
                let decorator = slog_term::TermDecorator::new().build();
                let drain =
                    slog_term::FullFormat::new(decorator).build().fuse();
                Ok(async_root_logger(*level, drain))
            }

            ConfigLogging::File { level, path, if_exists } => {
                let mut open_options = OpenOptions::new();
                open_options.write(true);
                open_options.create(true);

                match if_exists {
                    ConfigLoggingIfExists::Fail => {
                        open_options.create_new(true);
                    }
                    ConfigLoggingIfExists::Append => {
                        open_options.append(true);
                    }
                    ConfigLoggingIfExists::Truncate => {
                        open_options.truncate(true);
                    }
                }

                let drain = log_drain_for_file(&open_options, path, name)?;
                Ok(async_root_logger(*level, drain))
            }
        }
    }
}

// We use an async drain for the terminal logger to take care of
// synchronization.  The other options use a std::sync::Mutex, which is not
// futures-aware and is likely to foul up the executor.
fn async_root_logger<T>(level: ConfigLoggingLevel, drain: T) -> Logger
where
    T: Drain + Send + 'static,
    <T as Drain>::Err: std::fmt::Debug,
{
    let pid = std::process::id();
    let level_drain = slog::LevelFilter(drain, Level::from(level)).fuse();
    let async_drain = slog_async::Async::new(level_drain).build().fuse();
    Logger::root(async_drain, o!("pid" => pid, FileKv))
}

/// Opens `path` per `open_options` and returns a bunyan drain writing to it.
///
/// Used both by [`ConfigLogging::to_logger`] and by the test-suite log
/// helpers, which need a drain for a file whose name they pick themselves.
pub fn log_drain_for_file(
    open_options: &OpenOptions,
    path: &Utf8Path,
    name: &'static str,
) -> Result<impl Drain<Ok = (), Err = slog::Never> + Send + 'static, LogInitError>
{
    if let Some(parent) = path.parent() {
        if !parent.as_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                let message =
                    format!("create log directory {:?}: {}", parent, e);
                LogInitError(message)
            })?;
        }
    }

    let file = open_options.open(path).map_err(|e| {
        LogInitError(format!("open log file {:?}: {}", path, e))
    })?;

    // Record a message to stderr so that a reader who doesn't already know
    // how logging is configured knows where the rest of the log messages went.
    eprintln!("note: configured to log to \"{}\"", path);
    Ok(slog_bunyan::with_name(name, file).build().fuse())
}
