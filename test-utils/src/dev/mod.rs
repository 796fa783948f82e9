// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities intended for development tools and the test suite.  These should
//! not be used in production code.

pub mod poll;

use camino::Utf8PathBuf;
use cirrus_common::logging::ConfigLogging;
use cirrus_common::logging::ConfigLoggingIfExists;
use cirrus_common::logging::ConfigLoggingLevel;
use slog::o;
use slog::Logger;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

static TEST_LOG_ID: AtomicU32 = AtomicU32::new(0);

/// A logger for a single test, writing bunyan records to a file in the
/// system's temporary directory
///
/// Tests should call [`LogContext::cleanup_successful`] once they pass.  A
/// failing test leaves its log file behind for inspection.
pub struct LogContext {
    pub log: Logger,
    pub log_path: Utf8PathBuf,
}

impl LogContext {
    pub fn new(test_name: &str) -> LogContext {
        let tmpdir = Utf8PathBuf::try_from(std::env::temp_dir())
            .expect("temporary directory is not valid UTF-8");
        let id = TEST_LOG_ID.fetch_add(1, Ordering::SeqCst);
        let log_path = tmpdir.join(format!(
            "{}.{}.{}.log",
            test_name,
            std::process::id(),
            id
        ));
        let config = ConfigLogging::File {
            level: ConfigLoggingLevel::Trace,
            path: log_path.clone(),
            if_exists: ConfigLoggingIfExists::Fail,
        };
        let log = config
            .to_logger("cirrus-test")
            .unwrap_or_else(|error| {
                panic!("failed to set up log for {:?}: {}", test_name, error)
            })
            .new(o!("test_name" => test_name.to_owned()));
        LogContext { log, log_path }
    }

    /// Removes the log file.  Call this when the test has passed.
    pub fn cleanup_successful(self) {
        let LogContext { log, log_path } = self;
        // Flush outstanding records before removing the file.
        drop(log);
        if let Err(error) = std::fs::remove_file(&log_path) {
            eprintln!("failed to remove log file {:?}: {}", log_path, error);
        }
    }
}

/// Set up a [`LogContext`] appropriate for a test named `test_name`
pub fn test_setup_log(test_name: &str) -> LogContext {
    LogContext::new(test_name)
}
