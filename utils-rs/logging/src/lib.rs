// Copyright (C) 2020  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU Common Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Common Public License for more details.
//
// You should have received a copy of the GNU Common Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Application-wide logging built on `slog`.
//!
//! The logger is a process-global instance created on first use. Records go
//! to stderr (and optionally to the file named by `LOG_FILE`) through an
//! asynchronous drain. The level filter is taken from `LOG_LEVEL`, unless
//! `RUST_LOG` is set, in which case the full env-logger directive syntax
//! applies.

use lazy_static::lazy_static;
use slog::Drain;

use std::env;
use std::fs::OpenOptions;

// Re-export slog so that dependent crates don't have to version-match it
pub use slog;

/// Macros that log through the process-global logger. Import them with
/// `use ii_logging::macros::*;`
pub mod macros {
    pub use crate::{crit, debug, error, info, trace, warn};
}

/// Size of the channel between the logging frontend and the async drain.
/// When the channel fills up, records are dropped rather than blocking
/// the control loops.
pub const ASYNC_LOGGER_CHANNEL_SIZE: usize = 2048;

/// Name of the environment variable with the level filter
pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";

/// Name of the environment variable with an optional log file path
pub const LOG_FILE_ENV: &str = "LOG_FILE";

fn level_from_env() -> slog::Level {
    match env::var(LOG_LEVEL_ENV)
        .unwrap_or_default()
        .to_lowercase()
        .as_str()
    {
        "trace" => slog::Level::Trace,
        "debug" => slog::Level::Debug,
        "warn" | "warning" => slog::Level::Warning,
        "error" => slog::Level::Error,
        "crit" | "critical" => slog::Level::Critical,
        _ => slog::Level::Info,
    }
}

fn new_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let term_drain = slog_term::FullFormat::new(decorator)
        .use_local_timestamp()
        .build()
        .ignore_res();

    // Mirror everything into LOG_FILE when requested
    let drain: Box<dyn Drain<Ok = (), Err = slog::Never> + Send> =
        match env::var(LOG_FILE_ENV).ok().filter(|path| !path.is_empty()) {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .unwrap_or_else(|e| panic!("cannot open log file {}: {}", path, e));
                let file_drain = slog_term::FullFormat::new(slog_term::PlainDecorator::new(file))
                    .use_local_timestamp()
                    .build()
                    .ignore_res();
                Box::new(slog::Duplicate::new(term_drain, file_drain).ignore_res())
            }
            None => Box::new(term_drain),
        };

    // RUST_LOG directives win over the plain LOG_LEVEL filter
    let drain: Box<dyn Drain<Ok = (), Err = slog::Never> + Send> = if env::var("RUST_LOG").is_ok() {
        Box::new(slog_envlogger::new(drain).ignore_res())
    } else {
        Box::new(drain.filter_level(level_from_env()).ignore_res())
    };

    let drain = slog_async::Async::new(drain)
        .chan_size(ASYNC_LOGGER_CHANNEL_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .ignore_res();

    slog::Logger::root(drain, slog::o!())
}

lazy_static! {
    static ref LOGGER: slog::Logger = new_logger();
}

/// Accessor used by the logging macros
pub fn logger() -> &'static slog::Logger {
    &LOGGER
}

/// Force logger instantiation. Call this early so that the drain
/// configuration panics at startup rather than at the first log record.
pub fn setup_for_app() {
    lazy_static::initialize(&LOGGER);
}

#[macro_export]
macro_rules! trace {
    ($($args:tt)+) => { $crate::slog::trace!($crate::logger(), $($args)+) };
}

#[macro_export]
macro_rules! debug {
    ($($args:tt)+) => { $crate::slog::debug!($crate::logger(), $($args)+) };
}

#[macro_export]
macro_rules! info {
    ($($args:tt)+) => { $crate::slog::info!($crate::logger(), $($args)+) };
}

#[macro_export]
macro_rules! warn {
    ($($args:tt)+) => { $crate::slog::warn!($crate::logger(), $($args)+) };
}

#[macro_export]
macro_rules! error {
    ($($args:tt)+) => { $crate::slog::error!($crate::logger(), $($args)+) };
}

#[macro_export]
macro_rules! crit {
    ($($args:tt)+) => { $crate::slog::crit!($crate::logger(), $($args)+) };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_level_from_env_default() {
        // No LOG_LEVEL set in the test environment
        assert_eq!(level_from_env(), slog::Level::Info);
    }

    #[test]
    fn test_macros_do_not_panic() {
        setup_for_app();
        info!("logging smoke test: {}", 42);
        warn!("logging smoke test: {:?}", Some("value"));
    }
}
