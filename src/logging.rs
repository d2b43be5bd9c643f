/*
 * rescenter - Resource aggregation and transaction engine for software centers.
 * Copyright (C) 2025  compiledkernel-idk and rescenter contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Logging and observability with tracing support.

use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// `RUST_LOG` wins over the configured level
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize logging with a specific level; logs go to stderr
pub fn init_with_level(level: &str) {
    let _ = tracing_subscriber::registry()
        .with(env_filter(level))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .compact(),
        )
        .try_init();
}

/// Initialize logging with optional append-only file output
pub fn init_with_file(level: &str, log_file: Option<&Path>) {
    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
            let file_layer = fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .with_target(true);

            let _ = tracing_subscriber::registry()
                .with(env_filter(level))
                .with(fmt::layer().with_writer(std::io::stderr).compact())
                .with(file_layer)
                .try_init();
            return;
        }
    }

    init_with_level(level);
}

/// Initialize from the `[logging]` section; `verbose` forces debug output
pub fn init_from_config(config: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.level.as_str() };
    init_with_file(level, config.file.as_deref());
}

/// Log macros re-exported for convenience
pub use tracing::{debug, error, info, trace, warn};

/// Span covering one query fanned out to a backend
#[macro_export]
macro_rules! span_query {
    ($backend:expr, $filter:expr) => {
        tracing::debug_span!("query", backend = %$backend, filter = %$filter)
    };
}

/// Span covering the backend work behind one transaction
#[macro_export]
macro_rules! span_transaction {
    ($transaction:expr) => {
        tracing::info_span!(
            "transaction",
            id = %$transaction.id(),
            name = %$transaction.name(),
            role = %$transaction.role()
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_logging_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("rescenter.log");
        // A global subscriber can only be set once per process; a second
        // init is ignored, so only the file side effect is checked.
        init_with_file("info", Some(&path));
        assert!(path.exists());
    }
}
