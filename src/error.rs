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

//! Error taxonomy for the aggregation and transaction core.

use std::fmt;
use thiserror::Error;

use crate::transaction::TransactionStatus;

/// Main error type for rescenter operations
#[derive(Debug, Error)]
pub enum RescenterError {
    /// A backend failed locally (network, permissions, corrupt metadata)
    #[error("Backend '{backend}' failed: {message}")]
    Backend {
        backend: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Backend reported itself as unusable at registration time
    #[error("Backend '{backend}' is not valid and was discarded")]
    InvalidBackend { backend: String },

    /// A backend with the same name is already registered
    #[error("Backend '{backend}' is already registered")]
    DuplicateBackend { backend: String },

    /// No registered backend with that name
    #[error("Unknown backend '{backend}'")]
    UnknownBackend { backend: String },

    /// Resource lookup failed
    #[error("Resource '{resource}' not found")]
    ResourceNotFound { resource: String },

    /// A second operation was requested for a resource that already has one
    #[error("An operation is already in progress for '{resource}'")]
    TransactionInProgress { resource: String },

    /// Cancellation requested on a transaction that cannot be cancelled
    #[error("Transaction '{transaction}' cannot be cancelled right now")]
    NotCancellable { transaction: String },

    /// Operation on a transaction that already reached a terminal status
    #[error("Transaction '{transaction}' has already finished")]
    TransactionFinished { transaction: String },

    /// Status moves backwards or out of a terminal status
    #[error("Transaction '{transaction}' cannot move from {from} to {to}")]
    InvalidTransition {
        transaction: String,
        from: TransactionStatus,
        to: TransactionStatus,
    },

    /// Updater is running a batch and cannot be prepared or mutated
    #[error("Updater for '{backend}' is busy with a running update")]
    UpdaterBusy { backend: String },

    /// Resource is not part of the upgradeable set
    #[error("Resource '{resource}' has no pending update")]
    NotUpgradeable { resource: String },

    /// Operation not offered by this backend
    #[error("Backend '{backend}' does not support {operation}")]
    Unsupported { backend: String, operation: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// File system errors
    #[error("File system error for '{path}': {message}")]
    FileSystem {
        path: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Serialization of exported documents
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Interrupted operation
    #[error("Operation interrupted")]
    Interrupted,

    /// Generic/wrapped error
    #[error("{0}")]
    Other(String),
}

/// How an error is expected to be handled by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Reported at the backend boundary, never alters aggregate control flow
    BackendLocal,
    /// Rejected synchronously; shown inline next to the resource
    PolicyViolation,
    /// Programming or input error by the caller
    Usage,
    /// Environment problem (config, filesystem)
    Environment,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::BackendLocal => write!(f, "backend"),
            ErrorClass::PolicyViolation => write!(f, "policy"),
            ErrorClass::Usage => write!(f, "usage"),
            ErrorClass::Environment => write!(f, "environment"),
        }
    }
}

impl RescenterError {
    /// Classify the error
    pub fn class(&self) -> ErrorClass {
        match self {
            RescenterError::Backend { .. } | RescenterError::InvalidBackend { .. } => {
                ErrorClass::BackendLocal
            }
            RescenterError::TransactionInProgress { .. }
            | RescenterError::NotCancellable { .. }
            | RescenterError::TransactionFinished { .. }
            | RescenterError::UpdaterBusy { .. } => ErrorClass::PolicyViolation,
            RescenterError::ConfigError { .. }
            | RescenterError::FileSystem { .. }
            | RescenterError::Serialization(_) => ErrorClass::Environment,
            _ => ErrorClass::Usage,
        }
    }

    /// Check if this error is a rejected policy rather than a failure
    pub fn is_policy_violation(&self) -> bool {
        self.class() == ErrorClass::PolicyViolation
    }

    /// Short message meant to be shown next to the affected item
    pub fn inline_message(&self) -> String {
        match self {
            RescenterError::TransactionInProgress { .. } => {
                "An operation is already in progress for this item".to_string()
            }
            RescenterError::NotCancellable { .. } => {
                "This operation can no longer be cancelled".to_string()
            }
            RescenterError::TransactionFinished { .. } => "This operation has already finished".to_string(),
            RescenterError::UpdaterBusy { .. } => "Updates are already being installed".to_string(),
            other => other.to_string(),
        }
    }

    /// Create a backend error
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        RescenterError::Backend {
            backend: backend.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a backend error wrapping its cause
    pub fn backend_with<E: std::error::Error + Send + Sync + 'static>(
        backend: impl Into<String>,
        message: impl Into<String>,
        source: E,
    ) -> Self {
        RescenterError::Backend {
            backend: backend.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a filesystem error
    pub fn filesystem<E: Into<std::io::Error>>(
        path: impl Into<String>,
        message: impl Into<String>,
        source: E,
    ) -> Self {
        RescenterError::FileSystem {
            path: path.into(),
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// Result type alias for rescenter operations
pub type RescenterResult<T> = std::result::Result<T, RescenterError>;

/// Extension trait for adding context to errors
pub trait ErrorContext<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> RescenterResult<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ErrorContext<T> for Result<T, E> {
    fn context(self, context: impl Into<String>) -> RescenterResult<T> {
        self.map_err(|e| RescenterError::Other(format!("{}: {}", context.into(), e)))
    }
}
