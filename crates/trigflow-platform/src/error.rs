// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for trigflow-platform.

use thiserror::Error;

/// Result type using PlatformError.
pub type Result<T> = std::result::Result<T, PlatformError>;

/// Errors that can occur when talking to the remote platform.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// Configuration error (missing or invalid values).
    #[error("configuration error: {0}")]
    Config(String),

    /// The platform could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// Request timed out.
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    /// Platform returned an error response.
    #[error("server error [{status}]: {message}")]
    Server { status: u16, message: String },

    /// Unexpected response from the platform.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Element reference expression did not resolve to an element.
    #[error("unresolved reference: {0}")]
    UnresolvedReference(String),

    /// Workflow template not found.
    #[error("workflow template not found: {0}")]
    TemplateNotFound(String),

    /// Run handle is unknown to the platform.
    #[error("run not found: {0}")]
    RunNotFound(String),

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl PlatformError {
    /// Whether retrying the same request later may succeed.
    ///
    /// Connection failures, timeouts and 5xx responses are transient;
    /// everything else reflects the request itself.
    pub fn is_transient(&self) -> bool {
        match self {
            PlatformError::Connection(_) | PlatformError::Timeout(_) => true,
            PlatformError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for PlatformError {
    fn from(err: serde_json::Error) -> Self {
        PlatformError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for PlatformError {
    fn from(err: std::io::Error) -> Self {
        PlatformError::InvalidInput(err.to_string())
    }
}

impl From<url::ParseError> for PlatformError {
    fn from(err: url::ParseError) -> Self {
        PlatformError::Config(format!("invalid URL: {}", err))
    }
}
