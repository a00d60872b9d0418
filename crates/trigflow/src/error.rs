// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for trigflow.

use thiserror::Error;

/// Controller errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Directory watch could not be set up or broke down.
    #[error("Watch error: {0}")]
    Watch(#[from] crate::watcher::WatchError),

    /// Service was started twice.
    #[error("Service already started: {0}")]
    AlreadyStarted(String),

    /// Service did not stop within its grace period.
    #[error("Service {service} did not stop within {grace_ms}ms")]
    StopTimeout {
        /// Service name.
        service: String,
        /// Grace period that elapsed.
        grace_ms: u64,
    },

    /// Service task panicked.
    #[error("Service {service} task panicked: {message}")]
    TaskPanicked {
        /// Service name.
        service: String,
        /// Join error message.
        message: String,
    },

    /// Service failed or did not become healthy.
    #[error("Service {service} unhealthy: {reason}")]
    Unhealthy {
        /// Service name.
        service: String,
        /// Failure reason.
        reason: String,
    },
}

/// Result type using trigflow Error.
pub type Result<T> = std::result::Result<T, Error>;
