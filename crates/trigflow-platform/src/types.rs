// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Types for platform requests and responses.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of a run as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Accepted by the platform, not yet executing.
    Starting,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with error (or never started).
    Failed,
}

impl RunStatus {
    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Starting => "STARTING",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of remote procedure a run belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// A workflow started from a template.
    Workflow,
    /// An operation invoked on a platform element.
    Operation,
}

/// Handle for a run, named by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunHandle {
    /// Workflow or operation run.
    pub kind: RunKind,
    /// Platform-assigned name, unique within the platform.
    pub name: String,
    /// When the start request was accepted.
    pub started_at: DateTime<Utc>,
}

impl RunHandle {
    /// Create a handle for a workflow run.
    pub fn workflow(name: impl Into<String>) -> Self {
        Self {
            kind: RunKind::Workflow,
            name: name.into(),
            started_at: Utc::now(),
        }
    }

    /// Create a handle for an operation run.
    pub fn operation(name: impl Into<String>) -> Self {
        Self {
            kind: RunKind::Operation,
            name: name.into(),
            started_at: Utc::now(),
        }
    }
}

impl fmt::Display for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A resolved platform element (parameter, property, file slot, operation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementHandle {
    /// The expression the element was resolved from.
    pub expression: String,
    /// Platform identifier of the element.
    pub element_id: String,
}

impl fmt::Display for ElementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.expression, self.element_id)
    }
}

/// Status observation for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Current status.
    pub status: RunStatus,
    /// Failure message reported by the platform, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusReport {
    /// Report with no message.
    pub fn new(status: RunStatus) -> Self {
        Self {
            status,
            message: None,
        }
    }

    /// Failed report carrying a message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            message: Some(message.into()),
        }
    }
}

/// Request to invoke an operation element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOperationRequest {
    /// Input values by variable name, resolved at call time.
    pub inputs: BTreeMap<String, Value>,
    /// Names of the expected output variables.
    pub outputs: Vec<String>,
    /// Free-form options (e.g. `loglevel`).
    pub options: BTreeMap<String, String>,
    /// Free-form labels.
    pub labels: BTreeMap<String, String>,
    /// Execution timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Output values of a completed operation run, by variable name.
pub type OperationOutputs = BTreeMap<String, Value>;
