// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock platform for testing.
//!
//! An in-memory [`RemotePlatform`] that runs nothing. Every run follows a
//! scripted sequence of poll results, and every start, write and upload is
//! recorded so tests can assert on it.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{PlatformError, Result};
use crate::platform::RemotePlatform;
use crate::types::{
    ElementHandle, OperationOutputs, RunHandle, RunStatus, StartOperationRequest, StatusReport,
};

/// One scripted answer to `poll_status`.
#[derive(Debug, Clone)]
pub enum PollStep {
    /// Report this status.
    Report(StatusReport),
    /// Fail the poll with a connection error.
    Error(String),
}

impl From<RunStatus> for PollStep {
    fn from(status: RunStatus) -> Self {
        PollStep::Report(StatusReport::new(status))
    }
}

/// A start request the mock accepted.
#[derive(Debug, Clone)]
pub enum StartRecord {
    /// `start_workflow` call.
    Workflow {
        /// Assigned handle.
        handle: RunHandle,
        /// Requested template.
        template_id: String,
    },
    /// `start_operation` call.
    Operation {
        /// Assigned handle.
        handle: RunHandle,
        /// Operation element.
        operation: ElementHandle,
        /// Request as received.
        request: StartOperationRequest,
    },
}

impl StartRecord {
    /// Handle assigned to the run.
    pub fn handle(&self) -> &RunHandle {
        match self {
            StartRecord::Workflow { handle, .. } | StartRecord::Operation { handle, .. } => handle,
        }
    }
}

/// An attachment the mock received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    /// Attachment element.
    pub element: ElementHandle,
    /// File name sent with the upload.
    pub file_name: String,
    /// Uploaded bytes.
    pub content: Vec<u8>,
}

#[derive(Debug)]
struct MockState {
    script: Vec<PollStep>,
    runs: HashMap<String, VecDeque<PollStep>>,
    polls: HashMap<String, usize>,
    values: HashMap<String, Value>,
    unresolved: HashSet<String>,
    outputs: OperationOutputs,
    start_failure: Option<PlatformError>,
    failing_uploads: HashSet<String>,
    started: Vec<StartRecord>,
    writes: Vec<(ElementHandle, Value)>,
    uploads: Vec<UploadRecord>,
    next_run: u64,
}

/// Scripted in-memory platform.
///
/// By default every expression resolves, every run reports `RUNNING` once and
/// then `COMPLETED`, and operation runs have no outputs.
pub struct MockPlatform {
    state: Mutex<MockState>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    /// Create a mock platform with the default script.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                script: vec![RunStatus::Running.into(), RunStatus::Completed.into()],
                runs: HashMap::new(),
                polls: HashMap::new(),
                values: HashMap::new(),
                unresolved: HashSet::new(),
                outputs: OperationOutputs::new(),
                start_failure: None,
                failing_uploads: HashSet::new(),
                started: Vec::new(),
                writes: Vec::new(),
                uploads: Vec::new(),
                next_run: 0,
            }),
        }
    }

    /// Script followed by every run started afterwards.
    ///
    /// Each poll consumes one step; the last step repeats forever.
    pub fn with_script(mut self, steps: Vec<PollStep>) -> Self {
        self.state.get_mut().script = steps;
        self
    }

    /// Shorthand for a script made only of statuses.
    pub fn with_statuses(self, statuses: &[RunStatus]) -> Self {
        self.with_script(statuses.iter().copied().map(PollStep::from).collect())
    }

    /// Outputs reported by every completed operation run.
    pub fn with_outputs(mut self, outputs: OperationOutputs) -> Self {
        self.state.get_mut().outputs = outputs;
        self
    }

    /// Seed the value of an element by expression.
    pub fn with_value(mut self, expression: &str, value: Value) -> Self {
        self.state
            .get_mut()
            .values
            .insert(expression.to_string(), value);
        self
    }

    /// Make an expression fail to resolve.
    pub fn with_unresolved(mut self, expression: &str) -> Self {
        self.state
            .get_mut()
            .unresolved
            .insert(expression.to_string());
        self
    }

    /// Make uploads of this file name fail.
    pub fn with_failing_upload(mut self, file_name: &str) -> Self {
        self.state
            .get_mut()
            .failing_uploads
            .insert(file_name.to_string());
        self
    }

    /// Reject every start request with the given error until cleared.
    pub async fn fail_starts(&self, error: Option<PlatformError>) {
        self.state.lock().await.start_failure = error;
    }

    /// All accepted start requests, in order.
    pub async fn started(&self) -> Vec<StartRecord> {
        self.state.lock().await.started.clone()
    }

    /// Number of accepted start requests.
    pub async fn start_count(&self) -> usize {
        self.state.lock().await.started.len()
    }

    /// Number of polls served for a run.
    pub async fn poll_count(&self, run: &RunHandle) -> usize {
        self.state
            .lock()
            .await
            .polls
            .get(&run.name)
            .copied()
            .unwrap_or(0)
    }

    /// All values written, in order.
    pub async fn writes(&self) -> Vec<(ElementHandle, Value)> {
        self.state.lock().await.writes.clone()
    }

    /// All attachments received, in order.
    pub async fn uploads(&self) -> Vec<UploadRecord> {
        self.state.lock().await.uploads.clone()
    }

    fn element_for(expression: &str) -> ElementHandle {
        ElementHandle {
            expression: expression.to_string(),
            element_id: format!("el-{}", expression.replace(':', "-")),
        }
    }

    fn next_name(state: &mut MockState, prefix: &str) -> String {
        state.next_run += 1;
        format!("{}-{}", prefix, state.next_run)
    }

    fn take_start_failure(state: &MockState) -> Option<PlatformError> {
        state.start_failure.as_ref().map(|e| match e {
            PlatformError::TemplateNotFound(t) => PlatformError::TemplateNotFound(t.clone()),
            PlatformError::UnresolvedReference(r) => PlatformError::UnresolvedReference(r.clone()),
            PlatformError::Server { status, message } => PlatformError::Server {
                status: *status,
                message: message.clone(),
            },
            other => PlatformError::UnexpectedResponse(other.to_string()),
        })
    }
}

#[async_trait]
impl RemotePlatform for MockPlatform {
    async fn resolve_reference(&self, expression: &str) -> Result<ElementHandle> {
        let state = self.state.lock().await;
        if state.unresolved.contains(expression) {
            return Err(PlatformError::UnresolvedReference(expression.to_string()));
        }
        Ok(Self::element_for(expression))
    }

    async fn read_value(&self, element: &ElementHandle) -> Result<Value> {
        let state = self.state.lock().await;
        Ok(state
            .values
            .get(&element.expression)
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn write_value(&self, element: &ElementHandle, value: Value) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .values
            .insert(element.expression.clone(), value.clone());
        state.writes.push((element.clone(), value));
        Ok(())
    }

    async fn start_workflow(&self, template_id: &str) -> Result<RunHandle> {
        let mut state = self.state.lock().await;
        if let Some(err) = Self::take_start_failure(&state) {
            return Err(err);
        }

        let handle = RunHandle::workflow(Self::next_name(&mut state, template_id));
        let script = state.script.clone().into();
        state.runs.insert(handle.name.clone(), script);
        state.started.push(StartRecord::Workflow {
            handle: handle.clone(),
            template_id: template_id.to_string(),
        });
        Ok(handle)
    }

    async fn start_operation(
        &self,
        operation: &ElementHandle,
        request: StartOperationRequest,
    ) -> Result<RunHandle> {
        let mut state = self.state.lock().await;
        if let Some(err) = Self::take_start_failure(&state) {
            return Err(err);
        }

        let handle = RunHandle::operation(Self::next_name(&mut state, "op"));
        let script = state.script.clone().into();
        state.runs.insert(handle.name.clone(), script);
        state.started.push(StartRecord::Operation {
            handle: handle.clone(),
            operation: operation.clone(),
            request,
        });
        Ok(handle)
    }

    async fn poll_status(&self, run: &RunHandle) -> Result<StatusReport> {
        let mut state = self.state.lock().await;
        *state.polls.entry(run.name.clone()).or_default() += 1;

        let steps = state
            .runs
            .get_mut(&run.name)
            .ok_or_else(|| PlatformError::RunNotFound(run.name.clone()))?;
        let step = if steps.len() > 1 {
            steps.pop_front()
        } else {
            steps.front().cloned()
        };

        match step {
            Some(PollStep::Report(report)) => Ok(report),
            Some(PollStep::Error(message)) => Err(PlatformError::Connection(message)),
            None => Err(PlatformError::UnexpectedResponse(format!(
                "no status scripted for {}",
                run.name
            ))),
        }
    }

    async fn fetch_outputs(&self, run: &RunHandle) -> Result<OperationOutputs> {
        let state = self.state.lock().await;
        if !state.runs.contains_key(&run.name) {
            return Err(PlatformError::RunNotFound(run.name.clone()));
        }
        match run.kind {
            crate::types::RunKind::Workflow => Ok(OperationOutputs::new()),
            crate::types::RunKind::Operation => Ok(state.outputs.clone()),
        }
    }

    async fn upload_attachment(
        &self,
        element: &ElementHandle,
        file_name: &str,
        content: Vec<u8>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.failing_uploads.contains(file_name) {
            return Err(PlatformError::Server {
                status: 503,
                message: format!("upload of {} rejected", file_name),
            });
        }

        state.uploads.push(UploadRecord {
            element: element.clone(),
            file_name: file_name.to_string(),
            content,
        });
        Ok(())
    }
}
