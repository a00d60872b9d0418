// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The remote platform contract.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::types::{
    ElementHandle, OperationOutputs, RunHandle, StartOperationRequest, StatusReport,
};

/// Operations the controllers consume from the remote platform.
///
/// Implementations are stateless from the caller's point of view: every call
/// is an independent request, safe to issue concurrently from several tasks.
#[async_trait]
pub trait RemotePlatform: Send + Sync {
    /// Resolve an element reference expression (e.g. `param:welder:Quantity`).
    async fn resolve_reference(&self, expression: &str) -> Result<ElementHandle>;

    /// Read the current value of an element.
    async fn read_value(&self, element: &ElementHandle) -> Result<Value>;

    /// Overwrite the value of an element.
    async fn write_value(&self, element: &ElementHandle, value: Value) -> Result<()>;

    /// Start a workflow from a template.
    async fn start_workflow(&self, template_id: &str) -> Result<RunHandle>;

    /// Invoke an operation element.
    async fn start_operation(
        &self,
        operation: &ElementHandle,
        request: StartOperationRequest,
    ) -> Result<RunHandle>;

    /// Poll the status of a run.
    async fn poll_status(&self, run: &RunHandle) -> Result<StatusReport>;

    /// Output values of a completed run. Workflow runs have none.
    async fn fetch_outputs(&self, run: &RunHandle) -> Result<OperationOutputs>;

    /// Store bytes as the attachment of a file element.
    async fn upload_attachment(
        &self,
        element: &ElementHandle,
        file_name: &str,
        content: Vec<u8>,
    ) -> Result<()>;
}
