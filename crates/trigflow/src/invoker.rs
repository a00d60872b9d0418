// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Starting operations from descriptors and waiting for them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use trigflow_platform::{
    ElementHandle, OperationOutputs, PlatformError, RemotePlatform, RunHandle,
    StartOperationRequest,
};

use crate::descriptor::OperationDescriptor;
use crate::monitor::{LifecycleEvent, MonitorOutcome, OperationStatusMonitor, RunListener};

/// Errors raised while starting an operation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum InvocationError {
    /// The operation element could not be resolved.
    #[error("operation target '{expression}' could not be resolved: {source}")]
    UnresolvedTarget {
        /// Target reference expression.
        expression: String,
        /// Platform error.
        #[source]
        source: PlatformError,
    },

    /// A required binding could not be resolved or read.
    #[error("required binding '{name}' ({expression}) could not be resolved: {source}")]
    UnresolvedBinding {
        /// Variable name.
        name: String,
        /// Source reference expression.
        expression: String,
        /// Platform error.
        #[source]
        source: PlatformError,
    },

    /// The platform refused to start the run.
    #[error("platform rejected start of '{operation}': {source}")]
    Rejected {
        /// Operation id or workflow template.
        operation: String,
        /// Platform error.
        #[source]
        source: PlatformError,
    },
}

/// Lifecycle state of a run as seen by the invoker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Start accepted, not yet observed running.
    Starting,
    /// Executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl RunState {
    /// Whether the run has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

impl From<&LifecycleEvent> for RunState {
    fn from(event: &LifecycleEvent) -> Self {
        match event {
            LifecycleEvent::Starting => RunState::Starting,
            LifecycleEvent::Started => RunState::Running,
            LifecycleEvent::Completed => RunState::Completed,
            LifecycleEvent::Failed { .. } => RunState::Failed,
        }
    }
}

/// Records the latest state of one run before passing events on.
struct StateRecorder {
    state: Mutex<RunState>,
    inner: Arc<dyn RunListener>,
}

impl StateRecorder {
    fn current(&self) -> RunState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RunListener for StateRecorder {
    fn on_event(&self, run: &RunHandle, event: &LifecycleEvent) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = event.into();
        self.inner.on_event(run, event);
    }
}

/// A started operation run.
#[derive(Debug, Clone)]
pub struct OperationRun {
    /// Platform handle of the run.
    pub handle: RunHandle,
    /// Last observed state. `Starting` from [`OperationInvoker::start`],
    /// the state at the end of the wait from [`OperationInvoker::run`].
    pub state: RunState,
    /// Descriptor the run was started from.
    pub descriptor: Arc<OperationDescriptor>,
    /// Output bindings resolved at start, by variable name.
    pub output_elements: Vec<(String, ElementHandle)>,
}

/// How a run started by [`OperationInvoker::run`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Completed; outputs were fetched and written back.
    Completed {
        /// Outputs reported by the platform.
        outputs: OperationOutputs,
    },
    /// The run failed or could no longer be observed.
    Failed {
        /// Failure reason.
        reason: String,
    },
    /// The descriptor's timeout elapsed first. The run was reported as failed.
    TimedOut,
    /// The caller cancelled the wait.
    Cancelled,
}

/// Starts operations described by [`OperationDescriptor`]s.
#[derive(Clone)]
pub struct OperationInvoker {
    platform: Arc<dyn RemotePlatform>,
    monitor: OperationStatusMonitor,
}

impl OperationInvoker {
    /// Create an invoker tracking runs with `monitor`.
    pub fn new(platform: Arc<dyn RemotePlatform>, monitor: OperationStatusMonitor) -> Self {
        Self { platform, monitor }
    }

    /// Start one run of `descriptor`.
    ///
    /// Every binding is resolved now, not when the descriptor was built.
    /// Required bindings that do not resolve fail the call; optional ones are
    /// left out of the request. Nothing is retried.
    #[instrument(skip_all, fields(operation = %descriptor.id()))]
    pub async fn start(
        &self,
        descriptor: &Arc<OperationDescriptor>,
    ) -> Result<OperationRun, InvocationError> {
        let target = self
            .platform
            .resolve_reference(descriptor.target())
            .await
            .map_err(|source| InvocationError::UnresolvedTarget {
                expression: descriptor.target().to_string(),
                source,
            })?;

        let mut inputs = BTreeMap::new();
        for binding in descriptor.inputs() {
            let value = match self.platform.resolve_reference(&binding.source).await {
                Ok(element) => self.platform.read_value(&element).await,
                Err(e) => Err(e),
            };
            match value {
                Ok(value) => {
                    inputs.insert(binding.name.clone(), value);
                }
                Err(source) if binding.required => {
                    return Err(InvocationError::UnresolvedBinding {
                        name: binding.name.clone(),
                        expression: binding.source.clone(),
                        source,
                    });
                }
                Err(e) => {
                    debug!(input = %binding.name, error = %e, "Optional input skipped");
                }
            }
        }

        let mut output_elements = Vec::new();
        for binding in descriptor.outputs() {
            match self.platform.resolve_reference(&binding.source).await {
                Ok(element) => output_elements.push((binding.name.clone(), element)),
                Err(source) if binding.required => {
                    return Err(InvocationError::UnresolvedBinding {
                        name: binding.name.clone(),
                        expression: binding.source.clone(),
                        source,
                    });
                }
                Err(e) => {
                    debug!(output = %binding.name, error = %e, "Optional output skipped");
                }
            }
        }

        let request = StartOperationRequest {
            inputs,
            outputs: descriptor.outputs().iter().map(|b| b.name.clone()).collect(),
            options: descriptor.options().clone(),
            labels: descriptor.labels().clone(),
            timeout_ms: Some(descriptor.timeout().as_millis() as u64),
        };

        let handle = self
            .platform
            .start_operation(&target, request)
            .await
            .map_err(|source| InvocationError::Rejected {
                operation: descriptor.id().to_string(),
                source,
            })?;

        info!(run = %handle, "Operation started");
        Ok(OperationRun {
            handle,
            state: RunState::Starting,
            descriptor: descriptor.clone(),
            output_elements,
        })
    }

    /// Start a run and wait until it completes, fails, times out or `cancel`
    /// fires. Returns the run with its final state alongside the outcome.
    ///
    /// On completion the run's outputs are written back to the resolved
    /// output elements; a failed write is logged and does not change the
    /// outcome. A timeout reports `Failed` to the listener before returning.
    pub async fn run(
        &self,
        descriptor: &Arc<OperationDescriptor>,
        listener: Arc<dyn RunListener>,
        cancel: &CancellationToken,
    ) -> Result<(OperationRun, RunOutcome), InvocationError> {
        let mut run = self.start(descriptor).await?;
        let recorder = Arc::new(StateRecorder {
            state: Mutex::new(run.state),
            inner: listener,
        });
        let monitor = self.monitor.track(
            run.handle.clone(),
            recorder.clone(),
            descriptor.poll_interval(),
            true,
        );

        let deadline = tokio::time::sleep(descriptor.timeout());
        tokio::pin!(deadline);

        let control = monitor.control();
        let wait = monitor.wait();
        tokio::pin!(wait);

        let outcome = tokio::select! {
            outcome = &mut wait => self.finish(&run, outcome).await,
            _ = &mut deadline => {
                let timeout_ms = descriptor.timeout().as_millis() as u64;
                warn!(run = %run.handle, timeout_ms, "Operation timed out");
                control.fail(format!("timed out after {}ms", timeout_ms));
                match wait.await {
                    // Finished between the deadline and the failure request.
                    MonitorOutcome::Completed => {
                        self.finish(&run, MonitorOutcome::Completed).await
                    }
                    _ => RunOutcome::TimedOut,
                }
            }
            _ = cancel.cancelled() => {
                control.stop();
                info!(run = %run.handle, "Operation wait cancelled");
                RunOutcome::Cancelled
            }
        };

        run.state = recorder.current();
        Ok((run, outcome))
    }

    async fn finish(&self, run: &OperationRun, outcome: MonitorOutcome) -> RunOutcome {
        match outcome {
            MonitorOutcome::Completed => {
                let outputs = self.write_back(run).await;
                RunOutcome::Completed { outputs }
            }
            MonitorOutcome::Failed { reason } => RunOutcome::Failed { reason },
            MonitorOutcome::Stopped => RunOutcome::Cancelled,
        }
    }

    async fn write_back(&self, run: &OperationRun) -> OperationOutputs {
        let outputs = match self.platform.fetch_outputs(&run.handle).await {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!(run = %run.handle, error = %e, "Failed to fetch operation outputs");
                return OperationOutputs::new();
            }
        };

        for (name, element) in &run.output_elements {
            let Some(value) = outputs.get(name) else {
                warn!(run = %run.handle, output = %name, "Operation did not report output");
                continue;
            };
            match self.platform.write_value(element, value.clone()).await {
                Ok(()) => debug!(run = %run.handle, output = %name, element = %element, "Output written"),
                Err(e) => warn!(
                    run = %run.handle,
                    output = %name,
                    error = %e,
                    "Failed to write operation output"
                ),
            }
        }

        outputs
    }
}
