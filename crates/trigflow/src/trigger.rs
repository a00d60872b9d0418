// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Turning broker messages into remote runs.
//!
//! [`TriggerController`] is the message handler registered on the trigger
//! topic. It runs the deduplication check inline, on the delivery task, and
//! hands every accepted trigger to a task of its own so that a slow platform
//! never holds up the next message.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};
use trigflow_platform::RemotePlatform;

use crate::dedup::TriggerDeduplicator;
use crate::descriptor::OperationDescriptor;
use crate::invoker::{InvocationError, OperationInvoker, OperationRun, RunOutcome};
use crate::monitor::{OperationStatusMonitor, RunListener};
use crate::subscriber::MessageHandler;

/// What an accepted trigger starts.
#[derive(Debug, Clone)]
pub enum TriggerAction {
    /// Start a workflow from a template.
    Workflow {
        /// Template identifier.
        template_id: String,
    },
    /// Invoke an operation and write its outputs back.
    Operation {
        /// Descriptor reused for every trigger.
        descriptor: Arc<OperationDescriptor>,
    },
}

impl TriggerAction {
    fn name(&self) -> &str {
        match self {
            TriggerAction::Workflow { template_id } => template_id,
            TriggerAction::Operation { descriptor } => descriptor.id(),
        }
    }
}

/// Broker message handler starting one run per accepted trigger.
pub struct TriggerController {
    platform: Arc<dyn RemotePlatform>,
    monitor: OperationStatusMonitor,
    invoker: OperationInvoker,
    action: TriggerAction,
    listener: Arc<dyn RunListener>,
    dedup: Option<Mutex<TriggerDeduplicator>>,
    poll_interval: Duration,
    accepted: AtomicU64,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl TriggerController {
    /// Create a controller acting on every message.
    pub fn new(
        platform: Arc<dyn RemotePlatform>,
        monitor: OperationStatusMonitor,
        action: TriggerAction,
        listener: Arc<dyn RunListener>,
    ) -> Self {
        let invoker = OperationInvoker::new(platform.clone(), monitor.clone());
        Self {
            platform,
            monitor,
            invoker,
            action,
            listener,
            dedup: None,
            poll_interval: Duration::from_secs(3),
            accepted: AtomicU64::new(0),
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Only act on messages whose counter exceeds every counter accepted so far.
    pub fn with_dedup(mut self, dedup: TriggerDeduplicator) -> Self {
        self.dedup = Some(Mutex::new(dedup));
        self
    }

    /// Status poll interval for workflow runs. Operation runs use their
    /// descriptor's interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The configured action.
    pub fn action(&self) -> &TriggerAction {
        &self.action
    }

    /// Triggers accepted so far.
    pub fn accepted_count(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Runs still being started or waited on.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Stop accepting triggers, cancel in-flight waits and wait up to `grace`
    /// for their tasks to end. Returns `false` if some did not.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.cancel.cancel();
        self.tasks.close();

        match tokio::time::timeout(grace, self.tasks.wait()).await {
            Ok(()) => {
                debug!("Trigger actions drained");
                true
            }
            Err(_) => {
                warn!(
                    in_flight = self.tasks.len(),
                    grace_ms = grace.as_millis() as u64,
                    "Trigger actions still running after grace period"
                );
                false
            }
        }
    }

    /// Run the deduplication check. `true` when the message should act.
    fn admit(&self, topic: &str, payload: &[u8]) -> bool {
        let Some(dedup) = &self.dedup else {
            return true;
        };
        // A panic elsewhere cannot leave the counter half-updated.
        let mut dedup = dedup.lock().unwrap_or_else(PoisonError::into_inner);

        match dedup.parse(payload) {
            Ok(value) => {
                if dedup.accept(value) {
                    info!(topic = %topic, counter = %value, "Trigger accepted");
                    true
                } else {
                    debug!(
                        topic = %topic,
                        counter = %value,
                        last_accepted = ?dedup.last_accepted().map(|v| v.to_string()),
                        "Trigger ignored, counter not increasing"
                    );
                    false
                }
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "Malformed trigger payload dropped");
                false
            }
        }
    }

    fn dispatch(&self, topic: &str) {
        let cancel = self.cancel.clone();
        let listener = self.listener.clone();
        let span = info_span!("trigger", topic = %topic, action = %self.action.name());

        match &self.action {
            TriggerAction::Workflow { template_id } => {
                let platform = self.platform.clone();
                let monitor = self.monitor.clone();
                let template_id = template_id.clone();
                let poll_interval = self.poll_interval;
                self.tasks.spawn(
                    run_workflow(platform, monitor, template_id, listener, poll_interval, cancel)
                        .instrument(span),
                );
            }
            TriggerAction::Operation { descriptor } => {
                let invoker = self.invoker.clone();
                let descriptor = descriptor.clone();
                self.tasks.spawn(
                    async move {
                        match invoker.run(&descriptor, listener, &cancel).await {
                            Ok((run, outcome)) => log_outcome(&run, &outcome),
                            Err(e) => error!(error = %e, "Operation could not be started"),
                        }
                    }
                    .instrument(span),
                );
            }
        }
    }
}

impl MessageHandler for TriggerController {
    fn on_message(&self, topic: &str, payload: &[u8]) {
        if self.cancel.is_cancelled() {
            debug!(topic = %topic, "Trigger dropped during shutdown");
            return;
        }
        if !self.admit(topic, payload) {
            return;
        }

        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.dispatch(topic);
    }
}

async fn run_workflow(
    platform: Arc<dyn RemotePlatform>,
    monitor: OperationStatusMonitor,
    template_id: String,
    listener: Arc<dyn RunListener>,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    let handle = match platform.start_workflow(&template_id).await {
        Ok(handle) => handle,
        Err(source) => {
            let e = InvocationError::Rejected {
                operation: template_id,
                source,
            };
            error!(error = %e, "Workflow could not be started");
            return;
        }
    };
    info!(run = %handle, "Workflow started");

    let tracked = monitor.track(handle, listener, poll_interval, true);
    let stop = tracked.cancel_token();
    tokio::select! {
        outcome = tracked.wait() => debug!(outcome = ?outcome, "Workflow monitor ended"),
        _ = cancel.cancelled() => {
            stop.cancel();
            info!("Workflow wait cancelled");
        }
    }
}

fn log_outcome(run: &OperationRun, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Completed { outputs } => {
            info!(run = %run.handle, outputs = outputs.len(), "Operation completed")
        }
        RunOutcome::Failed { reason } => {
            warn!(run = %run.handle, reason = %reason, "Operation failed")
        }
        RunOutcome::TimedOut => warn!(run = %run.handle, "Operation timed out"),
        RunOutcome::Cancelled => {
            info!(run = %run.handle, state = ?run.state, "Operation wait cancelled")
        }
    }
}
