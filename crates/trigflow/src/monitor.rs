// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background status monitor for started runs.
//!
//! Each tracked run gets its own task that polls the platform at a fixed
//! interval and turns status observations into lifecycle events:
//!
//! ```text
//! Starting ──► Started ──► Completed
//!     │           │
//!     └───────────┴──────► Failed
//! ```
//!
//! Events are emitted at most once each and never out of order. A poll that
//! jumps ahead (e.g. `COMPLETED` while nothing was reported yet) fills in the
//! skipped non-terminal events first. Polling stops for good at the first
//! terminal event or when the monitor is stopped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trigflow_platform::{PlatformError, RemotePlatform, RunHandle, RunStatus, StatusReport};

/// Lifecycle event of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Accepted by the platform.
    Starting,
    /// Executing.
    Started,
    /// Finished successfully.
    Completed,
    /// Finished with an error, or could no longer be observed.
    Failed {
        /// Why the run failed.
        reason: String,
    },
}

impl LifecycleEvent {
    fn rank(&self) -> u8 {
        match self {
            LifecycleEvent::Starting => 0,
            LifecycleEvent::Started => 1,
            LifecycleEvent::Completed | LifecycleEvent::Failed { .. } => 2,
        }
    }

    /// Whether no event can follow this one.
    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::Starting => f.write_str("starting"),
            LifecycleEvent::Started => f.write_str("started"),
            LifecycleEvent::Completed => f.write_str("completed"),
            LifecycleEvent::Failed { reason } => write!(f, "failed ({})", reason),
        }
    }
}

/// Receives the lifecycle events of tracked runs.
pub trait RunListener: Send + Sync {
    /// Called once per event, in lifecycle order, on the monitor's task.
    fn on_event(&self, run: &RunHandle, event: &LifecycleEvent);
}

/// Listener that logs every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl RunListener for LoggingListener {
    fn on_event(&self, run: &RunHandle, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::Starting => info!(run = %run, "Run starting"),
            LifecycleEvent::Started => info!(run = %run, "Run started"),
            LifecycleEvent::Completed => info!(run = %run, "Run completed"),
            LifecycleEvent::Failed { reason } => {
                warn!(run = %run, reason = %reason, "Run failed")
            }
        }
    }
}

/// Listener forwarding events into a channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<(RunHandle, LifecycleEvent)>,
}

impl ChannelListener {
    /// Create a listener and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(RunHandle, LifecycleEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl RunListener for ChannelListener {
    fn on_event(&self, run: &RunHandle, event: &LifecycleEvent) {
        // A dropped receiver only means nobody is interested any more.
        let _ = self.tx.send((run.clone(), event.clone()));
    }
}

/// Sends each event to several listeners, in order.
#[derive(Clone, Default)]
pub struct FanoutListener {
    listeners: Vec<Arc<dyn RunListener>>,
}

impl FanoutListener {
    /// Create an empty fan-out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener.
    pub fn with(mut self, listener: Arc<dyn RunListener>) -> Self {
        self.listeners.push(listener);
        self
    }
}

impl RunListener for FanoutListener {
    fn on_event(&self, run: &RunHandle, event: &LifecycleEvent) {
        for listener in &self.listeners {
            listener.on_event(run, event);
        }
    }
}

/// Polling failure past the retry bound.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    /// Consecutive transient failures reached the bound.
    #[error("status polling failed {attempts} times in a row: {last_error}")]
    PollFailed {
        /// Consecutive failed polls.
        attempts: u32,
        /// Message of the last failure.
        last_error: String,
    },
    /// The platform gave an answer that will not change on retry.
    #[error("status polling rejected: {0}")]
    Rejected(String),
}

/// Configuration for the status monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Consecutive transient poll failures tolerated before the run is failed.
    pub max_consecutive_failures: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
        }
    }
}

/// How a monitor ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// The run completed.
    Completed,
    /// The run failed, or polling failed past the bound.
    Failed {
        /// Failure reason, as reported to the listener.
        reason: String,
    },
    /// The monitor was stopped before a terminal status was seen.
    Stopped,
}

/// Stops or fails a tracked run from outside its task.
#[derive(Debug, Clone)]
pub struct MonitorControl {
    cancel: CancellationToken,
    fails: mpsc::UnboundedSender<String>,
}

impl MonitorControl {
    /// Stop polling. No further events are emitted.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// End the run as failed. `Failed` is reported unless a terminal event
    /// was already emitted, and the monitor ends.
    pub fn fail(&self, reason: impl Into<String>) {
        // The task has already ended when the receiver is gone.
        let _ = self.fails.send(reason.into());
    }
}

/// Handle to one monitor task.
pub struct MonitorHandle {
    run: RunHandle,
    control: MonitorControl,
    join: JoinHandle<MonitorOutcome>,
}

impl MonitorHandle {
    /// The tracked run.
    pub fn run(&self) -> &RunHandle {
        &self.run
    }

    /// Stop polling. No further events are emitted.
    pub fn stop(&self) {
        self.control.stop();
    }

    /// End the run as failed, see [`MonitorControl::fail`].
    pub fn fail(&self, reason: impl Into<String>) {
        self.control.fail(reason);
    }

    /// Control usable after [`wait`](Self::wait) took the handle.
    pub fn control(&self) -> MonitorControl {
        self.control.clone()
    }

    /// Token that stops this monitor, usable after [`wait`](Self::wait) took the handle.
    pub fn cancel_token(&self) -> CancellationToken {
        self.control.cancel.clone()
    }

    /// Whether the monitor task has ended.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the monitor to end.
    pub async fn wait(self) -> MonitorOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(run = %self.run, error = %e, "Monitor task panicked");
                MonitorOutcome::Failed {
                    reason: format!("monitor task panicked: {}", e),
                }
            }
        }
    }
}

/// Spawns one polling task per tracked run.
#[derive(Clone)]
pub struct OperationStatusMonitor {
    platform: Arc<dyn RemotePlatform>,
    config: MonitorConfig,
    shutdown: CancellationToken,
}

impl OperationStatusMonitor {
    /// Create a monitor with the default configuration.
    pub fn new(platform: Arc<dyn RemotePlatform>) -> Self {
        Self::with_config(platform, MonitorConfig::default())
    }

    /// Create a monitor with a custom configuration.
    pub fn with_config(platform: Arc<dyn RemotePlatform>, config: MonitorConfig) -> Self {
        Self {
            platform,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops every monitor spawned by this instance.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Track `run` until it reaches a terminal status or is stopped.
    ///
    /// With `fire_initial_state_immediately`, `Starting` is reported and the
    /// first poll happens right away; otherwise the first poll waits one
    /// `poll_interval`.
    pub fn track(
        &self,
        run: RunHandle,
        listener: Arc<dyn RunListener>,
        poll_interval: Duration,
        fire_initial_state_immediately: bool,
    ) -> MonitorHandle {
        let cancel = self.shutdown.child_token();
        let (fails_tx, fails) = mpsc::unbounded_channel();
        let tracker = Tracker {
            platform: self.platform.clone(),
            run: run.clone(),
            listener,
            fails,
            emitted: None,
            failures: 0,
            max_failures: self.config.max_consecutive_failures.max(1),
        };

        let join = tokio::spawn(tracker.run(
            poll_interval,
            fire_initial_state_immediately,
            cancel.clone(),
        ));

        MonitorHandle {
            run,
            control: MonitorControl {
                cancel,
                fails: fails_tx,
            },
            join,
        }
    }
}

struct Tracker {
    platform: Arc<dyn RemotePlatform>,
    run: RunHandle,
    listener: Arc<dyn RunListener>,
    fails: mpsc::UnboundedReceiver<String>,
    emitted: Option<LifecycleEvent>,
    failures: u32,
    max_failures: u32,
}

impl Tracker {
    async fn run(
        mut self,
        poll_interval: Duration,
        immediate: bool,
        cancel: CancellationToken,
    ) -> MonitorOutcome {
        debug!(run = %self.run, poll_ms = poll_interval.as_millis() as u64, "Monitor started");

        if immediate {
            self.advance(LifecycleEvent::Starting);
        }
        let mut first = immediate;

        loop {
            if !first {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!(run = %self.run, "Monitor stopped");
                        return MonitorOutcome::Stopped;
                    }

                    Some(reason) = self.fails.recv() => return self.fail_requested(reason),

                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            first = false;

            let polled = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(run = %self.run, "Monitor stopped");
                    return MonitorOutcome::Stopped;
                }

                Some(reason) = self.fails.recv() => return self.fail_requested(reason),

                polled = self.platform.poll_status(&self.run) => polled,
            };

            if let Some(outcome) = self.observe(polled) {
                return outcome;
            }
        }
    }

    /// Apply one poll result. Returns the outcome once terminal.
    fn observe(&mut self, polled: Result<StatusReport, PlatformError>) -> Option<MonitorOutcome> {
        let report = match polled {
            Ok(report) => {
                self.failures = 0;
                report
            }
            Err(e) if e.is_transient() => {
                self.failures += 1;
                if self.failures < self.max_failures {
                    warn!(
                        run = %self.run,
                        attempt = self.failures,
                        error = %e,
                        "Status poll failed, retrying on next tick"
                    );
                    return None;
                }
                let err = MonitorError::PollFailed {
                    attempts: self.failures,
                    last_error: e.to_string(),
                };
                error!(run = %self.run, error = %err, "Giving up on run status");
                return Some(self.fail(err.to_string()));
            }
            Err(e) => {
                let err = MonitorError::Rejected(e.to_string());
                error!(run = %self.run, error = %err, "Giving up on run status");
                return Some(self.fail(err.to_string()));
            }
        };

        match report.status {
            RunStatus::Starting => {
                self.advance(LifecycleEvent::Starting);
                None
            }
            RunStatus::Running => {
                self.advance(LifecycleEvent::Started);
                None
            }
            RunStatus::Completed => {
                self.advance(LifecycleEvent::Completed);
                Some(MonitorOutcome::Completed)
            }
            RunStatus::Failed => {
                let reason = report
                    .message
                    .unwrap_or_else(|| "run failed".to_string());
                Some(self.fail(reason))
            }
        }
    }

    fn fail_requested(&mut self, reason: String) -> MonitorOutcome {
        warn!(run = %self.run, reason = %reason, "Run failed by caller");
        self.fail(reason)
    }

    fn fail(&mut self, reason: String) -> MonitorOutcome {
        self.advance(LifecycleEvent::Failed {
            reason: reason.clone(),
        });
        MonitorOutcome::Failed { reason }
    }

    /// Emit `target` and every skipped event before it, unless already past it.
    fn advance(&mut self, target: LifecycleEvent) {
        let reached = self.emitted.as_ref().map(|e| e.rank());
        if reached.is_some_and(|rank| rank >= target.rank()) {
            return;
        }

        if reached.is_none() && target.rank() > 0 {
            self.emit(LifecycleEvent::Starting);
        }
        if target == LifecycleEvent::Completed && reached.is_none_or(|rank| rank < 1) {
            self.emit(LifecycleEvent::Started);
        }
        self.emit(target);
    }

    fn emit(&mut self, event: LifecycleEvent) {
        self.listener.on_event(&self.run, &event);
        self.emitted = Some(event);
    }
}
