// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Start/stop/health contract shared by the long-running controllers.
//!
//! Each controller owns one background task, spawned by [`ServiceTask`], that
//! exits when its cancellation token fires. [`ServiceManager`] starts a set of
//! services in order, waits for them to report healthy and stops them in
//! reverse order, all within one grace period.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// Health of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceHealth {
    /// Not started, or stopped cleanly.
    Stopped,
    /// Start in progress.
    Starting,
    /// Background task running.
    Running,
    /// Stop requested, task not yet finished.
    Stopping,
    /// Background task ended with an error.
    Failed(String),
}

impl fmt::Display for ServiceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceHealth::Stopped => f.write_str("stopped"),
            ServiceHealth::Starting => f.write_str("starting"),
            ServiceHealth::Running => f.write_str("running"),
            ServiceHealth::Stopping => f.write_str("stopping"),
            ServiceHealth::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// A long-running controller hosted by the process.
#[async_trait]
pub trait Service: Send {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Perform structural checks and spawn the background task.
    ///
    /// Errors here are fatal: the service never reaches `Running`.
    async fn start(&mut self) -> Result<()>;

    /// Request the background task to stop and wait up to `grace` for it.
    async fn stop(&mut self, grace: Duration) -> Result<()>;

    /// Current health.
    fn health(&self) -> ServiceHealth;
}

/// One cancellable background task with health tracking.
pub struct ServiceTask {
    name: String,
    cancel: CancellationToken,
    health: Arc<watch::Sender<ServiceHealth>>,
    handle: Option<JoinHandle<()>>,
}

impl ServiceTask {
    /// Create an idle task slot.
    pub fn new(name: impl Into<String>) -> Self {
        let (health, _) = watch::channel(ServiceHealth::Stopped);
        Self {
            name: name.into(),
            cancel: CancellationToken::new(),
            health: Arc::new(health),
            handle: None,
        }
    }

    /// Token the task must watch to know when to stop.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark the service as starting, before structural checks run.
    pub fn mark_starting(&self) {
        self.health.send_replace(ServiceHealth::Starting);
    }

    /// Mark the service as failed without spawning anything.
    pub fn mark_failed(&self, reason: impl Into<String>) {
        self.health.send_replace(ServiceHealth::Failed(reason.into()));
    }

    /// Spawn the background task.
    ///
    /// `Ok(())` from the task means a clean stop; `Err(reason)` marks the
    /// service as failed.
    pub fn spawn<F>(&mut self, work: F) -> Result<()>
    where
        F: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        if self.handle.is_some() {
            return Err(Error::AlreadyStarted(self.name.clone()));
        }

        self.health.send_replace(ServiceHealth::Running);
        let health = self.health.clone();
        let name = self.name.clone();

        self.handle = Some(tokio::spawn(async move {
            match work.await {
                Ok(()) => {
                    health.send_replace(ServiceHealth::Stopped);
                }
                Err(reason) => {
                    error!(service = %name, error = %reason, "Service failed");
                    health.send_replace(ServiceHealth::Failed(reason));
                }
            }
        }));
        Ok(())
    }

    /// Current health.
    pub fn health(&self) -> ServiceHealth {
        self.health.borrow().clone()
    }

    /// Cancel the task and wait up to `grace` for it to finish.
    ///
    /// A task still running after `grace` is aborted and reported as
    /// [`Error::StopTimeout`].
    pub async fn stop(&mut self, grace: Duration) -> Result<()> {
        self.cancel.cancel();

        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };

        self.health.send_if_modified(|health| {
            if *health == ServiceHealth::Running {
                *health = ServiceHealth::Stopping;
                true
            } else {
                false
            }
        });

        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                let message = e.to_string();
                self.health
                    .send_replace(ServiceHealth::Failed(message.clone()));
                Err(Error::TaskPanicked {
                    service: self.name.clone(),
                    message,
                })
            }
            Err(_) => {
                handle.abort();
                warn!(
                    service = %self.name,
                    grace_ms = grace.as_millis() as u64,
                    "Service did not stop within grace period, aborted"
                );
                self.health.send_replace(ServiceHealth::Failed(
                    "did not stop within grace period".to_string(),
                ));
                Err(Error::StopTimeout {
                    service: self.name.clone(),
                    grace_ms: grace.as_millis() as u64,
                })
            }
        }
    }
}

/// Starts, watches and stops a set of services.
pub struct ServiceManager {
    services: Vec<Box<dyn Service>>,
    started: usize,
    grace: Duration,
}

impl ServiceManager {
    /// Create an empty manager stopping all services within `grace`.
    pub fn new(grace: Duration) -> Self {
        Self {
            services: Vec::new(),
            started: 0,
            grace,
        }
    }

    /// Add a service. Services start in insertion order.
    pub fn add(&mut self, service: Box<dyn Service>) {
        self.services.push(service);
    }

    /// Start every service.
    ///
    /// If one fails to start, the ones already started are stopped again
    /// and the error is returned.
    pub async fn start_all(&mut self) -> Result<()> {
        while self.started < self.services.len() {
            let service = &mut self.services[self.started];
            info!(service = %service.name(), "Starting service");

            if let Err(e) = service.start().await {
                error!(service = %service.name(), error = %e, "Service failed to start");
                if let Err(stop_err) = self.stop_all().await {
                    warn!(error = %stop_err, "Failed to stop services after start failure");
                }
                return Err(e);
            }
            self.started += 1;
        }
        Ok(())
    }

    /// Wait until every service reports [`ServiceHealth::Running`].
    pub async fn await_healthy(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut all_running = true;
            for service in &self.services {
                match service.health() {
                    ServiceHealth::Running => {}
                    ServiceHealth::Failed(reason) => {
                        return Err(Error::Unhealthy {
                            service: service.name().to_string(),
                            reason,
                        });
                    }
                    _ => all_running = false,
                }
            }

            if all_running {
                info!(services = self.services.len(), "All services healthy");
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                let pending = self
                    .services
                    .iter()
                    .find(|s| s.health() != ServiceHealth::Running)
                    .map(|s| (s.name().to_string(), s.health().to_string()))
                    .unwrap_or_default();
                return Err(Error::Unhealthy {
                    service: pending.0,
                    reason: format!("not running after {}ms ({})", timeout.as_millis(), pending.1),
                });
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Name and health of every service.
    pub fn health_report(&self) -> Vec<(String, ServiceHealth)> {
        self.services
            .iter()
            .map(|s| (s.name().to_string(), s.health()))
            .collect()
    }

    /// Stop every started service in reverse start order, within the
    /// manager's grace period.
    pub async fn stop_all(&mut self) -> Result<()> {
        self.stop_all_by(Instant::now() + self.grace).await
    }

    /// Stop every started service in reverse start order.
    ///
    /// Each service gets whatever is left until `deadline`. The first error
    /// is returned after all services were asked to stop.
    pub async fn stop_all_by(&mut self, deadline: Instant) -> Result<()> {
        let mut first_error = None;

        while self.started > 0 {
            self.started -= 1;
            let service = &mut self.services[self.started];
            info!(service = %service.name(), "Stopping service");

            let grace = deadline.saturating_duration_since(Instant::now());
            if let Err(e) = service.stop(grace).await {
                error!(service = %service.name(), error = %e, "Service stop failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
