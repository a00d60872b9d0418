// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime hosting the trigger subscriber and the upload watcher.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trigflow::config::Config;
//! use trigflow::runtime::CompanionRuntime;
//! use trigflow_platform::{HttpPlatform, PlatformConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let platform = Arc::new(HttpPlatform::new(PlatformConfig::from_env()?)?);
//!
//!     let runtime = CompanionRuntime::builder()
//!         .config(Config::from_env()?)
//!         .platform(platform)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use trigflow_platform::RemotePlatform;

use crate::broker::{BrokerTransport, MqttTransport};
use crate::config::{ActionConfig, Config, TriggerConfig};
use crate::dedup::TriggerDeduplicator;
use crate::descriptor::{DescriptorError, OperationDescriptor};
use crate::lifecycle::{ServiceHealth, ServiceManager};
use crate::monitor::{
    FanoutListener, LoggingListener, MonitorConfig, OperationStatusMonitor, RunListener,
};
use crate::subscriber::ReconnectingSubscriber;
use crate::trigger::{TriggerAction, TriggerController};
use crate::watcher::{AttachmentSink, DirectoryUploadWatcher, PlatformAttachmentSink};

/// Builder for a [`CompanionRuntime`].
pub struct CompanionRuntimeBuilder {
    config: Option<Config>,
    platform: Option<Arc<dyn RemotePlatform>>,
    transport: Option<Box<dyn BrokerTransport>>,
    sink: Option<Arc<dyn AttachmentSink>>,
    listener: Option<Arc<dyn RunListener>>,
    monitor_config: MonitorConfig,
    startup_timeout: Duration,
}

impl Default for CompanionRuntimeBuilder {
    fn default() -> Self {
        Self {
            config: None,
            platform: None,
            transport: None,
            sink: None,
            listener: None,
            monitor_config: MonitorConfig::default(),
            startup_timeout: Duration::from_secs(5),
        }
    }
}

impl CompanionRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the remote platform (required).
    pub fn platform(mut self, platform: Arc<dyn RemotePlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Use this broker transport instead of an MQTT connection built from
    /// the configuration.
    pub fn transport(mut self, transport: Box<dyn BrokerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Send watched files here instead of the configured platform attachment.
    pub fn attachment_sink(mut self, sink: Arc<dyn AttachmentSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Also receive lifecycle events of triggered runs. Events are logged
    /// either way.
    pub fn listener(mut self, listener: Arc<dyn RunListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Set the status monitor configuration.
    pub fn monitor_config(mut self, config: MonitorConfig) -> Self {
        self.monitor_config = config;
        self
    }

    /// How long [`CompanionRuntimeConfig::start`] waits for every service to
    /// report running.
    ///
    /// Default: 5 seconds
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing or the configured
    /// action or broker URL is invalid.
    pub fn build(self) -> Result<CompanionRuntimeConfig> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;
        let platform = self
            .platform
            .ok_or_else(|| anyhow::anyhow!("platform is required"))?;

        let action = action_from_config(&config.trigger)?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => Box::new(MqttTransport::new(&config.broker)?),
        };
        let sink = self.sink.unwrap_or_else(|| {
            Arc::new(PlatformAttachmentSink::new(
                platform.clone(),
                config.watcher.file_ref.clone(),
            ))
        });
        let listener: Arc<dyn RunListener> = match self.listener {
            Some(listener) => Arc::new(
                FanoutListener::new()
                    .with(Arc::new(LoggingListener))
                    .with(listener),
            ),
            None => Arc::new(LoggingListener),
        };

        Ok(CompanionRuntimeConfig {
            config,
            platform,
            action,
            transport,
            sink,
            listener,
            monitor_config: self.monitor_config,
            startup_timeout: self.startup_timeout,
        })
    }
}

/// Configuration for a [`CompanionRuntime`].
pub struct CompanionRuntimeConfig {
    config: Config,
    platform: Arc<dyn RemotePlatform>,
    action: TriggerAction,
    transport: Box<dyn BrokerTransport>,
    sink: Arc<dyn AttachmentSink>,
    listener: Arc<dyn RunListener>,
    monitor_config: MonitorConfig,
    startup_timeout: Duration,
}

impl CompanionRuntimeConfig {
    /// Start the watcher and the subscriber and wait until both are running.
    ///
    /// A structural failure (unusable watch directory, unresolvable
    /// attachment reference) stops whatever was started and is returned.
    pub async fn start(self) -> Result<CompanionRuntime> {
        let monitor = OperationStatusMonitor::with_config(self.platform.clone(), self.monitor_config);
        let monitor_shutdown = monitor.shutdown_handle();

        let mut controller = TriggerController::new(
            self.platform.clone(),
            monitor,
            self.action,
            self.listener,
        )
        .with_poll_interval(self.config.trigger.poll_interval);
        if let Some(dedup) = dedup_from_config(&self.config.trigger) {
            controller = controller.with_dedup(dedup);
        }
        let controller = Arc::new(controller);

        let mut subscriber = ReconnectingSubscriber::new(self.transport);
        subscriber.subscribe(self.config.broker.topic.clone(), controller.clone());

        let watcher = DirectoryUploadWatcher::new(
            self.config.watcher.dir.clone(),
            self.sink,
            self.config.watcher.poll_interval,
        );

        // Reverse-order stop takes the subscriber down before the watcher.
        let mut services = ServiceManager::new(self.config.shutdown_grace);
        services.add(Box::new(watcher));
        services.add(Box::new(subscriber));

        services.start_all().await?;
        if let Err(e) = services.await_healthy(self.startup_timeout).await {
            if let Err(stop_err) = services.stop_all().await {
                error!(error = %stop_err, "Failed to stop services after unhealthy start");
            }
            return Err(e.into());
        }

        info!(
            topic = %self.config.broker.topic,
            action = ?controller.action(),
            dir = %self.config.watcher.dir.display(),
            "CompanionRuntime started"
        );

        Ok(CompanionRuntime {
            services,
            controller,
            monitor_shutdown,
            grace: self.config.shutdown_grace,
        })
    }
}

/// Running subscriber and watcher.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct CompanionRuntime {
    services: ServiceManager,
    controller: Arc<TriggerController>,
    monitor_shutdown: CancellationToken,
    grace: Duration,
}

impl CompanionRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> CompanionRuntimeBuilder {
        CompanionRuntimeBuilder::new()
    }

    /// The trigger handler registered on the broker topic.
    pub fn trigger(&self) -> &Arc<TriggerController> {
        &self.controller
    }

    /// Name and health of every hosted service.
    pub fn health_report(&self) -> Vec<(String, ServiceHealth)> {
        self.services.health_report()
    }

    /// Check if every hosted service is still running.
    pub fn is_running(&self) -> bool {
        self.services
            .health_report()
            .iter()
            .all(|(_, health)| *health == ServiceHealth::Running)
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the subscriber, then the watcher, then cancels runs still being
    /// waited on. All steps together get the configured grace period.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("CompanionRuntime shutting down...");

        let deadline = Instant::now() + self.grace;
        let stopped = self.services.stop_all_by(deadline).await;
        self.controller
            .shutdown(deadline.saturating_duration_since(Instant::now()))
            .await;
        self.monitor_shutdown.cancel();

        match stopped {
            Ok(()) => {
                info!("CompanionRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "CompanionRuntime shutdown incomplete");
                Err(e.into())
            }
        }
    }
}

/// Turn the configured action into a trigger action.
pub fn action_from_config(trigger: &TriggerConfig) -> std::result::Result<TriggerAction, DescriptorError> {
    match &trigger.action {
        ActionConfig::Workflow { template_id } => Ok(TriggerAction::Workflow {
            template_id: template_id.clone(),
        }),
        ActionConfig::Operation {
            target,
            inputs,
            outputs,
        } => {
            let descriptor = OperationDescriptor::builder(target.clone(), target.clone())
                .inputs(inputs.iter().cloned())
                .outputs(outputs.iter().cloned())
                .poll_interval(trigger.poll_interval)
                .timeout(trigger.operation_timeout)
                .build()?;
            Ok(TriggerAction::Operation {
                descriptor: Arc::new(descriptor),
            })
        }
    }
}

fn dedup_from_config(trigger: &TriggerConfig) -> Option<TriggerDeduplicator> {
    let dedup = trigger.dedup.as_ref()?;
    let deduplicator = TriggerDeduplicator::new(dedup.kind);
    Some(match &dedup.field {
        Some(field) => deduplicator.with_field(field.clone()),
        None => deduplicator,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use trigflow_platform::MockPlatform;

    use super::*;
    use crate::broker::MockBroker;
    use crate::dedup::CounterKind;
    use crate::descriptor::VariableBinding;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned()).unwrap()
    }

    #[test]
    fn test_builder_build_fails_without_config() {
        let result = CompanionRuntime::builder()
            .platform(Arc::new(MockPlatform::new()))
            .build();
        assert!(result.is_err());
        assert!(result.err().unwrap().to_string().contains("config"));
    }

    #[test]
    fn test_builder_build_fails_without_platform() {
        let result = CompanionRuntime::builder()
            .config(config(&[
                ("TRIGFLOW_WORKFLOW", "inspect"),
                ("TRIGFLOW_WATCH_DIR", "/tmp/incoming"),
            ]))
            .build();
        assert!(result.is_err());
        assert!(result.err().unwrap().to_string().contains("platform"));
    }

    #[test]
    fn test_builder_rejects_unsupported_broker_scheme() {
        let mut config = config(&[
            ("TRIGFLOW_WORKFLOW", "inspect"),
            ("TRIGFLOW_WATCH_DIR", "/tmp/incoming"),
        ]);
        config.broker.url = "ws://broker:8080".to_string();

        let result = CompanionRuntime::builder()
            .config(config)
            .platform(Arc::new(MockPlatform::new()))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_accepts_injected_transport() {
        let (broker, _handle) = MockBroker::new();
        let result = CompanionRuntime::builder()
            .config(config(&[
                ("TRIGFLOW_WORKFLOW", "inspect"),
                ("TRIGFLOW_WATCH_DIR", "/tmp/incoming"),
            ]))
            .platform(Arc::new(MockPlatform::new()))
            .transport(Box::new(broker))
            .startup_timeout(Duration::from_secs(1))
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_action_from_config_operation() {
        let config = config(&[
            ("TRIGFLOW_OPERATION", "ops:Measure"),
            ("TRIGFLOW_INPUTS", "width=vars:Width"),
            ("TRIGFLOW_OUTPUTS", "area=vars:Area"),
            ("TRIGFLOW_OPERATION_TIMEOUT_MS", "2500"),
            ("TRIGFLOW_WATCH_DIR", "/tmp/incoming"),
        ]);

        match action_from_config(&config.trigger).unwrap() {
            TriggerAction::Operation { descriptor } => {
                assert_eq!(descriptor.target(), "ops:Measure");
                assert_eq!(descriptor.inputs(), [VariableBinding::new("width", "vars:Width")]);
                assert_eq!(descriptor.outputs(), [VariableBinding::new("area", "vars:Area")]);
                assert_eq!(descriptor.timeout(), Duration::from_millis(2500));
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_dedup_from_config() {
        let with_dedup = config(&[
            ("TRIGFLOW_WORKFLOW", "inspect"),
            ("TRIGFLOW_WATCH_DIR", "/tmp/incoming"),
            ("TRIGFLOW_COUNTER_KIND", "timestamp"),
        ]);
        let dedup = dedup_from_config(&with_dedup.trigger).unwrap();
        assert_eq!(dedup.kind(), CounterKind::Timestamp);

        let without = config(&[
            ("TRIGFLOW_WORKFLOW", "inspect"),
            ("TRIGFLOW_WATCH_DIR", "/tmp/incoming"),
            ("TRIGFLOW_DEDUP", "false"),
        ]);
        assert!(dedup_from_config(&without.trigger).is_none());
    }
}
