// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for trigflow.

use std::path::PathBuf;
use std::time::Duration;

use crate::dedup::CounterKind;
use crate::descriptor::VariableBinding;

/// Controller configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Broker connection and trigger topic.
    pub broker: BrokerConfig,
    /// What each accepted trigger does.
    pub trigger: TriggerConfig,
    /// Directory upload watcher.
    pub watcher: WatcherConfig,
    /// Grace period for the whole shutdown.
    pub shutdown_grace: Duration,
}

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker URL (`tcp://host:port` or `mqtt://host:port`).
    pub url: String,
    /// Client identifier, reused across reconnects.
    pub client_id: String,
    /// Topic (or topic filter) carrying triggers.
    pub topic: String,
    /// Start every connection with a clean session.
    pub clean_session: bool,
    /// Keep-alive interval.
    pub keep_alive: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "tcp://localhost:1883".to_string(),
            client_id: "trigflow".to_string(),
            topic: "trigflow/trigger".to_string(),
            clean_session: true,
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// The remote procedure started per accepted trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionConfig {
    /// Start a workflow from a template.
    Workflow {
        /// Workflow template identifier.
        template_id: String,
    },
    /// Invoke an operation element with variable bindings.
    Operation {
        /// Reference expression of the operation element.
        target: String,
        /// Input bindings, in order.
        inputs: Vec<VariableBinding>,
        /// Output bindings, in order.
        outputs: Vec<VariableBinding>,
    },
}

/// Counter deduplication settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupConfig {
    /// Integer or timestamp counters.
    pub kind: CounterKind,
    /// JSON field holding the counter when the payload is an object.
    pub field: Option<String>,
}

/// Trigger handling settings.
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// Workflow or operation to start.
    pub action: ActionConfig,
    /// Status poll interval for started runs.
    pub poll_interval: Duration,
    /// Operation timeout.
    pub operation_timeout: Duration,
    /// Counter deduplication, `None` to act on every message.
    pub dedup: Option<DedupConfig>,
}

/// Directory upload watcher settings.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Directory watched for new files.
    pub dir: PathBuf,
    /// Reference expression of the remote attachment slot.
    pub file_ref: String,
    /// Bounded wait between checks of the directory and the stop signal.
    pub poll_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = BrokerConfig::default();
        let broker = BrokerConfig {
            url: lookup("TRIGFLOW_BROKER_URL").unwrap_or(defaults.url),
            client_id: lookup("TRIGFLOW_CLIENT_ID").unwrap_or(defaults.client_id),
            topic: lookup("TRIGFLOW_TOPIC").unwrap_or(defaults.topic),
            clean_session: parse_bool(&lookup, "TRIGFLOW_CLEAN_SESSION", true)?,
            keep_alive: parse_millis(&lookup, "TRIGFLOW_KEEP_ALIVE_MS", 30_000)?,
        };
        if broker.topic.is_empty() {
            return Err(ConfigError::Invalid {
                var: "TRIGFLOW_TOPIC",
                message: "topic must not be empty".to_string(),
            });
        }

        let action = match (lookup("TRIGFLOW_WORKFLOW"), lookup("TRIGFLOW_OPERATION")) {
            (Some(template_id), None) => ActionConfig::Workflow { template_id },
            (None, Some(target)) => ActionConfig::Operation {
                target,
                inputs: parse_bindings(&lookup, "TRIGFLOW_INPUTS")?,
                outputs: parse_bindings(&lookup, "TRIGFLOW_OUTPUTS")?,
            },
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid {
                    var: "TRIGFLOW_OPERATION",
                    message: "set either TRIGFLOW_WORKFLOW or TRIGFLOW_OPERATION, not both"
                        .to_string(),
                });
            }
            (None, None) => {
                return Err(ConfigError::MissingEnvVar(
                    "TRIGFLOW_WORKFLOW or TRIGFLOW_OPERATION",
                ));
            }
        };

        let dedup = if parse_bool(&lookup, "TRIGFLOW_DEDUP", true)? {
            let kind = match lookup("TRIGFLOW_COUNTER_KIND").as_deref() {
                None | Some("integer") => CounterKind::Integer,
                Some("timestamp") => CounterKind::Timestamp,
                Some(other) => {
                    return Err(ConfigError::Invalid {
                        var: "TRIGFLOW_COUNTER_KIND",
                        message: format!("expected 'integer' or 'timestamp', got '{}'", other),
                    });
                }
            };
            Some(DedupConfig {
                kind,
                field: lookup("TRIGFLOW_COUNTER_FIELD"),
            })
        } else {
            None
        };

        let trigger = TriggerConfig {
            action,
            poll_interval: parse_millis(&lookup, "TRIGFLOW_POLL_INTERVAL_MS", 3_000)?,
            operation_timeout: parse_millis(&lookup, "TRIGFLOW_OPERATION_TIMEOUT_MS", 60_000)?,
            dedup,
        };

        let watcher = WatcherConfig {
            dir: lookup("TRIGFLOW_WATCH_DIR")
                .map(PathBuf::from)
                .ok_or(ConfigError::MissingEnvVar("TRIGFLOW_WATCH_DIR"))?,
            file_ref: lookup("TRIGFLOW_FILE_REF")
                .unwrap_or_else(|| "attachments:Upload".to_string()),
            poll_interval: parse_millis(&lookup, "TRIGFLOW_WATCH_POLL_MS", 1_000)?,
        };

        Ok(Self {
            broker,
            trigger,
            watcher,
            shutdown_grace: parse_millis(&lookup, "TRIGFLOW_SHUTDOWN_GRACE_MS", 10_000)?,
        })
    }
}

fn parse_bool<F>(lookup: &F, var: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var).as_deref() {
        None => Ok(default),
        Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            var,
            message: format!("expected a boolean, got '{}'", other),
        }),
    }
}

fn parse_millis<F>(lookup: &F, var: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let millis = match lookup(var) {
        None => default,
        Some(raw) => raw.parse::<u64>().map_err(|e| ConfigError::Invalid {
            var,
            message: e.to_string(),
        })?,
    };
    if millis == 0 {
        return Err(ConfigError::Invalid {
            var,
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_millis(millis))
}

/// Parse `name=expression;name=expression` into required bindings.
fn parse_bindings<F>(lookup: &F, var: &'static str) -> Result<Vec<VariableBinding>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(Vec::new());
    };

    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, source) = entry.split_once('=').ok_or_else(|| ConfigError::Invalid {
                var,
                message: format!("binding '{}' is not name=expression", entry),
            })?;
            let (name, source) = (name.trim(), source.trim());
            if name.is_empty() || source.is_empty() {
                return Err(ConfigError::Invalid {
                    var,
                    message: format!("binding '{}' has an empty side", entry),
                });
            }
            Ok(VariableBinding::new(name, source))
        })
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable has an unusable value.
    #[error("Invalid value for {var}: {message}")]
    Invalid {
        /// The offending variable.
        var: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults_for_workflow_mode() {
        let config = load(&[
            ("TRIGFLOW_WORKFLOW", "surface-inspection"),
            ("TRIGFLOW_WATCH_DIR", "/tmp/upper"),
        ])
        .unwrap();

        assert_eq!(config.broker.url, "tcp://localhost:1883");
        assert_eq!(config.broker.client_id, "trigflow");
        assert!(config.broker.clean_session);
        assert_eq!(
            config.trigger.action,
            ActionConfig::Workflow {
                template_id: "surface-inspection".to_string()
            }
        );
        assert_eq!(config.trigger.poll_interval, Duration::from_secs(3));
        assert_eq!(config.trigger.operation_timeout, Duration::from_secs(60));
        assert_eq!(
            config.trigger.dedup,
            Some(DedupConfig {
                kind: CounterKind::Integer,
                field: None
            })
        );
        assert_eq!(config.watcher.dir, PathBuf::from("/tmp/upper"));
        assert_eq!(config.watcher.poll_interval, Duration::from_secs(1));
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
    }

    #[test]
    fn test_operation_mode_parses_bindings() {
        let config = load(&[
            ("TRIGFLOW_OPERATION", "op:welder:PredictTotalQuantity"),
            (
                "TRIGFLOW_INPUTS",
                "quantity = param:welder:Quantity; rate=param:welder:Rate;",
            ),
            ("TRIGFLOW_OUTPUTS", "prediction=param:welder:Predicted"),
            ("TRIGFLOW_WATCH_DIR", "/tmp/x"),
        ])
        .unwrap();

        let ActionConfig::Operation {
            target,
            inputs,
            outputs,
        } = config.trigger.action
        else {
            panic!("expected operation action");
        };
        assert_eq!(target, "op:welder:PredictTotalQuantity");
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0].name, "quantity");
        assert_eq!(inputs[0].source, "param:welder:Quantity");
        assert_eq!(inputs[1].name, "rate");
        assert_eq!(outputs[0].source, "param:welder:Predicted");
    }

    #[test]
    fn test_missing_action() {
        let err = load(&[("TRIGFLOW_WATCH_DIR", "/tmp/x")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(_)));
    }

    #[test]
    fn test_both_actions_rejected() {
        let err = load(&[
            ("TRIGFLOW_WORKFLOW", "wf"),
            ("TRIGFLOW_OPERATION", "op"),
            ("TRIGFLOW_WATCH_DIR", "/tmp/x"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_missing_watch_dir() {
        let err = load(&[("TRIGFLOW_WORKFLOW", "wf")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar("TRIGFLOW_WATCH_DIR")));
    }

    #[test]
    fn test_dedup_disabled_and_timestamp_kind() {
        let off = load(&[
            ("TRIGFLOW_WORKFLOW", "wf"),
            ("TRIGFLOW_WATCH_DIR", "/tmp/x"),
            ("TRIGFLOW_DEDUP", "false"),
        ])
        .unwrap();
        assert!(off.trigger.dedup.is_none());

        let ts = load(&[
            ("TRIGFLOW_WORKFLOW", "wf"),
            ("TRIGFLOW_WATCH_DIR", "/tmp/x"),
            ("TRIGFLOW_COUNTER_KIND", "timestamp"),
            ("TRIGFLOW_COUNTER_FIELD", "capturedAt"),
        ])
        .unwrap();
        let dedup = ts.trigger.dedup.unwrap();
        assert_eq!(dedup.kind, CounterKind::Timestamp);
        assert_eq!(dedup.field.as_deref(), Some("capturedAt"));
    }

    #[test]
    fn test_invalid_values() {
        assert!(
            load(&[
                ("TRIGFLOW_WORKFLOW", "wf"),
                ("TRIGFLOW_WATCH_DIR", "/tmp/x"),
                ("TRIGFLOW_POLL_INTERVAL_MS", "soon"),
            ])
            .is_err()
        );
        assert!(
            load(&[
                ("TRIGFLOW_WORKFLOW", "wf"),
                ("TRIGFLOW_WATCH_DIR", "/tmp/x"),
                ("TRIGFLOW_WATCH_POLL_MS", "0"),
            ])
            .is_err()
        );
        assert!(
            load(&[
                ("TRIGFLOW_OPERATION", "op"),
                ("TRIGFLOW_WATCH_DIR", "/tmp/x"),
                ("TRIGFLOW_INPUTS", "just-a-name"),
            ])
            .is_err()
        );
    }
}
