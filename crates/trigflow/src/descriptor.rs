// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Declarative description of an operation invocation.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Maps an operation variable to a platform element reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableBinding {
    /// Operation variable name.
    pub name: String,
    /// Reference expression of the element holding (or receiving) the value.
    pub source: String,
    /// Human-readable description.
    pub description: Option<String>,
    /// Whether the invocation fails when `source` does not resolve.
    pub required: bool,
}

impl VariableBinding {
    /// Create a required binding.
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            description: None,
            required: true,
        }
    }

    /// Create a binding that is skipped when its source does not resolve.
    pub fn optional(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::new(name, source)
        }
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Errors raised while building a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    /// The target reference is empty.
    #[error("operation '{0}' has no target reference")]
    MissingTarget(String),
    /// Two bindings on the same side share a name.
    #[error("duplicate {side} binding '{name}'")]
    DuplicateBinding {
        /// `input` or `output`.
        side: &'static str,
        /// The repeated variable name.
        name: String,
    },
    /// A duration is zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Immutable specification of a remote operation invocation.
///
/// Bindings hold reference expressions only; they are resolved against the
/// platform each time the descriptor is invoked, so one descriptor serves
/// every trigger for the lifetime of the process.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationDescriptor {
    id: String,
    target: String,
    inputs: Vec<VariableBinding>,
    outputs: Vec<VariableBinding>,
    poll_interval: Duration,
    timeout: Duration,
    options: BTreeMap<String, String>,
    labels: BTreeMap<String, String>,
}

impl OperationDescriptor {
    /// Start building a descriptor for the operation element `target`.
    pub fn builder(id: impl Into<String>, target: impl Into<String>) -> OperationDescriptorBuilder {
        OperationDescriptorBuilder {
            id: id.into(),
            target: target.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
            options: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }

    /// Identifier used in logs.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Reference expression of the operation element.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Input bindings, in declaration order.
    pub fn inputs(&self) -> &[VariableBinding] {
        &self.inputs
    }

    /// Output bindings, in declaration order.
    pub fn outputs(&self) -> &[VariableBinding] {
        &self.outputs
    }

    /// Status poll interval.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Time allowed from start to a terminal status.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Options forwarded with the start request.
    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    /// Labels forwarded with the start request.
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }
}

/// Builder for [`OperationDescriptor`].
#[derive(Debug, Clone)]
pub struct OperationDescriptorBuilder {
    id: String,
    target: String,
    inputs: Vec<VariableBinding>,
    outputs: Vec<VariableBinding>,
    poll_interval: Duration,
    timeout: Duration,
    options: BTreeMap<String, String>,
    labels: BTreeMap<String, String>,
}

impl OperationDescriptorBuilder {
    /// Add an input binding.
    pub fn input(mut self, binding: VariableBinding) -> Self {
        self.inputs.push(binding);
        self
    }

    /// Add several input bindings.
    pub fn inputs(mut self, bindings: impl IntoIterator<Item = VariableBinding>) -> Self {
        self.inputs.extend(bindings);
        self
    }

    /// Add an output binding.
    pub fn output(mut self, binding: VariableBinding) -> Self {
        self.outputs.push(binding);
        self
    }

    /// Add several output bindings.
    pub fn outputs(mut self, bindings: impl IntoIterator<Item = VariableBinding>) -> Self {
        self.outputs.extend(bindings);
        self
    }

    /// Set the status poll interval.
    ///
    /// Default: 1 second
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the operation timeout.
    ///
    /// Default: 1 minute
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add a free-form option (e.g. `loglevel=info`).
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Add a free-form label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Validate and freeze the descriptor.
    pub fn build(self) -> Result<OperationDescriptor, DescriptorError> {
        if self.target.trim().is_empty() {
            return Err(DescriptorError::MissingTarget(self.id));
        }
        check_unique("input", &self.inputs)?;
        check_unique("output", &self.outputs)?;
        if self.poll_interval.is_zero() {
            return Err(DescriptorError::ZeroDuration("poll interval"));
        }
        if self.timeout.is_zero() {
            return Err(DescriptorError::ZeroDuration("timeout"));
        }

        Ok(OperationDescriptor {
            id: self.id,
            target: self.target,
            inputs: self.inputs,
            outputs: self.outputs,
            poll_interval: self.poll_interval,
            timeout: self.timeout,
            options: self.options,
            labels: self.labels,
        })
    }
}

fn check_unique(side: &'static str, bindings: &[VariableBinding]) -> Result<(), DescriptorError> {
    let mut seen = HashSet::new();
    for binding in bindings {
        if !seen.insert(binding.name.as_str()) {
            return Err(DescriptorError::DuplicateBinding {
                side,
                name: binding.name.clone(),
            });
        }
    }
    Ok(())
}
