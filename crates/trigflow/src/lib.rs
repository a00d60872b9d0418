// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigflow - Broker-Triggered Automation
//!
//! This crate hosts the long-running controllers that connect a
//! publish/subscribe broker and a local directory to a remote automation
//! platform: broker messages start workflows or operations, and files
//! dropped into a directory become platform attachments.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   message   ┌───────────────────────┐
//! │ MQTT broker  │────────────►│ ReconnectingSubscriber│
//! └──────────────┘             └───────────┬───────────┘
//!                                          │ on_message
//!                                          ▼
//!                              ┌───────────────────────┐
//!                              │  TriggerController    │
//!                              │  (TriggerDeduplicator)│
//!                              └───────────┬───────────┘
//!                                          │ spawn per accepted trigger
//!                                          ▼
//!                              ┌───────────────────────┐      ┌──────────────┐
//!                              │  OperationInvoker     │─────►│              │
//!                              └───────────┬───────────┘      │   Remote     │
//!                                          │ track            │   platform   │
//!                                          ▼                  │              │
//!                              ┌───────────────────────┐ poll │              │
//!                              │OperationStatusMonitor │─────►│              │
//!                              └───────────┬───────────┘      │              │
//!                                          │ events           │              │
//!                                          ▼                  │              │
//!                                    RunListener              │              │
//!                                                             │              │
//! ┌──────────────┐   create    ┌───────────────────────┐upload│              │
//! │  directory   │────────────►│ DirectoryUploadWatcher│─────►│              │
//! └──────────────┘             └───────────────────────┘      └──────────────┘
//! ```
//!
//! The subscriber and the watcher are [`lifecycle::Service`]s hosted by
//! [`runtime::CompanionRuntime`], which starts both, waits for them to report
//! healthy, and stops them within a grace period.
//!
//! # Run Lifecycle
//!
//! ```text
//! Starting ──► Started ──► Completed
//!     │           │
//!     └───────────┴──────► Failed
//! ```
//!
//! Every tracked run reports each event at most once, in this order, and
//! reaches exactly one terminal event unless its monitor is stopped first.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TRIGFLOW_BROKER_URL` | No | `tcp://localhost:1883` | Broker URL |
//! | `TRIGFLOW_CLIENT_ID` | No | `trigflow` | Broker client identifier |
//! | `TRIGFLOW_TOPIC` | No | `trigflow/trigger` | Trigger topic filter |
//! | `TRIGFLOW_WORKFLOW` | Yes* | - | Workflow template started per trigger |
//! | `TRIGFLOW_OPERATION` | Yes* | - | Operation reference invoked per trigger |
//! | `TRIGFLOW_INPUTS` / `TRIGFLOW_OUTPUTS` | No | - | `name=expr;...` bindings |
//! | `TRIGFLOW_DEDUP` | No | `true` | Counter deduplication |
//! | `TRIGFLOW_POLL_INTERVAL_MS` | No | `3000` | Status poll interval |
//! | `TRIGFLOW_OPERATION_TIMEOUT_MS` | No | `60000` | Operation timeout |
//! | `TRIGFLOW_WATCH_DIR` | Yes | - | Directory watched for new files |
//! | `TRIGFLOW_FILE_REF` | No | `attachments:Upload` | Attachment reference |
//!
//! \* exactly one of the two. See [`config`] for the complete list.
//!
//! # Modules
//!
//! - [`broker`]: Broker transport trait, MQTT and mock transports
//! - [`subscriber`]: Resilient topic subscriber
//! - [`dedup`]: Counter-based trigger deduplication
//! - [`descriptor`]: Operation descriptors and variable bindings
//! - [`invoker`]: Starting operations and waiting for them
//! - [`monitor`]: Run status polling and lifecycle events
//! - [`trigger`]: Broker message handler starting runs
//! - [`watcher`]: Directory upload watcher
//! - [`lifecycle`]: Service start/stop/health contract
//! - [`runtime`]: Embeddable runtime hosting all services

#![warn(missing_docs)]

/// Broker transports (MQTT, mock).
pub mod broker;

/// Configuration loaded from environment variables.
pub mod config;

/// Counter-based trigger deduplication.
pub mod dedup;

/// Operation descriptors.
pub mod descriptor;

/// Error types for trigflow.
pub mod error;

/// Operation invocation.
pub mod invoker;

/// Service lifecycle contract.
pub mod lifecycle;

/// Run status monitoring.
pub mod monitor;

/// Embeddable runtime.
pub mod runtime;

/// Topic subscriber with reconnect handling.
pub mod subscriber;

/// Broker-triggered run dispatch.
pub mod trigger;

/// Directory upload watcher.
pub mod watcher;

pub use config::Config;
pub use error::Error;
