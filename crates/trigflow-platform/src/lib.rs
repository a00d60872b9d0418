// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigflow Platform client
//!
//! Client for the remote platform that executes workflows and operations and
//! stores element values and file attachments.
//!
//! The controllers in `trigflow` only ever see the [`RemotePlatform`] trait:
//! - Reference resolution (`param:welder:Quantity` -> element)
//! - Element values (read, write) and attachments (upload)
//! - Runs (start a workflow, invoke an operation, poll status, fetch outputs)
//!
//! [`HttpPlatform`] talks to a live platform over HTTP; [`MockPlatform`] is a
//! scripted in-memory stand-in for tests.
//!
//! # Example
//!
//! ```no_run
//! use trigflow_platform::{HttpPlatform, RemotePlatform, RunStatus};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let platform = HttpPlatform::from_env()?;
//!
//! let run = platform.start_workflow("surface-inspection").await?;
//! loop {
//!     let report = platform.poll_status(&run).await?;
//!     if report.status.is_terminal() {
//!         println!("{} finished: {}", run, report.status);
//!         break;
//!     }
//!     tokio::time::sleep(std::time::Duration::from_secs(3)).await;
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;
mod mock;
mod platform;
mod types;

pub use client::HttpPlatform;
pub use config::PlatformConfig;
pub use error::{PlatformError, Result};
pub use mock::{MockPlatform, PollStep, StartRecord, UploadRecord};
pub use platform::RemotePlatform;
pub use types::{
    ElementHandle, OperationOutputs, RunHandle, RunKind, RunStatus, StartOperationRequest,
    StatusReport,
};
