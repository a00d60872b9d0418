// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the platform client.

use std::time::Duration;

use url::Url;

use crate::error::{PlatformError, Result};

/// Configuration for the HttpPlatform client.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// Base URL of the platform API.
    pub base_url: Url,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Request timeout.
    pub request_timeout: Duration,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse("http://127.0.0.1:12985").expect("static URL is valid"),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl PlatformConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration from environment variables.
    ///
    /// Environment variables:
    /// - `TRIGFLOW_PLATFORM_URL`: Base URL (default: "http://127.0.0.1:12985")
    /// - `TRIGFLOW_PLATFORM_CONNECT_TIMEOUT_MS`: Connection timeout in milliseconds (default: 10000)
    /// - `TRIGFLOW_PLATFORM_REQUEST_TIMEOUT_MS`: Request timeout in milliseconds (default: 30000)
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("TRIGFLOW_PLATFORM_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:12985".to_string());
        let base_url = Url::parse(&base_url)
            .map_err(|e| PlatformError::Config(format!("invalid TRIGFLOW_PLATFORM_URL: {}", e)))?;

        let connect_timeout_ms: u64 = std::env::var("TRIGFLOW_PLATFORM_CONNECT_TIMEOUT_MS")
            .unwrap_or_else(|_| "10000".to_string())
            .parse()
            .map_err(|e| {
                PlatformError::Config(format!("invalid TRIGFLOW_PLATFORM_CONNECT_TIMEOUT_MS: {}", e))
            })?;

        let request_timeout_ms: u64 = std::env::var("TRIGFLOW_PLATFORM_REQUEST_TIMEOUT_MS")
            .unwrap_or_else(|_| "30000".to_string())
            .parse()
            .map_err(|e| {
                PlatformError::Config(format!("invalid TRIGFLOW_PLATFORM_REQUEST_TIMEOUT_MS: {}", e))
            })?;

        Ok(Self {
            base_url,
            connect_timeout: Duration::from_millis(connect_timeout_ms),
            request_timeout: Duration::from_millis(request_timeout_ms),
        })
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: Url) -> Self {
        self.base_url = url;
        self
    }

    /// Set the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
