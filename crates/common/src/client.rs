// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Bridge Contributors

// Tunnel Bridge - Daemon Client Module
// Shared daemon connection logic for consumers (CLI, GUI shells)

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;

use crate::config::DEFAULT_LISTEN_ADDRESS;
use crate::types::{CommandRequest, CommandResult};

/// Environment variable overriding the daemon URL
pub const BRIDGE_URL_ENV: &str = "BRIDGE_URL";

/// Client configuration for connecting to the daemon
#[derive(Debug, Clone)]
pub struct BridgeClientConfig {
    /// Base URL, e.g. "http://127.0.0.1:3443"
    pub base_url: String,
    /// Per-request timeout; commands like connect can take a while
    pub request_timeout: Option<Duration>,
}

impl Default for BridgeClientConfig {
    fn default() -> Self {
        Self {
            base_url: format!("http://{}", DEFAULT_LISTEN_ADDRESS),
            request_timeout: None,
        }
    }
}

impl BridgeClientConfig {
    /// Use `BRIDGE_URL` when set, the default loopback address otherwise
    pub fn from_env() -> Self {
        match std::env::var(BRIDGE_URL_ENV) {
            Ok(url) if !url.trim().is_empty() => Self::with_base_url(url),
            _ => Self::default(),
        }
    }

    pub fn with_base_url(url: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base_url(&url.into()),
            ..Self::default()
        }
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Accept "host:port" as well as full URLs; strip trailing slashes
fn normalize_base_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

/// Thin HTTP client for the bridge command API
#[derive(Debug, Clone)]
pub struct BridgeClient {
    config: BridgeClientConfig,
    http: Client,
}

impl BridgeClient {
    pub fn new(config: BridgeClientConfig) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().context("Failed to create HTTP client")?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &BridgeClientConfig {
        &self.config
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    /// Check that the daemon is reachable
    pub async fn health(&self) -> Result<bool> {
        let response = self
            .http
            .get(self.config.endpoint("/api/health"))
            .send()
            .await
            .context("Failed to reach bridge daemon")?;
        Ok(response.status().is_success())
    }

    /// Send one command and return its result
    ///
    /// Failed commands come back as `CommandResult { success: false, .. }` with a
    /// non-2xx status; only transport-level problems become `Err`.
    pub async fn command(&self, request: &CommandRequest) -> Result<CommandResult> {
        let response = self
            .http
            .post(self.config.endpoint("/api/command"))
            .json(request)
            .send()
            .await
            .with_context(|| format!("Failed to send '{}' command to bridge daemon", request.name()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read daemon response")?;

        serde_json::from_str::<CommandResult>(&body).with_context(|| {
            format!("Unexpected daemon response ({}): {}", status, body)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeClientConfig::default();
        assert_eq!(config.base_url, "http://127.0.0.1:3443");
        assert_eq!(
            config.endpoint("/api/events"),
            "http://127.0.0.1:3443/api/events"
        );
    }

    #[test]
    fn test_base_url_normalization() {
        assert_eq!(
            BridgeClientConfig::with_base_url("localhost:9000/").base_url,
            "http://localhost:9000"
        );
        assert_eq!(
            BridgeClientConfig::with_base_url("http://127.0.0.1:3443").base_url,
            "http://127.0.0.1:3443"
        );
    }
}
