// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Session configuration for the Loki log shipper.
//!
//! A [`Config`] is immutable once a session starts. It can be built in code
//! starting from [`Config::new`], or read from `LOKI_*` environment variables
//! with [`Config::from_env`]. Either way it must pass [`Config::validate`]
//! before a session accepts it.

use crate::error::Error;
use std::env;
use std::time::Duration;
use url::Url;

pub const DEFAULT_SERVICE_NAME: &str = "unknown_service";
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRY_COUNT: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// When the time-based flush fires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FlushPolicy {
    /// The timer restarts on every write and fires after a quiet period.
    #[default]
    Debounce,
    /// The timer fires every interval regardless of write activity.
    FixedInterval,
}

impl FlushPolicy {
    /// Parses `debounce` or `fixed` (case-insensitive).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "debounce" => Some(Self::Debounce),
            "fixed" | "fixed_interval" | "interval" => Some(Self::FixedInterval),
            _ => None,
        }
    }
}

/// Configuration for one logging session.
#[derive(Debug, Clone)]
pub struct Config {
    /// Push endpoint, e.g. `http://localhost:3100/loki/api/v1/push`
    pub url: Url,
    /// Value of the `service_name` stream label
    pub service_name: String,
    /// Number of buffered lines that triggers an immediate flush
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub flush_policy: FlushPolicy,
    /// Total number of delivery attempts per batch. Zero is treated as one:
    /// every batch is sent at least once (see [`Config::max_attempts`]).
    pub retry_count: u32,
    /// Attempt `i` waits `retry_backoff_base * 2^i` before sending
    pub retry_backoff_base: Duration,
    /// Sent as `Authorization: Bearer <token>` when set
    pub access_token: Option<String>,
    /// Gzip request bodies
    pub use_compression: bool,
    pub request_timeout: Duration,
    /// A connection unused for longer than this is considered dead
    pub connection_idle_timeout: Duration,
    /// Number of batches that may wait for delivery before new ones are dropped
    pub queue_capacity: usize,
    pub https_proxy: Option<String>,
}

impl Config {
    /// Creates a configuration with default settings for the given endpoint.
    pub fn new(url: &str) -> Result<Self, Error> {
        let url = Url::parse(url)?;
        Ok(Self {
            url,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_policy: FlushPolicy::default(),
            retry_count: DEFAULT_RETRY_COUNT,
            retry_backoff_base: DEFAULT_RETRY_BACKOFF_BASE,
            access_token: None,
            use_compression: true,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connection_idle_timeout: DEFAULT_CONNECTION_IDLE_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            https_proxy: None,
        })
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("LOKI_URL")
            .ok_or_else(|| Error::InvalidConfig("LOKI_URL is not set".to_string()))?;
        let mut config = Self::new(url.trim())?;

        if let Some(name) = lookup("LOKI_SERVICE_NAME") {
            config.service_name = name;
        }
        if let Some(batch_size) = lookup("LOKI_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            config.batch_size = batch_size;
        }
        if let Some(ms) = lookup("LOKI_FLUSH_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            config.flush_interval = Duration::from_millis(ms);
        }
        if let Some(policy) = lookup("LOKI_FLUSH_POLICY").and_then(|v| FlushPolicy::parse(&v)) {
            config.flush_policy = policy;
        }
        if let Some(retry_count) = lookup("LOKI_RETRY_COUNT").and_then(|v| v.parse().ok()) {
            config.retry_count = retry_count;
        }
        config.access_token = lookup("LOKI_ACCESS_TOKEN").filter(|v| !v.trim().is_empty());
        if let Some(use_compression) = lookup("LOKI_USE_COMPRESSION") {
            config.use_compression = use_compression.to_lowercase() != "false";
        }
        if let Some(ms) = lookup("LOKI_REQUEST_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            config.request_timeout = Duration::from_millis(ms);
        }
        config.https_proxy = lookup("LOKI_PROXY_HTTPS").or_else(|| lookup("HTTPS_PROXY"));

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), Error> {
        match self.url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::InvalidConfig(format!(
                    "Unsupported URL scheme '{other}', expected http or https"
                )));
            }
        }

        if self.url.host_str().map_or(true, str::is_empty) {
            return Err(Error::InvalidConfig(
                "Destination URL must include a host".to_string(),
            ));
        }

        if self.batch_size == 0 {
            return Err(Error::InvalidConfig(
                "Batch size must be at least 1".to_string(),
            ));
        }

        if self.flush_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "Flush interval must be greater than 0".to_string(),
            ));
        }

        if self.service_name.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "Service name cannot be empty".to_string(),
            ));
        }

        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "Queue capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Number of delivery attempts per batch. A retry count of zero still sends once.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.max(1)
    }
}
