//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the HTTP
//! fleet. All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::handlers::HandlerRow;

/// Default number of HTTP workers.
pub const DEFAULT_HTTP_WORKERS: i64 = 10;

/// Root configuration for the HTTP fleet.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct HttpdConfig {
    /// Worker fleet sizing and database scope.
    pub fleet: FleetConfig,

    /// Reload protocol timings.
    pub reload: ReloadConfig,

    /// Listening socket and per-request limits.
    pub listener: ListenerConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Seed rows for the handler table.
    pub handlers: Vec<HandlerRow>,
}

impl HttpdConfig {
    /// Validated worker count. Callers validate first; out-of-range values clamp.
    pub fn worker_count(&self) -> usize {
        self.fleet.http_workers.clamp(1, i32::MAX as i64) as usize
    }
}

/// Worker fleet configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct FleetConfig {
    /// Number of HTTP workers, in `[1, i32::MAX]`. Reloadable.
    pub http_workers: i64,

    /// Database the fleet serves; scopes the shared reload semaphore.
    pub database: String,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            http_workers: DEFAULT_HTTP_WORKERS,
            database: "postgres".to_string(),
        }
    }
}

/// Reload protocol configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ReloadConfig {
    /// Window in which reload edges coalesce into one cycle.
    pub debounce_ms: u64,

    /// Interval at which the supervisor samples the reload semaphore.
    pub semaphore_poll_ms: u64,

    /// How long a worker waits for in-flight connections on a retired socket.
    pub drain_grace_secs: u64,

    /// How long the supervisor waits for a worker to acknowledge a drain.
    pub drain_timeout_secs: u64,
}

impl ReloadConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn semaphore_poll(&self) -> Duration {
        Duration::from_millis(self.semaphore_poll_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            semaphore_poll_ms: 1000,
            drain_grace_secs: 5,
            drain_timeout_secs: 10,
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Listen backlog for every bound socket.
    pub backlog: i32,

    /// Bind attempts before an address is reported as failed.
    pub bind_attempts: u32,

    /// Base delay for bind retry backoff.
    pub bind_base_delay_ms: u64,

    /// Cap on bind retry backoff.
    pub bind_max_delay_ms: u64,

    /// Maximum request body accepted, in bytes.
    pub max_body_size: usize,

    /// Total time allowed per request, in seconds.
    pub request_timeout_secs: u64,
}

impl ListenerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            backlog: 1024,
            bind_attempts: 5,
            bind_base_delay_ms: 100,
            bind_max_delay_ms: 2000,
            max_body_size: 2 * 1024 * 1024,
            request_timeout_secs: 30,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format: `pretty` or `json`.
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
