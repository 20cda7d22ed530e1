//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (worker count, timings, backlog)
//! - Compile seed handler rows so malformed rows fail at load time
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: HttpdConfig → Result<(), Vec<ConfigurationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::HttpdConfig;
use crate::handlers::HandlerSnapshot;

/// A single semantic problem with the configuration or the handler table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("{field} = {value} is out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("handler {handler}: malformed listen address {address:?}: {reason}")]
    MalformedAddress {
        handler: i64,
        address: String,
        reason: String,
    },
    #[error("handler {handler}: invalid method {method:?}")]
    InvalidMethod { handler: i64, method: String },
    #[error("handler {handler}: invalid path pattern {pattern:?}: {reason}")]
    InvalidPath {
        handler: i64,
        pattern: String,
        reason: String,
    },
    #[error("duplicate handler id {0}")]
    DuplicateHandler(i64),
    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn check_range(
    errors: &mut Vec<ConfigurationError>,
    field: &'static str,
    value: i64,
    min: i64,
    max: i64,
) {
    if value < min || value > max {
        errors.push(ConfigurationError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
}

/// Validate a configuration, collecting every error.
pub fn validate_config(config: &HttpdConfig) -> Result<(), Vec<ConfigurationError>> {
    let mut errors = Vec::new();

    check_range(
        &mut errors,
        "fleet.http_workers",
        config.fleet.http_workers,
        1,
        i32::MAX as i64,
    );
    if config.fleet.database.trim().is_empty() {
        errors.push(ConfigurationError::Invalid {
            field: "fleet.database",
            reason: "must not be empty".to_string(),
        });
    }

    let reload = &config.reload;
    check_range(&mut errors, "reload.semaphore_poll_ms", reload.semaphore_poll_ms as i64, 1, 3_600_000);
    check_range(&mut errors, "reload.debounce_ms", reload.debounce_ms as i64, 0, 60_000);
    check_range(&mut errors, "reload.drain_timeout_secs", reload.drain_timeout_secs as i64, 1, 3600);
    if reload.drain_grace_secs > reload.drain_timeout_secs {
        errors.push(ConfigurationError::Invalid {
            field: "reload.drain_grace_secs",
            reason: "must not exceed reload.drain_timeout_secs".to_string(),
        });
    }

    let listener = &config.listener;
    check_range(&mut errors, "listener.backlog", listener.backlog as i64, 1, 65_535);
    check_range(&mut errors, "listener.bind_attempts", listener.bind_attempts as i64, 1, 100);
    check_range(&mut errors, "listener.request_timeout_secs", listener.request_timeout_secs as i64, 1, 86_400);
    if listener.bind_base_delay_ms > listener.bind_max_delay_ms {
        errors.push(ConfigurationError::Invalid {
            field: "listener.bind_base_delay_ms",
            reason: "must not exceed listener.bind_max_delay_ms".to_string(),
        });
    }
    if listener.max_body_size == 0 {
        errors.push(ConfigurationError::Invalid {
            field: "listener.max_body_size",
            reason: "must be positive".to_string(),
        });
    }

    let observability = &config.observability;
    if !matches!(observability.log_format.as_str(), "pretty" | "json") {
        errors.push(ConfigurationError::Invalid {
            field: "observability.log_format",
            reason: format!("expected \"pretty\" or \"json\", got {:?}", observability.log_format),
        });
    }
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ConfigurationError::Invalid {
            field: "observability.metrics_address",
            reason: format!("{:?} is not a socket address", observability.metrics_address),
        });
    }

    if let Err(handler_errors) = HandlerSnapshot::build(0, &config.handlers) {
        errors.extend(handler_errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::HandlerRow;

    #[test]
    fn defaults_are_valid() {
        assert!(validate_config(&HttpdConfig::default()).is_ok());
    }

    #[test]
    fn worker_count_bounds() {
        let mut config = HttpdConfig::default();
        config.fleet.http_workers = 0;
        let errors = validate_config(&config).unwrap_err();
        assert!(matches!(
            errors[0],
            ConfigurationError::OutOfRange { field: "fleet.http_workers", value: 0, .. }
        ));

        config.fleet.http_workers = i32::MAX as i64 + 1;
        assert!(validate_config(&config).is_err());

        config.fleet.http_workers = 1;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = HttpdConfig::default();
        config.fleet.http_workers = -1;
        config.observability.log_format = "xml".to_string();
        config.reload.drain_grace_secs = 100;
        config.handlers = vec![HandlerRow::new(1, "nowhere", &[], "/", "SELECT 1")];

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 4);
    }
}
