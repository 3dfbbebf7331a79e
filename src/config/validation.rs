//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (caps > 0)
//! - Check that every address the server binds parses
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::ServerConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// `shaping.aggregate_limit` is zero.
    #[error("shaping.aggregate_limit must be greater than zero")]
    ZeroAggregateLimit,

    /// `shaping.conn_limit` is zero.
    #[error("shaping.conn_limit must be greater than zero")]
    ZeroConnLimit,

    /// An address field does not parse as `ip:port`.
    #[error("{field} is not a valid socket address: {value:?}")]
    InvalidAddress { field: &'static str, value: String },

    /// The admin API is enabled without a key.
    #[error("admin.api_key must not be empty when the admin API is enabled")]
    EmptyApiKey,
}

/// Check a configuration, collecting every problem found.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.shaping.aggregate_limit == 0 {
        errors.push(ValidationError::ZeroAggregateLimit);
    }
    if config.shaping.conn_limit == 0 {
        errors.push(ValidationError::ZeroConnLimit);
    }

    check_address(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.observability.metrics_enabled {
        check_address(&mut errors, "observability.metrics_address", &config.observability.metrics_address);
    }
    if config.admin.enabled {
        check_address(&mut errors, "admin.bind_address", &config.admin.bind_address);
        if config.admin.api_key.is_empty() {
            errors.push(ValidationError::EmptyApiKey);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&ServerConfig::default()), Ok(()));
    }

    #[test]
    fn reports_every_error() {
        let mut config = ServerConfig::default();
        config.shaping.aggregate_limit = 0;
        config.shaping.conn_limit = 0;
        config.listener.bind_address = "nowhere".into();
        config.admin.enabled = true;
        config.admin.api_key.clear();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::ZeroAggregateLimit,
                ValidationError::ZeroConnLimit,
                ValidationError::InvalidAddress {
                    field: "listener.bind_address",
                    value: "nowhere".into(),
                },
                ValidationError::EmptyApiKey,
            ]
        );
    }

    #[test]
    fn disabled_sections_are_not_checked() {
        let mut config = ServerConfig::default();
        config.observability.metrics_enabled = false;
        config.observability.metrics_address = "bad".into();
        config.admin.bind_address = "bad".into();

        assert_eq!(validate_config(&config), Ok(()));
    }
}
