//! Configuration validation.
//!
//! Validates configuration at startup to catch common errors early.

use super::{AuthMode, Config};
use thiserror::Error;

/// Validation errors for configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("server.name is required")]
    MissingServerName,
    #[error("invoker.workers must be at least 1")]
    NoInvokerWorkers,
    #[error("session.flush_interval must be at least 1 second")]
    ZeroFlushInterval,
    #[error("session.outbound_queue must be at least 1")]
    ZeroOutboundQueue,
    #[error("session.messages_per_second must be at least 1")]
    ZeroMessageRate,
    #[error("listen.max_frame must be between 1 KiB and 64 MiB, got {0}")]
    InvalidMaxFrame(usize),
    #[error("auth.mode = \"static\" requires at least one [auth.users] entry")]
    NoStaticUsers,
    #[error("reboot.hour must be below 24, got {0}")]
    InvalidRebootHour(u32),
    #[error("reboot.warnings must be non-zero and strictly descending")]
    InvalidRebootWarnings,
}

/// Validate a configuration, returning all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.name.trim().is_empty() {
        errors.push(ValidationError::MissingServerName);
    }

    if config.invoker.workers == 0 {
        errors.push(ValidationError::NoInvokerWorkers);
    }

    // Session limits
    if config.session.flush_interval == 0 {
        errors.push(ValidationError::ZeroFlushInterval);
    }
    if config.session.outbound_queue == 0 {
        errors.push(ValidationError::ZeroOutboundQueue);
    }
    if config.session.messages_per_second == 0 {
        errors.push(ValidationError::ZeroMessageRate);
    }

    let max_frame = config.listen.max_frame;
    if !(1024..=64 * 1024 * 1024).contains(&max_frame) {
        errors.push(ValidationError::InvalidMaxFrame(max_frame));
    }

    if config.auth.mode == AuthMode::Static && config.auth.users.is_empty() {
        errors.push(ValidationError::NoStaticUsers);
    }

    // Reboot schedule
    if config.reboot.hour >= 24 {
        errors.push(ValidationError::InvalidRebootHour(config.reboot.hour));
    }
    let warnings = &config.reboot.warnings;
    if warnings.contains(&0) || warnings.windows(2).any(|pair| pair[0] <= pair[1]) {
        errors.push(ValidationError::InvalidRebootWarnings);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
