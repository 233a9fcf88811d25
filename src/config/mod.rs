//! Configuration loading and management.
//!
//! This module is split into logical submodules:
//! - [`types`]: Config struct definitions and loading
//! - [`defaults`]: serde default value functions
//! - [`validation`]: startup validation

mod defaults;
mod types;
mod validation;

pub use types::{
    AuthConfig, AuthMode, Config, ConfigError, InvokerConfig, ListenConfig, LoggingConfig,
    OmgrConfig, RebootConfig, ServerConfig, SessionConfig,
};
pub use validation::{ValidationError, validate};
