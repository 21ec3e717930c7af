//! Sluice utility functions and helpers.
//!
//! - [`http`]: the transport abstraction, a reqwest-backed implementation,
//!   and response body parsing.
//! - [`config`]: engine configuration loading and validation.

pub mod config;
pub mod http;

pub use config::{
    CONFIG_PATH_ENV, ConfigError, CredentialsMode, DEFAULT_IDENTIFIER_SUFFIX, EngineConfig, default_config_path, expand_tilde,
    load_config, load_config_from_path, validate_config, validate_identifier_suffix,
};
