//! On-disk persistence for the tunnel binary.

pub mod config;

pub use config::{load_config, save_config, AppConfig, ConfigError};
