//! Configuration for Courier applications.
//!
//! Settings are layered with figment: built-in defaults, then
//! `courier.toml` (or `courier.yaml`), then `COURIER_*` environment
//! variables, then programmatic overrides. See [`ConfigLoader`].

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    BotConfig, CourierConfig, DispatchConfig, LogFormat, LogLevel, LogOutput, LogRotation,
    LoggingConfig, PersistenceBackend, PersistenceConfig, PollingConfig, RetrySettings,
    SpanEventConfig, WebhookConfig,
};
pub use validation::validate_config;
