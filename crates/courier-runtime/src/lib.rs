//! # Courier Runtime
//!
//! Application lifecycle for Courier bots:
//!
//! - [`Application`]: the dispatch loop. It pulls updates from an
//!   [`UpdateSource`](courier_core::UpdateSource), bounds concurrency, keeps
//!   the update checkpoint, flushes persistence and stops gracefully.
//! - [`config`]: layered configuration with figment.
//! - [`logging`]: `tracing-subscriber` setup.
//!
//! ```rust,ignore
//! use courier_runtime::Application;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let app = Application::load()?;
//!     app.add_handler(on_command("start").handler(start), 0)?;
//!
//!     // Runs until Ctrl+C
//!     app.run_polling().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `toml-config` *(default)* / `yaml-config`: config file formats
//! - `json-log`: JSON log output
//! - `polling`: [`Application::run_polling`]
//! - `webhook`: [`Application::run_webhook`]

pub mod application;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod logging;
pub mod service;

pub use application::{Application, ApplicationBuilder};
pub use checkpoint::Checkpoint;
pub use config::{ConfigError, ConfigLoader, ConfigResult, CourierConfig};
pub use error::{ApplicationError, ApplicationResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use service::DispatchService;

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Logging macros, for `use courier_runtime::prelude::*`.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
