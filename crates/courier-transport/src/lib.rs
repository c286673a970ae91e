//! Courier Transport - Bot API update sources.
//!
//! Both sources implement [`UpdateSource`](courier_core::UpdateSource) and
//! plug into `Application::run`:
//!
//! - `polling` feature: [`polling::PollingSource`] long-polls `getUpdates`
//!   and acknowledges by offset.
//! - `webhook` feature: [`webhook::WebhookServer`] accepts update POSTs
//!   with axum and pushes them into an in-process queue.
//!
//! ```ignore
//! use courier_core::{RetryConfig, RetryingSource};
//! use courier_transport::polling::{PollingSettings, PollingSource};
//!
//! let source = PollingSource::new(PollingSettings::new(token))?;
//! let source = RetryingSource::new(source, RetryConfig::default());
//! app.run(source).await?;
//! ```

#[cfg(feature = "polling")]
pub mod polling;

#[cfg(feature = "webhook")]
pub mod webhook;

#[cfg(feature = "polling")]
pub use polling::{PollingSettings, PollingSource};

#[cfg(feature = "webhook")]
pub use webhook::{SECRET_TOKEN_HEADER, WebhookServer, WebhookSettings};
