//! # Courier
//!
//! An update-dispatch framework for Telegram-style bots.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌─────────────┐     ┌───────────────────────────────┐
//! │ UpdateSource │────▶│ Application │────▶│ Dispatcher                    │
//! │ (poll/hook)  │     │ (checkpoint,│     │  group -1: [handler, ...]     │
//! └──────────────┘     │  limit,     │     │  group  0: [conversation, ...]│
//!                      │  stop)      │     │  group  1: [handler, ...]     │
//!                      └─────────────┘     └───────────────────────────────┘
//! ```
//!
//! - **Sources** produce updates: long polling, webhooks, or an in-process
//!   queue.
//! - **Application** runs each update as a task under a concurrency bound
//!   and commits the update cursor only past finished work.
//! - **Dispatcher** visits handler groups in ascending order; in each group
//!   the first matching handler runs.
//! - **Conversations** are handlers with per-chat/per-user state.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use courier::prelude::*;
//!
//! async fn start(chat: ChatData) -> anyhow::Result<()> {
//!     chat.set("started", true)?;
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let app = Application::load()?;
//!     app.add_handler(on_command("start").handler(start), 0)?;
//!     app.run_polling().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config` *(default)* / `yaml-config`: config file formats
//! - `json-log`: JSON log output
//! - `polling`: Bot API long polling
//! - `webhook`: webhook server

pub use courier_core as core;
pub use courier_framework as framework;
pub use courier_runtime as runtime;
pub use courier_transport as transport;

pub use courier_core::{Update, UpdateKind};
pub use courier_framework::{ConversationHandler, Dispatcher, Matcher};
pub use courier_runtime::{Application, ApplicationError, ApplicationResult};

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use courier::prelude::*;
/// ```
pub mod prelude {
    // Application - main entry point
    pub use courier_runtime::{Application, ApplicationBuilder, CourierConfig};

    // Updates and sources
    pub use courier_core::prelude::*;
    pub use courier_core::{CallbackQuery, InlineQuery, RetryConfig, RetryingSource};

    // Handlers, conversations, extractors and filters
    pub use courier_framework::prelude::*;
    pub use courier_framework::{
        ConversationKey, DispatchContext, Handler, JsonFilePersistence, MemoryPersistence,
        Partitions,
    };
}
