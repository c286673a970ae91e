//! # Courier Framework
//!
//! Handler routing, conversations and persistence for Courier bots.
//!
//! This layer provides:
//! - [`Handler`] and the axum-style [`Callback`] system built on
//!   [`FromContext`] extractors
//! - [`Matcher`] with composable [`filters`] and the `on_*` builders
//! - Priority groups in the [`HandlerRegistry`] and the group-ordered
//!   [`Dispatcher`]
//! - [`ConversationHandler`], a per-chat/per-user state machine
//! - [`ErrorHandlers`] for failed actions
//! - The shared [`DataStore`] and [`Persistence`] backends
//!
//! The polling loop, configuration and lifecycle live in
//! `courier-runtime`.

pub mod context;
pub mod conversation;
pub mod dispatcher;
pub mod error;
pub mod error_handler;
pub mod extractor;
pub mod filters;
pub mod handler;
pub mod matcher;
pub mod matcher_builders;
pub mod outcome;
pub mod persistence;
pub mod registry;
pub mod store;

pub use context::{CallbackContext, DispatchContext, DispatchEnv};
pub use conversation::{ConversationBuilder, ConversationHandler, ConversationKey, Route};
pub use dispatcher::{Dispatcher, ProcessReport};
pub use error::{
    ConversationError, ExtractError, ExtractResult, PersistenceError, StopPropagation,
    as_stop_signal,
};
pub use error_handler::{ErrorHandler, ErrorHandlers};
pub use extractor::{Args, BotData, ChatData, Failure, FromContext, UserData};
pub use filters::Filter;
pub use handler::{
    BoxedCallback, BoxedHandler, Callback, Captures, Handler, HandlerResult, Matched,
    into_callback,
};
pub use matcher::Matcher;
pub use matcher_builders::{
    on_callback_query, on_callback_query_pattern, on_command, on_command_as, on_commands,
    on_inline_query, on_inline_query_pattern, on_kind, on_message, on_update,
};
pub use outcome::{Flow, IntoOutcome, Outcome, State, Transition};
pub use persistence::{
    JsonFilePersistence, MemoryPersistence, Partitions, Persistence, PersistentData,
};
pub use registry::{HandlerGroups, HandlerRegistry};
pub use store::{DataHandle, DataMap, DataStore, Revisions};

/// Commonly used items.
pub mod prelude {
    pub use crate::context::CallbackContext;
    pub use crate::conversation::{ConversationHandler, Route};
    pub use crate::error::StopPropagation;
    pub use crate::error_handler::ErrorHandler;
    pub use crate::extractor::{Args, BotData, ChatData, Failure, UserData};
    pub use crate::filters::{self, Filter};
    pub use crate::matcher::Matcher;
    pub use crate::matcher_builders::*;
    pub use crate::outcome::{Outcome, State, Transition};
}
