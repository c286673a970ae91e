//! Error types for the Courier framework.

use std::path::PathBuf;

use thiserror::Error;

use crate::outcome::{State, Transition};

/// Raised by a handler action to stop processing the update in later groups.
///
/// The dispatcher recognises this error and treats it as a control signal:
/// it is never routed to error handlers. Inside a conversation,
/// [`StopPropagation::with_state`] additionally applies a state transition
/// before propagation stops.
#[derive(Debug, Clone, Default, Error)]
#[error("update propagation stopped")]
pub struct StopPropagation {
    transition: Option<Transition>,
}

impl StopPropagation {
    /// Stops propagation without changing conversation state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops propagation after moving the conversation to `state`.
    pub fn with_state(state: impl Into<State>) -> Self {
        Self::with_transition(Transition::To(state.into()))
    }

    /// Stops propagation after applying `transition`.
    pub fn with_transition(transition: Transition) -> Self {
        Self {
            transition: Some(transition),
        }
    }

    /// Returns the transition to apply, if any.
    pub fn transition(&self) -> Option<&Transition> {
        self.transition.as_ref()
    }

    /// Returns the target state, if the transition moves to one.
    pub fn state(&self) -> Option<&State> {
        match &self.transition {
            Some(Transition::To(state)) => Some(state),
            _ => None,
        }
    }
}

/// Returns the [`StopPropagation`] signal carried by `err`, if it is one.
pub fn as_stop_signal(err: &anyhow::Error) -> Option<&StopPropagation> {
    err.downcast_ref::<StopPropagation>()
}

/// Errors that can occur during context extraction.
#[derive(Debug, Clone, Error)]
pub enum ExtractError {
    /// The update does not carry the requested part.
    #[error("update has no {0}")]
    Missing(&'static str),

    /// The context was not created for error handling.
    #[error("no error attached to this context")]
    NoError,

    /// Custom extraction error.
    #[error("{0}")]
    Custom(String),
}

impl ExtractError {
    /// Creates a custom extraction error.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }
}

/// Result type for extraction operations.
pub type ExtractResult<T> = Result<T, ExtractError>;

/// Invalid conversation handler configuration.
#[derive(Debug, Clone, Error)]
pub enum ConversationError {
    /// None of `per_chat`, `per_user` and `per_message` is enabled.
    #[error("conversation '{0}': at least one of per_chat, per_user, per_message must be set")]
    NoKeyStrategy(String),

    /// The conversation has no entry points.
    #[error("conversation '{0}' has no entry points")]
    NoEntryPoints(String),

    /// `persistent(true)` was set without a name.
    #[error("a persistent conversation needs a name")]
    UnnamedPersistent,
}

/// Errors raised by persistence backends.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Reading or writing the backing store failed.
    #[error("persistence I/O error at {path}: {source}")]
    Io {
        /// File that was being accessed.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Data could not be encoded or decoded.
    #[error("persistence serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Backend-specific failure.
    #[error("persistence backend error: {0}")]
    Backend(String),
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
