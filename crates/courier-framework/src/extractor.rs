//! Extractor system for the Courier framework.
//!
//! This module provides the [`FromContext`] trait, which defines how types
//! can be extracted from a [`CallbackContext`] for use as callback
//! parameters, plus the extractor newtypes ([`Args`], [`ChatData`], ...).

use std::ops::Deref;
use std::sync::Arc;

use courier_core::{CallbackQuery, Chat, InlineQuery, Message, Update, User};

use crate::context::CallbackContext;
use crate::error::{ExtractError, ExtractResult};
use crate::handler::Captures;
use crate::store::DataHandle;

/// A trait for types that can be extracted from a [`CallbackContext`].
///
/// If extraction fails, the callback does not run and its handler falls
/// through to the next handler of the group.
///
/// # Example
///
/// ```rust,ignore
/// struct Language(String);
///
/// impl FromContext for Language {
///     fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
///         let user = ctx.update().effective_user().ok_or(ExtractError::Missing("user"))?;
///         let code = user.extra.get("language_code").and_then(|v| v.as_str());
///         Ok(Language(code.unwrap_or("en").to_string()))
///     }
/// }
/// ```
pub trait FromContext: Sized {
    /// Attempts to extract this type from the given context.
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self>;
}

impl FromContext for Arc<CallbackContext> {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        Ok(Arc::clone(ctx))
    }
}

impl FromContext for Arc<Update> {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        Ok(Arc::clone(ctx.update()))
    }
}

/// Allows callbacks to have optional parameters.
impl<T: FromContext> FromContext for Option<T> {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        Ok(T::from_context(ctx).ok())
    }
}

/// The effective message: new or edited message, channel post, or the
/// message under a callback query's keyboard.
impl FromContext for Message {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        ctx.message().cloned().ok_or(ExtractError::Missing("message"))
    }
}

impl FromContext for CallbackQuery {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        ctx.update()
            .callback_query()
            .cloned()
            .ok_or(ExtractError::Missing("callback query"))
    }
}

impl FromContext for InlineQuery {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        ctx.update()
            .inline_query()
            .cloned()
            .ok_or(ExtractError::Missing("inline query"))
    }
}

impl FromContext for Chat {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        ctx.update()
            .effective_chat()
            .cloned()
            .ok_or(ExtractError::Missing("chat"))
    }
}

impl FromContext for User {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        ctx.update()
            .effective_user()
            .cloned()
            .ok_or(ExtractError::Missing("user"))
    }
}

// ============================================================================
// Newtype extractors
// ============================================================================

/// Command arguments, split on whitespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args(pub Vec<String>);

impl Deref for Args {
    type Target = [String];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromContext for Args {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        Ok(Args(ctx.args().to_vec()))
    }
}

impl FromContext for Captures {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        ctx.captures()
            .cloned()
            .ok_or(ExtractError::Missing("regex captures"))
    }
}

macro_rules! data_extractor {
    ($(#[$doc:meta])* $name:ident, $what:literal, |$ctx:ident| $get:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone)]
        pub struct $name(pub DataHandle);

        impl Deref for $name {
            type Target = DataHandle;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl FromContext for $name {
            fn from_context($ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
                $get.map($name).ok_or(ExtractError::Missing($what))
            }
        }
    };
}

data_extractor!(
    /// Data of the effective chat.
    ChatData, "chat", |ctx| ctx.chat_data()
);
data_extractor!(
    /// Data of the effective user.
    UserData, "user", |ctx| ctx.user_data()
);
data_extractor!(
    /// Data shared by all updates.
    BotData, "bot data", |ctx| Some(ctx.bot_data())
);

/// The error being handled. Only available inside error handlers.
#[derive(Debug, Clone)]
pub struct Failure(pub Arc<anyhow::Error>);

impl Failure {
    /// Returns the error as `E` if it, or any error in its chain, has that
    /// type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.0.chain().find_map(|cause| cause.downcast_ref::<E>())
    }
}

impl Deref for Failure {
    type Target = anyhow::Error;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromContext for Failure {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        ctx.error().cloned().map(Failure).ok_or(ExtractError::NoError)
    }
}
