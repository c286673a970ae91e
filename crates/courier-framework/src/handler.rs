//! Handler system for the Courier framework.
//!
//! Two traits live here:
//!
//! - [`Handler`]: what the registry stores. A handler has a side-effect-free
//!   predicate ([`Handler::check`]) and an async action
//!   ([`Handler::handle`]). [`Matcher`](crate::Matcher) and
//!   [`ConversationHandler`](crate::ConversationHandler) implement it.
//!
//! - [`Callback`]: implemented for async functions whose parameters
//!   implement [`FromContext`], similar to Axum's handler system. Matchers
//!   wrap a callback as their action.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn start(message: Message, chat: ChatData) -> anyhow::Result<State> {
//!     chat.set("started", true)?;
//!     Ok(State::from("NAME"))
//! }
//!
//! async fn echo(ctx: Arc<CallbackContext>) {
//!     println!("{:?}", ctx.message());
//! }
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::trace;

use courier_core::Update;

use crate::context::{CallbackContext, DispatchContext};
use crate::extractor::FromContext;
use crate::outcome::{IntoOutcome, Outcome};
use crate::store::DataStore;

/// What a handler action returns.
pub type HandlerResult = Result<Outcome, anyhow::Error>;

// ============================================================================
// Matched
// ============================================================================

/// Owned regex captures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captures {
    groups: Vec<Option<String>>,
    named: HashMap<String, String>,
}

impl Captures {
    /// Copies the captures out of a regex match.
    pub fn from_regex(regex: &regex::Regex, caps: &regex::Captures<'_>) -> Self {
        let groups = caps
            .iter()
            .map(|m| m.map(|m| m.as_str().to_string()))
            .collect();
        let named = regex
            .capture_names()
            .flatten()
            .filter_map(|name| Some((name.to_string(), caps.name(name)?.as_str().to_string())))
            .collect();
        Self { groups, named }
    }

    /// Group `index`; index zero is the whole match.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.groups.get(index)?.as_deref()
    }

    pub fn name(&self, name: &str) -> Option<&str> {
        self.named.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// What a predicate computed while matching an update.
///
/// The dispatcher hands it back to [`Handler::handle`] unchanged, so work
/// done in `check` (splitting command arguments, running a regex) is not
/// repeated in the action.
#[derive(Default)]
pub struct Matched {
    /// Command arguments.
    pub args: Vec<String>,
    /// Regex captures.
    pub captures: Option<Captures>,
    /// Handler-private data.
    pub data: Option<Box<dyn Any + Send + Sync>>,
}

impl Matched {
    /// A match without extra data.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_captures(mut self, captures: Captures) -> Self {
        self.captures = Some(captures);
        self
    }

    pub fn with_data<T: Any + Send + Sync>(mut self, data: T) -> Self {
        self.data = Some(Box::new(data));
        self
    }

    /// Takes the handler-private data if it has type `T`.
    pub fn take_data<T: Any>(&mut self) -> Option<T> {
        let data = self.data.take()?;
        match data.downcast::<T>() {
            Ok(data) => Some(*data),
            Err(data) => {
                self.data = Some(data);
                None
            }
        }
    }

    /// Combines two matches, keeping the first non-empty value of each field.
    pub fn merge(mut self, other: Matched) -> Self {
        if self.args.is_empty() {
            self.args = other.args;
        }
        if self.captures.is_none() {
            self.captures = other.captures;
        }
        if self.data.is_none() {
            self.data = other.data;
        }
        self
    }
}

impl std::fmt::Debug for Matched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matched")
            .field("args", &self.args)
            .field("captures", &self.captures)
            .field("has_data", &self.data.is_some())
            .finish()
    }
}

// ============================================================================
// Handler
// ============================================================================

/// A registered unit of update handling.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Decides whether this handler wants `update`.
    ///
    /// Must not have side effects: the dispatcher may call it for handlers
    /// that end up not running.
    fn check(&self, update: &Update) -> Option<Matched>;

    /// Runs the action for a matched update.
    async fn handle(&self, matched: Matched, ctx: Arc<DispatchContext>) -> HandlerResult;

    /// Whether dispatch waits for [`handle`](Self::handle) before moving on
    /// to the next group.
    fn is_blocking(&self) -> bool {
        true
    }

    /// The name under which this handler persists its state, if it does.
    ///
    /// Applications use it to reject persistent handlers they cannot serve.
    fn persistent_name(&self) -> Option<&str> {
        None
    }

    /// Reloads persisted state after the application started.
    fn restore(&self, _store: &DataStore) {}
}

/// A shared, type-erased handler as stored in the registry.
pub type BoxedHandler = Arc<dyn Handler>;

// ============================================================================
// Callback
// ============================================================================

/// An async function usable as a handler action.
///
/// # Blanket Implementation
///
/// Implemented for async functions that:
/// - take 0-8 parameters implementing [`FromContext`]
/// - return a type implementing [`IntoOutcome`]
///
/// If a parameter cannot be extracted the action does not run and the
/// handler falls through to the next handler of its group.
#[async_trait]
pub trait Callback<T>: Clone + Send + Sync + 'static {
    /// Calls the function with parameters extracted from `ctx`.
    async fn call(self, ctx: Arc<CallbackContext>) -> HandlerResult;
}

/// A type-erased callback that can be stored in collections.
pub type BoxedCallback =
    Arc<dyn Fn(Arc<CallbackContext>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Converts a callback function into a boxed callback.
pub fn into_callback<F, T>(f: F) -> BoxedCallback
where
    F: Callback<T>,
    T: 'static,
{
    Arc::new(move |ctx| f.clone().call(ctx))
}

macro_rules! impl_callback {
    (
        $($ty:ident),*
    ) => {
        #[allow(non_snake_case, unused_variables)]
        #[async_trait]
        impl<F, Fut, Res, $($ty,)*> Callback<($($ty,)*)> for F
        where
            F: FnOnce($($ty,)*) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = Res> + Send + 'static,
            Res: IntoOutcome,
            $( $ty: FromContext + Send + 'static, )*
        {
            async fn call(self, ctx: Arc<CallbackContext>) -> HandlerResult {
                $(
                    let $ty = match $ty::from_context(&ctx) {
                        Ok(value) => value,
                        Err(err) => {
                            trace!(
                                parameter = std::any::type_name::<$ty>(),
                                error = %err,
                                "Parameter extraction failed, falling through"
                            );
                            return Ok(Outcome::fall_through());
                        }
                    };
                )*

                (self)($($ty,)*).await.into_outcome()
            }
        }
    };
}

impl_callback!();
impl_callback!(T1);
impl_callback!(T1, T2);
impl_callback!(T1, T2, T3);
impl_callback!(T1, T2, T3, T4);
impl_callback!(T1, T2, T3, T4, T5);
impl_callback!(T1, T2, T3, T4, T5, T6);
impl_callback!(T1, T2, T3, T4, T5, T6, T7);
impl_callback!(T1, T2, T3, T4, T5, T6, T7, T8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_data_keeps_mismatched_type() {
        let mut matched = Matched::new().with_data(7u32);
        assert_eq!(matched.take_data::<String>(), None);
        assert_eq!(matched.take_data::<u32>(), Some(7));
        assert!(matched.data.is_none());
    }

    #[test]
    fn test_merge_prefers_first() {
        let merged = Matched::new()
            .with_args(vec!["a".into()])
            .merge(Matched::new().with_args(vec!["b".into()]).with_data(1u8));
        assert_eq!(merged.args, vec!["a".to_string()]);
        assert!(merged.data.is_some());
    }

    #[test]
    fn test_captures_from_regex() {
        let regex = regex::Regex::new(r"^vote:(?P<choice>\w+)$").unwrap();
        let caps = regex.captures("vote:yes").unwrap();
        let captures = Captures::from_regex(&regex, &caps);
        assert_eq!(captures.get(0), Some("vote:yes"));
        assert_eq!(captures.get(1), Some("yes"));
        assert_eq!(captures.name("choice"), Some("yes"));
        assert_eq!(captures.len(), 2);
    }
}
