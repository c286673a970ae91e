//! Matcher: the general-purpose handler.
//!
//! A [`Matcher`] pairs a [`Filter`] with a callback. When the filter passes,
//! the callback runs with whatever the filter computed (captures, command
//! arguments) available through its extractors.
//!
//! # Example
//!
//! ```rust,ignore
//! use courier_framework::{Matcher, filters};
//!
//! let matcher = Matcher::new()
//!     .name("greeting")
//!     .filter(filters::text_in(["hi", "hello"]))
//!     .handler(greet);
//!
//! // Let the action run in the background while dispatch continues.
//! let logger = Matcher::new().block(false).handler(log_update);
//! ```
//!
//! # Cheap Cloning
//!
//! `Matcher` keeps its data behind an `Arc`; builder methods use
//! copy-on-write, so cloning a matcher and adjusting the clone leaves the
//! original untouched.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use courier_core::Update;

use crate::context::{CallbackContext, DispatchContext};
use crate::filters::{self, Filter};
use crate::handler::{
    BoxedCallback, BoxedHandler, Callback, Handler, HandlerResult, Matched, into_callback,
};
use crate::outcome::Outcome;

/// Internal data for a Matcher.
#[derive(Clone)]
struct MatcherInner {
    filter: Filter,
    callback: Option<BoxedCallback>,
    block: bool,
    name: Option<String>,
}

/// A handler made of a filter and a callback.
#[derive(Clone)]
pub struct Matcher {
    inner: Arc<MatcherInner>,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Matcher {
    /// Creates a matcher that accepts every update.
    ///
    /// A matcher without a callback never matches.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MatcherInner {
                filter: filters::any(),
                callback: None,
                block: true,
                name: None,
            }),
        }
    }

    fn inner_mut(&mut self) -> &mut MatcherInner {
        Arc::make_mut(&mut self.inner)
    }

    /// Sets a name for this matcher (useful for debugging).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.inner_mut().name = Some(name.into());
        self
    }

    /// Narrows the matcher with `filter`, combined with `&`.
    pub fn filter(mut self, filter: Filter) -> Self {
        let inner = self.inner_mut();
        inner.filter = inner.filter.clone() & filter;
        self
    }

    /// Narrows the matcher with a plain predicate.
    pub fn check<F>(self, f: F) -> Self
    where
        F: Fn(&Update) -> bool + Send + Sync + 'static,
    {
        self.filter(Filter::new(f))
    }

    /// Sets whether dispatch waits for the callback.
    ///
    /// Non-blocking callbacks run in the background while dispatch moves on
    /// to the next group; their outcome cannot stop propagation.
    pub fn block(mut self, block: bool) -> Self {
        self.inner_mut().block = block;
        self
    }

    /// Sets the callback.
    pub fn handler<F, T>(mut self, f: F) -> Self
    where
        F: Callback<T>,
        T: 'static,
    {
        self.inner_mut().callback = Some(into_callback(f));
        self
    }

    /// Sets a pre-built boxed callback.
    pub fn handler_boxed(mut self, callback: BoxedCallback) -> Self {
        self.inner_mut().callback = Some(callback);
        self
    }

    /// Tests `update` against the filter.
    pub fn matches(&self, update: &Update) -> Option<Matched> {
        self.inner.callback.as_ref()?;
        self.inner.filter.check(update)
    }

    /// Returns the name of this matcher, if set.
    pub fn get_name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Wraps the matcher for registration.
    pub fn boxed(self) -> BoxedHandler {
        Arc::new(self)
    }
}

#[async_trait]
impl Handler for Matcher {
    fn name(&self) -> &str {
        self.inner.name.as_deref().unwrap_or("unnamed")
    }

    fn check(&self, update: &Update) -> Option<Matched> {
        let matched = self.matches(update);
        if matched.is_none() {
            trace!(matcher = Handler::name(self), "Matcher check failed, skipping");
        }
        matched
    }

    async fn handle(&self, matched: Matched, ctx: Arc<DispatchContext>) -> HandlerResult {
        let Some(callback) = self.inner.callback.clone() else {
            return Ok(Outcome::fall_through());
        };
        let ctx = Arc::new(CallbackContext::new(ctx, matched));
        callback(ctx).await
    }

    fn is_blocking(&self) -> bool {
        self.inner.block
    }
}

impl std::fmt::Debug for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matcher")
            .field("name", &self.inner.name)
            .field("block", &self.inner.block)
            .field("has_callback", &self.inner.callback.is_some())
            .finish()
    }
}
