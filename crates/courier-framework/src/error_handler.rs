//! Error handlers.
//!
//! When a handler action fails, the dispatcher hands the error to the
//! registered [`ErrorHandler`]s. They are tried in registration order and the
//! first one whose predicate accepts the error runs. Errors nobody accepts
//! are logged and dropped; either way the dispatch loop keeps going.
//!
//! Error handlers are ordinary callbacks, so they use the same extractors as
//! update handlers, plus [`Failure`](crate::extractor::Failure):
//!
//! ```rust,ignore
//! async fn on_timeout(err: Failure, chat: Option<Chat>) {
//!     tracing::warn!(chat = ?chat.map(|c| c.id), "request timed out: {}", *err);
//! }
//!
//! app.add_error_handler(ErrorHandler::new(on_timeout).on::<std::io::Error>());
//! app.add_error_handler(ErrorHandler::new(|ctx: Arc<CallbackContext>| async move {
//!     ctx.request_shutdown();
//! }).when(|err| err.to_string().contains("fatal")));
//! ```

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error};

use crate::context::{CallbackContext, DispatchContext};
use crate::handler::{BoxedCallback, Callback, Matched, into_callback};

type ErrorPredicate = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// A callback for failed handler actions.
#[derive(Clone)]
pub struct ErrorHandler {
    callback: BoxedCallback,
    predicates: Vec<ErrorPredicate>,
    name: Option<String>,
}

impl ErrorHandler {
    /// Creates an error handler that accepts every error.
    pub fn new<F, T>(callback: F) -> Self
    where
        F: Callback<T>,
        T: 'static,
    {
        Self {
            callback: into_callback(callback),
            predicates: Vec::new(),
            name: None,
        }
    }

    /// Sets a name used in logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Only accepts errors that are, or are caused by, an `E`.
    pub fn on<E>(self) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.when(|err| err.chain().any(|cause| cause.is::<E>()))
    }

    /// Only accepts errors for which `predicate` returns `true`.
    ///
    /// Multiple predicates must all pass.
    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Arc::new(predicate));
        self
    }

    /// Returns `true` if this handler accepts `err`.
    pub fn accepts(&self, err: &anyhow::Error) -> bool {
        self.predicates.iter().all(|p| p(err))
    }

    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed")
    }
}

impl std::fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorHandler")
            .field("name", &self.name)
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

/// The ordered list of error handlers of one application.
#[derive(Debug, Default)]
pub struct ErrorHandlers {
    handlers: RwLock<Arc<Vec<ErrorHandler>>>,
}

impl ErrorHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an error handler.
    pub fn add(&self, handler: ErrorHandler) {
        Arc::make_mut(&mut self.handlers.write()).push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Routes `err` to the first accepting error handler.
    ///
    /// Returns `true` if a handler accepted it. Failures of the error handler
    /// itself are logged, never re-dispatched.
    pub async fn dispatch(&self, ctx: &Arc<DispatchContext>, err: anyhow::Error) -> bool {
        let handlers = Arc::clone(&self.handlers.read());
        let update_id = ctx.update().update_id;

        let Some(handler) = handlers.iter().find(|h| h.accepts(&err)) else {
            error!(update_id, error = ?err, "Unhandled error while processing update");
            return false;
        };

        debug!(update_id, handler = handler.label(), error = %err, "Routing error to error handler");
        let err_ctx = ctx.with_error(Arc::new(err));
        let cb_ctx = Arc::new(CallbackContext::new(err_ctx, Matched::new()));
        if let Err(failure) = (handler.callback)(cb_ctx).await {
            error!(
                update_id,
                handler = handler.label(),
                error = ?failure,
                "Error handler failed"
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DispatchEnv;
    use crate::extractor::Failure;
    use courier_core::{Update, UpdateKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> Arc<DispatchContext> {
        let update = Update::new(
            1,
            UpdateKind::Other {
                kind: "test".into(),
                payload: serde_json::Value::Null,
            },
        );
        Arc::new(DispatchContext::new(
            Arc::new(update),
            Arc::new(DispatchEnv::default()),
        ))
    }

    #[tokio::test]
    async fn test_first_accepting_handler_wins() {
        let io_hits = Arc::new(AtomicUsize::new(0));
        let any_hits = Arc::new(AtomicUsize::new(0));

        let handlers = ErrorHandlers::new();
        let hits = Arc::clone(&io_hits);
        handlers.add(
            ErrorHandler::new(move |err: Failure| {
                let hits = Arc::clone(&hits);
                async move {
                    assert!(err.downcast_ref::<std::io::Error>().is_some());
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on::<std::io::Error>(),
        );
        let hits = Arc::clone(&any_hits);
        handlers.add(ErrorHandler::new(move || {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let ctx = ctx();
        assert!(handlers.dispatch(&ctx, std::io::Error::other("disk").into()).await);
        assert!(handlers.dispatch(&ctx, anyhow::anyhow!("other")).await);

        assert_eq!(io_hits.load(Ordering::SeqCst), 1);
        assert_eq!(any_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unmatched_error_is_swallowed() {
        let handlers = ErrorHandlers::new();
        handlers.add(ErrorHandler::new(|| async {}).when(|_| false));
        assert!(!handlers.dispatch(&ctx(), anyhow::anyhow!("lost")).await);
    }

    #[tokio::test]
    async fn test_request_shutdown_from_error_handler() {
        let handlers = ErrorHandlers::new();
        handlers.add(ErrorHandler::new(|ctx: Arc<CallbackContext>| async move {
            ctx.request_shutdown();
        }));

        let ctx = ctx();
        handlers.dispatch(&ctx, anyhow::anyhow!("fatal")).await;
        assert!(ctx.env().stop_token().is_cancelled());
    }
}
