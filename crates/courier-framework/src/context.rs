//! Dispatch contexts.
//!
//! Processing one update involves three layers of state:
//!
//! - [`DispatchEnv`]: the **long-lived** environment shared by every update:
//!   the data store, the error handlers, and the stop/abort tokens plus the
//!   task tracker the application waits on at shutdown.
//!
//! - [`DispatchContext`]: the **shared** base for one dispatch cycle. One
//!   `Arc<DispatchContext>` is created per update and passed to every handler
//!   that runs for it. It holds the update and the propagation flag.
//!
//! - [`CallbackContext`]: the full context handed to a handler action,
//!   combining an `Arc<DispatchContext>` with what that handler's predicate
//!   computed (command arguments, regex captures). Calling
//!   [`stop_propagation`](CallbackContext::stop_propagation) writes through to
//!   the shared base, so no later group sees the update.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use courier_core::{Message, Update};

use crate::error_handler::ErrorHandlers;
use crate::handler::{Captures, Matched};
use crate::store::{DataHandle, DataStore};

// =============================================================================
// DispatchEnv
// =============================================================================

/// State shared by every dispatch cycle of one application.
#[derive(Debug)]
pub struct DispatchEnv {
    store: Arc<DataStore>,
    error_handlers: ErrorHandlers,
    /// Cancelled when the application should stop pulling updates.
    stop: CancellationToken,
    /// Cancelled when in-flight work must be abandoned.
    abort: CancellationToken,
    tracker: TaskTracker,
}

impl Default for DispatchEnv {
    fn default() -> Self {
        Self::new(Arc::new(DataStore::new()))
    }
}

impl DispatchEnv {
    /// Creates an environment around the given data store.
    pub fn new(store: Arc<DataStore>) -> Self {
        Self {
            store,
            error_handlers: ErrorHandlers::new(),
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    pub fn error_handlers(&self) -> &ErrorHandlers {
        &self.error_handlers
    }

    /// Token cancelled on graceful stop. Conversation timers listen to it.
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Token cancelled on hard stop.
    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    /// Tracker for background tasks the application waits on at shutdown.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }
}

// =============================================================================
// DispatchContext
// =============================================================================

/// The shared base context for a single update dispatch cycle.
pub struct DispatchContext {
    update: Arc<Update>,
    env: Arc<DispatchEnv>,
    /// Cleared by any handler that calls `stop_propagation`.
    is_propagating: AtomicBool,
    /// Set only on contexts created for error handlers.
    error: Option<Arc<anyhow::Error>>,
}

impl DispatchContext {
    /// Creates the base context for one update.
    pub fn new(update: Arc<Update>, env: Arc<DispatchEnv>) -> Self {
        Self {
            update,
            env,
            is_propagating: AtomicBool::new(true),
            error: None,
        }
    }

    /// Creates a context carrying `error`, for error handlers.
    pub(crate) fn with_error(&self, error: Arc<anyhow::Error>) -> Arc<Self> {
        Arc::new(Self {
            update: Arc::clone(&self.update),
            env: Arc::clone(&self.env),
            is_propagating: AtomicBool::new(true),
            error: Some(error),
        })
    }

    /// Creates a fresh context for the same update.
    ///
    /// Used for work that runs outside the original dispatch cycle, such as
    /// conversation timeout routes.
    pub fn fork(&self) -> Arc<Self> {
        Arc::new(Self::new(Arc::clone(&self.update), Arc::clone(&self.env)))
    }

    pub fn update(&self) -> &Arc<Update> {
        &self.update
    }

    pub fn env(&self) -> &Arc<DispatchEnv> {
        &self.env
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.env.store
    }

    pub fn error(&self) -> Option<&Arc<anyhow::Error>> {
        self.error.as_ref()
    }

    /// Returns `true` if the update is still propagating.
    pub fn is_propagating(&self) -> bool {
        self.is_propagating.load(Ordering::SeqCst)
    }

    pub fn stop_propagation(&self) {
        self.is_propagating.store(false, Ordering::SeqCst);
    }

    /// Reports `error` to the error handlers.
    pub async fn report_error(self: &Arc<Self>, error: anyhow::Error) {
        let env = Arc::clone(&self.env);
        env.error_handlers.dispatch(self, error).await;
    }

    /// Runs `fut` in the background, tracked by the application.
    ///
    /// Errors are reported to the error handlers. The task is dropped on
    /// hard stop.
    pub fn spawn<F>(self: &Arc<Self>, fut: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let ctx = Arc::clone(self);
        let abort = self.env.abort.clone();
        self.env.tracker.spawn(async move {
            tokio::select! {
                _ = abort.cancelled() => {
                    debug!(update_id = ctx.update.update_id, "Background task aborted");
                }
                result = fut => {
                    if let Err(err) = result {
                        ctx.report_error(err).await;
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchContext")
            .field("update_id", &self.update.update_id)
            .field("kind", &self.update.kind_name())
            .field("is_propagating", &self.is_propagating())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// CallbackContext
// =============================================================================

/// The full context passed to handler actions.
///
/// # Example
///
/// ```rust,ignore
/// async fn start(ctx: Arc<CallbackContext>) -> anyhow::Result<()> {
///     if let Some(chat) = ctx.chat_data() {
///         chat.set("greeted", true)?;
///     }
///     ctx.stop_propagation();
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct CallbackContext {
    base: Arc<DispatchContext>,
    args: Vec<String>,
    captures: Option<Captures>,
}

impl CallbackContext {
    /// Creates a handler context from the shared base and the predicate's
    /// match data.
    pub fn new(base: Arc<DispatchContext>, matched: Matched) -> Self {
        Self {
            base,
            args: matched.args,
            captures: matched.captures,
        }
    }

    pub fn base(&self) -> &Arc<DispatchContext> {
        &self.base
    }

    pub fn update(&self) -> &Arc<Update> {
        self.base.update()
    }

    pub fn message(&self) -> Option<&Message> {
        self.base.update().effective_message()
    }

    /// Command arguments, split on whitespace.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Regex captures, when the handler matched on a pattern.
    pub fn captures(&self) -> Option<&Captures> {
        self.captures.as_ref()
    }

    /// The error being handled, inside error handlers.
    pub fn error(&self) -> Option<&Arc<anyhow::Error>> {
        self.base.error()
    }

    pub fn store(&self) -> &Arc<DataStore> {
        self.base.store()
    }

    /// Data shared by every update.
    pub fn bot_data(&self) -> DataHandle {
        self.store().bot_data()
    }

    /// Data of the update's effective chat.
    pub fn chat_data(&self) -> Option<DataHandle> {
        let chat_id = self.update().effective_chat_id()?;
        Some(self.store().chat_data(chat_id))
    }

    /// Data of the update's effective user.
    pub fn user_data(&self) -> Option<DataHandle> {
        let user_id = self.update().effective_user_id()?;
        Some(self.store().user_data(user_id))
    }

    /// Stops propagation of this update to later groups.
    pub fn stop_propagation(&self) {
        self.base.stop_propagation();
    }

    pub fn is_propagating(&self) -> bool {
        self.base.is_propagating()
    }

    /// Asks the application to shut down gracefully.
    pub fn request_shutdown(&self) {
        debug!(update_id = self.update().update_id, "Shutdown requested by handler");
        self.base.env().stop_token().cancel();
    }

    /// Runs `fut` in the background; see [`DispatchContext::spawn`].
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.base.spawn(fut);
    }
}
