//! Update dispatcher for the Courier framework.
//!
//! The [`Dispatcher`] routes one update through the registered handlers:
//!
//! 1. Groups are visited in ascending order.
//! 2. Within a group, the first handler whose `check` matches runs. If its
//!    outcome is [`Outcome::fall_through`], the next matching handler of the
//!    same group gets a chance.
//! 3. [`Outcome::stop`], a [`StopPropagation`](crate::StopPropagation) error
//!    or a call to `stop_propagation()` skips all remaining groups.
//! 4. Any other error is routed to the error handlers and dispatch moves on
//!    to the next group.
//!
//! ```rust,ignore
//! let dispatcher = Dispatcher::new();
//! dispatcher.add_handler(on_command("start").handler(start).boxed(), 0);
//! dispatcher.add_handler(Matcher::new().block(false).handler(audit).boxed(), 1);
//!
//! let report = dispatcher.process(update).await;
//! ```

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{Instrument, Level, debug, span, trace, warn};

use courier_core::Update;

use crate::context::{DispatchContext, DispatchEnv};
use crate::error::as_stop_signal;
use crate::error_handler::ErrorHandler;
use crate::handler::{BoxedHandler, HandlerResult};
use crate::outcome::Flow;
use crate::registry::HandlerRegistry;
use crate::store::DataStore;

/// Summary of one `process` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    /// Number of handler actions that ran, background ones included.
    pub handled: usize,
    /// Whether propagation was stopped before the last group.
    pub stopped: bool,
    /// Number of handler actions that failed.
    pub failed: usize,
}

/// How the outcome of one handler affects the group loop.
enum Step {
    NextHandler,
    NextGroup,
    Stop,
}

/// The central update dispatcher.
///
/// Cheap to clone; clones share handlers, error handlers and data.
#[derive(Clone, Default)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    env: Arc<DispatchEnv>,
}

impl Dispatcher {
    /// Creates a dispatcher with an empty data store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a dispatcher over an existing environment.
    pub fn with_env(env: Arc<DispatchEnv>) -> Self {
        Self {
            registry: Arc::new(HandlerRegistry::new()),
            env,
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn env(&self) -> &Arc<DispatchEnv> {
        &self.env
    }

    pub fn store(&self) -> &Arc<DataStore> {
        self.env.store()
    }

    /// Registers `handler` at the end of `group`.
    pub fn add_handler(&self, handler: BoxedHandler, group: i32) {
        self.registry.add_handler(handler, group);
    }

    /// Unregisters `handler` from `group`. No-op if it is not there.
    pub fn remove_handler(&self, handler: &BoxedHandler, group: i32) -> bool {
        self.registry.remove_handler(handler, group)
    }

    /// Appends an error handler.
    pub fn add_error_handler(&self, handler: ErrorHandler) {
        self.env.error_handlers().add(handler);
    }

    /// Routes `update` through all handler groups.
    ///
    /// Returns once every action started for this update, background ones
    /// included, has finished.
    pub async fn process(&self, update: impl Into<Arc<Update>>) -> ProcessReport {
        let update: Arc<Update> = update.into();
        let span = span!(
            Level::DEBUG,
            "dispatch",
            update_id = update.update_id,
            kind = %update.kind_name()
        );
        self.process_inner(update).instrument(span).await
    }

    async fn process_inner(&self, update: Arc<Update>) -> ProcessReport {
        let ctx = Arc::new(DispatchContext::new(
            Arc::clone(&update),
            Arc::clone(&self.env),
        ));
        let groups = self.registry.snapshot();
        let mut report = ProcessReport::default();
        let mut background = JoinSet::new();

        'groups: for (group, handlers) in groups.iter() {
            for handler in handlers {
                let Some(matched) = handler.check(&update) else {
                    continue;
                };
                report.handled += 1;

                if !handler.is_blocking() {
                    trace!(group, handler = handler.name(), "Spawning non-blocking handler");
                    let handler = Arc::clone(handler);
                    let ctx = Arc::clone(&ctx);
                    background.spawn(
                        async move {
                            let result = handler.handle(matched, Arc::clone(&ctx)).await;
                            settle(&ctx, handler.name(), result).await
                        }
                        .in_current_span(),
                    );
                    // The group is done; its outcome cannot steer dispatch.
                    break;
                }

                debug!(group, handler = handler.name(), "Handler matched");
                let result = handler.handle(matched, Arc::clone(&ctx)).await;
                let (step, failed) = settle(&ctx, handler.name(), result).await;
                if failed {
                    report.failed += 1;
                }

                if !ctx.is_propagating() {
                    report.stopped = true;
                    break 'groups;
                }
                match step {
                    Step::NextHandler => continue,
                    Step::NextGroup => break,
                    Step::Stop => {
                        debug!(group, handler = handler.name(), "Propagation stopped");
                        report.stopped = true;
                        break 'groups;
                    }
                }
            }
        }

        while let Some(joined) = background.join_next().await {
            match joined {
                Ok((_, true)) => report.failed += 1,
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "Background handler task did not complete");
                    report.failed += 1;
                }
            }
        }

        report
    }
}

/// Interprets a handler result. Errors are reported here.
async fn settle(ctx: &Arc<DispatchContext>, handler: &str, result: HandlerResult) -> (Step, bool) {
    match result {
        Ok(outcome) => {
            let step = match outcome.flow() {
                Flow::FallThrough => Step::NextHandler,
                Flow::NextGroup => Step::NextGroup,
                Flow::Stop => Step::Stop,
            };
            (step, false)
        }
        Err(err) if as_stop_signal(&err).is_some() => (Step::Stop, false),
        Err(err) => {
            debug!(handler, error = %err, "Handler failed");
            ctx.report_error(err).await;
            (Step::NextGroup, true)
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handler_count", &self.registry.len())
            .field("error_handler_count", &self.env.error_handlers().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StopPropagation;
    use crate::matcher::Matcher;
    use crate::outcome::Outcome;
    use courier_core::UpdateKind;
    use parking_lot::Mutex;

    fn update() -> Update {
        Update::new(
            1,
            UpdateKind::Other {
                kind: "test".into(),
                payload: serde_json::Value::Null,
            },
        )
    }

    type Log = Arc<Mutex<Vec<&'static str>>>;

    /// A matcher that records `label` and returns `outcome`.
    fn recorder(log: &Log, label: &'static str, outcome: Outcome) -> BoxedHandler {
        let log = Arc::clone(log);
        Matcher::new()
            .name(label)
            .handler(move || {
                let log = Arc::clone(&log);
                let outcome = outcome.clone();
                async move {
                    log.lock().push(label);
                    outcome
                }
            })
            .boxed()
    }

    #[tokio::test]
    async fn test_dispatch_no_handlers() {
        let report = Dispatcher::new().process(update()).await;
        assert_eq!(report, ProcessReport::default());
    }

    #[tokio::test]
    async fn test_single_match_per_group() {
        let log = Log::default();
        let dispatcher = Dispatcher::new();
        dispatcher.add_handler(recorder(&log, "g0-a", Outcome::handled()), 0);
        dispatcher.add_handler(recorder(&log, "g0-b", Outcome::handled()), 0);
        dispatcher.add_handler(recorder(&log, "g1-a", Outcome::handled()), 1);
        dispatcher.add_handler(recorder(&log, "g-1", Outcome::handled()), -1);

        let report = dispatcher.process(update()).await;

        assert_eq!(*log.lock(), ["g-1", "g0-a", "g1-a"]);
        assert_eq!(report.handled, 3);
        assert!(!report.stopped);
    }

    #[tokio::test]
    async fn test_fall_through_tries_next_in_group() {
        let log = Log::default();
        let dispatcher = Dispatcher::new();
        dispatcher.add_handler(recorder(&log, "declines", Outcome::fall_through()), 0);
        dispatcher.add_handler(recorder(&log, "accepts", Outcome::handled()), 0);
        dispatcher.add_handler(recorder(&log, "unreached", Outcome::handled()), 0);

        dispatcher.process(update()).await;
        assert_eq!(*log.lock(), ["declines", "accepts"]);
    }

    #[tokio::test]
    async fn test_stop_skips_later_groups() {
        let log = Log::default();
        let dispatcher = Dispatcher::new();
        dispatcher.add_handler(recorder(&log, "stopper", Outcome::stop()), 0);
        dispatcher.add_handler(recorder(&log, "later", Outcome::handled()), 1);

        let report = dispatcher.process(update()).await;
        assert!(report.stopped);
        assert_eq!(*log.lock(), ["stopper"]);
    }

    #[tokio::test]
    async fn test_stop_propagation_error_is_not_an_error() {
        let log = Log::default();
        let dispatcher = Dispatcher::new();
        dispatcher.add_handler(
            Matcher::new()
                .handler(|| async { Err::<(), _>(StopPropagation::new()) })
                .boxed(),
            0,
        );
        dispatcher.add_handler(recorder(&log, "later", Outcome::handled()), 1);
        let errors = Arc::new(Mutex::new(0));
        let seen = Arc::clone(&errors);
        dispatcher.add_error_handler(ErrorHandler::new(move || {
            let seen = Arc::clone(&seen);
            async move {
                *seen.lock() += 1;
            }
        }));

        let report = dispatcher.process(update()).await;
        assert!(report.stopped);
        assert_eq!(report.failed, 0);
        assert!(log.lock().is_empty());
        assert_eq!(*errors.lock(), 0);
    }

    #[tokio::test]
    async fn test_error_isolation() {
        let log = Log::default();
        let dispatcher = Dispatcher::new();
        dispatcher.add_handler(
            Matcher::new()
                .handler(|| async { Err::<(), _>(anyhow::anyhow!("boom")) })
                .boxed(),
            0,
        );
        dispatcher.add_handler(recorder(&log, "same-group", Outcome::handled()), 0);
        dispatcher.add_handler(recorder(&log, "next-group", Outcome::handled()), 1);

        let caught = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&caught);
        dispatcher.add_error_handler(ErrorHandler::new(move |err: crate::Failure| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(err.to_string());
            }
        }));

        let report = dispatcher.process(update()).await;
        assert_eq!(report.failed, 1);
        assert_eq!(*caught.lock(), ["boom"]);
        assert_eq!(*log.lock(), ["next-group"]);

        // The dispatcher is still usable afterwards.
        let again = dispatcher.process(update()).await;
        assert_eq!(again.failed, 1);
    }

    #[tokio::test]
    async fn test_non_blocking_handler_is_awaited() {
        let log = Log::default();
        let dispatcher = Dispatcher::new();
        let slow_log = Arc::clone(&log);
        dispatcher.add_handler(
            Matcher::new()
                .block(false)
                .handler(move || {
                    let log = Arc::clone(&slow_log);
                    async move {
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        log.lock().push("background");
                    }
                })
                .boxed(),
            0,
        );
        dispatcher.add_handler(recorder(&log, "foreground", Outcome::handled()), 1);

        let report = dispatcher.process(update()).await;
        assert_eq!(report.handled, 2);
        assert_eq!(*log.lock(), ["foreground", "background"]);
    }

    #[tokio::test]
    async fn test_ctx_stop_propagation() {
        let log = Log::default();
        let dispatcher = Dispatcher::new();
        dispatcher.add_handler(
            Matcher::new()
                .handler(|ctx: Arc<crate::CallbackContext>| async move {
                    ctx.stop_propagation();
                })
                .boxed(),
            0,
        );
        dispatcher.add_handler(recorder(&log, "later", Outcome::handled()), 1);

        assert!(dispatcher.process(update()).await.stopped);
        assert!(log.lock().is_empty());
    }
}
