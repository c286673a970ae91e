//! The application: dispatch loop and lifecycle.
//!
//! An [`Application`] owns a [`Dispatcher`], pulls updates from an
//! [`UpdateSource`] and runs each one as a tracked task through a
//! concurrency-limited service. It keeps the update checkpoint, loads and
//! flushes persistent data, and shuts down in two stages: a graceful stop
//! lets in-flight updates finish within the grace period, a hard stop
//! cancels them.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use courier_runtime::Application;
//!
//! let app = Application::load()?;
//! app.add_handler(on_command("start").handler(start), 0)?;
//! app.run_polling().await?;
//! ```
//!
//! # Custom Sources
//!
//! ```rust,ignore
//! let (queue, source) = update_queue(64);
//! let app = Application::builder().concurrency_limit(4).build();
//!
//! tokio::spawn(feed(queue));
//! app.run(source).await?;
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};
use tracing::{debug, error, info, trace, warn};

use courier_core::{RetryConfig, Update, UpdateSource};
use courier_framework::{
    BoxedHandler, DataStore, Dispatcher, ErrorHandler, Handler, JsonFilePersistence,
    MemoryPersistence, Partitions, Persistence, ProcessReport, Revisions,
};

use crate::checkpoint::Checkpoint;
use crate::config::{
    ConfigLoader, CourierConfig, DispatchConfig, PersistenceBackend, PersistenceConfig,
};
use crate::error::{ApplicationError, ApplicationResult};
use crate::logging;
use crate::service;

/// A running (or runnable) bot application.
///
/// Cheap to clone; clones control the same application, so a clone can be
/// moved into a task that calls [`stop`](Self::stop) later.
#[derive(Clone)]
pub struct Application {
    inner: Arc<Inner>,
}

struct Inner {
    config: CourierConfig,
    dispatcher: Dispatcher,
    concurrency_limit: usize,
    grace_period: Option<Duration>,
    drop_pending_updates: bool,
    stop_signals: bool,
    persistence: Option<Arc<dyn Persistence>>,
    partitions: Partitions,
    flush_interval: Duration,
    checkpoint: Checkpoint,
    /// Store revisions at the last successful flush.
    flushed: Mutex<Revisions>,
    /// Serializes flushes.
    flush_lock: tokio::sync::Mutex<()>,
    persistent_names: Mutex<HashSet<String>>,
    initialized: AtomicBool,
    running: AtomicBool,
}

impl Application {
    /// Creates an application with default settings and no persistence.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::new()
    }

    /// Loads `courier.toml` from the current directory (plus `COURIER_*`
    /// variables) and builds the application from it.
    pub fn load() -> ApplicationResult<Self> {
        let config = ConfigLoader::new().with_current_dir().load()?;
        Self::from_config(&config)
    }

    /// Creates an application from configuration.
    ///
    /// This initializes logging from the `[logging]` section and creates
    /// the configured persistence backend.
    pub fn from_config(config: &CourierConfig) -> ApplicationResult<Self> {
        logging::init_from_config(&config.logging);

        info!(
            log_level = %config.logging.level,
            concurrency_limit = config.dispatch.concurrency_limit,
            persistence = ?config.persistence.backend,
            "Application initialized from configuration"
        );

        Ok(ApplicationBuilder::from_config(config.clone()).build())
    }

    pub fn config(&self) -> &CourierConfig {
        &self.inner.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn store(&self) -> &Arc<DataStore> {
        self.inner.dispatcher.store()
    }

    /// The committed update cursor.
    pub fn committed_cursor(&self) -> Option<i64> {
        self.inner.checkpoint.committed()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst) && !self.stop_token().is_cancelled()
    }

    fn stop_token(&self) -> &CancellationToken {
        self.inner.dispatcher.env().stop_token()
    }

    fn abort_token(&self) -> &CancellationToken {
        self.inner.dispatcher.env().abort_token()
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Registers `handler` at the end of `group`.
    ///
    /// Returns the registered handle, which
    /// [`remove_handler`](Self::remove_handler) accepts.
    ///
    /// Fails with [`ApplicationError::InvalidHandler`] for a persistent
    /// conversation when the application has no persistence, or when another
    /// persistent conversation already uses the same name.
    pub fn add_handler<H: Handler>(&self, handler: H, group: i32) -> ApplicationResult<BoxedHandler> {
        self.add_boxed_handler(Arc::new(handler), group)
    }

    pub fn add_boxed_handler(
        &self,
        handler: BoxedHandler,
        group: i32,
    ) -> ApplicationResult<BoxedHandler> {
        if let Some(name) = handler.persistent_name() {
            if self.inner.persistence.is_none() {
                return Err(ApplicationError::InvalidHandler(format!(
                    "conversation '{name}' is persistent but the application has no persistence"
                )));
            }
            if !self.inner.persistent_names.lock().insert(name.to_string()) {
                return Err(ApplicationError::InvalidHandler(format!(
                    "a persistent conversation named '{name}' is already registered"
                )));
            }
        }

        // Late registrations still see the loaded data.
        if self.inner.initialized.load(Ordering::SeqCst) {
            handler.restore(self.store());
        }
        self.inner
            .dispatcher
            .add_handler(Arc::clone(&handler), group);
        Ok(handler)
    }

    /// Unregisters `handler` from `group`. Returns `false` if it was not
    /// registered there.
    pub fn remove_handler(&self, handler: &BoxedHandler, group: i32) -> bool {
        let removed = self.inner.dispatcher.remove_handler(handler, group);
        if removed && let Some(name) = handler.persistent_name() {
            self.inner.persistent_names.lock().remove(name);
        }
        removed
    }

    pub fn add_error_handler(&self, handler: ErrorHandler) {
        self.inner.dispatcher.add_error_handler(handler);
    }

    // =========================================================================
    // Processing
    // =========================================================================

    /// Loads persistent data and restores handler state.
    ///
    /// Called by [`run`](Self::run); only the first call has an effect.
    pub async fn initialize(&self) -> ApplicationResult<()> {
        let inner = &self.inner;
        if inner.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let store = self.store();
        if let Some(persistence) = &inner.persistence {
            let data = match persistence.load(inner.partitions).await {
                Ok(data) => data,
                Err(err) => {
                    inner.initialized.store(false, Ordering::SeqCst);
                    return Err(err.into());
                }
            };
            store.populate(data, inner.partitions);
            debug!(cursor = ?store.cursor(), "Loaded persistent data");
        }

        for handler in inner.dispatcher.registry().all() {
            handler.restore(store);
        }

        if let Some(cursor) = store.cursor() {
            inner.checkpoint.skip_to(cursor);
        }
        *inner.flushed.lock() = store.revisions();
        Ok(())
    }

    /// Dispatches one update directly, bypassing the source and the
    /// checkpoint.
    ///
    /// For tests and for servers that receive updates on their own.
    pub async fn process_update(&self, update: Update) -> ProcessReport {
        self.inner.dispatcher.process(update).await
    }

    /// Writes the partitions that changed since the last successful flush.
    ///
    /// A failed flush leaves them dirty, so the next flush retries them.
    pub async fn flush(&self) -> ApplicationResult<()> {
        let inner = &self.inner;
        let Some(persistence) = &inner.persistence else {
            return Ok(());
        };
        let _guard = inner.flush_lock.lock().await;

        let store = self.store();
        let current = store.revisions();
        let last = *inner.flushed.lock();
        let dirty = current.dirty_since(&last).intersect(inner.partitions);
        if dirty.is_empty() {
            trace!("Nothing to flush");
            return Ok(());
        }

        let data = store.snapshot(dirty);
        persistence.flush(&data, dirty).await?;
        *inner.flushed.lock() = current;
        debug!(partitions = ?dirty, "Flushed persistent data");
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Runs the dispatch loop over `source` until it is stopped or the
    /// source closes.
    ///
    /// On the way out the loop drains in-flight updates, flushes
    /// persistence and hands the committed cursor to
    /// [`UpdateSource::close`]. Fatal source errors end the loop and are
    /// returned after the drain.
    pub async fn run<S: UpdateSource>(&self, source: S) -> ApplicationResult<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(ApplicationError::AlreadyRunning);
        }
        self.initialize().await?;

        let signals = self.inner.stop_signals.then(|| {
            tokio::spawn(listen_for_signals(
                self.stop_token().clone(),
                self.abort_token().clone(),
            ))
        });
        let flusher = self.spawn_flusher();

        info!(source = source.name(), "Application is now running");
        let result = match self.drop_pending(&source).await {
            Ok(()) => self.pump(&source).await,
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            error!(error = %err, "Dispatch loop failed");
        }

        let shutdown = self.shutdown(&source, flusher).await;
        if let Some(signals) = signals {
            signals.abort();
        }
        info!("Application stopped");
        result.and(shutdown)
    }

    /// Long-polls the Bot API with the `[bot]` and `[polling]` settings.
    #[cfg(feature = "polling")]
    pub async fn run_polling(&self) -> ApplicationResult<()> {
        use courier_core::RetryingSource;
        use courier_transport::polling::{PollingSettings, PollingSource};

        let config = &self.inner.config;
        let token = config
            .bot
            .token
            .clone()
            .ok_or_else(|| crate::config::ConfigError::missing_field("bot.token"))?;
        let settings = PollingSettings {
            api_url: config.bot.api_url.clone(),
            token,
            timeout: Duration::from_secs(config.polling.timeout_secs),
            limit: config.polling.limit,
            allowed_updates: config.polling.allowed_updates.clone(),
        };

        let source = PollingSource::new(settings)?;
        let source = RetryingSource::new(source, config.polling.retry.to_retry_config());
        self.run(source).await
    }

    /// Serves the webhook endpoint with the `[webhook]` settings and
    /// dispatches what it receives.
    #[cfg(feature = "webhook")]
    pub async fn run_webhook(&self) -> ApplicationResult<()> {
        use courier_transport::webhook::{WebhookServer, WebhookSettings};

        let webhook = &self.inner.config.webhook;
        let settings = WebhookSettings {
            host: webhook.host.clone(),
            port: webhook.port,
            path: webhook.path.clone(),
            secret_token: webhook.secret_token.clone(),
            queue_capacity: webhook.queue_capacity,
        };

        let (server, source) = WebhookServer::bind(settings).await?;
        info!(address = %server.local_addr(), "Webhook server listening");
        let shutdown = self.stop_token().clone().cancelled_owned();
        let server = tokio::spawn(server.serve(shutdown));

        let result = self.run(source).await;
        // The loop cancelled the stop token on its way out.
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "Webhook server failed"),
            Err(err) => warn!(error = %err, "Webhook server task did not complete"),
        }
        result
    }

    /// Requests a graceful stop: no new updates are pulled, in-flight ones
    /// finish within the grace period.
    pub fn stop(&self) {
        if !self.stop_token().is_cancelled() {
            info!("Stopping application");
        }
        self.stop_token().cancel();
    }

    /// Requests a hard stop: in-flight updates are cancelled and never
    /// committed.
    pub fn abort(&self) {
        warn!("Aborting application");
        self.stop_token().cancel();
        self.abort_token().cancel();
    }

    async fn drop_pending<S: UpdateSource>(&self, source: &S) -> ApplicationResult<()> {
        if !self.inner.drop_pending_updates {
            return Ok(());
        }
        match source.drop_pending().await? {
            Some(next) => {
                let committed = next - 1;
                self.inner.checkpoint.skip_to(committed);
                self.store().set_cursor(committed);
                info!(cursor = next, "Dropped pending updates");
            }
            None => info!("Dropped pending updates"),
        }
        Ok(())
    }

    /// Fetches batches and schedules their updates until stopped.
    async fn pump<S: UpdateSource>(&self, source: &S) -> ApplicationResult<()> {
        let inner = &self.inner;
        let env = Arc::clone(inner.dispatcher.env());
        let stop = env.stop_token().clone();
        let mut service = service::limited(inner.dispatcher.clone(), inner.concurrency_limit);
        let backoff = RetryConfig::default();
        let mut failures = 0u32;
        let mut source_cursor: Option<i64> = None;

        loop {
            let cursor = fetch_cursor(inner.checkpoint.committed(), source_cursor);
            let batch = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                fetched = source.fetch_next(cursor) => fetched,
            };

            let batch = match batch {
                Ok(batch) => {
                    failures = 0;
                    batch
                }
                Err(err) if err.is_closed() => {
                    info!(source = source.name(), "Update source closed");
                    break;
                }
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    let delay = err
                        .retry_after()
                        .unwrap_or_else(|| backoff.delay_for(failures));
                    warn!(error = %err, delay = ?delay, "Fetching updates failed");
                    failures = failures.saturating_add(1);
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            let pushed = batch.next_cursor.is_none();
            if let Some(next) = batch.next_cursor {
                source_cursor = Some(source_cursor.map_or(next, |c| c.max(next)));
            }
            trace!(count = batch.updates.len(), "Fetched updates");

            for update in batch.updates {
                // Waiting for a permit keeps arrival order at limit one.
                let ready = tokio::select! {
                    biased;
                    _ = stop.cancelled() => return Ok(()),
                    ready = ServiceExt::<Arc<Update>>::ready(&mut service) => ready,
                };
                let svc = match ready {
                    Ok(svc) => svc,
                    Err(never) => match never {},
                };

                let update_id = update.update_id;
                let fresh = if pushed {
                    inner.checkpoint.begin_pushed(update_id)
                } else {
                    inner.checkpoint.begin(update_id)
                };
                if !fresh {
                    warn!(update_id, "Skipping update that was already processed");
                    continue;
                }

                let processing = svc.call(Arc::new(update));
                let app = self.clone();
                let abort = env.abort_token().clone();
                env.tracker().spawn(async move {
                    tokio::select! {
                        biased;
                        _ = abort.cancelled() => {
                            debug!(update_id, "Update cancelled before completion");
                        }
                        processed = processing => {
                            let report = match processed {
                                Ok(report) => report,
                                Err(never) => match never {},
                            };
                            trace!(update_id, ?report, "Update processed");
                            app.complete(update_id);
                        }
                    }
                });
            }
        }
        Ok(())
    }

    fn complete(&self, update_id: i64) {
        if let Some(committed) = self.inner.checkpoint.complete(update_id) {
            self.store().set_cursor(committed);
        }
    }

    fn spawn_flusher(&self) -> Option<JoinHandle<()>> {
        self.inner.persistence.as_ref()?;
        let app = self.clone();
        let stop = self.stop_token().clone();
        let period = self.inner.flush_interval;

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = app.flush().await {
                            warn!(error = %err, "Flushing persistent data failed, retrying at the next checkpoint");
                        }
                    }
                }
            }
        }))
    }

    /// Drains in-flight work, flushes and closes the source.
    async fn shutdown<S: UpdateSource>(
        &self,
        source: &S,
        flusher: Option<JoinHandle<()>>,
    ) -> ApplicationResult<()> {
        let inner = &self.inner;
        let env = inner.dispatcher.env();
        // Also disarms conversation timers.
        self.stop_token().cancel();

        let tracker = env.tracker();
        tracker.close();
        debug!(in_flight = inner.checkpoint.in_flight(), "Waiting for in-flight updates");
        match inner.grace_period {
            Some(grace) => {
                if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
                    warn!(
                        in_flight = inner.checkpoint.in_flight(),
                        "Grace period elapsed, cancelling in-flight updates"
                    );
                    self.abort_token().cancel();
                    tracker.wait().await;
                }
            }
            None => tracker.wait().await,
        }

        if let Some(flusher) = flusher
            && let Err(err) = flusher.await
        {
            warn!(error = %err, "Flush task did not complete");
        }
        let flushed = self.flush().await;
        if let Err(err) = &flushed {
            error!(error = %err, "Final flush failed");
        }

        let cursor = inner.checkpoint.committed().map(|c| c + 1);
        if let Err(err) = source.close(cursor).await {
            warn!(error = %err, "Closing the update source failed");
        }
        flushed
    }
}

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = &self.inner;
        f.debug_struct("Application")
            .field("dispatcher", &inner.dispatcher)
            .field("concurrency_limit", &inner.concurrency_limit)
            .field("grace_period", &inner.grace_period)
            .field("has_persistence", &inner.persistence.is_some())
            .field("committed", &inner.checkpoint.committed())
            .field("running", &inner.running.load(Ordering::SeqCst))
            .finish()
    }
}

/// The cursor to fetch from: past the committed id, and never behind what
/// the source already handed out.
fn fetch_cursor(committed: Option<i64>, source_cursor: Option<i64>) -> Option<i64> {
    match (committed.map(|c| c + 1), source_cursor) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// The first Ctrl+C or SIGTERM stops gracefully, the second aborts.
async fn listen_for_signals(stop: CancellationToken, abort: CancellationToken) {
    tokio::select! {
        _ = stop.cancelled() => {}
        received = wait_for_signal() => match received {
            Ok(()) => stop.cancel(),
            Err(err) => {
                warn!(error = %err, "Cannot listen for stop signals");
                return;
            }
        }
    }

    tokio::select! {
        _ = abort.cancelled() => {}
        received = wait_for_signal() => {
            if received.is_ok() {
                warn!("Second stop signal, cancelling in-flight updates");
                abort.cancel();
            }
        }
    }
}

async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        tokio::select! {
            received = signal::ctrl_c() => {
                received?;
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}

// =============================================================================
// ApplicationBuilder
// =============================================================================

/// Builder for an [`Application`].
///
/// # Example
///
/// ```rust,ignore
/// let app = Application::builder()
///     .concurrency_limit(8)
///     .grace_period(Some(Duration::from_secs(10)))
///     .persistence(JsonFilePersistence::single_file("data.json"))
///     .build();
/// ```
pub struct ApplicationBuilder {
    config: CourierConfig,
    grace_period: Option<Duration>,
    persistence: Option<Arc<dyn Persistence>>,
    partitions: Partitions,
    flush_interval: Duration,
    dispatcher: Option<Dispatcher>,
}

impl ApplicationBuilder {
    pub fn new() -> Self {
        Self::from_config(CourierConfig::default())
    }

    /// Starts from `config`, including its persistence backend.
    pub fn from_config(config: CourierConfig) -> Self {
        let persistence = backend_for(&config.persistence);
        Self {
            grace_period: config.dispatch.grace_period(),
            partitions: config.persistence.partitions,
            flush_interval: config.persistence.update_interval(),
            persistence,
            config,
            dispatcher: None,
        }
    }

    /// Replaces the dispatch settings.
    pub fn dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.grace_period = dispatch.grace_period();
        self.config.dispatch = dispatch;
        self
    }

    /// Maximum number of updates processed at once; 0 means unbounded.
    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.config.dispatch.concurrency_limit = limit;
        self
    }

    /// How long a graceful stop waits; `None` waits indefinitely.
    pub fn grace_period(mut self, grace_period: Option<Duration>) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn drop_pending_updates(mut self, drop: bool) -> Self {
        self.config.dispatch.drop_pending_updates = drop;
        self
    }

    /// Whether Ctrl+C and SIGTERM stop the application.
    pub fn stop_signals(mut self, enabled: bool) -> Self {
        self.config.dispatch.stop_signals = enabled;
        self
    }

    pub fn persistence(mut self, persistence: impl Persistence) -> Self {
        self.persistence = Some(Arc::new(persistence));
        self
    }

    pub fn shared_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Which partitions are loaded and flushed.
    pub fn partitions(mut self, partitions: Partitions) -> Self {
        self.partitions = partitions;
        self
    }

    /// Time between periodic flushes.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Uses an existing dispatcher instead of a fresh one.
    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn build(self) -> Application {
        let dispatch = &self.config.dispatch;
        let inner = Inner {
            dispatcher: self.dispatcher.unwrap_or_default(),
            concurrency_limit: dispatch.concurrency_limit,
            grace_period: self.grace_period,
            drop_pending_updates: dispatch.drop_pending_updates,
            stop_signals: dispatch.stop_signals,
            persistence: self.persistence,
            partitions: self.partitions,
            flush_interval: self.flush_interval.max(Duration::from_millis(1)),
            checkpoint: Checkpoint::default(),
            flushed: Mutex::new(Revisions::default()),
            flush_lock: tokio::sync::Mutex::new(()),
            persistent_names: Mutex::new(HashSet::new()),
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            config: self.config,
        };
        Application {
            inner: Arc::new(inner),
        }
    }
}

impl Default for ApplicationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn backend_for(config: &PersistenceConfig) -> Option<Arc<dyn Persistence>> {
    match config.backend {
        PersistenceBackend::None => None,
        PersistenceBackend::Memory => Some(Arc::new(MemoryPersistence::new())),
        PersistenceBackend::Json if config.single_file => {
            Some(Arc::new(JsonFilePersistence::single_file(&config.path)))
        }
        PersistenceBackend::Json => Some(Arc::new(JsonFilePersistence::per_partition(
            &config.path,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_framework::{ConversationHandler, Matcher, Outcome};

    #[test]
    fn test_fetch_cursor() {
        assert_eq!(fetch_cursor(None, None), None);
        assert_eq!(fetch_cursor(Some(4), None), Some(5));
        assert_eq!(fetch_cursor(None, Some(9)), Some(9));
        assert_eq!(fetch_cursor(Some(10), Some(9)), Some(11));
        assert_eq!(fetch_cursor(Some(3), Some(9)), Some(9));
    }

    #[test]
    fn test_builder_from_config() {
        let mut config = CourierConfig::default();
        config.dispatch.concurrency_limit = 0;
        config.dispatch.grace_period_secs = None;
        config.persistence.backend = PersistenceBackend::Memory;

        let app = ApplicationBuilder::from_config(config).build();
        assert_eq!(app.inner.concurrency_limit, 0);
        assert_eq!(app.inner.grace_period, None);
        assert!(app.inner.persistence.is_some());
    }

    fn persistent_conversation(name: &str) -> ConversationHandler {
        ConversationHandler::builder()
            .entry(Matcher::new().handler(|| async { Outcome::goto("A") }))
            .name(name)
            .persistent(true)
            .build()
            .unwrap()
    }

    #[test]
    fn test_persistent_conversation_needs_persistence() {
        let app = Application::new();
        let err = app
            .add_handler(persistent_conversation("signup"), 0)
            .err().unwrap();
        assert!(matches!(err, ApplicationError::InvalidHandler(_)));
    }

    #[test]
    fn test_persistent_names_are_unique() {
        let app = Application::builder()
            .persistence(MemoryPersistence::new())
            .build();
        let first = app.add_handler(persistent_conversation("signup"), 0).unwrap();
        assert!(app.add_handler(persistent_conversation("signup"), 1).is_err());

        assert!(app.remove_handler(&first, 0));
        assert!(app.add_handler(persistent_conversation("signup"), 1).is_ok());
    }
}
