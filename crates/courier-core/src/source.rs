//! Update sources.
//!
//! An [`UpdateSource`] is the only way updates enter the dispatch loop. The
//! loop hands it the cursor of the next update it wants and receives a batch
//! back; long polling, webhooks and tests all plug in through this one trait.
//!
//! This module also provides:
//!
//! - [`update_queue`]: an in-process push source, used by webhook ingestion
//!   and tests.
//! - [`RetryingSource`]: wraps another source and retries transient failures
//!   with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::error::{TransportError, TransportResult};
use crate::update::Update;

/// A batch of updates returned by [`UpdateSource::fetch_next`].
#[derive(Debug, Clone, Default)]
pub struct UpdateBatch {
    /// Updates in ascending `update_id` order.
    pub updates: Vec<Update>,
    /// Cursor to pass on the next fetch, if the source tracks one.
    pub next_cursor: Option<i64>,
}

impl UpdateBatch {
    /// Creates a batch, deriving the next cursor from the last update.
    pub fn new(updates: Vec<Update>) -> Self {
        let next_cursor = updates.iter().map(|u| u.update_id + 1).max();
        Self {
            updates,
            next_cursor,
        }
    }

    /// Returns `true` if the batch holds no updates.
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// A producer of updates.
///
/// `cursor` is the smallest `update_id` the caller still wants. Sources
/// that acknowledge by offset (long polling) confirm everything below it;
/// push sources ignore it.
#[async_trait]
pub trait UpdateSource: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Waits for and returns the next batch of updates.
    ///
    /// An empty batch is valid and simply means nothing arrived in time.
    /// [`TransportError::Closed`] ends the stream.
    async fn fetch_next(&self, cursor: Option<i64>) -> TransportResult<UpdateBatch>;

    /// Discards updates that are pending on the remote side.
    ///
    /// Returns the cursor to continue from, if the source knows one.
    async fn drop_pending(&self) -> TransportResult<Option<i64>> {
        Ok(None)
    }

    /// Final acknowledgement: confirms everything below `cursor` and
    /// releases resources.
    async fn close(&self, _cursor: Option<i64>) -> TransportResult<()> {
        Ok(())
    }
}

#[async_trait]
impl<S: UpdateSource + ?Sized> UpdateSource for Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn fetch_next(&self, cursor: Option<i64>) -> TransportResult<UpdateBatch> {
        (**self).fetch_next(cursor).await
    }

    async fn drop_pending(&self) -> TransportResult<Option<i64>> {
        (**self).drop_pending().await
    }

    async fn close(&self, cursor: Option<i64>) -> TransportResult<()> {
        (**self).close(cursor).await
    }
}

// ============================================================================
// In-process queue
// ============================================================================

/// Maximum number of updates a [`QueueSource`] returns per fetch.
const DEFAULT_MAX_BATCH: usize = 100;

/// Creates a bounded in-process queue.
///
/// The [`UpdateQueue`] half is cloned into producers (a webhook server, a
/// test); the [`QueueSource`] half is handed to the dispatch loop. Once every
/// producer is dropped and the queue drains, the source reports
/// [`TransportError::Closed`].
pub fn update_queue(capacity: usize) -> (UpdateQueue, QueueSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        UpdateQueue { tx },
        QueueSource {
            rx: Mutex::new(rx),
            max_batch: DEFAULT_MAX_BATCH,
        },
    )
}

/// Producer half of [`update_queue`].
#[derive(Debug, Clone)]
pub struct UpdateQueue {
    tx: mpsc::Sender<Update>,
}

impl UpdateQueue {
    /// Pushes an update, waiting for capacity.
    pub async fn enqueue(&self, update: Update) -> TransportResult<()> {
        self.tx
            .send(update)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Pushes an update without waiting.
    ///
    /// Fails with [`TransportError::RetryAfter`] when the queue is full so a
    /// webhook can ask the platform to redeliver later.
    pub fn try_enqueue(&self, update: Update) -> TransportResult<()> {
        self.tx.try_send(update).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::RetryAfter(Duration::from_secs(1)),
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Returns `true` if the consuming side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of [`update_queue`].
#[derive(Debug)]
pub struct QueueSource {
    rx: Mutex<mpsc::Receiver<Update>>,
    max_batch: usize,
}

impl QueueSource {
    /// Sets the maximum batch size.
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }
}

#[async_trait]
impl UpdateSource for QueueSource {
    fn name(&self) -> &str {
        "queue"
    }

    async fn fetch_next(&self, _cursor: Option<i64>) -> TransportResult<UpdateBatch> {
        let mut rx = self.rx.lock().await;
        let first = rx.recv().await.ok_or(TransportError::Closed)?;

        let mut updates = vec![first];
        while updates.len() < self.max_batch {
            match rx.try_recv() {
                Ok(update) => updates.push(update),
                Err(_) => break,
            }
        }

        Ok(UpdateBatch {
            updates,
            next_cursor: None,
        })
    }

    async fn drop_pending(&self) -> TransportResult<Option<i64>> {
        let mut rx = self.rx.lock().await;
        let mut dropped = 0usize;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        debug!(dropped, "Dropped pending queued updates");
        Ok(None)
    }

    async fn close(&self, _cursor: Option<i64>) -> TransportResult<()> {
        self.rx.lock().await.close();
        Ok(())
    }
}

// ============================================================================
// Retry wrapper
// ============================================================================

/// Backoff settings for [`RetryingSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum consecutive retries; `None` retries forever.
    pub max_retries: Option<u32>,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for the delay.
    pub max_delay: Duration,
    /// Factor applied to the delay after each failure.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Sets the maximum number of consecutive retries.
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Returns the delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Retries transient fetch failures of the wrapped source.
///
/// Fatal errors and [`TransportError::Closed`] are returned immediately. A
/// server-mandated `retry_after` overrides the computed backoff.
#[derive(Debug)]
pub struct RetryingSource<S> {
    inner: S,
    config: RetryConfig,
}

impl<S: UpdateSource> RetryingSource<S> {
    /// Wraps `inner` with the given backoff settings.
    pub fn new(inner: S, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    /// Returns the wrapped source.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: UpdateSource> UpdateSource for RetryingSource<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch_next(&self, cursor: Option<i64>) -> TransportResult<UpdateBatch> {
        let mut attempt = 0u32;
        loop {
            let err = match self.inner.fetch_next(cursor).await {
                Ok(batch) => return Ok(batch),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            if let Some(max) = self.config.max_retries
                && attempt >= max
            {
                return Err(TransportError::RetriesExhausted {
                    attempts: attempt + 1,
                    last: Box::new(err),
                });
            }

            let delay = err
                .retry_after()
                .unwrap_or_else(|| self.config.delay_for(attempt));
            warn!(
                source = self.inner.name(),
                error = %err,
                attempt = attempt + 1,
                delay = ?delay,
                "Fetching updates failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn drop_pending(&self) -> TransportResult<Option<i64>> {
        self.inner.drop_pending().await
    }

    async fn close(&self, cursor: Option<i64>) -> TransportResult<()> {
        self.inner.close(cursor).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::{UpdateKind, UpdateTag};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn update(id: i64) -> Update {
        Update::new(
            id,
            UpdateKind::Other {
                kind: "test".into(),
                payload: serde_json::Value::Null,
            },
        )
    }

    /// Fails `failures` times with `error`, then yields one update.
    struct Flaky {
        failures: u32,
        error: TransportError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl UpdateSource for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn fetch_next(&self, _cursor: Option<i64>) -> TransportResult<UpdateBatch> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(UpdateBatch::new(vec![update(1)]))
            }
        }
    }

    #[tokio::test]
    async fn test_queue_batches_and_closes() {
        let (queue, source) = update_queue(8);
        queue.enqueue(update(1)).await.unwrap();
        queue.enqueue(update(2)).await.unwrap();

        let batch = source.fetch_next(None).await.unwrap();
        assert_eq!(batch.updates.len(), 2);
        assert_eq!(batch.updates[0].tag(), UpdateTag::Other);

        drop(queue);
        let err = source.fetch_next(None).await.unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_try_enqueue_full() {
        let (queue, _source) = update_queue(1);
        queue.try_enqueue(update(1)).unwrap();
        let err = queue.try_enqueue(update(2)).unwrap_err();
        assert!(err.retry_after().is_some());
    }

    #[test]
    fn test_batch_cursor() {
        let batch = UpdateBatch::new(vec![update(4), update(7), update(5)]);
        assert_eq!(batch.next_cursor, Some(8));
        assert!(UpdateBatch::new(Vec::new()).next_cursor.is_none());
    }

    #[test]
    fn test_delay_is_capped() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for(0), Duration::from_secs(1));
        assert_eq!(config.delay_for(2), Duration::from_secs(4));
        assert_eq!(config.delay_for(10), Duration::from_secs(30));
        assert_eq!(config.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers() {
        let source = RetryingSource::new(
            Flaky {
                failures: 3,
                error: TransportError::Network("reset".into()),
                calls: AtomicU32::new(0),
            },
            RetryConfig::default(),
        );

        let batch = source.fetch_next(None).await.unwrap();
        assert_eq!(batch.updates.len(), 1);
        assert_eq!(source.inner().calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let source = RetryingSource::new(
            Flaky {
                failures: 10,
                error: TransportError::api(502, "Bad Gateway"),
                calls: AtomicU32::new(0),
            },
            RetryConfig::default().with_max_retries(2),
        );

        let err = source.fetch_next(None).await.unwrap_err();
        assert!(matches!(err, TransportError::RetriesExhausted { attempts: 3, .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let source = RetryingSource::new(
            Flaky {
                failures: 10,
                error: TransportError::Unauthorized("bad token".into()),
                calls: AtomicU32::new(0),
            },
            RetryConfig::default(),
        );

        let err = source.fetch_next(None).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(source.inner().calls.load(Ordering::SeqCst), 1);
    }
}
