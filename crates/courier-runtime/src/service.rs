//! The per-update service.
//!
//! The dispatch loop drives updates through a `tower` stack:
//! [`DispatchService`] runs one update through the dispatcher, and
//! [`limited`] wraps it in a [`ConcurrencyLimit`] so at most
//! `concurrency_limit` updates are in flight. A limit of one makes
//! processing strictly sequential in arrival order.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tower::Service;
use tower::limit::ConcurrencyLimit;

use courier_core::Update;
use courier_framework::{Dispatcher, ProcessReport};

/// Runs updates through a [`Dispatcher`].
///
/// Never fails: handler errors are reported to the error handlers and
/// counted in the [`ProcessReport`].
#[derive(Debug, Clone)]
pub struct DispatchService {
    dispatcher: Dispatcher,
}

impl DispatchService {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

impl Service<Arc<Update>> for DispatchService {
    type Response = ProcessReport;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<ProcessReport, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, update: Arc<Update>) -> Self::Future {
        let dispatcher = self.dispatcher.clone();
        Box::pin(async move { Ok(dispatcher.process(update).await) })
    }
}

/// Wraps `dispatcher` in a concurrency bound; `0` means unbounded.
pub fn limited(dispatcher: Dispatcher, limit: usize) -> ConcurrencyLimit<DispatchService> {
    let max = if limit == 0 {
        Semaphore::MAX_PERMITS
    } else {
        limit
    };
    ConcurrencyLimit::new(DispatchService::new(dispatcher), max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::UpdateKind;
    use courier_framework::Matcher;
    use tokio_test::{assert_pending, assert_ready_ok, task};
    use tower::ServiceExt;

    fn update(id: i64) -> Arc<Update> {
        Arc::new(Update::new(
            id,
            UpdateKind::Other {
                kind: "test".into(),
                payload: serde_json::Value::Null,
            },
        ))
    }

    #[tokio::test]
    async fn test_limit_holds_second_call() {
        let dispatcher = Dispatcher::new();
        let gate = Arc::new(tokio::sync::Notify::new());
        let wait = Arc::clone(&gate);
        dispatcher.add_handler(
            Matcher::new()
                .handler(move || {
                    let wait = Arc::clone(&wait);
                    async move { wait.notified().await }
                })
                .boxed(),
            0,
        );

        let mut service = limited(dispatcher, 1);
        let first = ServiceExt::<Arc<Update>>::ready(&mut service)
            .await
            .unwrap()
            .call(update(1));
        let first = tokio::spawn(first);

        let mut second = service.clone();
        let mut ready = task::spawn(ServiceExt::<Arc<Update>>::ready(&mut second));
        assert_pending!(ready.poll());

        gate.notify_one();
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.handled, 1);
        assert!(ready.is_woken());
        assert_ready_ok!(ready.poll());
    }

    #[tokio::test]
    async fn test_zero_is_unbounded() {
        let mut service = limited(Dispatcher::new(), 0);
        let mut calls = Vec::new();
        for id in 0..64 {
            let svc = ServiceExt::<Arc<Update>>::ready(&mut service).await.unwrap();
            calls.push(svc.call(update(id)));
        }
        for call in calls {
            assert_eq!(call.await.unwrap(), ProcessReport::default());
        }
    }
}
