use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use courier_core::{
    TransportError, TransportResult, Update, UpdateBatch, UpdateSource, update_queue,
};
use courier_framework::{
    ChatData, ConversationHandler, ErrorHandler, Failure, JsonFilePersistence, Matcher,
    MemoryPersistence, Persistence, State, filters, on_command, on_message,
};
use courier_runtime::{Application, ApplicationError};

fn message(update_id: i64, chat: i64, text: &str) -> Update {
    let mut msg = json!({
        "message_id": update_id,
        "date": 0,
        "chat": { "id": chat, "type": "private" },
        "from": { "id": chat, "is_bot": false, "first_name": "Ann" },
        "text": text,
    });
    if text.starts_with('/') {
        let length = text.split_whitespace().next().map_or(0, |w| w.len());
        msg["entities"] = json!([{ "type": "bot_command", "offset": 0, "length": length }]);
    }
    Update::from_value(json!({ "update_id": update_id, "message": msg })).unwrap()
}

fn quiet() -> courier_runtime::ApplicationBuilder {
    Application::builder().stop_signals(false)
}

/// Records the update ids the handler saw.
fn recorder(seen: &Arc<Mutex<Vec<i64>>>) -> Matcher {
    let seen = Arc::clone(seen);
    on_message(filters::text()).handler(move |update: Arc<Update>| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().push(update.update_id);
        }
    })
}

/// Feeds `updates` through a queue whose producer is then dropped, so the
/// run ends once they are processed.
async fn run_with(app: &Application, updates: Vec<Update>) -> Result<(), ApplicationError> {
    let (queue, source) = update_queue(updates.len().max(1));
    for update in updates {
        queue.enqueue(update).await.unwrap();
    }
    drop(queue);
    app.run(source).await
}

/// Hands out its batches in order, then reports the stream closed.
struct ScriptedSource {
    batches: Mutex<Vec<TransportResult<UpdateBatch>>>,
    closed_with: Mutex<Option<Option<i64>>>,
}

impl ScriptedSource {
    fn new(mut batches: Vec<TransportResult<UpdateBatch>>) -> Self {
        batches.reverse();
        Self {
            batches: Mutex::new(batches),
            closed_with: Mutex::new(None),
        }
    }
}

#[async_trait]
impl UpdateSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch_next(&self, _cursor: Option<i64>) -> TransportResult<UpdateBatch> {
        self.batches.lock().pop().unwrap_or(Err(TransportError::Closed))
    }

    async fn close(&self, cursor: Option<i64>) -> TransportResult<()> {
        *self.closed_with.lock() = Some(cursor);
        Ok(())
    }
}

#[tokio::test]
async fn test_redelivered_updates_run_once() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let app = quiet().build();
    app.add_handler(recorder(&seen), 0).unwrap();

    let source = Arc::new(ScriptedSource::new(vec![
        Ok(UpdateBatch::new(vec![message(1, 7, "a"), message(2, 7, "b")])),
        Ok(UpdateBatch::new(vec![message(2, 7, "b"), message(1, 7, "a")])),
        Ok(UpdateBatch::new(vec![message(3, 7, "c")])),
    ]));
    app.run(Arc::clone(&source)).await.unwrap();

    assert_eq!(*seen.lock(), [1, 2, 3]);
    assert_eq!(app.committed_cursor(), Some(3));
    assert_eq!(app.store().cursor(), Some(3));
    assert_eq!(*source.closed_with.lock(), Some(Some(4)));
}

#[tokio::test]
async fn test_pushed_updates_below_cursor_still_run() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let app = quiet().build();
    app.add_handler(recorder(&seen), 0).unwrap();

    let (queue, source) = update_queue(8);
    let running = tokio::spawn({
        let app = app.clone();
        async move { app.run(source).await }
    });

    queue.enqueue(message(5, 7, "late")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while app.committed_cursor() != Some(5) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    // Webhook deliveries can overtake each other.
    queue.enqueue(message(4, 7, "early")).await.unwrap();
    queue.enqueue(message(5, 7, "late")).await.unwrap();
    drop(queue);
    running.await.unwrap().unwrap();

    assert_eq!(*seen.lock(), [5, 4]);
    assert_eq!(app.committed_cursor(), Some(5));
}

#[tokio::test]
async fn test_limit_one_keeps_arrival_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let app = quiet().concurrency_limit(1).build();
    let log = Arc::clone(&seen);
    app.add_handler(
        on_message(filters::text()).handler(move |update: Arc<Update>| {
            let log = Arc::clone(&log);
            async move {
                // Later updates finish faster if they are allowed to overlap.
                let delay = 30 - update.update_id as u64 * 5;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                log.lock().push(update.update_id);
            }
        }),
        0,
    )
    .unwrap();

    let updates = (1..=5).map(|id| message(id, id, "hi")).collect();
    run_with(&app, updates).await.unwrap();

    assert_eq!(*seen.lock(), [1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let app = quiet().concurrency_limit(3).build();

    let (now, max) = (Arc::clone(&running), Arc::clone(&peak));
    app.add_handler(
        on_message(filters::text()).handler(move || {
            let (now, max) = (Arc::clone(&now), Arc::clone(&max));
            async move {
                let current = now.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                now.fetch_sub(1, Ordering::SeqCst);
            }
        }),
        0,
    )
    .unwrap();

    let updates = (1..=12).map(|id| message(id, id, "hi")).collect();
    run_with(&app, updates).await.unwrap();

    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert_eq!(app.committed_cursor(), Some(12));
}

#[tokio::test]
async fn test_failures_are_reported_and_loop_survives() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let app = quiet().build();

    app.add_handler(
        on_message(filters::text()).handler(|update: Arc<Update>| async move {
            if update.update_id == 2 {
                anyhow::bail!("update {} is cursed", update.update_id);
            }
            Ok(())
        }),
        0,
    )
    .unwrap();
    app.add_handler(recorder(&seen), 1).unwrap();

    let sink = Arc::clone(&errors);
    app.add_error_handler(ErrorHandler::new(move |failure: Failure| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().push(failure.0.to_string());
        }
    }));

    let updates = (1..=3).map(|id| message(id, 5, "hi")).collect();
    run_with(&app, updates).await.unwrap();

    assert_eq!(*errors.lock(), ["update 2 is cursed"]);
    assert_eq!(*seen.lock(), [1, 2, 3]);
    assert_eq!(app.committed_cursor(), Some(3));
}

#[tokio::test]
async fn test_fatal_source_error_ends_run() {
    let app = quiet().build();
    let source = ScriptedSource::new(vec![
        Ok(UpdateBatch::new(vec![message(1, 1, "hi")])),
        Err(TransportError::Unauthorized("bad token".into())),
    ]);

    let err = app.run(source).await.unwrap_err();
    assert!(matches!(
        err,
        ApplicationError::Transport(TransportError::Unauthorized(_))
    ));
    assert_eq!(app.committed_cursor(), Some(1));
}

#[tokio::test]
async fn test_second_run_is_rejected() {
    let app = quiet().build();
    run_with(&app, Vec::new()).await.unwrap();

    let err = run_with(&app, Vec::new()).await.unwrap_err();
    assert!(matches!(err, ApplicationError::AlreadyRunning));
}

#[tokio::test]
async fn test_drop_pending_updates() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let app = quiet().drop_pending_updates(true).build();
    app.add_handler(recorder(&seen), 0).unwrap();

    let updates = (1..=3).map(|id| message(id, 1, "old")).collect();
    run_with(&app, updates).await.unwrap();

    assert!(seen.lock().is_empty());
}

#[tokio::test]
async fn test_graceful_stop_finishes_in_flight() {
    let finished = Arc::new(AtomicUsize::new(0));
    let app = quiet().concurrency_limit(0).build();

    let done = Arc::clone(&finished);
    let stopper = app.clone();
    app.add_handler(
        on_message(filters::text()).handler(move || {
            let done = Arc::clone(&done);
            let stopper = stopper.clone();
            async move {
                stopper.stop();
                tokio::time::sleep(Duration::from_millis(20)).await;
                done.fetch_add(1, Ordering::SeqCst);
            }
        }),
        0,
    )
    .unwrap();

    let (queue, source) = update_queue(8);
    queue.enqueue(message(1, 1, "hi")).await.unwrap();
    app.run(source).await.unwrap();

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(app.committed_cursor(), Some(1));
    assert!(!app.is_running());
    // The producer outlived the run.
    drop(queue);
}

#[tokio::test(start_paused = true)]
async fn test_grace_period_cancels_stuck_updates() {
    let app = quiet()
        .concurrency_limit(0)
        .grace_period(Some(Duration::from_secs(5)))
        .build();

    let stopper = app.clone();
    app.add_handler(
        on_message(filters::text()).handler(move |update: Arc<Update>| {
            let stopper = stopper.clone();
            async move {
                if update.update_id == 2 {
                    stopper.stop();
                    std::future::pending::<()>().await;
                }
            }
        }),
        0,
    )
    .unwrap();

    let source = ScriptedSource::new(vec![Ok(UpdateBatch::new(vec![
        message(1, 1, "ok"),
        message(2, 2, "stuck"),
        message(3, 3, "ok"),
    ]))]);
    app.run(source).await.unwrap();

    // 2 never completed, so the cursor cannot pass it.
    assert_eq!(app.committed_cursor(), Some(1));
}

#[tokio::test]
async fn test_data_round_trips_through_persistence() {
    let backend = Arc::new(MemoryPersistence::new());

    let counter = || {
        on_message(filters::text()).handler(|chat: ChatData| async move {
            let count = chat.get::<u32>("count").unwrap_or(0);
            chat.set("count", count + 1)
        })
    };

    let first = quiet()
        .shared_persistence(Arc::clone(&backend) as Arc<dyn Persistence>)
        .build();
    first.add_handler(counter(), 0).unwrap();
    run_with(&first, vec![message(1, 42, "a"), message(2, 42, "b")])
        .await
        .unwrap();

    let saved = backend.data();
    assert_eq!(saved.chat_data[&42]["count"], 2);
    assert_eq!(saved.update_cursor, Some(2));

    // A restart resumes the data and skips what was already committed.
    let second = quiet()
        .shared_persistence(Arc::clone(&backend) as Arc<dyn Persistence>)
        .build();
    second.add_handler(counter(), 0).unwrap();
    run_with(&second, vec![message(2, 42, "b"), message(3, 42, "c")])
        .await
        .unwrap();

    assert_eq!(backend.data().chat_data[&42]["count"], 3);
    assert_eq!(second.committed_cursor(), Some(3));
}

#[tokio::test]
async fn test_conversation_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bot.json");
    let replies = Arc::new(Mutex::new(Vec::new()));

    let conversation = |replies: &Arc<Mutex<Vec<String>>>| {
        let replies = Arc::clone(replies);
        ConversationHandler::builder()
            .name("signup")
            .persistent(true)
            .entry(on_command("start").handler(|| async { State::from("NAME") }))
            .state(
                "NAME",
                [on_message(filters::text()).handler(move |update: Arc<Update>| {
                    let replies = Arc::clone(&replies);
                    async move {
                        let text = update.effective_message().and_then(|m| m.text.clone());
                        replies.lock().push(text.unwrap_or_default());
                        courier_framework::Transition::End
                    }
                })],
            )
            .build()
            .unwrap()
    };

    let first = quiet()
        .persistence(JsonFilePersistence::single_file(&path))
        .build();
    first.add_handler(conversation(&replies), 0).unwrap();
    run_with(&first, vec![message(1, 9, "/start")]).await.unwrap();
    assert!(path.exists());

    let second = quiet()
        .persistence(JsonFilePersistence::single_file(&path))
        .build();
    second.add_handler(conversation(&replies), 0).unwrap();
    run_with(&second, vec![message(2, 9, "Ann")]).await.unwrap();

    assert_eq!(*replies.lock(), ["Ann"]);
    assert!(second.store().conversations("signup").is_empty());
}
