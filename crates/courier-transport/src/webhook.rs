//! Webhook ingestion.
//!
//! [`WebhookServer`] is an axum server with a single POST route. Each
//! request body is one update; it is decoded and pushed into an
//! [`update_queue`], whose [`QueueSource`] half feeds the dispatch loop.
//!
//! Responses tell the Bot API whether to redeliver:
//!
//! | Status | Meaning |
//! |--------|---------|
//! | 200 | Queued |
//! | 400 | Body is not an update; redelivery would not help |
//! | 403 | Secret token header missing or wrong |
//! | 503 | Queue full or the application is stopping |

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use tokio::net::TcpListener;
use tracing::{debug, info, trace, warn};

use courier_core::{QueueSource, TransportError, TransportResult, Update, UpdateQueue, update_queue};

/// Header carrying the secret token set with `setWebhook`.
pub const SECRET_TOKEN_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Settings for [`WebhookServer`].
#[derive(Clone)]
pub struct WebhookSettings {
    pub host: String,
    pub port: u16,
    /// Path of the update endpoint.
    pub path: String,
    /// Required value of the secret token header.
    pub secret_token: Option<String>,
    /// Updates buffered between the server and the dispatch loop.
    pub queue_capacity: usize,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8443,
            path: "/webhook".to_string(),
            secret_token: None,
            queue_capacity: 1024,
        }
    }
}

impl std::fmt::Debug for WebhookSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("has_secret_token", &self.secret_token.is_some())
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

/// Shared state of the update route.
struct WebhookState {
    queue: UpdateQueue,
    secret_token: Option<String>,
}

/// A bound webhook server.
#[derive(Debug)]
pub struct WebhookServer {
    listener: TcpListener,
    router: Router,
    local_addr: SocketAddr,
}

impl WebhookServer {
    /// Binds the listening socket and creates the update queue.
    ///
    /// Returns the server and the source the dispatch loop reads from.
    pub async fn bind(settings: WebhookSettings) -> TransportResult<(Self, QueueSource)> {
        let (queue, source) = update_queue(settings.queue_capacity);
        let router = router(&settings, queue);

        let listener = TcpListener::bind((settings.host.as_str(), settings.port)).await?;
        let local_addr = listener.local_addr()?;
        debug!(address = %local_addr, path = %settings.path, "Webhook socket bound");

        Ok((
            Self {
                listener,
                router,
                local_addr,
            },
            source,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves requests until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> TransportResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;
        info!(address = %self.local_addr, "Webhook server stopped");
        Ok(())
    }
}

/// Builds the update route, for mounting into an existing axum app.
pub fn router(settings: &WebhookSettings, queue: UpdateQueue) -> Router {
    let path = if settings.path.starts_with('/') {
        settings.path.clone()
    } else {
        format!("/{}", settings.path)
    };
    let state = Arc::new(WebhookState {
        queue,
        secret_token: settings.secret_token.clone(),
    });

    Router::new()
        .route(&path, post(receive_update))
        .with_state(state)
}

async fn receive_update(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(expected) = &state.secret_token {
        let given = headers
            .get(SECRET_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok());
        if given != Some(expected.as_str()) {
            warn!("Rejected webhook request with a missing or wrong secret token");
            return StatusCode::FORBIDDEN;
        }
    }

    let update: Update = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(err) => {
            warn!(error = %err, len = body.len(), "Rejected webhook body that is not an update");
            return StatusCode::BAD_REQUEST;
        }
    };

    let update_id = update.update_id;
    match state.queue.try_enqueue(update) {
        Ok(()) => {
            trace!(update_id, "Queued webhook update");
            StatusCode::OK
        }
        Err(TransportError::Closed) => {
            debug!(update_id, "Dispatch loop is gone, asking for redelivery");
            StatusCode::SERVICE_UNAVAILABLE
        }
        Err(err) => {
            warn!(update_id, error = %err, "Update queue is full, asking for redelivery");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use courier_core::UpdateSource;
    use tower::ServiceExt;

    const UPDATE: &str = r#"{"update_id": 11, "message": {"message_id": 1, "date": 0, "chat": {"id": 5, "type": "private"}, "text": "hi"}}"#;

    fn request(secret: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::post("/hook").header("content-type", "application/json");
        if let Some(secret) = secret {
            builder = builder.header(SECRET_TOKEN_HEADER, secret);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn settings(secret: Option<&str>, capacity: usize) -> WebhookSettings {
        WebhookSettings {
            path: "hook".to_string(),
            secret_token: secret.map(str::to_string),
            queue_capacity: capacity,
            ..WebhookSettings::default()
        }
    }

    #[tokio::test]
    async fn test_update_is_queued() {
        let (queue, source) = update_queue(4);
        let app = router(&settings(None, 4), queue);

        let response = app.oneshot(request(None, UPDATE)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let batch = source.fetch_next(None).await.unwrap();
        assert_eq!(batch.updates[0].update_id, 11);
    }

    #[tokio::test]
    async fn test_secret_token_is_checked() {
        let (queue, _source) = update_queue(4);
        let app = router(&settings(Some("s3cret"), 4), queue);

        let missing = app.clone().oneshot(request(None, UPDATE)).await.unwrap();
        assert_eq!(missing.status(), StatusCode::FORBIDDEN);

        let wrong = app.clone().oneshot(request(Some("nope"), UPDATE)).await.unwrap();
        assert_eq!(wrong.status(), StatusCode::FORBIDDEN);

        let right = app.oneshot(request(Some("s3cret"), UPDATE)).await.unwrap();
        assert_eq!(right.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_bad_body_and_full_queue() {
        let (queue, _source) = update_queue(1);
        let app = router(&settings(None, 1), queue);

        let bad = app.clone().oneshot(request(None, "{}")).await.unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let first = app.clone().oneshot(request(None, UPDATE)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let full = app.oneshot(request(None, UPDATE)).await.unwrap();
        assert_eq!(full.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
