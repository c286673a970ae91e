//! Long polling with `getUpdates`.
//!
//! Each fetch sends the cursor as `offset`, which the Bot API treats as the
//! acknowledgement of every update below it. A batch containing an update
//! that fails to decode still advances the cursor past it; the update is
//! logged and skipped so one malformed payload cannot wedge the bot.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, trace, warn};

use courier_core::{TransportError, TransportResult, Update, UpdateBatch, UpdateSource};

/// Added to the long-polling timeout for the HTTP request timeout.
const REQUEST_SLACK: Duration = Duration::from_secs(10);

/// Settings for [`PollingSource`].
#[derive(Clone)]
pub struct PollingSettings {
    /// Base URL of the Bot API server.
    pub api_url: String,
    pub token: String,
    /// How long the server holds a `getUpdates` request open.
    pub timeout: Duration,
    /// Maximum updates per batch (1-100).
    pub limit: u32,
    /// Update kinds to receive; `None` keeps the server's setting.
    pub allowed_updates: Option<Vec<String>>,
}

impl PollingSettings {
    /// Settings for the public Bot API with default polling parameters.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            api_url: "https://api.telegram.org".to_string(),
            token: token.into(),
            timeout: Duration::from_secs(10),
            limit: 100,
            allowed_updates: None,
        }
    }

    pub fn api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit.clamp(1, 100);
        self
    }

    pub fn allowed_updates<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_updates = Some(kinds.into_iter().map(Into::into).collect());
        self
    }
}

impl fmt::Debug for PollingSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingSettings")
            .field("api_url", &self.api_url)
            .field("token", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("limit", &self.limit)
            .field("allowed_updates", &self.allowed_updates)
            .finish()
    }
}

/// The Bot API response envelope.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

/// An [`UpdateSource`] that long-polls the Bot API.
///
/// Transient failures are returned as they are; wrap the source in a
/// [`RetryingSource`](courier_core::RetryingSource) to back off and retry.
pub struct PollingSource {
    client: Client,
    /// `{api_url}/bot{token}`; never logged.
    endpoint: String,
    settings: PollingSettings,
}

impl PollingSource {
    pub fn new(settings: PollingSettings) -> TransportResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let endpoint = format!(
            "{}/bot{}",
            settings.api_url.trim_end_matches('/'),
            settings.token
        );
        Ok(Self {
            client,
            endpoint,
            settings,
        })
    }

    pub fn settings(&self) -> &PollingSettings {
        &self.settings
    }

    /// Calls a Bot API method and unwraps the response envelope.
    async fn call<T>(&self, method: &str, params: Value, timeout: Duration) -> TransportResult<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = self
            .client
            .post(format!("{}/{method}", self.endpoint))
            .json(&params)
            .timeout(timeout + REQUEST_SLACK)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.without_url().to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Network(e.without_url().to_string()))?;

        let envelope: ApiResponse<T> = match serde_json::from_slice(&body) {
            Ok(envelope) => envelope,
            Err(err) if status.is_success() => return Err(err.into()),
            Err(_) => return Err(status_error(status, String::from_utf8_lossy(&body).into_owned())),
        };

        if envelope.ok {
            return envelope
                .result
                .ok_or_else(|| TransportError::Decode(format!("{method} returned no result")));
        }
        Err(envelope_error(status, envelope))
    }

    async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout: Duration,
        limit: u32,
    ) -> TransportResult<Vec<Value>> {
        let mut params = json!({
            "timeout": timeout.as_secs(),
            "limit": limit,
        });
        if let Some(offset) = offset {
            params["offset"] = json!(offset);
        }
        if let Some(kinds) = &self.settings.allowed_updates {
            params["allowed_updates"] = json!(kinds);
        }
        self.call("getUpdates", params, timeout).await
    }
}

fn envelope_error<T>(status: StatusCode, envelope: ApiResponse<T>) -> TransportError {
    if let Some(delay) = envelope.parameters.and_then(|p| p.retry_after) {
        return TransportError::RetryAfter(Duration::from_secs(delay));
    }
    let code = envelope.error_code.unwrap_or(i64::from(status.as_u16()));
    let description = envelope.description.unwrap_or_default();
    classify(code, description)
}

fn status_error(status: StatusCode, body: String) -> TransportError {
    classify(i64::from(status.as_u16()), body)
}

/// 401 and 404 both mean the token was rejected.
fn classify(code: i64, description: String) -> TransportError {
    match code {
        401 | 404 => TransportError::Unauthorized(description),
        _ => TransportError::api(code, description),
    }
}

/// Decodes a batch, skipping updates that do not decode.
fn decode_batch(values: Vec<Value>) -> UpdateBatch {
    let next_cursor = values
        .iter()
        .filter_map(|v| v.get("update_id").and_then(Value::as_i64))
        .max()
        .map(|id| id + 1);

    let updates = values
        .into_iter()
        .filter_map(|value| {
            let update_id = value.get("update_id").and_then(Value::as_i64);
            match Update::from_value(value) {
                Ok(update) => Some(update),
                Err(err) => {
                    warn!(update_id, error = %err, "Skipping update that failed to decode");
                    None
                }
            }
        })
        .collect();

    UpdateBatch {
        updates,
        next_cursor,
    }
}

#[async_trait]
impl UpdateSource for PollingSource {
    fn name(&self) -> &str {
        "polling"
    }

    async fn fetch_next(&self, cursor: Option<i64>) -> TransportResult<UpdateBatch> {
        let values = self
            .get_updates(cursor, self.settings.timeout, self.settings.limit)
            .await?;
        trace!(count = values.len(), offset = cursor, "Polled updates");
        Ok(decode_batch(values))
    }

    /// Deletes any webhook and the updates queued on the server.
    async fn drop_pending(&self) -> TransportResult<Option<i64>> {
        let _: bool = self
            .call(
                "deleteWebhook",
                json!({ "drop_pending_updates": true }),
                Duration::ZERO,
            )
            .await?;
        Ok(None)
    }

    /// Confirms every update below `cursor` with a non-blocking
    /// `getUpdates`.
    async fn close(&self, cursor: Option<i64>) -> TransportResult<()> {
        let Some(cursor) = cursor else {
            return Ok(());
        };
        self.get_updates(Some(cursor), Duration::ZERO, 1).await?;
        debug!(offset = cursor, "Confirmed processed updates");
        Ok(())
    }
}

impl fmt::Debug for PollingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingSource")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_batch_skips_bad_updates() {
        let batch = decode_batch(vec![
            json!({ "update_id": 5, "message": { "message_id": 1, "date": 0, "chat": { "id": 1, "type": "private" } } }),
            json!({ "update_id": 6, "message": "not an object" }),
        ]);
        assert_eq!(batch.updates.len(), 1);
        assert_eq!(batch.updates[0].update_id, 5);
        assert_eq!(batch.next_cursor, Some(7));
    }

    #[test]
    fn test_envelope_errors() {
        let flood: ApiResponse<()> = serde_json::from_value(json!({
            "ok": false,
            "error_code": 429,
            "description": "Too Many Requests: retry after 7",
            "parameters": { "retry_after": 7 }
        }))
        .unwrap();
        let err = envelope_error(StatusCode::TOO_MANY_REQUESTS, flood);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));

        let rejected: ApiResponse<()> = serde_json::from_value(json!({
            "ok": false,
            "error_code": 401,
            "description": "Unauthorized"
        }))
        .unwrap();
        assert!(envelope_error(StatusCode::UNAUTHORIZED, rejected).is_fatal());

        assert!(status_error(StatusCode::BAD_GATEWAY, "<html>".into()).is_retryable());
        assert!(status_error(StatusCode::NOT_FOUND, String::new()).is_fatal());
    }

    #[test]
    fn test_token_is_not_in_debug_output() {
        let source = PollingSource::new(PollingSettings::new("123:secret")).unwrap();
        assert!(!format!("{source:?}").contains("secret"));
    }
}
