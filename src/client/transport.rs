//! Run transport: how the client reaches the backend.

use std::sync::OnceLock;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::TryStreamExt;

use crate::error::KestrelError;
use crate::types::{ConversationId, ConversationMode};
use crate::util::RetryPolicy;

/// Raw event-stream bytes as delivered by the transport.
pub type ByteStream = BoxStream<'static, Result<Bytes, KestrelError>>;

/// Backend interface consumed by the client session.
#[async_trait]
pub trait RunTransport: Send + Sync {
    /// Begin a run for a user message, returning the wire event stream.
    ///
    /// `conversation_id` is `None` on the first turn; the backend mints the
    /// conversation and reports its id in the `start` event.
    async fn begin_run(
        &self,
        conversation_id: Option<ConversationId>,
        text: &str,
        mode: ConversationMode,
        page_context: Option<&serde_json::Value>,
    ) -> Result<ByteStream, KestrelError>;

    /// Switch the conversation's active mode. Synchronous call, never part
    /// of a run.
    async fn set_mode(
        &self,
        conversation_id: ConversationId,
        mode: ConversationMode,
    ) -> Result<(), KestrelError>;
}

static SHARED_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// Get (or create) the shared reqwest client.
pub fn shared_client() -> &'static reqwest::Client {
    SHARED_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to build HTTP client")
    })
}

/// Map an HTTP failure status onto the error taxonomy.
pub fn status_to_error(status: u16, body: &str) -> KestrelError {
    match status {
        401 | 403 => KestrelError::Authentication(body.to_string()),
        404 | 410 => KestrelError::StaleConversation(if body.is_empty() {
            "conversation not recognized".to_string()
        } else {
            body.to_string()
        }),
        429 => KestrelError::RateLimited {
            retry_after_ms: extract_retry_after(body),
        },
        _ => KestrelError::api(status, body),
    }
}

fn extract_retry_after(body: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("retry_after"))
                .and_then(|r| r.as_f64())
                .map(|s| (s * 1000.0) as u64)
        })
}

/// HTTP implementation of [`RunTransport`].
#[derive(Debug, Clone)]
pub struct HttpRunTransport {
    base_url: String,
    retry: RetryPolicy,
}

impl HttpRunTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl RunTransport for HttpRunTransport {
    async fn begin_run(
        &self,
        conversation_id: Option<ConversationId>,
        text: &str,
        mode: ConversationMode,
        page_context: Option<&serde_json::Value>,
    ) -> Result<ByteStream, KestrelError> {
        let url = format!("{}/runs", self.base_url);
        let body = serde_json::json!({
            "conversation_id": conversation_id,
            "message": text,
            "mode": mode,
            "page_context": page_context,
        });

        let response = self
            .retry
            .execute(|| {
                let url = url.clone();
                let body = body.clone();
                async move {
                    let response = shared_client().post(&url).json(&body).send().await?;
                    let status = response.status();
                    if !status.is_success() {
                        let text = response.text().await.unwrap_or_default();
                        return Err(status_to_error(status.as_u16(), &text));
                    }
                    Ok(response)
                }
            })
            .await?;

        Ok(Box::pin(
            response.bytes_stream().map_err(KestrelError::from),
        ))
    }

    async fn set_mode(
        &self,
        conversation_id: ConversationId,
        mode: ConversationMode,
    ) -> Result<(), KestrelError> {
        let url = format!("{}/conversations/{}/mode", self.base_url, conversation_id);
        let response = shared_client()
            .post(&url)
            .json(&serde_json::json!({ "mode": mode }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_to_error(status.as_u16(), &text));
        }
        Ok(())
    }
}
