// Streaming client for an Ollama-compatible inference backend
// (chat, embeddings, model listing over newline-delimited JSON).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::InferenceError;

pub const DELTA_CHANNEL_CAPACITY: usize = 256;

const RETRY_BACKOFF: Duration = Duration::from_millis(500);

// Aggregate ceiling for one streamed call, as a multiple of the
// per-delta deadline.
const HARD_CEILING_FACTOR: u32 = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub name: String,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Abstract streaming-chat backend. The orchestrator and the template
/// retriever only see this trait; tests substitute a scripted fake.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Open a streamed generation. Deltas arrive in order on the returned
    /// channel; their concatenation is the full reply. Errors arrive
    /// in-band and terminate the stream.
    fn stream_chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        temperature: f32,
        deadline: Duration,
    ) -> mpsc::Receiver<Result<String, InferenceError>>;

    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, InferenceError>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError>;

    /// Collect a streamed generation into one string. Used for the
    /// non-streaming auto-score call.
    async fn chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        temperature: f32,
        deadline: Duration,
    ) -> Result<String, InferenceError> {
        let mut rx = self.stream_chat(model, messages, temperature, deadline);
        let mut reply = String::new();
        while let Some(delta) = rx.recv().await {
            reply.push_str(&delta?);
        }
        Ok(reply)
    }
}

#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn pump_chat(
        self,
        model: String,
        messages: Vec<ChatMessage>,
        temperature: f32,
        deadline: Duration,
        tx: mpsc::Sender<Result<String, InferenceError>>,
    ) {
        let hard_deadline = Instant::now() + deadline * HARD_CEILING_FACTOR;
        let mut delivered_any = false;

        for attempt in 0..2 {
            let result = self
                .stream_once(
                    &model,
                    &messages,
                    temperature,
                    deadline,
                    hard_deadline,
                    &tx,
                    &mut delivered_any,
                )
                .await;

            match result {
                Ok(()) => return,
                Err(err) => {
                    // One retry, and only if the stream never produced a
                    // delta; retrying later would duplicate tokens.
                    if attempt == 0 && !delivered_any && err.is_retryable() {
                        tracing::warn!(model = %model, error = %err, "chat stream failed before first delta, retrying once");
                        tokio::time::sleep(RETRY_BACKOFF).await;
                        continue;
                    }
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_once(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
        per_delta: Duration,
        hard_deadline: Instant,
        tx: &mpsc::Sender<Result<String, InferenceError>>,
        delivered_any: &mut bool,
    ) -> Result<(), InferenceError> {
        let request = ChatRequest {
            model,
            messages,
            stream: true,
            options: ChatOptions { temperature },
        };
        let url = format!("{}/api/chat", self.base_url);

        // The first-delta clock runs from request start.
        let mut next_deadline = Instant::now() + per_delta;

        let send = self.client.post(&url).json(&request).send();
        let response = match tokio::time::timeout_at(next_deadline.min(hard_deadline), send).await {
            Err(_) => return Err(InferenceError::Timeout),
            Ok(Err(err)) => return Err(map_request_error(err)),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(InferenceError::ModelMissing(model.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Backend {
                status: status.as_u16(),
                message: truncate(&body, 500),
            });
        }

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let wait_until = next_deadline.min(hard_deadline);
            let chunk = match tokio::time::timeout_at(wait_until, stream.next()).await {
                // Dropping the body stream cancels the upstream request.
                Err(_) => return Err(InferenceError::Timeout),
                Ok(None) => return Ok(()),
                Ok(Some(Err(err))) => return Err(map_request_error(err)),
                Ok(Some(Ok(bytes))) => bytes,
            };

            buffer.extend_from_slice(&chunk);
            while let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
                let line_bytes: Vec<u8> = buffer.drain(..=newline_pos).collect();
                let line = String::from_utf8_lossy(&line_bytes);
                match parse_chat_line(&line) {
                    Some(StreamDelta::Content(text)) => {
                        *delivered_any = true;
                        if tx.send(Ok(text)).await.is_err() {
                            // Consumer went away; nothing left to do.
                            return Ok(());
                        }
                    }
                    Some(StreamDelta::Done) => return Ok(()),
                    None => {}
                }
            }

            next_deadline = Instant::now() + per_delta;
        }
    }
}

#[async_trait]
impl ChatBackend for OllamaClient {
    fn stream_chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        temperature: f32,
        deadline: Duration,
    ) -> mpsc::Receiver<Result<String, InferenceError>> {
        let (tx, rx) = mpsc::channel(DELTA_CHANNEL_CAPACITY);
        let client = self.clone();
        let model = model.to_string();
        tokio::spawn(async move {
            client
                .pump_chat(model, messages, temperature, deadline, tx)
                .await;
        });
        rx
    }

    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, InferenceError> {
        let url = format!("{}/api/embeddings", self.base_url);
        let request = EmbeddingsRequest {
            model,
            prompt: text,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(InferenceError::ModelMissing(model.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Backend {
                status: status.as_u16(),
                message: truncate(&body, 500),
            });
        }

        let body: EmbeddingsResponse = response.json().await.map_err(|err| {
            InferenceError::Backend {
                status: status.as_u16(),
                message: format!("malformed embeddings response: {err}"),
            }
        })?;
        Ok(body.embedding)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Backend {
                status: status.as_u16(),
                message: truncate(&body, 500),
            });
        }

        let body: TagsResponse = response.json().await.map_err(|err| {
            InferenceError::Backend {
                status: status.as_u16(),
                message: format!("malformed tags response: {err}"),
            }
        })?;

        Ok(body
            .models
            .into_iter()
            .map(|model| ModelInfo {
                name: model.name,
                size_bytes: model.size,
                modified_at: model
                    .modified_at
                    .as_deref()
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|dt| dt.with_timezone(&Utc)),
            })
            .collect())
    }
}

fn map_request_error(err: reqwest::Error) -> InferenceError {
    if err.is_timeout() {
        InferenceError::Timeout
    } else {
        InferenceError::BackendUnreachable(err.to_string())
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum StreamDelta {
    Content(String),
    Done,
}

/// One NDJSON record from the chat route. Records carrying neither a
/// content fragment nor a done marker are no-ops.
pub(crate) fn parse_chat_line(line: &str) -> Option<StreamDelta> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let record: ChatStreamRecord = serde_json::from_str(line).ok()?;
    if let Some(message) = record.message {
        if !message.content.is_empty() {
            return Some(StreamDelta::Content(message.content));
        }
    }
    if record.done {
        Some(StreamDelta::Done)
    } else {
        None
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatStreamRecord {
    #[serde(default)]
    message: Option<StreamMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
    #[serde(default)]
    size: u64,
    modified_at: Option<String>,
}
