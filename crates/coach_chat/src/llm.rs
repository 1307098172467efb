//! Streaming producer for OpenAI-compatible chat completions.
//!
//! Configured from environment variables:
//! - `OPENAI_API_KEY` (required)
//! - `COACH_LLM_MODEL` (optional model override)
//! - `OPENAI_BASE_URL` (optional, for compatible gateways)

use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use eventsource_stream::{EventStream, Eventsource};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ChatError, ChatResult};
use crate::producer::{GenerationRequest, ModelProducer, ProducerItem, ProducerStream};
use crate::types::MessageRole;

const DEFAULT_MODEL: &str = "gpt-5-mini";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const MAX_RETRIES: u32 = 3;

/// Model producer backed by a streaming chat-completions endpoint
pub struct OpenAiProducer {
    api_key: String,
    model: String,
    base_url: String,
    system_prompt: Option<String>,
    client: reqwest::Client,
}

impl OpenAiProducer {
    pub fn new(api_key: String, model: Option<String>, base_url: Option<String>) -> Self {
        Self {
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: base_url
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            system_prompt: None,
            client: reqwest::Client::new(),
        }
    }

    /// Create a producer from environment variables
    pub fn from_env() -> ChatResult<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| ChatError::LlmNotConfigured)?;
        if api_key.is_empty() {
            return Err(ChatError::LlmNotConfigured);
        }

        let model = std::env::var("COACH_LLM_MODEL").ok().filter(|m| !m.is_empty());
        let base_url = std::env::var("OPENAI_BASE_URL").ok().filter(|u| !u.is_empty());
        Ok(Self::new(api_key, model, base_url))
    }

    /// Override the model, e.g. from the config file
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request(&self, request: &GenerationRequest) -> OpenAIRequest {
        let mut messages = Vec::with_capacity(request.transcript.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            messages.push(OpenAIMessage {
                role: "system".to_string(),
                content: prompt.clone(),
            });
        }
        messages.extend(request.transcript.iter().map(|entry| OpenAIMessage {
            role: match entry.role {
                MessageRole::User => "user".to_string(),
                MessageRole::Assistant => "assistant".to_string(),
            },
            content: entry.content.clone(),
        }));

        OpenAIRequest {
            model: self.model.clone(),
            messages,
            tools: request
                .tools
                .iter()
                .map(|tool| OpenAITool {
                    tool_type: "function",
                    function: OpenAIFunction {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.input_schema.clone(),
                    },
                })
                .collect(),
            stream: true,
        }
    }

    async fn send_with_retry(&self, body: &OpenAIRequest) -> ChatResult<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                // Exponential backoff: 2s, 4s
                let delay = std::time::Duration::from_secs(1 << attempt);
                tokio::time::sleep(delay).await;
            }

            let response = match self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = Some(ChatError::Producer(format!("Network error: {}", e)));
                    continue;
                }
            };

            let status = response.status();
            if status.is_server_error() || status.as_u16() == 429 {
                let text = response.text().await.unwrap_or_default();
                last_error = Some(ChatError::Producer(format!(
                    "API error {} (attempt {}/{}): {}",
                    status,
                    attempt + 1,
                    MAX_RETRIES,
                    text
                )));
                continue;
            }

            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(ChatError::Producer(format!("API error {}: {}", status, text)));
            }

            return Ok(response);
        }

        Err(last_error.unwrap_or_else(|| ChatError::Producer("Max retries exceeded".to_string())))
    }
}

#[async_trait]
impl ModelProducer for OpenAiProducer {
    async fn generate(&self, request: GenerationRequest) -> ChatResult<ProducerStream> {
        let body = self.build_request(&request);
        debug!(
            session_id = %request.session_id,
            model = %self.model,
            messages = body.messages.len(),
            "Starting chat completion stream"
        );

        let response = self.send_with_retry(&body).await?;
        Ok(ChatCompletionsStream::new(response.bytes_stream().boxed()).boxed())
    }

    fn name(&self) -> &str {
        "openai"
    }
}

/// Server-sent events of a streaming chat completion, decoded into
/// producer items.
///
/// Tool call arguments arrive in pieces keyed by index; a call is emitted
/// once the choice reports a finish reason or the stream sends `[DONE]`.
/// A body that ends without `[DONE]` ends the stream without `Finished`.
pub struct ChatCompletionsStream<S> {
    inner: EventStream<S>,
    tools: BTreeMap<u32, ToolCallBuilder>,
    pending: VecDeque<ChatResult<ProducerItem>>,
    done: bool,
}

#[derive(Debug, Default)]
struct ToolCallBuilder {
    name: String,
    arguments: String,
}

impl<S> ChatCompletionsStream<S> {
    pub fn new(stream: S) -> Self
    where
        S: Eventsource,
    {
        Self {
            inner: stream.eventsource(),
            tools: BTreeMap::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    fn handle_event_data(&mut self, data: &str) {
        let data = data.trim();
        if data.is_empty() {
            return;
        }

        if data == "[DONE]" {
            self.flush_tools();
            self.pending.push_back(Ok(ProducerItem::Finished));
            self.done = true;
            return;
        }

        let chunk: OpenAIChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Skipping undecodable stream chunk: {}", e);
                return;
            }
        };

        if let Some(error) = chunk.error {
            self.pending
                .push_back(Err(ChatError::Producer(format!("API stream error: {}", error))));
            return;
        }

        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    self.pending.push_back(Ok(ProducerItem::Fragment(content)));
                }
            }
            for call in choice.delta.tool_calls {
                let builder = self.tools.entry(call.index).or_default();
                if let Some(function) = call.function {
                    if let Some(name) = function.name {
                        builder.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        builder.arguments.push_str(&arguments);
                    }
                }
            }
            if choice.finish_reason.is_some() {
                self.flush_tools();
            }
        }
    }

    fn flush_tools(&mut self) {
        for (_, builder) in std::mem::take(&mut self.tools) {
            // Unparseable arguments still reach the tool parser, which rejects them
            let arguments = if builder.arguments.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&builder.arguments).unwrap_or(Value::String(builder.arguments))
            };
            self.pending.push_back(Ok(ProducerItem::ToolCall {
                name: builder.name,
                arguments,
            }));
        }
    }
}

impl<S, B, E> Stream for ChatCompletionsStream<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    type Item = ChatResult<ProducerItem>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Poll::Ready(Some(item));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => self.handle_event_data(&event.data),
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(ChatError::Producer(format!(
                        "SSE stream error: {}",
                        e
                    )))));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// OpenAI API types

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAITool>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OpenAITool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: OpenAIFunction,
}

#[derive(Debug, Serialize)]
struct OpenAIFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct OpenAIChunk {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    #[serde(default)]
    delta: OpenAIDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAIToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAIToolCallDelta {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    function: Option<OpenAIFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAIFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
