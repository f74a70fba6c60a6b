//! # Provider Transports
//!
//! HTTP clients for the two provider families plus the raw fallback transport.
//! Each one turns a [`ChatRequest`] into a [`ModelResponse`], streaming text deltas
//! into a [`TokenSink`] when one is supplied.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::models::{ImageFormat, LlmProvider};

use super::envelope::{GeminiAccumulator, ModelResponse, OpenAiAccumulator};
use super::error::GatewayError;
use super::message::{ChatMessage, ChatRole, ContentPart};
use super::sse::{is_done, SseDecoder};

/// Tool schema offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Fully resolved provider call.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Provider-side model id
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Receives streamed text deltas.
#[async_trait]
pub trait TokenSink: Send + Sync {
    /// Returns `false` once nobody is listening anymore.
    async fn token(&self, text: &str) -> bool;
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Short provider name for logs and errors
    fn name(&self) -> &'static str;

    async fn complete(
        &self,
        request: &ChatRequest,
        sink: Option<&dyn TokenSink>,
    ) -> Result<ModelResponse, GatewayError>;
}

async fn emit(sink: Option<&dyn TokenSink>, text: &str) -> Result<(), GatewayError> {
    match sink {
        Some(sink) if !sink.token(text).await => Err(GatewayError::Disconnected),
        _ => Ok(()),
    }
}

fn build_client(provider: &'static str, timeout: Duration) -> Result<reqwest::Client, GatewayError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|source| GatewayError::Transport { provider, source })
}

/// Turn a non-2xx response into [`GatewayError::Status`].
async fn check_status(
    provider: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GatewayError::Status {
        provider,
        status: status.as_u16(),
        body: truncate(&body, 500),
    })
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Mid-stream `{"error": {...}}` objects some gateways send instead of a status code.
fn stream_error(provider: &'static str, value: &Value) -> Option<GatewayError> {
    let error = value.get("error")?;
    let status = error
        .get("code")
        .and_then(Value::as_u64)
        .map(|c| c as u16)
        .unwrap_or(500);
    let body = error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    Some(GatewayError::Status {
        provider,
        status,
        body,
    })
}

// === OpenAI-compatible chat completions ===

/// Chat-completions client for OpenRouter and other OpenAI-compatible endpoints.
pub struct OpenAiCompatibleProvider {
    name: &'static str,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        name: &'static str,
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        Ok(Self {
            name,
            client: build_client(name, timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn body(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages.iter().map(openai_message).collect::<Vec<_>>(),
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": stream,
        });
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {"name": t.name, "description": t.description, "parameters": t.parameters}
                    })
                })
                .collect();
        }
        body
    }
}

fn openai_message(message: &ChatMessage) -> Value {
    let content = match message.parts.as_slice() {
        [ContentPart::Text(text)] => Value::String(text.clone()),
        parts => parts
            .iter()
            .map(|p| match p {
                ContentPart::Text(text) => json!({"type": "text", "text": text}),
                ContentPart::Image(asset) => asset.envelope(ImageFormat::OpenAi),
            })
            .collect(),
    };
    let mut value = json!({"role": message.role.as_str(), "content": content});
    if !message.tool_calls.is_empty() {
        value["tool_calls"] = message
            .tool_calls
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "type": "function",
                    "function": {"name": c.name, "arguments": c.arguments.to_string()}
                })
            })
            .collect();
    }
    if let Some(id) = &message.tool_call_id {
        value["tool_call_id"] = Value::String(id.clone());
    }
    value
}

#[async_trait]
impl ChatProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn complete(
        &self,
        request: &ChatRequest,
        sink: Option<&dyn TokenSink>,
    ) -> Result<ModelResponse, GatewayError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(GatewayError::MissingApiKey(LlmProvider::OpenRouter.api_key_env()))?;
        let provider = self.name;

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&self.body(request, sink.is_some()))
            .send()
            .await
            .map_err(|source| GatewayError::Transport { provider, source })?;
        let response = check_status(provider, response).await?;

        if sink.is_none() {
            let body: Value = response
                .json()
                .await
                .map_err(|e| GatewayError::decode(provider, e.to_string()))?;
            return ModelResponse::from_openai(provider, &body);
        }

        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::default();
        let mut acc = OpenAiAccumulator::default();

        'read: loop {
            let (payloads, ended) = match stream.next().await {
                Some(chunk) => {
                    let chunk = chunk.map_err(|source| GatewayError::Transport { provider, source })?;
                    (decoder.push(&chunk), false)
                }
                None => (decoder.finish().into_iter().collect(), true),
            };
            for payload in payloads {
                if is_done(&payload) {
                    break 'read;
                }
                let value: Value = serde_json::from_str(&payload)
                    .map_err(|e| GatewayError::decode(provider, e.to_string()))?;
                if let Some(err) = stream_error(provider, &value) {
                    return Err(err);
                }
                if let Some(delta) = acc.push(&value) {
                    emit(sink, &delta).await?;
                }
            }
            if ended {
                break;
            }
        }

        Ok(acc.finish(&request.model))
    }
}

// === Gemini native ===

/// Native Gemini `generateContent` client.
pub struct GeminiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeminiProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        Ok(Self {
            client: build_client("gemini", timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn body(&self, request: &ChatRequest) -> Value {
        let system: Vec<String> = request
            .messages
            .iter()
            .filter(|m| m.role == ChatRole::System)
            .map(ChatMessage::text)
            .collect();
        let contents: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(gemini_content)
            .collect();

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "temperature": request.temperature,
                "maxOutputTokens": request.max_tokens,
            }
        });
        if !system.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system.join("\n\n")}]});
        }
        if !request.tools.is_empty() {
            let declarations: Vec<Value> = request
                .tools
                .iter()
                .map(|t| json!({"name": t.name, "description": t.description, "parameters": t.parameters}))
                .collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }
        body
    }
}

fn gemini_content(message: &ChatMessage) -> Value {
    let role = match message.role {
        ChatRole::Assistant => "model",
        _ => "user",
    };
    let mut parts: Vec<Value> = message
        .parts
        .iter()
        .map(|p| match p {
            ContentPart::Text(text) if message.role == ChatRole::Tool => json!({
                "text": format!("Tool result {}:\n{}", message.tool_call_id.as_deref().unwrap_or(""), text)
            }),
            ContentPart::Text(text) => json!({"text": text}),
            ContentPart::Image(asset) => asset.envelope(ImageFormat::InlineData),
        })
        .collect();
    parts.extend(
        message
            .tool_calls
            .iter()
            .map(|c| json!({"functionCall": {"name": c.name, "args": c.arguments}})),
    );
    json!({"role": role, "parts": parts})
}

#[async_trait]
impl ChatProvider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn complete(
        &self,
        request: &ChatRequest,
        sink: Option<&dyn TokenSink>,
    ) -> Result<ModelResponse, GatewayError> {
        let provider = self.name();
        let url = match sink {
            Some(_) => format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                self.base_url, request.model
            ),
            None => format!("{}/models/{}:generateContent", self.base_url, request.model),
        };

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|source| GatewayError::Transport { provider, source })?;
        let response = check_status(provider, response).await?;

        if sink.is_none() {
            let body: Value = response
                .json()
                .await
                .map_err(|e| GatewayError::decode(provider, e.to_string()))?;
            return ModelResponse::from_gemini(&request.model, &body);
        }

        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::default();
        let mut acc = GeminiAccumulator::default();

        loop {
            let (payloads, ended) = match stream.next().await {
                Some(chunk) => {
                    let chunk = chunk.map_err(|source| GatewayError::Transport { provider, source })?;
                    (decoder.push(&chunk), false)
                }
                None => (decoder.finish().into_iter().collect(), true),
            };
            for payload in payloads {
                let value: Value = serde_json::from_str(&payload)
                    .map_err(|e| GatewayError::decode(provider, e.to_string()))?;
                if let Some(err) = stream_error(provider, &value) {
                    return Err(err);
                }
                if let Some(delta) = acc.push(&value)? {
                    emit(sink, &delta).await?;
                }
            }
            if ended {
                break;
            }
        }

        acc.finish(provider, &request.model)
    }
}

// === Raw fallback transport ===

/// Plain chat-completions POST with string contents, no tools and no streaming.
///
/// Used once per gateway call for fallback-eligible models after the primary
/// path has failed. The whole reply is pushed to the sink as a single token.
pub struct FallbackTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl FallbackTransport {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        Ok(Self {
            client: build_client("fallback", timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl ChatProvider for FallbackTransport {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn complete(
        &self,
        request: &ChatRequest,
        sink: Option<&dyn TokenSink>,
    ) -> Result<ModelResponse, GatewayError> {
        let provider = self.name();
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(GatewayError::MissingApiKey(LlmProvider::OpenRouter.api_key_env()))?;

        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.flat_text()}))
            .collect();
        let body = json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|source| GatewayError::Transport { provider, source })?;
        let response = check_status(provider, response).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::decode(provider, e.to_string()))?;

        let response = ModelResponse::from_openai(provider, &body)?;
        if response.text().is_empty() {
            return Err(GatewayError::Empty { provider });
        }
        emit(sink, response.text()).await?;
        Ok(response)
    }
}
