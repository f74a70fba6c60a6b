//! # Response Envelope
//!
//! Every provider call ends in a [`ModelResponse`], built right after the provider
//! replies. Callers never inspect raw provider JSON; they read [`ModelResponse::text`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::GatewayError;

/// Tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Normalized result of one model call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Provider-side model id that answered
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl ModelResponse {
    pub fn new(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    /// Generated text; empty when the model only requested tools.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Build from a chat-completions body (`choices[0].message`).
    pub fn from_openai(provider: &'static str, body: &Value) -> Result<Self, GatewayError> {
        let choice = body
            .pointer("/choices/0")
            .ok_or_else(|| GatewayError::decode(provider, "response has no choices"))?;
        let message = choice
            .get("message")
            .ok_or_else(|| GatewayError::decode(provider, "choice has no message"))?;

        let text = openai_content_text(message.get("content"));
        let tool_calls = message
            .get("tool_calls")
            .and_then(Value::as_array)
            .map(|calls| calls.iter().filter_map(openai_tool_call).collect())
            .unwrap_or_default();

        let mut response = Self::new(text, body_model(body)).with_tool_calls(tool_calls);
        response.finish_reason = choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(response)
    }

    /// Build from a Gemini `generateContent` body (`candidates[0].content.parts`).
    pub fn from_gemini(model: &str, body: &Value) -> Result<Self, GatewayError> {
        let mut acc = GeminiAccumulator::default();
        acc.push(body)?;
        acc.finish("gemini", model)
    }
}

fn body_model(body: &Value) -> String {
    body.get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// `content` is either a string or an array of `{type: "text", text}` parts.
fn openai_content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn openai_tool_call(call: &Value) -> Option<ToolCall> {
    let function = call.get("function")?;
    Some(ToolCall {
        id: call.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
        name: function.get("name")?.as_str()?.to_string(),
        arguments: parse_arguments(function.get("arguments")),
    })
}

/// Arguments arrive as a JSON-encoded string; keep the raw string if it does not parse.
fn parse_arguments(raw: Option<&Value>) -> Value {
    match raw {
        Some(Value::String(s)) if s.trim().is_empty() => Value::Object(Default::default()),
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone())),
        Some(other) => other.clone(),
        None => Value::Object(Default::default()),
    }
}

/// Highest tool-call slot a streamed chunk may address.
const MAX_STREAMED_TOOL_CALLS: u64 = 64;

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Folds chat-completions stream chunks into one response.
#[derive(Debug, Default)]
pub struct OpenAiAccumulator {
    text: String,
    model: String,
    finish_reason: Option<String>,
    calls: Vec<PartialToolCall>,
}

impl OpenAiAccumulator {
    /// Apply one chunk and return its text delta, if any.
    pub fn push(&mut self, chunk: &Value) -> Option<String> {
        if self.model.is_empty() {
            self.model = body_model(chunk);
        }
        let choice = chunk.pointer("/choices/0")?;
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(reason.to_string());
        }
        let delta = choice.get("delta")?;

        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
                if index >= MAX_STREAMED_TOOL_CALLS {
                    tracing::warn!(index, "Ignoring streamed tool call with out-of-range index");
                    continue;
                }
                let index = index as usize;
                while self.calls.len() <= index {
                    self.calls.push(PartialToolCall::default());
                }
                let slot = &mut self.calls[index];
                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    slot.id = id.to_string();
                }
                if let Some(function) = call.get("function") {
                    if let Some(name) = function.get("name").and_then(Value::as_str) {
                        slot.name.push_str(name);
                    }
                    if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                        slot.arguments.push_str(args);
                    }
                }
            }
        }

        let text = openai_content_text(delta.get("content"));
        if text.is_empty() {
            return None;
        }
        self.text.push_str(&text);
        Some(text)
    }

    pub fn finish(self, fallback_model: &str) -> ModelResponse {
        let tool_calls = self
            .calls
            .into_iter()
            .filter(|c| !c.name.is_empty())
            .map(|c| ToolCall {
                id: c.id,
                name: c.name,
                arguments: parse_arguments(Some(&Value::String(c.arguments))),
            })
            .collect();
        let model = if self.model.is_empty() {
            fallback_model.to_string()
        } else {
            self.model
        };
        ModelResponse {
            text: self.text,
            tool_calls,
            model,
            finish_reason: self.finish_reason,
        }
    }
}

/// Folds Gemini responses (whole or streamed) into one response.
#[derive(Debug, Default)]
pub struct GeminiAccumulator {
    text: String,
    finish_reason: Option<String>,
    tool_calls: Vec<ToolCall>,
    seen_candidate: bool,
}

impl GeminiAccumulator {
    /// Apply one response body and return its text delta, if any.
    pub fn push(&mut self, body: &Value) -> Result<Option<String>, GatewayError> {
        if let Some(reason) = body.pointer("/promptFeedback/blockReason").and_then(Value::as_str) {
            return Err(GatewayError::decode("gemini", format!("prompt blocked: {reason}")));
        }
        let Some(candidate) = body.pointer("/candidates/0") else {
            return Ok(None);
        };
        self.seen_candidate = true;
        if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
            self.finish_reason = Some(reason.to_string());
        }

        let mut delta = String::new();
        let parts = candidate
            .pointer("/content/parts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                delta.push_str(text);
            }
            if let Some(call) = part.get("functionCall") {
                if let Some(name) = call.get("name").and_then(Value::as_str) {
                    self.tool_calls.push(ToolCall {
                        id: format!("call_{}", self.tool_calls.len()),
                        name: name.to_string(),
                        arguments: call.get("args").cloned().unwrap_or(Value::Null),
                    });
                }
            }
        }

        if delta.is_empty() {
            return Ok(None);
        }
        self.text.push_str(&delta);
        Ok(Some(delta))
    }

    pub fn finish(self, provider: &'static str, model: &str) -> Result<ModelResponse, GatewayError> {
        if !self.seen_candidate {
            return Err(GatewayError::Empty { provider });
        }
        Ok(ModelResponse {
            text: self.text,
            tool_calls: self.tool_calls,
            model: model.to_string(),
            finish_reason: self.finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn openai_body_with_string_content() {
        let body = json!({
            "model": "anthropic/claude-sonnet-4",
            "choices": [{"message": {"content": "hello"}, "finish_reason": "stop"}]
        });
        let response = ModelResponse::from_openai("openrouter", &body).unwrap();
        assert_eq!(response.text(), "hello");
        assert_eq!(response.model, "anthropic/claude-sonnet-4");
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn openai_body_with_tool_calls_and_null_content() {
        let body = json!({
            "choices": [{"message": {
                "content": null,
                "tool_calls": [{"id": "c1", "function": {"name": "web_search", "arguments": "{\"query\":\"rust\"}"}}]
            }}]
        });
        let response = ModelResponse::from_openai("openrouter", &body).unwrap();
        assert_eq!(response.text(), "");
        assert_eq!(response.tool_calls[0].name, "web_search");
        assert_eq!(response.tool_calls[0].arguments["query"], "rust");
    }

    #[test]
    fn openai_body_without_choices_is_decode_error() {
        let err = ModelResponse::from_openai("openrouter", &json!({"error": "x"})).unwrap_err();
        assert!(matches!(err, GatewayError::Decode { .. }));
    }

    #[test]
    fn out_of_range_tool_call_index_is_ignored() {
        let mut acc = OpenAiAccumulator::default();
        acc.push(&json!({"choices": [{"delta": {"tool_calls": [
            {"index": 4_000_000_000u64, "id": "x", "function": {"name": "web_search"}},
            {"index": 1, "id": "t", "function": {"name": "web_search", "arguments": "{}"}}
        ]}}]}));
        assert_eq!(acc.calls.len(), 2);

        let response = acc.finish("m");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].id, "t");
    }

    #[test]
    fn openai_stream_accumulates_text_and_tool_arguments() {
        let mut acc = OpenAiAccumulator::default();
        let chunks = [
            json!({"model": "m", "choices": [{"delta": {"content": "He"}}]}),
            json!({"choices": [{"delta": {"content": "llo"}}]}),
            json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "id": "t", "function": {"name": "web_search", "arguments": "{\"query\":"}}]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "function": {"arguments": "\"axum\"}"}}]}, "finish_reason": "tool_calls"}]}),
        ];
        let deltas: Vec<_> = chunks.iter().filter_map(|c| acc.push(c)).collect();
        assert_eq!(deltas, vec!["He", "llo"]);

        let response = acc.finish("fallback");
        assert_eq!(response.text(), "Hello");
        assert_eq!(response.model, "m");
        assert_eq!(response.tool_calls[0].arguments["query"], "axum");
        assert_eq!(response.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn gemini_body_parts_are_joined() {
        let body = json!({
            "candidates": [{
                "content": {"parts": [{"text": "a"}, {"text": "b"}, {"functionCall": {"name": "web_search", "args": {"query": "q"}}}]},
                "finishReason": "STOP"
            }]
        });
        let response = ModelResponse::from_gemini("gemini-2.5-pro", &body).unwrap();
        assert_eq!(response.text(), "ab");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.finish_reason.as_deref(), Some("STOP"));
    }

    #[test]
    fn gemini_without_candidates_is_empty() {
        let err = ModelResponse::from_gemini("gemini-2.5-pro", &json!({})).unwrap_err();
        assert!(matches!(err, GatewayError::Empty { .. }));
    }
}
