//! # Kiln Models
//!
//! Logical model catalogue for the gateway. Clients name a model by its short
//! logical name (`claude-sonnet-4`, `gpt-4.1`, ...); this module maps that name onto a
//! provider, a provider-side model id and the capabilities the gateway negotiates.

use serde::{Deserialize, Serialize};

/// Model used when a client names a model the catalogue does not know.
pub const DEFAULT_MODEL: &str = "gpt-4.1";

/// Logical models whose providers reject tool bindings.
pub const TOOLLESS_MODELS: &[&str] = &["gpt-5-chat", "kimi-k2", "grok-3"];

/// Supported model providers
///
/// - OpenRouter (OpenAI-compatible chat completions) - `MODEL_API_KEY`
/// - Gemini (native generateContent API) - `GEMINI_API_KEY`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    OpenRouter,
    Gemini,
}

impl LlmProvider {
    /// Display name for logs and the catalogue endpoint
    pub fn display_name(&self) -> &'static str {
        match self {
            LlmProvider::OpenRouter => "OpenRouter",
            LlmProvider::Gemini => "Gemini",
        }
    }

    /// Environment variable holding the provider's API key
    pub fn api_key_env(&self) -> &'static str {
        match self {
            LlmProvider::OpenRouter => "MODEL_API_KEY",
            LlmProvider::Gemini => "GEMINI_API_KEY",
        }
    }

    /// Inline image shape this provider family accepts
    pub fn image_format(&self) -> ImageFormat {
        match self {
            LlmProvider::OpenRouter => ImageFormat::OpenAi,
            LlmProvider::Gemini => ImageFormat::InlineData,
        }
    }
}

/// Envelope shape for base64 image payloads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    /// `{ "type": "image_url", "image_url": { "url": "data:<mime>;base64,<data>" } }`
    OpenAi,
    /// `{ "inlineData": { "mimeType": "<mime>", "data": "<data>" } }`
    InlineData,
}

/// Resolved configuration for one logical model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    /// Logical name clients use
    pub name: String,
    /// Provider that serves it
    #[serde(default)]
    pub provider: LlmProvider,
    /// Provider-side model id
    pub model: String,
    /// Whether tool definitions may be bound to calls
    pub supports_tools: bool,
    /// Whether a failed call may be retried once over the raw fallback transport
    pub fallback_eligible: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::resolve(DEFAULT_MODEL)
    }
}

impl ModelConfig {
    /// Create config for a specific provider
    pub fn with_provider(
        name: impl Into<String>,
        provider: LlmProvider,
        model: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            supports_tools: !TOOLLESS_MODELS.contains(&name.as_str()),
            fallback_eligible: name.starts_with("claude-"),
            provider,
            model: model.into(),
            name,
        }
    }

    /// Look up a logical model name. Unknown names resolve to [`DEFAULT_MODEL`].
    pub fn resolve(name: &str) -> Self {
        let (provider, model) = match name {
            "gpt-5-chat" => (LlmProvider::OpenRouter, "openai/gpt-5-chat"),
            "kimi-k2" => (LlmProvider::OpenRouter, "moonshotai/kimi-k2"),
            "claude-sonnet-4" => (LlmProvider::OpenRouter, "anthropic/claude-sonnet-4"),
            "claude-3.7-sonnet" => (LlmProvider::OpenRouter, "anthropic/claude-3.7-sonnet"),
            "gemini-2.5-pro" => (LlmProvider::Gemini, "gemini-2.5-pro"),
            "grok-3" => (LlmProvider::OpenRouter, "x-ai/grok-3"),
            "gpt-4.1" => (LlmProvider::OpenRouter, "openai/gpt-4.1"),
            other => {
                tracing::debug!(model = other, "Unknown model, using {}", DEFAULT_MODEL);
                return Self::resolve(DEFAULT_MODEL);
            }
        };
        Self::with_provider(name, provider, model)
    }

    /// Same logical model, served through OpenRouter instead of its native provider.
    pub fn via_openrouter(&self) -> Self {
        let model = match self.provider {
            LlmProvider::OpenRouter => self.model.clone(),
            LlmProvider::Gemini => format!("google/{}", self.model),
        };
        Self {
            provider: LlmProvider::OpenRouter,
            model,
            ..self.clone()
        }
    }

    /// Image envelope format for the provider that serves this model
    pub fn image_format(&self) -> ImageFormat {
        self.provider.image_format()
    }

    /// Model family used to pick persona prompts (`claude`, `gpt`, `gemini`, ...)
    pub fn family(&self) -> &str {
        self.name.split('-').next().unwrap_or(&self.name)
    }
}

/// Every logical model the gateway serves, in catalogue order.
pub fn catalogue() -> Vec<ModelConfig> {
    [
        "gpt-4.1",
        "gpt-5-chat",
        "kimi-k2",
        "claude-sonnet-4",
        "claude-3.7-sonnet",
        "gemini-2.5-pro",
        "grok-3",
    ]
    .iter()
    .map(|name| ModelConfig::resolve(name))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_resolves_to_default() {
        let config = ModelConfig::resolve("llama-9000");
        assert_eq!(config.name, DEFAULT_MODEL);
        assert_eq!(config.model, "openai/gpt-4.1");
        assert!(config.supports_tools);
    }

    #[test]
    fn denylisted_models_do_not_bind_tools() {
        for name in TOOLLESS_MODELS {
            assert!(!ModelConfig::resolve(name).supports_tools, "{name}");
        }
        assert!(ModelConfig::resolve("claude-sonnet-4").supports_tools);
    }

    #[test]
    fn only_claude_family_is_fallback_eligible() {
        let eligible: Vec<_> = catalogue()
            .into_iter()
            .filter(|m| m.fallback_eligible)
            .map(|m| m.name)
            .collect();
        assert_eq!(eligible, vec!["claude-sonnet-4", "claude-3.7-sonnet"]);
    }

    #[test]
    fn gemini_routes_natively_with_inline_images() {
        let config = ModelConfig::resolve("gemini-2.5-pro");
        assert_eq!(config.provider, LlmProvider::Gemini);
        assert_eq!(config.image_format(), ImageFormat::InlineData);

        let routed = config.via_openrouter();
        assert_eq!(routed.model, "google/gemini-2.5-pro");
        assert_eq!(routed.image_format(), ImageFormat::OpenAi);
    }

    #[test]
    fn family_is_name_prefix() {
        assert_eq!(ModelConfig::resolve("claude-3.7-sonnet").family(), "claude");
        assert_eq!(ModelConfig::resolve("kimi-k2").family(), "kimi");
    }
}
