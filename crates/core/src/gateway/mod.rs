//! # Model Invocation Gateway
//!
//! One call interface over every model provider. The gateway resolves a logical
//! model name through the catalogue, negotiates tool binding, retries transient
//! failures with exponential backoff and, for fallback-eligible models, makes a
//! single attempt over the raw fallback transport before surfacing an error.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kiln_core::gateway::{ChatMessage, ModelGateway};
//!
//! let gateway = ModelGateway::from_config(&config)?;
//! let response = gateway
//!     .invoke("claude-sonnet-4", &[ChatMessage::user("hi")], false, None)
//!     .await?;
//! println!("{}", response.text());
//! ```

mod envelope;
mod error;
mod message;
mod providers;
mod sse;

pub use envelope::{ModelResponse, ToolCall};
pub use error::GatewayError;
pub use message::{ChatMessage, ChatRole, ContentPart};
pub use providers::{
    ChatProvider, ChatRequest, FallbackTransport, GeminiProvider, OpenAiCompatibleProvider,
    TokenSink, ToolDefinition,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{GatewaySettings, KilnConfig};
use crate::models::{LlmProvider, ModelConfig};

/// Remembers whether any token reached the caller's sink.
struct TrackingSink<'a> {
    inner: &'a dyn TokenSink,
    emitted: AtomicBool,
}

impl<'a> TrackingSink<'a> {
    fn new(inner: &'a dyn TokenSink) -> Self {
        Self {
            inner,
            emitted: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TokenSink for TrackingSink<'_> {
    async fn token(&self, text: &str) -> bool {
        self.emitted.store(true, Ordering::SeqCst);
        self.inner.token(text).await
    }
}

fn emitted(tracker: Option<&TrackingSink<'_>>) -> bool {
    tracker.is_some_and(|t| t.emitted.load(Ordering::SeqCst))
}

pub struct ModelGateway {
    providers: HashMap<LlmProvider, Arc<dyn ChatProvider>>,
    fallback: Option<Arc<dyn ChatProvider>>,
    tools: Vec<ToolDefinition>,
    settings: GatewaySettings,
}

impl ModelGateway {
    pub fn new(settings: GatewaySettings) -> Self {
        Self {
            providers: HashMap::new(),
            fallback: None,
            tools: Vec::new(),
            settings,
        }
    }

    /// Gateway with OpenRouter always registered and Gemini when a key is configured.
    pub fn from_config(config: &KilnConfig) -> Result<Self, GatewayError> {
        let timeout = Duration::from_secs(config.gateway.request_timeout_secs);

        let mut gateway = Self::new(config.gateway.clone())
            .with_provider(
                LlmProvider::OpenRouter,
                Arc::new(OpenAiCompatibleProvider::new(
                    "openrouter",
                    &config.model_base_url,
                    config.model_api_key.clone(),
                    timeout,
                )?),
            )
            .with_fallback(Arc::new(FallbackTransport::new(
                &config.fallback_base_url,
                config.model_api_key.clone(),
                timeout,
            )?));

        if let Some(key) = &config.gemini_api_key {
            gateway = gateway.with_provider(
                LlmProvider::Gemini,
                Arc::new(GeminiProvider::new(&config.gemini_base_url, key, timeout)?),
            );
        } else {
            tracing::info!(
                "{} not set, Gemini models route through OpenRouter",
                LlmProvider::Gemini.api_key_env()
            );
        }

        Ok(gateway)
    }

    pub fn with_provider(mut self, provider: LlmProvider, client: Arc<dyn ChatProvider>) -> Self {
        self.providers.insert(provider, client);
        self
    }

    pub fn with_fallback(mut self, transport: Arc<dyn ChatProvider>) -> Self {
        self.fallback = Some(transport);
        self
    }

    /// Tool definitions bound to calls that ask for tools
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Resolve a logical name to the config and client that will serve it.
    ///
    /// Models whose native provider is not registered are routed through OpenRouter.
    pub fn route(&self, model_name: &str) -> Result<(ModelConfig, Arc<dyn ChatProvider>), GatewayError> {
        let config = ModelConfig::resolve(model_name);
        if let Some(client) = self.providers.get(&config.provider) {
            return Ok((config, Arc::clone(client)));
        }
        let routed = config.via_openrouter();
        match self.providers.get(&routed.provider) {
            Some(client) => {
                tracing::debug!(
                    "{} not registered, routing {} through {}",
                    config.provider.display_name(),
                    config.name,
                    routed.provider.display_name()
                );
                Ok((routed, Arc::clone(client)))
            }
            None => Err(GatewayError::UnknownModel(config.name)),
        }
    }

    /// Invoke a model.
    ///
    /// With a `sink`, text deltas are streamed into it as they arrive and the full
    /// response is still returned. Transient failures are retried only while no
    /// token has reached the sink.
    #[tracing::instrument(skip_all, fields(model = %model_name))]
    pub async fn invoke(
        &self,
        model_name: &str,
        messages: &[ChatMessage],
        bind_tools: bool,
        sink: Option<&dyn TokenSink>,
    ) -> Result<ModelResponse, GatewayError> {
        let (config, client) = self.route(model_name)?;

        let tools = if bind_tools && config.supports_tools {
            self.tools.clone()
        } else {
            if bind_tools && !self.tools.is_empty() {
                tracing::debug!("{} does not support tools, calling without them", config.name);
            }
            Vec::new()
        };

        let request = ChatRequest {
            model: config.model.clone(),
            messages: messages.to_vec(),
            tools,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        };

        let tracker = sink.map(TrackingSink::new);

        let primary = self.call_with_retry(client.as_ref(), &request, tracker.as_ref()).await;
        let error = match primary {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };

        let fallback = match &self.fallback {
            Some(fallback) if config.fallback_eligible => fallback,
            _ => return Err(error),
        };
        if emitted(tracker.as_ref()) || matches!(error, GatewayError::Disconnected) {
            return Err(error);
        }

        tracing::warn!(
            "{} failed on the primary path ({}), trying fallback transport",
            config.name,
            error
        );
        let fallback_request = ChatRequest {
            model: config.via_openrouter().model,
            messages: messages.iter().map(ChatMessage::flattened).collect(),
            tools: Vec::new(),
            temperature: self.settings.fallback_temperature,
            max_tokens: self.settings.fallback_max_tokens,
        };
        match fallback.complete(&fallback_request, sink).await {
            Ok(response) => {
                tracing::info!("Fallback transport answered for {}", config.name);
                Ok(response)
            }
            Err(fallback_error) => {
                tracing::error!("Fallback transport failed for {}: {}", config.name, fallback_error);
                Err(GatewayError::FallbackFailed {
                    primary: Box::new(error),
                    fallback: Box::new(fallback_error),
                })
            }
        }
    }

    async fn call_with_retry(
        &self,
        client: &dyn ChatProvider,
        request: &ChatRequest,
        tracker: Option<&TrackingSink<'_>>,
    ) -> Result<ModelResponse, GatewayError> {
        let sink = tracker.map(|t| t as &dyn TokenSink);
        let mut attempt: u32 = 0;
        loop {
            match client.complete(request, sink).await {
                Ok(response) => return Ok(response),
                Err(e)
                    if e.is_transient()
                        && attempt < self.settings.max_retries
                        && !emitted(tracker) =>
                {
                    let delay = self.settings.retry_base_delay() * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    tracing::warn!(
                        "{} transient error on attempt {}/{}: {} (retrying in {:?})",
                        client.name(),
                        attempt,
                        self.settings.max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
