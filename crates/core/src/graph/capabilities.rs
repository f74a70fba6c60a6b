//! # Capabilities
//!
//! External helpers the tool node can call on the router's behalf, plus the
//! screenshot service the planner uses for clone requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::gateway::{ToolCall, ToolDefinition};

#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the arguments
    fn parameters(&self) -> Value;
    async fn invoke(&self, args: Value) -> Result<Value>;
}

/// Outcome of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub content: Value,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(call: &ToolCall, content: Value) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content,
            is_error: false,
        }
    }

    pub fn error(call: &ToolCall, message: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content: json!({ "error": message.into() }),
            is_error: true,
        }
    }

    /// Text handed back to the model
    pub fn to_message_text(&self) -> String {
        self.content.to_string()
    }
}

fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| json!({"type": "object"}))
}

#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.capabilities.insert(capability.name().to_string(), capability);
    }

    pub fn with(mut self, capability: Arc<dyn Capability>) -> Self {
        self.register(capability);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.capabilities.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Tool definitions for gateway binding, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .capabilities
            .values()
            .map(|c| ToolDefinition {
                name: c.name().to_string(),
                description: c.description().to_string(),
                parameters: c.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Run each call in order. Unknown tools and failures become error results.
    pub async fn execute(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let result = match self.get(&call.name) {
                None => {
                    tracing::warn!("Router asked for unknown tool {}", call.name);
                    ToolResult::error(call, format!("unknown tool: {}", call.name))
                }
                Some(capability) => match capability.invoke(call.arguments.clone()).await {
                    Ok(content) => ToolResult::success(call, content),
                    Err(e) => {
                        tracing::warn!("Tool {} failed: {:#}", call.name, e);
                        ToolResult::error(call, e.to_string())
                    }
                },
            };
            results.push(result);
        }
        results
    }
}

// === Web search (SearXNG) ===

/// Arguments for web search
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchWebArgs {
    /// Search query
    pub query: String,
    /// Maximum number of results (default: 5)
    pub max_results: Option<u32>,
}

/// SearXNG JSON API search.
pub struct WebSearch {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl WebSearch {
    /// Try `configured` first, then local instances.
    pub fn new(configured: Option<&str>) -> Result<Self> {
        let mut endpoints = Vec::new();
        if let Some(url) = configured {
            endpoints.push(format!("{}/search", url.trim_end_matches('/')));
        }
        endpoints.push("http://localhost:8888/search".to_string());
        endpoints.push("http://127.0.0.1:8888/search".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, endpoints })
    }

    async fn query_endpoint(&self, endpoint: &str, query: &str, max_results: usize) -> Option<Vec<Value>> {
        let url = format!("{}?q={}&format=json", endpoint, urlencoding::encode(query));
        let response = self.client.get(&url).send().await.ok()?;
        let body: Value = response.json().await.ok()?;
        let results = body.get("results")?.as_array()?;
        Some(
            results
                .iter()
                .take(max_results)
                .map(|r| {
                    json!({
                        "title": r.get("title").and_then(Value::as_str).unwrap_or(""),
                        "url": r.get("url").and_then(Value::as_str).unwrap_or(""),
                        "snippet": r.get("content").and_then(Value::as_str).unwrap_or("")
                    })
                })
                .collect(),
        )
    }
}

#[async_trait]
impl Capability for WebSearch {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web. Returns result titles, URLs and snippets."
    }

    fn parameters(&self) -> Value {
        schema_of::<SearchWebArgs>()
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let args: SearchWebArgs = serde_json::from_value(args).context("invalid web_search arguments")?;
        let max_results = args.max_results.unwrap_or(5) as usize;

        for endpoint in &self.endpoints {
            if let Some(results) = self.query_endpoint(endpoint, &args.query, max_results).await {
                return Ok(json!({ "query": args.query, "source": "searxng", "results": results }));
            }
            tracing::debug!("Search endpoint {} unavailable", endpoint);
        }

        Ok(json!({
            "query": args.query,
            "source": "none",
            "results": [],
            "message": "No search backend available."
        }))
    }
}

// === Screenshots ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageImage {
    pub src: String,
    #[serde(default)]
    pub alt: String,
}

/// Rendered page capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Screenshot {
    pub screenshot_url: String,
    #[serde(default)]
    pub images: Vec<PageImage>,
}

#[async_trait]
pub trait ScreenshotProvider: Send + Sync {
    async fn capture(&self, url: &str) -> Result<Screenshot>;
}

/// Arguments for page screenshots
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ScreenshotArgs {
    /// Page URL to capture
    pub url: String,
}

/// Client for `<base>/screenshot?url=...`, which answers
/// `{ "screenshotUrl": "...", "html": { "images": [{ "src", "alt" }] } }`.
pub struct ScreenshotClient {
    client: reqwest::Client,
    base_url: String,
}

impl ScreenshotClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

/// Parse the screenshot service's response body.
pub fn parse_screenshot(body: &Value) -> Result<Screenshot> {
    let screenshot_url = body
        .get("screenshotUrl")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .context("screenshot response has no screenshotUrl")?
        .to_string();
    let images = body
        .pointer("/html/images")
        .and_then(Value::as_array)
        .map(|imgs| {
            imgs.iter()
                .filter_map(|img| serde_json::from_value::<PageImage>(img.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    Ok(Screenshot {
        screenshot_url,
        images,
    })
}

#[async_trait]
impl ScreenshotProvider for ScreenshotClient {
    async fn capture(&self, url: &str) -> Result<Screenshot> {
        let endpoint = format!("{}/screenshot?url={}", self.base_url, urlencoding::encode(url));
        let response = self
            .client
            .get(&endpoint)
            .send()
            .await
            .context("screenshot request failed")?
            .error_for_status()
            .context("screenshot service returned an error")?;
        let body: Value = response.json().await.context("invalid screenshot response")?;
        parse_screenshot(&body)
    }
}

#[async_trait]
impl Capability for ScreenshotClient {
    fn name(&self) -> &str {
        "screenshot"
    }

    fn description(&self) -> &str {
        "Capture a screenshot of a web page and list the images it contains."
    }

    fn parameters(&self) -> Value {
        schema_of::<ScreenshotArgs>()
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let args: ScreenshotArgs = serde_json::from_value(args).context("invalid screenshot arguments")?;
        let shot = self.capture(&args.url).await?;
        Ok(serde_json::to_value(shot)?)
    }
}
