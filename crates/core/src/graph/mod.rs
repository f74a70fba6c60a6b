//! # Execution Graph Engine
//!
//! Runs one conversational turn through the fixed node graph defined in
//! [`routing`]. Each turn gets its own [`GraphExecutionState`]; nothing is shared
//! between turns.
//!
//! Node failures never escape: a failing router emits a short apology and ends
//! the turn, a failing generation node emits a minimal scaffold payload. The
//! only early exit is the event receiver going away (client disconnect).

pub mod capabilities;
pub mod prompts;
pub mod routing;

pub use capabilities::{
    Capability, CapabilityRegistry, PageImage, Screenshot, ScreenshotClient, ScreenshotProvider,
    ToolResult, WebSearch,
};
pub use routing::{GraphNode, Route, RoutingDecision, MAX_TOOL_HOPS};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::extract::{PlanRecord, END_MARKER, START_MARKER};
use crate::gateway::{ChatMessage, GatewayError, ModelGateway, TokenSink};
use crate::images::ImageAsset;

pub const ROUTER_FALLBACK: &str =
    "I encountered an error processing your request. Let's try a simpler approach.";

/// Event emitted while a turn runs, in production order.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    /// Streamed model text
    Token(String),
    /// Turn aborted before any node ran
    Error(String),
}

/// Everything a turn needs besides the graph itself.
#[derive(Debug, Clone, Default)]
pub struct TurnContext {
    pub model: String,
    /// The user's message as given to the router
    pub user_input: String,
    /// Earlier turns, oldest first
    pub history: Vec<ChatMessage>,
    /// Current project files, if the project has a bundle
    pub code_bundle: Option<Value>,
    /// Most recent plan saved for the project
    pub plan: Option<PlanRecord>,
    pub gallery: Vec<Value>,
    pub images: Vec<ImageAsset>,
    /// Modify an existing app instead of generating a new one
    pub fix: bool,
}

/// Per-turn state, discarded when the turn ends.
#[derive(Debug, Clone, Default)]
pub struct GraphExecutionState {
    pub messages: Vec<ChatMessage>,
    pub routing_decision: Option<RoutingDecision>,
    pub tool_results: Vec<ToolResult>,
    pub metadata: HashMap<String, Value>,
    /// Raw text of the generation node, if it ran
    pub generation_output: Option<String>,
    /// Nodes visited, in order
    pub path: Vec<GraphNode>,
    pub disconnected: bool,
}

impl GraphExecutionState {
    fn new(ctx: &TurnContext) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("model".to_string(), json!(ctx.model));
        metadata.insert("fix".to_string(), json!(ctx.fix));
        Self {
            messages: vec![ChatMessage::user(ctx.user_input.clone())],
            metadata,
            ..Default::default()
        }
    }

    fn last_assistant_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == crate::gateway::ChatRole::Assistant)
            .map(ChatMessage::text)
    }
}

/// Forwards gateway tokens into the turn's event channel.
struct ChannelSink {
    tx: mpsc::Sender<GraphEvent>,
}

#[async_trait]
impl TokenSink for ChannelSink {
    async fn token(&self, text: &str) -> bool {
        self.tx.send(GraphEvent::Token(text.to_string())).await.is_ok()
    }
}

/// Receiver went away; stop the turn.
struct Disconnected;

pub struct ExecutionGraph {
    gateway: Arc<ModelGateway>,
    capabilities: Arc<CapabilityRegistry>,
}

impl ExecutionGraph {
    pub fn new(gateway: Arc<ModelGateway>, capabilities: Arc<CapabilityRegistry>) -> Self {
        Self {
            gateway,
            capabilities,
        }
    }

    /// Run one turn, streaming events into `events`.
    pub async fn run(&self, ctx: &TurnContext, events: mpsc::Sender<GraphEvent>) -> GraphExecutionState {
        let sink = ChannelSink { tx: events };
        let mut state = GraphExecutionState::new(ctx);
        let mut route = Route::new();

        loop {
            if sink.tx.is_closed() {
                state.disconnected = true;
                break;
            }
            state.path.push(route.node);
            tracing::debug!(node = ?route.node, "Entering node");

            let step = match route.node {
                GraphNode::Router => self.router(&mut state, ctx, &sink).await.map(|decision| {
                    state.routing_decision = Some(decision);
                    route.advance(Some(decision))
                }),
                GraphNode::Tool => {
                    self.tool(&mut state).await;
                    Ok(route.advance(None))
                }
                GraphNode::Generate => self
                    .generate(&mut state, ctx, &sink)
                    .await
                    .map(|_| route.advance(None)),
                GraphNode::Terminal => break,
            };

            if step.is_err() {
                tracing::info!("Event receiver closed, stopping turn");
                state.disconnected = true;
                break;
            }
        }

        state
            .metadata
            .insert("tool_hops".to_string(), json!(route.tool_hops));
        state
    }

    /// Coordinator call on the latest user message (plus any tool exchange).
    async fn router(
        &self,
        state: &mut GraphExecutionState,
        ctx: &TurnContext,
        sink: &ChannelSink,
    ) -> Result<RoutingDecision, Disconnected> {
        let mut messages = vec![
            ChatMessage::system(prompts::COORDINATOR),
            ChatMessage::user(ctx.user_input.clone()),
        ];
        messages.extend(state.messages.iter().skip(1).cloned());

        match self.gateway.invoke(&ctx.model, &messages, true, Some(sink as &dyn TokenSink)).await {
            Ok(response) => {
                let decision = RoutingDecision::from_router_output(response.text());
                if response.has_tool_calls() && decision != RoutingDecision::Tool {
                    tracing::warn!("Router requested tool calls without NextNode \"tools\", ignoring them");
                }
                state.messages.push(
                    ChatMessage::assistant(response.text()).with_tool_calls(response.tool_calls),
                );
                Ok(decision)
            }
            Err(GatewayError::Disconnected) => Err(Disconnected),
            Err(e) => {
                tracing::error!("Router node failed: {}", e);
                if !sink.token(ROUTER_FALLBACK).await {
                    return Err(Disconnected);
                }
                state.messages.push(ChatMessage::assistant(ROUTER_FALLBACK));
                Ok(RoutingDecision::Terminal)
            }
        }
    }

    /// Execute the router's tool calls and append their results.
    async fn tool(&self, state: &mut GraphExecutionState) {
        let calls = state
            .messages
            .last()
            .map(|m| m.tool_calls.clone())
            .unwrap_or_default();
        if calls.is_empty() {
            tracing::warn!("Tool node reached without tool calls");
            return;
        }
        let results = self.capabilities.execute(&calls).await;
        for result in &results {
            state
                .messages
                .push(ChatMessage::tool_result(&result.call_id, result.to_message_text()));
        }
        state.tool_results.extend(results);
    }

    /// Role-specific generation call with the full turn context.
    async fn generate(
        &self,
        state: &mut GraphExecutionState,
        ctx: &TurnContext,
        sink: &ChannelSink,
    ) -> Result<(), Disconnected> {
        let system = if ctx.fix {
            prompts::GENERATOR_FIX
        } else {
            prompts::GENERATOR
        };
        let messages = vec![
            ChatMessage::system(system),
            ChatMessage::user(generation_input(state, ctx)).with_images(ctx.images.iter().cloned()),
        ];

        let text = match self.gateway.invoke(&ctx.model, &messages, false, Some(sink as &dyn TokenSink)).await {
            Ok(response) if !response.text().trim().is_empty() => response.into_text(),
            Ok(_) => {
                tracing::error!("Generation node got an empty response");
                self.generation_fallback(sink).await?
            }
            Err(GatewayError::Disconnected) => return Err(Disconnected),
            Err(e) => {
                tracing::error!("Generation node failed: {}", e);
                self.generation_fallback(sink).await?
            }
        };

        state.messages.push(ChatMessage::assistant(text.clone()));
        state.generation_output = Some(text);
        Ok(())
    }

    async fn generation_fallback(&self, sink: &ChannelSink) -> Result<String, Disconnected> {
        let text = fallback_generation_output();
        if sink.token(&text).await {
            Ok(text)
        } else {
            Err(Disconnected)
        }
    }
}

/// User text for the generation node.
fn generation_input(state: &GraphExecutionState, ctx: &TurnContext) -> String {
    let history: Vec<Value> = ctx
        .history
        .iter()
        .map(|m| json!({"role": m.role.as_str(), "text": m.text()}))
        .collect();
    let router_notes = state.last_assistant_text().unwrap_or_default();

    let mut text = format!(
        "{input}\n\nRouting notes: {router}\n\nAll the Code: {code}\n\nPrevious Messages: {history}\n\nGallery Images: {gallery}",
        input = ctx.user_input,
        router = router_notes,
        code = ctx.code_bundle.clone().unwrap_or(Value::Null),
        history = Value::Array(history),
        gallery = Value::Array(ctx.gallery.clone()),
    );
    if let Some(plan) = &ctx.plan {
        let plan = serde_json::to_string(plan).unwrap_or_default();
        text.push_str(&format!("\n\nCurrent Plan: {}", plan));
    }
    text
}

/// Minimal scaffold emitted when generation fails, wrapped like real output.
pub fn fallback_generation_output() -> String {
    let package = json!({
        "name": "frontend-app",
        "private": true,
        "version": "0.0.0",
        "type": "module",
        "scripts": {"dev": "vite", "build": "tsc && vite build", "preview": "vite preview"},
        "dependencies": {"react": "^18.2.0", "react-dom": "^18.2.0", "lucide-react": "^0.263.1"},
        "devDependencies": {
            "@types/react": "^18.0.28",
            "@types/react-dom": "^18.0.11",
            "@vitejs/plugin-react": "^3.1.0",
            "tailwindcss": "^3.2.7",
            "typescript": "^4.9.3",
            "vite": "^4.1.0"
        }
    });
    let payload = json!({
        "Steps": "Frontend development initiated - building React TypeScript application",
        "role": "frontend",
        "generatedFiles": {
            "frontend/package.json": {
                "code": serde_json::to_string_pretty(&package).unwrap_or_default()
            }
        },
        "files": ["frontend/package.json"],
        "filesCount": 1
    });
    format!(
        "{START_MARKER}\n{}\n{END_MARKER}",
        serde_json::to_string_pretty(&payload).unwrap_or_default()
    )
}
