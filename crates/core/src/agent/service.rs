//! # Turn Service
//!
//! Resolves a turn's user and project, assembles its context, runs the
//! execution graph and persists what the generation node produced. Missing
//! users or projects abort before the graph runs and reach the client as a
//! single error frame followed by the completion sentinel.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::config::TurnLimits;
use crate::extract::{extract_message, PlanRecord};
use crate::gateway::ChatMessage;
use crate::graph::{ExecutionGraph, GraphEvent, TurnContext};
use crate::images::ImagePipeline;
use crate::models::DEFAULT_MODEL;
use crate::queue::{BuildPayload, BuildQueue, Enqueued, JobOptions, QueueError};
use crate::relay::{relay_channel, Frame};
use crate::state::{
    bundle_key, BundleStore, CdnInvalidator, GalleryStore, Project, ProjectStore, TurnRole, User,
};

/// Client frames for one turn
pub type TurnStream = Pin<Box<dyn Stream<Item = Frame> + Send>>;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("User not found: {0}")]
    MissingUser(String),

    #[error("Project not found: {0}")]
    MissingProject(String),

    #[error("Project has no bundle URL: {0}")]
    MissingUrl(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl TurnError {
    /// Whether the request named something that does not exist.
    pub fn is_missing(&self) -> bool {
        matches!(
            self,
            TurnError::MissingUser(_) | TurnError::MissingProject(_) | TurnError::MissingUrl(_)
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TurnRequest {
    pub prompt: String,
    #[serde(rename = "projectId")]
    pub project_key: String,
    /// Owner's email
    pub owner: String,
    /// Terminal output the user attached, passed through as-is
    pub terminal: Option<Value>,
    pub model: Option<String>,
    pub memory: Option<Value>,
    pub css_lib: Option<String>,
    pub framework: Option<String>,
    pub images: Vec<Value>,
    /// Modify the existing app rather than generate a new one
    pub fix: bool,
}

/// What a finished turn left behind.
#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    pub error: Option<String>,
    pub generation_output: Option<String>,
    pub message: Option<String>,
    pub plan: Option<PlanRecord>,
    pub disconnected: bool,
}

/// External collaborators the service persists through
#[derive(Clone)]
pub struct Collaborators {
    pub projects: Arc<dyn ProjectStore>,
    pub gallery: Arc<dyn GalleryStore>,
    pub bundles: Arc<dyn BundleStore>,
    pub cdn: Arc<dyn CdnInvalidator>,
}

struct PreparedTurn {
    user: User,
    project: Project,
    context: TurnContext,
}

pub struct AgentService {
    graph: Arc<ExecutionGraph>,
    images: Arc<ImagePipeline>,
    stores: Collaborators,
    limits: TurnLimits,
}

impl AgentService {
    pub fn new(
        graph: Arc<ExecutionGraph>,
        images: Arc<ImagePipeline>,
        stores: Collaborators,
        limits: TurnLimits,
    ) -> Self {
        Self {
            graph,
            images,
            stores,
            limits,
        }
    }

    /// Start a turn in the background and return its client frames.
    ///
    /// Dropping the stream stops the turn from producing further events.
    pub fn start_turn(self: &Arc<Self>, request: TurnRequest) -> TurnStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.run_turn(request, tx).await;
        });
        Box::pin(relay_channel(rx))
    }

    /// Run a turn to completion, sending its events into `events`.
    #[tracing::instrument(skip_all, fields(project = %request.project_key))]
    pub async fn run_turn(&self, request: TurnRequest, events: mpsc::Sender<GraphEvent>) -> TurnOutcome {
        let prepared = match self.prepare(&request).await {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::warn!("Turn aborted before the graph ran: {}", e);
                let _ = events.send(GraphEvent::Error(e.to_string())).await;
                return TurnOutcome {
                    error: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };

        let state = self.graph.run(&prepared.context, events).await;
        if state.disconnected {
            tracing::info!("Client disconnected during turn");
        }

        let mut outcome = TurnOutcome {
            disconnected: state.disconnected,
            ..Default::default()
        };
        if let Some(output) = state.generation_output {
            let (message, plan) = self.persist_generation(&prepared, &output).await;
            outcome.message = message;
            outcome.plan = plan;
            outcome.generation_output = Some(output);
        }
        outcome
    }

    async fn resolve(&self, owner: &str, project_key: &str) -> Result<(User, Project), TurnError> {
        let user = self
            .stores
            .projects
            .find_user(owner)
            .await?
            .ok_or_else(|| TurnError::MissingUser(owner.to_string()))?;
        let project = self
            .stores
            .projects
            .find_project(project_key)
            .await?
            .ok_or_else(|| TurnError::MissingProject(project_key.to_string()))?;
        Ok((user, project))
    }

    async fn prepare(&self, request: &TurnRequest) -> Result<PreparedTurn, TurnError> {
        let (user, project) = self.resolve(&request.owner, &request.project_key).await?;
        let projects = &self.stores.projects;

        let mut turns = projects.recent_turns(&project.id, self.limits.history_limit).await?;
        turns.reverse();
        let history: Vec<ChatMessage> = turns
            .iter()
            .map(|turn| match turn.role {
                TurnRole::User => ChatMessage::user(turn.text.clone()),
                TurnRole::Assistant => ChatMessage::assistant(turn.text.clone()),
            })
            .collect();

        let plan = projects.latest_plan(&project.id).await?;
        let code_bundle = self.load_bundle(&project).await;

        let gallery = match self
            .stores
            .gallery
            .active_assets(&project.id, self.limits.gallery_limit)
            .await
        {
            Ok(assets) => assets,
            Err(e) => {
                tracing::warn!("Could not load gallery: {:#}", e);
                Vec::new()
            }
        };
        let gallery: Vec<Value> = gallery
            .iter()
            .map(|asset| json!({"label": asset.label, "url": asset.url}))
            .collect();

        let mut image_urls = request.images.clone();
        if let Some(previous) = &project.clone_screenshot_url {
            image_urls.push(Value::String(previous.clone()));
        }
        let images = self.images.ingest(&image_urls).await;
        tracing::info!(
            "Turn context: {} history, {} gallery, {} of {} images",
            history.len(),
            gallery.len(),
            images.len(),
            image_urls.len()
        );

        let user_input = json!({
            "userInput": request.prompt,
            "terminal": request.terminal,
            "memory": request.memory,
            "cssLib": request.css_lib,
            "framework": request.framework,
            "images": image_urls,
            "galleryImages": gallery,
        })
        .to_string();

        projects
            .append_turn(&project.id, &user.id, TurnRole::User, &request.prompt, &string_urls(&request.images))
            .await?;

        let context = TurnContext {
            model: request.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            user_input,
            history,
            code_bundle,
            plan,
            gallery,
            images,
            fix: request.fix,
        };
        Ok(PreparedTurn {
            user,
            project,
            context,
        })
    }

    /// Current bundle, fetched fresh every turn.
    async fn load_bundle(&self, project: &Project) -> Option<Value> {
        let url = project.url.as_deref()?;
        match self.stores.bundles.fetch(url).await {
            Ok(bundle) => bundle,
            Err(e) => {
                tracing::warn!("Could not load code bundle from {}: {:#}", url, e);
                None
            }
        }
    }

    /// Save the assistant summary and the plan extracted from generation output.
    async fn persist_generation(
        &self,
        prepared: &PreparedTurn,
        output: &str,
    ) -> (Option<String>, Option<PlanRecord>) {
        let projects = &self.stores.projects;
        let plan = PlanRecord::from_model_output(output);
        let message = extract_message(output).or_else(|| plan.as_ref().and_then(|p| p.message.clone()));

        if let Some(text) = &message {
            if let Err(e) = projects
                .append_turn(&prepared.project.id, &prepared.user.id, TurnRole::Assistant, text, &[])
                .await
            {
                tracing::error!("Failed to save assistant message: {:#}", e);
            }
        }

        match &plan {
            Some(record) => {
                if !record.is_consistent() {
                    tracing::warn!("Plan file list does not match its generated files");
                }
                if let Err(e) = projects.save_plan(&prepared.project.id, record).await {
                    tracing::error!("Failed to save plan: {:#}", e);
                }
            }
            None => tracing::warn!("Generation output contained no plan"),
        }
        (message, plan)
    }

    /// Write a project's bundle, point the project at it and invalidate the
    /// CDN in the background. Returns the bundle URL.
    #[tracing::instrument(skip(self, bundle))]
    pub async fn save_bundle(&self, project_key: &str, owner: &str, bundle: &Value) -> Result<String, TurnError> {
        let (user, project) = self.resolve(owner, project_key).await?;

        let url = self
            .stores
            .bundles
            .put(&bundle_key(&user.id, &project.id), bundle)
            .await?;
        self.stores.projects.set_project_url(&project.id, &url).await?;

        let cdn = Arc::clone(&self.stores.cdn);
        let urls = vec![url.clone()];
        tokio::spawn(async move {
            match cdn.invalidate(&urls).await {
                Ok(()) => tracing::debug!("CDN invalidation sent"),
                Err(e) => tracing::warn!("CDN invalidation failed: {:#}", e),
            }
        });

        tracing::info!("Saved bundle to {}", url);
        Ok(url)
    }
}

impl AgentService {
    /// Remember the screenshot a project was cloned from so later turns see it.
    pub async fn remember_clone_screenshot(&self, project_key: &str, url: &str) -> Result<(), TurnError> {
        let project = self
            .stores
            .projects
            .find_project(project_key)
            .await?
            .ok_or_else(|| TurnError::MissingProject(project_key.to_string()))?;
        self.stores.projects.set_clone_screenshot(&project.id, url).await?;
        Ok(())
    }

    /// Queue a build of the project's current bundle.
    ///
    /// An identical build already waiting or running is reported as
    /// `existing` instead of being queued twice.
    pub async fn request_build(
        &self,
        queue: &BuildQueue,
        project_key: &str,
        owner: &str,
    ) -> Result<Enqueued, TurnError> {
        let (user, project) = self.resolve(owner, project_key).await?;
        let url = project
            .url
            .clone()
            .ok_or_else(|| TurnError::MissingUrl(project_key.to_string()))?;

        let payload = BuildPayload {
            project_key: project.key.clone(),
            user_id: user.id.clone(),
            email: user.email.clone(),
            url,
        };
        let enqueued = queue.enqueue(&payload, &JobOptions::for_build())?;
        if !enqueued.existing {
            tracing::info!("Queued build {} for {}", enqueued.job.id, project.key);
        }
        Ok(enqueued)
    }
}

fn string_urls(values: &[Value]) -> Vec<String> {
    values
        .iter()
        .filter_map(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewaySettings;
    use crate::gateway::{ChatProvider, ChatRequest, GatewayError, ModelGateway, ModelResponse, TokenSink};
    use crate::graph::{prompts, CapabilityRegistry};
    use crate::images::{FetchedImage, ImageError, ImageFetcher};
    use crate::models::LlmProvider;
    use crate::relay::{DONE, PLACEHOLDER};
    use crate::state::{FsBundleStore, KilnDb, SqliteStore};
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::Mutex;

    const OUTPUT: &str = r#"___start___{"Steps":["Create app"],"generatedFiles":{"src/App.tsx":{"code":"export default 1"}},"files":["src/App.tsx"],"filesCount": 1, "message": "Created the app shell"}___end___"#;

    struct Scripted {
        router: String,
        generator: Option<String>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    #[async_trait]
    impl ChatProvider for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn complete(
            &self,
            request: &ChatRequest,
            sink: Option<&dyn TokenSink>,
        ) -> Result<ModelResponse, GatewayError> {
            self.requests.lock().unwrap().push(request.clone());
            let text = if request.messages[0].text() == prompts::COORDINATOR {
                Some(self.router.clone())
            } else {
                self.generator.clone()
            };
            let text = text.ok_or(GatewayError::Status {
                provider: "scripted",
                status: 400,
                body: String::new(),
            })?;
            if let Some(sink) = sink {
                if !sink.token(&text).await {
                    return Err(GatewayError::Disconnected);
                }
            }
            Ok(ModelResponse::new(text, "scripted"))
        }
    }

    struct NoImages;

    #[async_trait]
    impl ImageFetcher for NoImages {
        async fn fetch(&self, url: &str) -> Result<FetchedImage, ImageError> {
            Err(ImageError::Status {
                url: url.to_string(),
                status: 404,
            })
        }
    }

    struct Fixture {
        db: KilnDb,
        service: Arc<AgentService>,
        store: SqliteStore,
        model: Arc<Scripted>,
        project_id: String,
        bundle_dir: std::path::PathBuf,
    }

    fn fixture(router: &str, generator: Option<&str>) -> Fixture {
        let db = KilnDb::open_in_memory().unwrap();
        let store = SqliteStore::new(&db);
        let user = store.ensure_user("dev@example.com", "Dev").unwrap();
        let project = store.create_project("brave-fox", &user.id, "Fox").unwrap();

        let model = Arc::new(Scripted {
            router: router.to_string(),
            generator: generator.map(str::to_string),
            requests: Mutex::new(Vec::new()),
        });
        let gateway = ModelGateway::new(GatewaySettings {
            max_retries: 0,
            ..Default::default()
        })
        .with_provider(LlmProvider::OpenRouter, model.clone());
        let graph = ExecutionGraph::new(Arc::new(gateway), Arc::new(CapabilityRegistry::new()));

        let bundle_dir = std::env::temp_dir().join(format!("kiln_service_{}", uuid::Uuid::new_v4()));
        let stores = Collaborators {
            projects: Arc::new(store.clone()),
            gallery: Arc::new(store.clone()),
            bundles: Arc::new(FsBundleStore::new(&bundle_dir, "http://localhost:3000/bundles").unwrap()),
            cdn: Arc::new(crate::state::LoggingCdnInvalidator),
        };
        let service = AgentService::new(
            Arc::new(graph),
            Arc::new(ImagePipeline::new(Arc::new(NoImages))),
            stores,
            TurnLimits::default(),
        );
        Fixture {
            db,
            service: Arc::new(service),
            store,
            model,
            project_id: project.id,
            bundle_dir,
        }
    }

    fn request(prompt: &str) -> TurnRequest {
        TurnRequest {
            prompt: prompt.into(),
            project_key: "brave-fox".into(),
            owner: "dev@example.com".into(),
            ..Default::default()
        }
    }

    async fn payloads(stream: TurnStream) -> Vec<String> {
        stream.map(|frame| frame.payload()).collect().await
    }

    #[tokio::test]
    async fn generation_turn_streams_tokens() {
        let fx = fixture(r#"{"NextNode":"frontend"}"#, Some(OUTPUT));
        let frames = payloads(fx.service.start_turn(request("build a todo app"))).await;

        assert_eq!(frames.first().map(String::as_str), Some("stream_start"));
        assert_eq!(frames.last().map(String::as_str), Some(DONE));
        assert!(frames.contains(&OUTPUT.to_string()));
        assert_eq!(frames.iter().filter(|f| f.as_str() == DONE).count(), 1);
    }

    #[tokio::test]
    async fn generation_output_is_persisted() {
        let fx = fixture(r#"{"NextNode":"frontend"}"#, Some(OUTPUT));
        let (tx, mut rx) = mpsc::channel(64);
        let outcome = fx.service.run_turn(request("again"), tx).await;
        while rx.recv().await.is_some() {}

        assert_eq!(outcome.message.as_deref(), Some("Created the app shell"));
        let plan = outcome.plan.unwrap();
        assert_eq!(plan.file_list, vec!["src/App.tsx"]);

        let saved = fx.store.latest_plan(&fx.project_id).await.unwrap().unwrap();
        assert_eq!(saved.generated_files["src/App.tsx"], "export default 1");

        let turns = fx.store.recent_turns(&fx.project_id, 10).await.unwrap();
        assert_eq!(turns[0].role, TurnRole::Assistant);
        assert_eq!(turns[0].text, "Created the app shell");
        assert_eq!(turns[1].text, "again");
    }

    #[tokio::test]
    async fn router_prompt_carries_only_the_latest_message() {
        let fx = fixture(r#"{"NextNode":"frontend"}"#, Some(OUTPUT));
        let (tx, mut rx) = mpsc::channel(64);
        fx.service.run_turn(request("first"), tx).await;
        while rx.recv().await.is_some() {}
        let (tx, mut rx) = mpsc::channel(64);
        fx.service.run_turn(request("second"), tx).await;
        while rx.recv().await.is_some() {}

        let requests = fx.model.requests.lock().unwrap();
        let router = &requests[2];
        assert_eq!(router.messages.len(), 2);
        let input: Value = serde_json::from_str(&router.messages[1].text()).unwrap();
        assert_eq!(input["userInput"], "second");

        let generation = requests[3].messages[1].text();
        assert!(generation.contains("Previous Messages"));
        assert!(generation.contains("Created the app shell"));
        assert!(generation.contains("Current Plan"));
    }

    #[tokio::test]
    async fn missing_project_is_one_error_then_done() {
        let fx = fixture(r#"{"NextNode":"frontend"}"#, Some(OUTPUT));
        let mut req = request("hi");
        req.project_key = "nope".into();

        let frames = payloads(fx.service.start_turn(req)).await;
        assert_eq!(
            frames,
            vec![
                "Error processing your request: Project not found: nope".to_string(),
                DONE.to_string()
            ]
        );
        assert!(fx.model.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_user_aborts_before_the_graph() {
        let fx = fixture("", None);
        let mut req = request("hi");
        req.owner = "ghost@example.com".into();

        let (tx, _rx) = mpsc::channel(8);
        let outcome = fx.service.run_turn(req, tx).await;
        assert_eq!(outcome.error.as_deref(), Some("User not found: ghost@example.com"));
    }

    #[tokio::test]
    async fn terminal_routing_still_completes_the_stream() {
        let fx = fixture(r#"{"NextNode":"none"}"#, None);
        let frames = payloads(fx.service.start_turn(request("hello"))).await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1], r#"{"NextNode":"none"}"#);
        assert_eq!(frames[2], DONE);
    }

    #[tokio::test]
    async fn empty_router_reply_gets_placeholder() {
        let fx = fixture("", None);
        let frames = payloads(fx.service.start_turn(request("hello"))).await;
        assert_eq!(frames, vec!["stream_start".to_string(), PLACEHOLDER.to_string(), DONE.to_string()]);
    }

    #[tokio::test]
    async fn saved_bundle_feeds_the_next_turn() {
        let fx = fixture(r#"{"NextNode":"frontend"}"#, Some(OUTPUT));
        let url = fx
            .service
            .save_bundle("brave-fox", "dev@example.com", &json!({"src/App.tsx": "old code"}))
            .await
            .unwrap();
        assert!(url.starts_with("http://localhost:3000/bundles/projects/"));

        let project = fx.store.find_project("brave-fox").await.unwrap().unwrap();
        assert_eq!(project.url.as_deref(), Some(url.as_str()));

        let (tx, mut rx) = mpsc::channel(64);
        let mut req = request("fix the header");
        req.fix = true;
        fx.service.run_turn(req, tx).await;
        while rx.recv().await.is_some() {}

        let requests = fx.model.requests.lock().unwrap();
        let generation = &requests[1].messages;
        assert_eq!(generation[0].text(), prompts::GENERATOR_FIX);
        assert!(generation[1].text().contains("old code"));

        let _ = std::fs::remove_dir_all(&fx.bundle_dir);
    }

    #[tokio::test]
    async fn build_requests_dedupe_per_project() {
        let fx = fixture("", None);
        let queue = BuildQueue::new(&fx.db, crate::config::QueueSettings::default());

        let err = fx
            .service
            .request_build(&queue, "brave-fox", "dev@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::MissingUrl(_)));
        assert!(err.is_missing());

        fx.service
            .save_bundle("brave-fox", "dev@example.com", &json!({"a": "b"}))
            .await
            .unwrap();
        let first = fx
            .service
            .request_build(&queue, "brave-fox", "dev@example.com")
            .await
            .unwrap();
        let second = fx
            .service
            .request_build(&queue, "brave-fox", "dev@example.com")
            .await
            .unwrap();
        assert!(!first.existing);
        assert!(second.existing);
        assert_eq!(first.job.id, second.job.id);
        assert_eq!(first.job.payload.email, "dev@example.com");

        let _ = std::fs::remove_dir_all(&fx.bundle_dir);
    }

    #[tokio::test]
    async fn clone_screenshot_joins_later_turn_images() {
        let fx = fixture(r#"{"NextNode":"frontend"}"#, Some(OUTPUT));
        fx.service
            .remember_clone_screenshot("brave-fox", "https://cdn/shot.png")
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        fx.service.run_turn(request("match the original"), tx).await;
        while rx.recv().await.is_some() {}

        let requests = fx.model.requests.lock().unwrap();
        let input: Value = serde_json::from_str(&requests[0].messages[1].text()).unwrap();
        assert_eq!(input["images"], json!(["https://cdn/shot.png"]));

        let err = fx
            .service
            .remember_clone_screenshot("missing", "https://cdn/x.png")
            .await;
        assert!(matches!(err, Err(TurnError::MissingProject(_))));
    }

    #[tokio::test]
    async fn save_bundle_requires_known_project() {
        let fx = fixture("", None);
        let err = fx
            .service
            .save_bundle("missing", "dev@example.com", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::MissingProject(_)));
    }
}
