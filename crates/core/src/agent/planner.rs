//! # Planner
//!
//! Drafts a frontend development plan before any code is generated:
//! clone-intent detection, optional page screenshot, image ingestion, the
//! planning call with a model-family persona, then a short title.
//!
//! The planner never fails. Any error on the planning path yields a default draft.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::extract::{extract_json, try_extract_json};
use crate::gateway::{ChatMessage, ModelGateway};
use crate::graph::prompts;
use crate::graph::{PageImage, ScreenshotProvider};
use crate::images::ImagePipeline;
use crate::models::{ModelConfig, DEFAULT_MODEL};

pub const CONTINUE_PROMPT: &str = "Should I continue with this plan?";
pub const DEFAULT_TITLE: &str = "New Project";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanRequest {
    pub input: String,
    /// Reference image URLs
    pub images: Vec<Value>,
    pub memory: Option<String>,
    pub css_library: Option<String>,
    pub framework: Option<String>,
    pub model: Option<String>,
}

/// Plan shown to the user for confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDraft {
    pub title: String,
    pub message: String,
    pub plan: String,
    pub url: String,
    /// Screenshot of the page being cloned, if one was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_url: Option<String>,
}

impl PlanDraft {
    fn fallback(input: &str) -> Self {
        Self {
            title: "Development Plan".to_string(),
            message: CONTINUE_PROMPT.to_string(),
            plan: format!(
                "PROJECT: {}\n\nFRONTEND FILES:\n- src/components/App.tsx\n- src/pages/Home.tsx\n\n\
                 BRAND KIT:\n- Font: Inter\n- Colors: Primary #3B82F6\n- Spacing: Tailwind default",
                input
            ),
            url: String::new(),
            screenshot_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloneIntent {
    pub is_cloning: bool,
    pub url: Option<String>,
}

impl CloneIntent {
    /// Parse the clone-analysis reply. Anything unreadable means "not cloning".
    pub fn parse(text: &str) -> Self {
        let Some((value, _)) = try_extract_json(text) else {
            tracing::warn!("Clone analysis reply was not JSON, assuming no clone");
            return Self::default();
        };
        let mut intent: Self = serde_json::from_value(value).unwrap_or_default();
        intent.url = intent
            .url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty() && u != "null")
            .map(|u| {
                if u.starts_with("http://") || u.starts_with("https://") {
                    u
                } else {
                    format!("https://{}", u)
                }
            });
        intent
    }
}

pub struct Planner {
    gateway: Arc<ModelGateway>,
    images: Arc<ImagePipeline>,
    screenshots: Option<Arc<dyn ScreenshotProvider>>,
    image_limit: usize,
}

impl Planner {
    pub fn new(gateway: Arc<ModelGateway>, images: Arc<ImagePipeline>, image_limit: usize) -> Self {
        Self {
            gateway,
            images,
            screenshots: None,
            image_limit,
        }
    }

    pub fn with_screenshots(mut self, provider: Arc<dyn ScreenshotProvider>) -> Self {
        self.screenshots = Some(provider);
        self
    }

    #[tracing::instrument(skip_all)]
    pub async fn create_plan(&self, request: &PlanRequest) -> PlanDraft {
        match self.draft(request).await {
            Ok(draft) => draft,
            Err(e) => {
                tracing::error!("Planning failed, using default plan: {:#}", e);
                PlanDraft::fallback(&request.input)
            }
        }
    }

    async fn draft(&self, request: &PlanRequest) -> Result<PlanDraft> {
        let model = request.model.as_deref().unwrap_or(DEFAULT_MODEL);
        let intent = self.detect_clone(model, &request.input).await;

        let mut image_urls = request.images.clone();
        let mut screenshot_url = None;
        let mut extra_images = Vec::new();
        if let (true, Some(url)) = (intent.is_cloning, intent.url.as_deref()) {
            match &self.screenshots {
                Some(provider) => match provider.capture(url).await {
                    Ok(shot) => {
                        image_urls.push(Value::String(shot.screenshot_url.clone()));
                        screenshot_url = Some(shot.screenshot_url);
                        extra_images = shot.images;
                    }
                    Err(e) => tracing::warn!("Screenshot of {} failed: {:#}", url, e),
                },
                None => tracing::warn!("Clone requested but no screenshot service is configured"),
            }
        }

        let mut assets = self.images.ingest(&image_urls).await;
        assets.truncate(self.image_limit);

        let prompt = planning_prompt(
            request,
            ModelConfig::resolve(model).family(),
            intent.is_cloning,
            screenshot_url.as_deref(),
        );
        let messages = [
            ChatMessage::system("Reply only in JSON format."),
            ChatMessage::user(prompt).with_images(assets),
        ];
        let plan_text = self.gateway.invoke(model, &messages, false, None).await?.into_text();

        let title = self.title(model, &plan_text).await;
        let extraction = extract_json(&plan_text, &request.input);

        let url = extraction
            .value
            .get("url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .or_else(|| screenshot_url.clone())
            .unwrap_or_default();

        Ok(PlanDraft {
            title,
            message: CONTINUE_PROMPT.to_string(),
            plan: render_plan(&extraction.value, &extra_images, &plan_text, &request.input),
            url,
            screenshot_url,
        })
    }

    async fn detect_clone(&self, model: &str, input: &str) -> CloneIntent {
        let messages = [
            ChatMessage::system("Reply only in JSON format."),
            ChatMessage::user(prompts::render(prompts::CLONE_ANALYSIS, &[("input", input)])),
        ];
        match self.gateway.invoke(model, &messages, false, None).await {
            Ok(response) => {
                let intent = CloneIntent::parse(response.text());
                tracing::info!(is_cloning = intent.is_cloning, url = ?intent.url, "Clone analysis");
                intent
            }
            Err(e) => {
                tracing::warn!("Clone analysis failed: {}", e);
                CloneIntent::default()
            }
        }
    }

    async fn title(&self, model: &str, plan_text: &str) -> String {
        let messages = [
            ChatMessage::system("Generate concise project titles only."),
            ChatMessage::user(prompts::render(prompts::TITLE, &[("input", plan_text)])),
        ];
        match self.gateway.invoke(model, &messages, false, None).await {
            Ok(response) => clean_title(response.text()),
            Err(e) => {
                tracing::warn!("Title generation failed: {}", e);
                DEFAULT_TITLE.to_string()
            }
        }
    }
}

fn clean_title(raw: &str) -> String {
    let title: String = raw.trim().chars().filter(|c| *c != '"' && *c != '\'').collect();
    let title = title.trim();
    if title.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        title.to_string()
    }
}

fn planning_prompt(request: &PlanRequest, family: &str, cloning: bool, screenshot_url: Option<&str>) -> String {
    let (persona, replication_key) = prompts::planner_persona(family);
    let (clone_section, clone_fields) = if cloning {
        (
            "- Replication mode: reproduce the referenced page as closely as possible from the attached \
             screenshot. Match layout, spacing, colors and typography; mock all data on the client.\n"
                .to_string(),
            format!(
                ",\n  \"{}\": {{\"layout\": \"\", \"components\": [], \"styling\": \"\", \"dataStrategy\": \"\"}}",
                replication_key
            ),
        )
    } else {
        (String::new(), String::new())
    };

    prompts::render(
        prompts::PLANNER,
        &[
            ("persona", persona),
            ("css_library", request.css_library.as_deref().unwrap_or("Tailwind CSS")),
            ("framework", request.framework.as_deref().unwrap_or("React")),
            ("clone_section", &clone_section),
            ("input", &request.input),
            ("memory", request.memory.as_deref().unwrap_or("None provided")),
            ("clone_url", screenshot_url.unwrap_or("")),
            ("clone_fields", &clone_fields),
        ],
    )
}

fn feature_text(feature: &Value) -> String {
    let Value::Object(obj) = feature else {
        return match feature {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
    };
    let pair = |a: &str, b: &str| match (obj.get(a).and_then(Value::as_str), obj.get(b).and_then(Value::as_str)) {
        (Some(x), Some(y)) => Some(format!("{}: {}", x, y)),
        _ => None,
    };
    pair("name", "description")
        .or_else(|| pair("title", "details"))
        .or_else(|| pair("feature", "implementation"))
        .unwrap_or_else(|| {
            obj.iter()
                .map(|(k, v)| match v {
                    Value::String(s) => format!("{}: {}", k, s),
                    other => format!("{}: {}", k, other),
                })
                .collect::<Vec<_>>()
                .join(" - ")
        })
}

fn file_label(file: &Value) -> String {
    match file {
        Value::String(s) => s.clone(),
        Value::Object(obj) => ["name", "path", "filename"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| file.to_string()),
        other => other.to_string(),
    }
}

/// Plain-text plan shown to the user.
pub fn render_plan(plan: &Value, extra_images: &[PageImage], raw: &str, input: &str) -> String {
    let mut out = String::new();

    if let Some(description) = plan.get("description").and_then(Value::as_str) {
        out.push_str(&format!("\n{}\n\n", description));
    }

    if !extra_images.is_empty() {
        out.push_str("\nEXTRA IMAGES FOUND:\n");
        for image in extra_images {
            out.push_str(&format!("{} - {}\n", image.alt, image.src));
        }
    }

    if let Some(features) = plan.get("features").and_then(Value::as_array) {
        out.push_str("FEATURES:\n");
        for (i, feature) in features.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, feature_text(feature)));
        }
        out.push('\n');
    }

    if let Some(files) = plan.get("frontendFiles").and_then(Value::as_array) {
        out.push_str("ARCHITECTURE:\n");
        for file in files {
            out.push_str(&format!("- {}\n", file_label(file)));
        }
    }

    let out = out.trim();
    if !out.is_empty() {
        return out.to_string();
    }
    if let Some(raw_plan) = plan.get("rawPlan").and_then(Value::as_str).filter(|s| !s.trim().is_empty()) {
        return raw_plan.trim().to_string();
    }
    if !raw.trim().is_empty() {
        return raw.trim().to_string();
    }
    format!(
        "Development plan for: {}\n\nFEATURES:\n1. Responsive user interface\n2. Client-side state management\n\n\
         ARCHITECTURE:\n- src/App.tsx\n- src/pages/Home.tsx\n- src/components/Header.tsx",
        input
    )
}
