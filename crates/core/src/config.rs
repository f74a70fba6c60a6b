//! # Kiln Configuration
//!
//! `KilnConfig` is read from `.kiln/config.json` when present and then overlaid by
//! environment variables. The server loads `.env` files through `dotenvy` before
//! calling [`KilnConfig::load`], so both sources end up here.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH: &str = ".kiln/config.json";
pub const DEFAULT_DB_PATH: &str = ".kiln/kiln.db";
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Runtime configuration shared by every service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    /// API key for the OpenAI-compatible endpoint (and the fallback transport)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_api_key: Option<String>,
    pub model_base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gemini_api_key: Option<String>,
    pub gemini_base_url: String,
    pub fallback_base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_api_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub searxng_url: Option<String>,
    /// Public base URL bundles are served from once saved
    pub bundle_base_url: String,
    /// Directory the filesystem bundle store writes into
    pub bundle_dir: PathBuf,
    pub db_path: PathBuf,

    pub gateway: GatewaySettings,
    pub limits: TurnLimits,
    pub queue: QueueSettings,
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            model_api_key: None,
            model_base_url: OPENROUTER_BASE_URL.to_string(),
            gemini_api_key: None,
            gemini_base_url: GEMINI_BASE_URL.to_string(),
            fallback_base_url: OPENROUTER_BASE_URL.to_string(),
            screenshot_api_url: None,
            searxng_url: None,
            bundle_base_url: "http://localhost:3000/bundles".to_string(),
            bundle_dir: PathBuf::from(".kiln/bundles"),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            gateway: GatewaySettings::default(),
            limits: TurnLimits::default(),
            queue: QueueSettings::default(),
        }
    }
}

/// Sampling and retry settings for primary model calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewaySettings {
    pub temperature: f32,
    pub max_retries: u32,
    pub max_tokens: u32,
    pub retry_base_delay_ms: u64,
    pub fallback_temperature: f32,
    pub fallback_max_tokens: u32,
    pub request_timeout_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_retries: 3,
            max_tokens: 60_000,
            retry_base_delay_ms: 500,
            fallback_temperature: 0.8,
            fallback_max_tokens: 4_000,
            request_timeout_secs: 300,
        }
    }
}

impl GatewaySettings {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Context bounds for a single turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TurnLimits {
    pub max_image_bytes: usize,
    pub history_limit: usize,
    pub gallery_limit: usize,
    pub planner_image_limit: usize,
}

impl Default for TurnLimits {
    fn default() -> Self {
        Self {
            max_image_bytes: 4 * 1024 * 1024,
            history_limit: 10,
            gallery_limit: 20,
            planner_image_limit: 2,
        }
    }
}

/// Build queue retry and retention settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueSettings {
    pub attempts: u32,
    pub backoff_base_ms: u64,
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base_ms: 2_000,
            keep_completed: 10,
            keep_failed: 5,
        }
    }
}

impl KilnConfig {
    /// Load `.kiln/config.json` (if any) and overlay the environment.
    pub async fn load() -> Self {
        let mut config = Self::load_file(CONFIG_PATH).await;
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Read a config file, falling back to defaults when it is missing or invalid.
    pub async fn load_file<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::default();
        }
        match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring invalid config at {}: {}", path.display(), e);
                Self::default()
            }),
            Err(e) => {
                tracing::warn!("Could not read config at {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Overlay values from an environment lookup. Empty variables are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("MODEL_API_KEY") {
            self.model_api_key = Some(v);
        }
        if let Some(v) = get("MODEL_BASE_URL") {
            self.model_base_url = v;
        }
        if let Some(v) = get("GEMINI_API_KEY") {
            self.gemini_api_key = Some(v);
        }
        if let Some(v) = get("FALLBACK_BASE_URL") {
            self.fallback_base_url = v;
        }
        if let Some(v) = get("SCREENSHOT_API_URL") {
            self.screenshot_api_url = Some(v);
        }
        if let Some(v) = get("SEARXNG_URL") {
            self.searxng_url = Some(v);
        }
        if let Some(v) = get("BUNDLE_BASE_URL") {
            self.bundle_base_url = v;
        }
        if let Some(v) = get("KILN_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
    }
}
