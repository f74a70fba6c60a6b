//! Project bundle storage and CDN invalidation.
//!
//! A bundle is the whole project file map written as one JSON blob. The
//! filesystem store serves bundles under `bundle_base_url`; URLs outside that
//! prefix are fetched over HTTP.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Object storage for project bundles
#[async_trait]
pub trait BundleStore: Send + Sync {
    /// Write `bundle` under `key`, replacing any previous blob. Returns its public URL.
    async fn put(&self, key: &str, bundle: &Value) -> Result<String>;

    /// Read a bundle back by URL. `Ok(None)` when nothing is stored there.
    async fn fetch(&self, url: &str) -> Result<Option<Value>>;
}

/// Cache invalidation after a bundle write
#[async_trait]
pub trait CdnInvalidator: Send + Sync {
    async fn invalidate(&self, urls: &[String]) -> Result<()>;
}

/// Storage key for a project's bundle
pub fn bundle_key(user_id: &str, project_id: &str) -> String {
    format!("projects/{}/{}", user_id, project_id)
}

pub struct FsBundleStore {
    dir: PathBuf,
    base_url: String,
    client: reqwest::Client,
}

impl FsBundleStore {
    pub fn new(dir: impl Into<PathBuf>, base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            dir: dir.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            anyhow::bail!("Invalid bundle key: {}", key);
        }
        Ok(self.dir.join(relative))
    }

    fn local_key<'a>(&self, url: &'a str) -> Option<&'a str> {
        url.strip_prefix(&self.base_url)?.strip_prefix('/')
    }
}

#[async_trait]
impl BundleStore for FsBundleStore {
    async fn put(&self, key: &str, bundle: &Value) -> Result<String> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, serde_json::to_vec(bundle)?)
            .await
            .with_context(|| format!("Failed to write bundle {}", path.display()))?;

        tracing::debug!("Wrote bundle {}", path.display());
        Ok(format!("{}/{}", self.base_url, key))
    }

    async fn fetch(&self, url: &str) -> Result<Option<Value>> {
        if let Some(key) = self.local_key(url) {
            let path = self.path_for(key)?;
            return match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(Some(
                    serde_json::from_slice(&bytes).context("Stored bundle is not valid JSON")?,
                )),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
            };
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch bundle {}", url))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response
            .error_for_status()
            .with_context(|| format!("Bundle request failed for {}", url))?
            .json()
            .await
            .context("Bundle response is not valid JSON")?;
        Ok(Some(body))
    }
}

/// Records invalidation requests in the log; for deployments without a CDN.
#[derive(Debug, Default, Clone)]
pub struct LoggingCdnInvalidator;

#[async_trait]
impl CdnInvalidator for LoggingCdnInvalidator {
    async fn invalidate(&self, urls: &[String]) -> Result<()> {
        tracing::info!("CDN invalidation requested for {:?}", urls);
        Ok(())
    }
}
