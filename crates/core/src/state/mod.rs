//! # State
//!
//! The SQLite database plus the collaborator traits the turn service persists
//! through. Everything is constructed once at startup and handed around as
//! `Arc<dyn ...>`.

mod bundles;
mod db;
mod store;

pub use bundles::{bundle_key, BundleStore, CdnInvalidator, FsBundleStore, LoggingCdnInvalidator};
pub use db::KilnDb;
pub use store::{is_unique_violation, GalleryAsset, Project, SqliteStore, Turn, TurnRole, User};

use anyhow::Result;
use async_trait::async_trait;

use crate::extract::PlanRecord;

/// Users, projects, conversation turns and plans
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn find_user(&self, email: &str) -> Result<Option<User>>;

    /// Look a project up by its public key
    async fn find_project(&self, key: &str) -> Result<Option<Project>>;

    /// Up to `limit` turns, most recent first
    async fn recent_turns(&self, project_id: &str, limit: usize) -> Result<Vec<Turn>>;

    async fn append_turn(
        &self,
        project_id: &str,
        user_id: &str,
        role: TurnRole,
        text: &str,
        images: &[String],
    ) -> Result<Turn>;

    async fn latest_plan(&self, project_id: &str) -> Result<Option<PlanRecord>>;

    async fn save_plan(&self, project_id: &str, plan: &PlanRecord) -> Result<()>;

    async fn set_project_url(&self, project_id: &str, url: &str) -> Result<()>;

    async fn set_clone_screenshot(&self, project_id: &str, url: &str) -> Result<()>;
}

/// Read-only access to a project's gallery
#[async_trait]
pub trait GalleryStore: Send + Sync {
    /// Up to `limit` active assets, newest first
    async fn active_assets(&self, project_id: &str, limit: usize) -> Result<Vec<GalleryAsset>>;
}
