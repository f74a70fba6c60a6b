//! # SQLite Store
//!
//! Users, projects, conversation turns, plans and gallery assets on top of
//! [`KilnDb`]. Implements the [`ProjectStore`] and [`GalleryStore`] traits the
//! turn service consumes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

use super::db::KilnDb;
use super::{GalleryStore, ProjectStore};
use crate::extract::PlanRecord;

/// Whether `err` was caused by a UNIQUE constraint, such as a project key
/// that is already taken.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        )
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    /// Public identifier clients address the project by
    pub key: String,
    pub owner_id: String,
    pub title: String,
    /// Where the current code bundle is served from
    pub url: Option<String>,
    /// Screenshot of the page the project was cloned from
    pub clone_screenshot_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "assistant" | "ai" => Self::Assistant,
            _ => Self::User,
        }
    }
}

/// One persisted conversation message. Never updated after insert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub id: String,
    pub role: TurnRole,
    pub text: String,
    #[serde(default)]
    pub images: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GalleryAsset {
    pub id: String,
    pub label: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_project(row: &rusqlite::Row) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        key: row.get(1)?,
        owner_id: row.get(2)?,
        title: row.get(3)?,
        url: row.get(4)?,
        clone_screenshot_url: row.get(5)?,
    })
}

fn row_to_turn(row: &rusqlite::Row) -> rusqlite::Result<Turn> {
    let images_json: String = row.get(3)?;
    Ok(Turn {
        id: row.get(0)?,
        role: TurnRole::from_str(&row.get::<_, String>(1)?),
        text: row.get(2)?,
        images: serde_json::from_str(&images_json).unwrap_or_default(),
        created_at: parse_timestamp(4, &row.get::<_, String>(4)?)?,
    })
}

/// SQLite-backed project store
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create from shared KilnDb connection
    pub fn new(db: &KilnDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    /// Insert a user, or return the existing one with that email
    pub fn ensure_user(&self, email: &str, name: &str) -> Result<User> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO users (id, email, name) VALUES (?1, ?2, ?3)",
            params![uuid::Uuid::new_v4().to_string(), email, name],
        )
        .context("Failed to create user")?;

        conn.query_row(
            "SELECT id, email, name FROM users WHERE email = ?1",
            params![email],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    name: row.get(2)?,
                })
            },
        )
        .context("User not found after insert")
    }

    pub fn create_project(&self, key: &str, owner_id: &str, title: &str) -> Result<Project> {
        let conn = self.lock()?;
        let project = Project {
            id: uuid::Uuid::new_v4().to_string(),
            key: key.to_string(),
            owner_id: owner_id.to_string(),
            title: title.to_string(),
            url: None,
            clone_screenshot_url: None,
        };
        conn.execute(
            "INSERT INTO projects (id, key, owner_id, title) VALUES (?1, ?2, ?3, ?4)",
            params![project.id, project.key, project.owner_id, project.title],
        )
        .with_context(|| format!("Failed to create project '{}'", key))?;
        Ok(project)
    }

    pub fn add_gallery_asset(&self, project_id: &str, label: &str, url: &str) -> Result<GalleryAsset> {
        let conn = self.lock()?;
        let asset = GalleryAsset {
            id: uuid::Uuid::new_v4().to_string(),
            label: label.to_string(),
            url: url.to_string(),
            created_at: Utc::now(),
        };
        conn.execute(
            "INSERT INTO gallery_assets (id, project_id, label, url, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![asset.id, project_id, asset.label, asset.url, timestamp(asset.created_at)],
        )
        .context("Failed to add gallery asset")?;
        Ok(asset)
    }

    pub fn set_gallery_asset_active(&self, id: &str, active: bool) -> Result<()> {
        let conn = self.lock()?;
        let affected = conn.execute(
            "UPDATE gallery_assets SET active = ?1 WHERE id = ?2",
            params![active, id],
        )?;
        if affected == 0 {
            anyhow::bail!("Gallery asset not found: {}", id);
        }
        Ok(())
    }
}

#[async_trait]
impl ProjectStore for SqliteStore {
    async fn find_user(&self, email: &str) -> Result<Option<User>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, email, name FROM users WHERE email = ?1",
            params![email],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    name: row.get(2)?,
                })
            },
        )
        .optional()
        .context("Failed to look up user")
    }

    async fn find_project(&self, key: &str) -> Result<Option<Project>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, key, owner_id, title, url, clone_screenshot_url FROM projects WHERE key = ?1",
            params![key],
            row_to_project,
        )
        .optional()
        .context("Failed to look up project")
    }

    async fn recent_turns(&self, project_id: &str, limit: usize) -> Result<Vec<Turn>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, role, text, images_json, created_at
            FROM turns
            WHERE project_id = ?1
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?2
            "#,
        )?;
        let turns = stmt
            .query_map(params![project_id, limit as i64], row_to_turn)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list turns")?;
        Ok(turns)
    }

    async fn append_turn(
        &self,
        project_id: &str,
        user_id: &str,
        role: TurnRole,
        text: &str,
        images: &[String],
    ) -> Result<Turn> {
        let conn = self.lock()?;
        let turn = Turn {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            text: text.to_string(),
            images: images.to_vec(),
            created_at: Utc::now(),
        };
        conn.execute(
            r#"
            INSERT INTO turns (id, project_id, user_id, role, text, images_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                turn.id,
                project_id,
                user_id,
                turn.role.as_str(),
                turn.text,
                serde_json::to_string(&turn.images)?,
                timestamp(turn.created_at),
            ],
        )
        .context("Failed to save turn")?;
        Ok(turn)
    }

    async fn latest_plan(&self, project_id: &str) -> Result<Option<PlanRecord>> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT record_json FROM plans WHERE project_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).context("Stored plan is not valid JSON"))
            .transpose()
    }

    async fn save_plan(&self, project_id: &str, plan: &PlanRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO plans (id, project_id, record_json, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                uuid::Uuid::new_v4().to_string(),
                project_id,
                serde_json::to_string(plan)?,
                timestamp(Utc::now()),
            ],
        )
        .context("Failed to save plan")?;
        Ok(())
    }

    async fn set_project_url(&self, project_id: &str, url: &str) -> Result<()> {
        let conn = self.lock()?;
        let affected = conn.execute(
            "UPDATE projects SET url = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![url, project_id],
        )?;
        if affected == 0 {
            anyhow::bail!("Project not found: {}", project_id);
        }
        Ok(())
    }

    async fn set_clone_screenshot(&self, project_id: &str, url: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE projects SET clone_screenshot_url = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![url, project_id],
        )?;
        Ok(())
    }
}

#[async_trait]
impl GalleryStore for SqliteStore {
    async fn active_assets(&self, project_id: &str, limit: usize) -> Result<Vec<GalleryAsset>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, label, url, created_at
            FROM gallery_assets
            WHERE project_id = ?1 AND active = 1
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?2
            "#,
        )?;
        let assets = stmt
            .query_map(params![project_id, limit as i64], |row| {
                Ok(GalleryAsset {
                    id: row.get(0)?,
                    label: row.get(1)?,
                    url: row.get(2)?,
                    created_at: parse_timestamp(3, &row.get::<_, String>(3)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list gallery assets")?;
        Ok(assets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> SqliteStore {
        SqliteStore::new(&KilnDb::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn users_and_projects() {
        let store = store();
        let user = store.ensure_user("dev@example.com", "Dev").unwrap();
        let again = store.ensure_user("dev@example.com", "Other").unwrap();
        assert_eq!(user, again);

        let project = store.create_project("shiny-otter", &user.id, "Otter").unwrap();
        let dup = store.create_project("shiny-otter", &user.id, "Dup").unwrap_err();
        assert!(is_unique_violation(&dup), "{dup:#}");
        assert!(!is_unique_violation(&anyhow::anyhow!("Lock error: poisoned")));

        let found = store.find_project("shiny-otter").await.unwrap().unwrap();
        assert_eq!(found.id, project.id);
        assert!(store.find_project("missing").await.unwrap().is_none());
        assert!(store.find_user("nobody@example.com").await.unwrap().is_none());

        store.set_project_url(&project.id, "https://cdn/x").await.unwrap();
        store.set_clone_screenshot(&project.id, "https://cdn/shot.png").await.unwrap();
        let found = store.find_project("shiny-otter").await.unwrap().unwrap();
        assert_eq!(found.url.as_deref(), Some("https://cdn/x"));
        assert_eq!(found.clone_screenshot_url.as_deref(), Some("https://cdn/shot.png"));
        assert!(store.set_project_url("nope", "u").await.is_err());
    }

    #[tokio::test]
    async fn turns_come_back_most_recent_first() {
        let store = store();
        let user = store.ensure_user("a@b.c", "").unwrap();
        let project = store.create_project("p", &user.id, "").unwrap();

        for i in 0..5 {
            let role = if i % 2 == 0 { TurnRole::User } else { TurnRole::Assistant };
            store
                .append_turn(&project.id, &user.id, role, &format!("turn {i}"), &[])
                .await
                .unwrap();
        }

        let turns = store.recent_turns(&project.id, 3).await.unwrap();
        let texts: Vec<&str> = turns.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["turn 4", "turn 3", "turn 2"]);
        assert_eq!(turns[1].role, TurnRole::Assistant);
    }

    #[tokio::test]
    async fn latest_plan_wins() {
        let store = store();
        let user = store.ensure_user("a@b.c", "").unwrap();
        let project = store.create_project("p", &user.id, "").unwrap();
        assert!(store.latest_plan(&project.id).await.unwrap().is_none());

        let first = PlanRecord::from_value(&json!({"generatedFiles": {"a.js": "1"}}));
        let second = PlanRecord::from_value(&json!({"generatedFiles": {"b.js": "2"}}));
        store.save_plan(&project.id, &first).await.unwrap();
        store.save_plan(&project.id, &second).await.unwrap();

        assert_eq!(store.latest_plan(&project.id).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn gallery_lists_active_assets_newest_first() {
        let store = store();
        let user = store.ensure_user("a@b.c", "").unwrap();
        let project = store.create_project("p", &user.id, "").unwrap();

        let old = store.add_gallery_asset(&project.id, "logo", "https://x/logo.png").unwrap();
        store.add_gallery_asset(&project.id, "hero", "https://x/hero.png").unwrap();
        let hidden = store.add_gallery_asset(&project.id, "old", "https://x/old.png").unwrap();
        store.set_gallery_asset_active(&hidden.id, false).unwrap();

        let assets = store.active_assets(&project.id, 20).await.unwrap();
        let labels: Vec<&str> = assets.iter().map(|a| a.label.as_str()).collect();
        assert_eq!(labels, vec!["hero", "logo"]);

        let limited = store.active_assets(&project.id, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_ne!(limited[0].id, old.id);
    }
}
