//! Build job records and enqueue options.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of a build job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    /// Waiting for its `run_at` time (initial delay or retry backoff)
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Delayed => "delayed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "delayed" => Self::Delayed,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Waiting,
        }
    }

    /// Completed or failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// What a build worker needs to deploy a project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildPayload {
    #[serde(rename = "projectId")]
    pub project_key: String,
    pub user_id: String,
    pub email: String,
    /// Bundle URL to build from
    pub url: String,
}

/// Per-job overrides of the queue defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOptions {
    /// Lower runs first; 0 means no priority and sorts after every prioritized job
    pub priority: u32,
    pub delay: Duration,
    pub attempts: Option<u32>,
    pub keep_completed: Option<usize>,
    pub keep_failed: Option<usize>,
}

impl JobOptions {
    /// Options used for user-triggered builds
    pub fn for_build() -> Self {
        Self {
            priority: 1,
            delay: Duration::ZERO,
            attempts: None,
            keep_completed: Some(5),
            keep_failed: Some(3),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildJob {
    pub id: String,
    pub project_key: String,
    pub payload: BuildPayload,
    pub state: JobState,
    pub priority: u32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub run_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_strings_round_trip() {
        for state in [
            JobState::Waiting,
            JobState::Active,
            JobState::Delayed,
            JobState::Completed,
            JobState::Failed,
        ] {
            assert_eq!(JobState::from_str(state.as_str()), state);
        }
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Delayed.is_terminal());
    }

    #[test]
    fn payload_uses_project_id_on_the_wire() {
        let payload = BuildPayload {
            project_key: "p1".into(),
            user_id: "u1".into(),
            email: "a@b.c".into(),
            url: "https://cdn/p1.json".into(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["projectId"], "p1");
        assert_eq!(value["userId"], "u1");
    }
}
