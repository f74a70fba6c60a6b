//! # Build Dedup Queue
//!
//! SQLite-backed job queue with at most one in-flight (waiting, active or
//! delayed) build per project. The in-flight check and the insert share one
//! immediate transaction taken under the connection mutex.
//!
//! Workers drive jobs through [`BuildQueue::claim_next`], [`BuildQueue::complete`]
//! and [`BuildQueue::fail`]. Failed attempts are re-delayed with exponential
//! backoff until the job runs out of attempts. Only the most recent terminal
//! jobs are kept, for operational visibility.

mod job;

pub use job::{BuildJob, BuildPayload, JobOptions, JobState};

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::config::QueueSettings;
use crate::state::KilnDb;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("queue lock poisoned: {0}")]
    Lock(String),

    #[error("invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("build job not found: {0}")]
    NotFound(String),

    #[error("build job {id} is {state}, not active")]
    NotActive { id: String, state: &'static str },
}

/// Result of [`BuildQueue::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct Enqueued {
    /// The project already had a build in flight; `job` is that build
    pub existing: bool,
    pub job: BuildJob,
}

const JOB_COLUMNS: &str = "id, project_key, payload_json, state, priority, attempts, \
     max_attempts, run_at, last_error, created_at, finished_at";

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<BuildJob> {
    let payload_json: String = row.get(2)?;
    let payload = serde_json::from_str(&payload_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    let finished_at: Option<String> = row.get(10)?;

    Ok(BuildJob {
        id: row.get(0)?,
        project_key: row.get(1)?,
        payload,
        state: JobState::from_str(&row.get::<_, String>(3)?),
        priority: row.get(4)?,
        attempts: row.get(5)?,
        max_attempts: row.get(6)?,
        run_at: parse_timestamp(7, &row.get::<_, String>(7)?)?,
        last_error: row.get(8)?,
        created_at: parse_timestamp(9, &row.get::<_, String>(9)?)?,
        finished_at: finished_at.map(|s| parse_timestamp(10, &s)).transpose()?,
    })
}

fn find_in_flight(conn: &Connection, project_key: &str) -> rusqlite::Result<Option<BuildJob>> {
    conn.query_row(
        &format!(
            "SELECT {JOB_COLUMNS} FROM build_jobs \
             WHERE project_key = ?1 AND state IN ('waiting', 'active', 'delayed') \
             ORDER BY created_at, rowid LIMIT 1"
        ),
        params![project_key],
        row_to_job,
    )
    .optional()
}

fn load(conn: &Connection, id: &str) -> Result<BuildJob, QueueError> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM build_jobs WHERE id = ?1"),
        params![id],
        row_to_job,
    )
    .optional()?
    .ok_or_else(|| QueueError::NotFound(id.to_string()))
}

/// (backoff_ms, keep_completed, keep_failed) recorded at enqueue time
fn job_policy(conn: &Connection, id: &str) -> rusqlite::Result<(i64, i64, i64)> {
    conn.query_row(
        "SELECT backoff_ms, keep_completed, keep_failed FROM build_jobs WHERE id = ?1",
        params![id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )
}

/// Delete all but the `keep` most recently finished jobs in `state`.
fn prune(conn: &Connection, state: JobState, keep: i64) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM build_jobs WHERE state = ?1 AND id NOT IN (\
             SELECT id FROM build_jobs WHERE state = ?1 \
             ORDER BY finished_at DESC, rowid DESC LIMIT ?2)",
        params![state.as_str(), keep],
    )
}

#[derive(Clone)]
pub struct BuildQueue {
    conn: Arc<Mutex<Connection>>,
    settings: QueueSettings,
}

impl BuildQueue {
    pub fn new(db: &KilnDb, settings: QueueSettings) -> Self {
        Self {
            conn: db.connection(),
            settings,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, QueueError> {
        self.conn
            .lock()
            .map_err(|e| QueueError::Lock(e.to_string()))
    }

    /// Queue a build unless the project already has one in flight, in which
    /// case the existing job is returned with `existing: true`.
    #[tracing::instrument(skip_all, fields(project = %payload.project_key))]
    pub fn enqueue(&self, payload: &BuildPayload, options: &JobOptions) -> Result<Enqueued, QueueError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = find_in_flight(&tx, &payload.project_key)? {
            tx.commit()?;
            tracing::info!(
                job = %existing.id,
                state = existing.state.as_str(),
                "Build already in flight for project"
            );
            return Ok(Enqueued {
                existing: true,
                job: existing,
            });
        }

        let now = Utc::now();
        let delay = chrono::Duration::from_std(options.delay).unwrap_or_else(|_| chrono::Duration::zero());
        let state = if options.delay.is_zero() {
            JobState::Waiting
        } else {
            JobState::Delayed
        };
        let job = BuildJob {
            id: uuid::Uuid::new_v4().to_string(),
            project_key: payload.project_key.clone(),
            payload: payload.clone(),
            state,
            priority: options.priority,
            attempts: 0,
            max_attempts: options.attempts.unwrap_or(self.settings.attempts).max(1),
            run_at: now + delay,
            last_error: None,
            created_at: now,
            finished_at: None,
        };

        tx.execute(
            r#"
            INSERT INTO build_jobs
            (id, project_key, payload_json, state, priority, attempts, max_attempts,
             backoff_ms, keep_completed, keep_failed, run_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                job.id,
                job.project_key,
                serde_json::to_string(&job.payload)?,
                job.state.as_str(),
                job.priority,
                job.attempts,
                job.max_attempts,
                self.settings.backoff_base_ms as i64,
                options.keep_completed.unwrap_or(self.settings.keep_completed) as i64,
                options.keep_failed.unwrap_or(self.settings.keep_failed) as i64,
                timestamp(job.run_at),
                timestamp(job.created_at),
            ],
        )?;
        tx.commit()?;

        tracing::info!(job = %job.id, state = job.state.as_str(), "Build job queued");
        Ok(Enqueued {
            existing: false,
            job,
        })
    }

    /// Take the next runnable job and mark it active.
    ///
    /// Delayed jobs whose time has come are promoted first. Prioritized jobs
    /// run before unprioritized ones, oldest first within a priority.
    pub fn claim_next(&self) -> Result<Option<BuildJob>, QueueError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let promoted = tx.execute(
            "UPDATE build_jobs SET state = 'waiting' WHERE state = 'delayed' AND run_at <= ?1",
            params![timestamp(Utc::now())],
        )?;
        if promoted > 0 {
            tracing::debug!("Promoted {} delayed build job(s)", promoted);
        }

        let next = tx
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM build_jobs WHERE state = 'waiting' \
                     ORDER BY CASE WHEN priority = 0 THEN 1 ELSE 0 END, priority, created_at, rowid \
                     LIMIT 1"
                ),
                [],
                row_to_job,
            )
            .optional()?;

        let Some(mut job) = next else {
            tx.commit()?;
            return Ok(None);
        };

        job.state = JobState::Active;
        job.attempts += 1;
        tx.execute(
            "UPDATE build_jobs SET state = 'active', attempts = ?1 WHERE id = ?2",
            params![job.attempts, job.id],
        )?;
        tx.commit()?;

        tracing::info!(job = %job.id, attempt = job.attempts, "Build job claimed");
        Ok(Some(job))
    }

    /// Mark a claimed job as done. Only `Active` jobs can complete.
    pub fn complete(&self, id: &str) -> Result<BuildJob, QueueError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        ensure_active(&load(&tx, id)?)?;
        let (_, keep_completed, _) = job_policy(&tx, id)?;

        tx.execute(
            "UPDATE build_jobs SET state = 'completed', finished_at = ?1, last_error = NULL WHERE id = ?2",
            params![timestamp(Utc::now()), id],
        )?;
        let job = load(&tx, id)?;
        let pruned = prune(&tx, JobState::Completed, keep_completed)?;
        tx.commit()?;

        if pruned > 0 {
            tracing::debug!("Pruned {} completed build job(s)", pruned);
        }
        tracing::info!(job = %id, "Build job completed");
        Ok(job)
    }

    /// Record a failed attempt of an `Active` job. Returns the job's new state: `Delayed` while
    /// attempts remain, `Failed` once they are exhausted.
    pub fn fail(&self, id: &str, reason: &str) -> Result<JobState, QueueError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let job = load(&tx, id)?;
        ensure_active(&job)?;
        let (backoff_ms, _, keep_failed) = job_policy(&tx, id)?;
        let now = Utc::now();

        let state = if job.attempts < job.max_attempts {
            let exponent = job.attempts.saturating_sub(1).min(20);
            let delay_ms = backoff_ms.saturating_mul(1i64 << exponent);
            tx.execute(
                "UPDATE build_jobs SET state = 'delayed', run_at = ?1, last_error = ?2 WHERE id = ?3",
                params![timestamp(now + chrono::Duration::milliseconds(delay_ms)), reason, id],
            )?;
            tracing::warn!(
                "Build job {} failed (attempt {}/{}), retrying in {}ms: {}",
                id,
                job.attempts,
                job.max_attempts,
                delay_ms,
                reason
            );
            JobState::Delayed
        } else {
            tx.execute(
                "UPDATE build_jobs SET state = 'failed', finished_at = ?1, last_error = ?2 WHERE id = ?3",
                params![timestamp(now), reason, id],
            )?;
            prune(&tx, JobState::Failed, keep_failed)?;
            tracing::error!(
                "Build job {} failed after {} attempt(s): {}",
                id,
                job.attempts,
                reason
            );
            JobState::Failed
        };

        tx.commit()?;
        Ok(state)
    }

    pub fn get(&self, id: &str) -> Result<Option<BuildJob>, QueueError> {
        let conn = self.lock()?;
        match load(&conn, id) {
            Ok(job) => Ok(Some(job)),
            Err(QueueError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The project's waiting, active or delayed build, if any.
    pub fn in_flight(&self, project_key: &str) -> Result<Option<BuildJob>, QueueError> {
        let conn = self.lock()?;
        Ok(find_in_flight(&conn, project_key)?)
    }

    pub fn count(&self, state: JobState) -> Result<usize, QueueError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM build_jobs WHERE state = ?1",
            params![state.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn ensure_active(job: &BuildJob) -> Result<(), QueueError> {
    if job.state == JobState::Active {
        Ok(())
    } else {
        Err(QueueError::NotActive {
            id: job.id.clone(),
            state: job.state.as_str(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue(settings: QueueSettings) -> BuildQueue {
        BuildQueue::new(&KilnDb::open_in_memory().unwrap(), settings)
    }

    fn payload(project: &str) -> BuildPayload {
        BuildPayload {
            project_key: project.into(),
            user_id: "u1".into(),
            email: "dev@example.com".into(),
            url: format!("https://cdn.example.com/{project}.json"),
        }
    }

    fn total(queue: &BuildQueue) -> usize {
        [
            JobState::Waiting,
            JobState::Active,
            JobState::Delayed,
            JobState::Completed,
            JobState::Failed,
        ]
        .iter()
        .map(|s| queue.count(*s).unwrap())
        .sum()
    }

    #[test]
    fn second_enqueue_returns_existing_job() {
        let queue = queue(QueueSettings::default());
        let first = queue.enqueue(&payload("p1"), &JobOptions::for_build()).unwrap();
        let second = queue.enqueue(&payload("p1"), &JobOptions::for_build()).unwrap();

        assert!(!first.existing);
        assert!(second.existing);
        assert_eq!(first.job.id, second.job.id);
        assert_eq!(first.job.max_attempts, 3);
        assert_eq!(first.job.state, JobState::Waiting);
        assert_eq!(total(&queue), 1);
    }

    #[test]
    fn simultaneous_requests_produce_one_entry() {
        let queue = queue(QueueSettings::default());
        let results: Vec<Enqueued> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| s.spawn(|| queue.enqueue(&payload("p1"), &JobOptions::for_build()).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.existing).count(), 1);
        assert_eq!(results[0].job.id, results[1].job.id);
        assert_eq!(total(&queue), 1);
    }

    #[test]
    fn projects_do_not_block_each_other() {
        let queue = queue(QueueSettings::default());
        assert!(!queue.enqueue(&payload("p1"), &JobOptions::default()).unwrap().existing);
        assert!(!queue.enqueue(&payload("p2"), &JobOptions::default()).unwrap().existing);
        assert_eq!(queue.count(JobState::Waiting).unwrap(), 2);
    }

    #[test]
    fn active_and_delayed_jobs_still_dedup() {
        let queue = queue(QueueSettings::default());
        let delayed = JobOptions {
            delay: Duration::from_secs(3600),
            ..JobOptions::default()
        };
        let job = queue.enqueue(&payload("later"), &delayed).unwrap().job;
        assert_eq!(job.state, JobState::Delayed);
        assert!(queue.enqueue(&payload("later"), &JobOptions::default()).unwrap().existing);
        assert!(queue.claim_next().unwrap().is_none(), "delayed job is not due");

        queue.enqueue(&payload("now"), &JobOptions::default()).unwrap();
        let active = queue.claim_next().unwrap().unwrap();
        assert_eq!(active.project_key, "now");
        assert!(queue.enqueue(&payload("now"), &JobOptions::default()).unwrap().existing);
    }

    #[test]
    fn finished_project_can_be_queued_again() {
        let queue = queue(QueueSettings::default());
        let first = queue.enqueue(&payload("p1"), &JobOptions::default()).unwrap().job;
        let claimed = queue.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.attempts, 1);

        let done = queue.complete(&first.id).unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert!(done.finished_at.is_some());
        assert!(queue.in_flight("p1").unwrap().is_none());

        let again = queue.enqueue(&payload("p1"), &JobOptions::default()).unwrap();
        assert!(!again.existing);
        assert_ne!(again.job.id, first.id);
    }

    #[test]
    fn prioritized_jobs_run_first() {
        let queue = queue(QueueSettings::default());
        queue.enqueue(&payload("plain"), &JobOptions::default()).unwrap();
        queue.enqueue(&payload("urgent"), &JobOptions::for_build()).unwrap();

        assert_eq!(queue.claim_next().unwrap().unwrap().project_key, "urgent");
        assert_eq!(queue.claim_next().unwrap().unwrap().project_key, "plain");
        assert!(queue.claim_next().unwrap().is_none());
    }

    #[test]
    fn failures_retry_until_attempts_run_out() {
        let queue = queue(QueueSettings {
            attempts: 2,
            backoff_base_ms: 0,
            ..QueueSettings::default()
        });
        let job = queue.enqueue(&payload("p1"), &JobOptions::default()).unwrap().job;

        queue.claim_next().unwrap().unwrap();
        assert_eq!(queue.fail(&job.id, "npm install failed").unwrap(), JobState::Delayed);
        assert!(queue.enqueue(&payload("p1"), &JobOptions::default()).unwrap().existing);

        let retry = queue.claim_next().unwrap().unwrap();
        assert_eq!(retry.attempts, 2);
        assert_eq!(retry.last_error.as_deref(), Some("npm install failed"));
        assert_eq!(queue.fail(&job.id, "still broken").unwrap(), JobState::Failed);

        let failed = queue.get(&job.id).unwrap().unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert!(queue.in_flight("p1").unwrap().is_none());
    }

    #[test]
    fn backoff_delays_the_retry() {
        let queue = queue(QueueSettings::default());
        let job = queue.enqueue(&payload("p1"), &JobOptions::default()).unwrap().job;
        queue.claim_next().unwrap().unwrap();
        queue.fail(&job.id, "boom").unwrap();

        let delayed = queue.get(&job.id).unwrap().unwrap();
        assert_eq!(delayed.state, JobState::Delayed);
        assert!(delayed.run_at > Utc::now());
        assert!(queue.claim_next().unwrap().is_none());
    }

    #[test]
    fn retention_keeps_only_recent_terminal_jobs() {
        let queue = queue(QueueSettings::default());
        let options = JobOptions {
            keep_completed: Some(1),
            ..JobOptions::default()
        };
        for project in ["a", "b", "c"] {
            let job = queue.enqueue(&payload(project), &options).unwrap().job;
            queue.claim_next().unwrap().unwrap();
            queue.complete(&job.id).unwrap();
        }
        assert_eq!(queue.count(JobState::Completed).unwrap(), 1);
    }

    #[test]
    fn only_claimed_jobs_can_finish() {
        let queue = queue(QueueSettings::default());
        let job = queue.enqueue(&payload("p1"), &JobOptions::default()).unwrap().job;
        assert!(matches!(
            queue.complete(&job.id),
            Err(QueueError::NotActive { state: "waiting", .. })
        ));
        assert!(matches!(queue.fail(&job.id, "boom"), Err(QueueError::NotActive { .. })));
        assert_eq!(queue.get(&job.id).unwrap().unwrap().state, JobState::Waiting);

        queue.claim_next().unwrap().unwrap();
        queue.complete(&job.id).unwrap();
        assert!(matches!(
            queue.complete(&job.id),
            Err(QueueError::NotActive { state: "completed", .. })
        ));
    }

    #[test]
    fn unknown_job_is_not_found() {
        let queue = queue(QueueSettings::default());
        assert!(matches!(queue.complete("nope"), Err(QueueError::NotFound(_))));
        assert!(queue.get("nope").unwrap().is_none());
    }
}
