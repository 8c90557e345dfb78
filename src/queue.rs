//! Durable, prioritized, multi-class job queue.
//!
//! Jobs live in the `jobs` table of the shared SQLite database, so a job is
//! durable once [`JobQueue::enqueue`] returns and is visible to worker
//! processes on other connections.
//!
//! # Claiming
//!
//! [`JobQueue::claim`] moves the oldest queued job of the highest-priority
//! eligible class to `started` in a single `UPDATE … RETURNING` statement.
//! SQLite serializes writers, so two workers can never claim the same job.
//!
//! # Termination
//!
//! [`finish`](JobQueue::finish) and [`fail`](JobQueue::fail) only match rows
//! still in `started`. A job therefore terminates exactly once; a second
//! attempt (for example a task that outlived its timeout) reports `false`.

use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::{KbError, Result};
use crate::metrics;
use crate::models::{from_millis, now_millis, Job, JobError, JobPayload, JobStatus, QueueClass};

#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    /// Wakes workers in this process on enqueue; remote workers poll.
    notify: Arc<Notify>,
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let queue: String = row.try_get("queue")?;
    let status: String = row.try_get("status")?;
    let payload_json: String = row.try_get("payload_json")?;
    let result_json: Option<String> = row.try_get("result_json")?;
    let error_kind: Option<String> = row.try_get("error_kind")?;
    let error_message: Option<String> = row.try_get("error_message")?;

    Ok(Job {
        id: row.try_get("id")?,
        queue: queue.parse()?,
        project_id: row.try_get("project_id")?,
        kind: row.try_get("kind")?,
        status: status.parse()?,
        payload: serde_json::from_str(&payload_json)?,
        result: result_json
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()?,
        error: error_kind.map(|kind| JobError {
            kind,
            message: error_message.unwrap_or_default(),
        }),
        worker_id: row.try_get("worker_id")?,
        created_at: from_millis(row.try_get("created_at")?),
        started_at: row.try_get::<Option<i64>, _>("started_at")?.map(from_millis),
        ended_at: row.try_get::<Option<i64>, _>("ended_at")?.map(from_millis),
    })
}

impl JobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Enqueue on the class the payload routes to.
    pub async fn enqueue(&self, project_id: &str, payload: JobPayload) -> Result<Job> {
        let class = payload.queue_class();
        self.enqueue_to(class, project_id, payload).await
    }

    pub async fn enqueue_to(
        &self,
        class: QueueClass,
        project_id: &str,
        payload: JobPayload,
    ) -> Result<Job> {
        let id = Uuid::new_v4().to_string();
        let kind = payload.kind();
        let now = now_millis();

        sqlx::query(
            r#"
            INSERT INTO jobs (id, queue, priority, project_id, kind, status, payload_json, created_at)
            VALUES (?, ?, ?, ?, ?, 'queued', ?, ?)
            "#,
        )
        .bind(&id)
        .bind(class.as_str())
        .bind(class.priority())
        .bind(project_id)
        .bind(kind)
        .bind(serde_json::to_string(&payload)?)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::info!(job_id = %id, queue = %class, kind, project_id, "job enqueued");
        metrics::record_enqueued(class.as_str());
        self.notify.notify_one();

        Ok(Job {
            id,
            queue: class,
            project_id: project_id.to_string(),
            kind: kind.to_string(),
            status: JobStatus::Queued,
            payload,
            result: None,
            error: None,
            worker_id: None,
            created_at: from_millis(now),
            started_at: None,
            ended_at: None,
        })
    }

    pub async fn status(&self, id: &str) -> Result<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| KbError::job_not_found(id))?;
        job_from_row(&row)
    }

    /// Most recent jobs first, optionally filtered by status.
    pub async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let rows = match status {
            Some(s) => {
                sqlx::query(
                    "SELECT * FROM jobs WHERE status = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
                )
                .bind(s.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(job_from_row).collect()
    }

    /// Claim the next job across `classes`, chat first, FIFO within a class.
    pub async fn claim(&self, worker_id: &str, classes: &[QueueClass]) -> Result<Option<Job>> {
        if classes.is_empty() {
            return Ok(None);
        }

        let placeholders = vec!["?"; classes.len()].join(", ");
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'started', worker_id = ?, started_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'queued' AND queue IN ({})
                ORDER BY priority ASC, created_at ASC, rowid ASC
                LIMIT 1
            )
            AND status = 'queued'
            RETURNING *
            "#,
            placeholders
        );

        let mut query = sqlx::query(&sql).bind(worker_id).bind(now_millis());
        for class in classes {
            query = query.bind(class.as_str());
        }

        match query.fetch_optional(&self.pool).await? {
            Some(row) => Ok(Some(job_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Record success. Returns `false` if the job was no longer `started`.
    pub async fn finish(&self, id: &str, result: &Value) -> Result<bool> {
        let changed = sqlx::query(
            "UPDATE jobs SET status = 'finished', result_json = ?, ended_at = ? WHERE id = ? AND status = 'started'",
        )
        .bind(serde_json::to_string(result)?)
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(changed == 1)
    }

    /// Record failure. Returns `false` if the job was no longer `started`.
    pub async fn fail(&self, id: &str, error: &JobError) -> Result<bool> {
        let changed = sqlx::query(
            r#"
            UPDATE jobs SET status = 'failed', error_kind = ?, error_message = ?, ended_at = ?
            WHERE id = ? AND status = 'started'
            "#,
        )
        .bind(&error.kind)
        .bind(&error.message)
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(changed == 1)
    }

    /// Block until a local enqueue or `poll` elapses, whichever is first.
    pub async fn wait_for_work(&self, poll: Duration) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn queue() -> JobQueue {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate(&pool).await.unwrap();
        JobQueue::new(pool)
    }

    fn search(q: &str) -> JobPayload {
        JobPayload::Search {
            query: q.to_string(),
            top_k: 5,
        }
    }

    fn index(text: &str) -> JobPayload {
        JobPayload::IndexText {
            text: text.to_string(),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_then_status() {
        let q = queue().await;
        let job = q.enqueue("p1", search("hello")).await.unwrap();
        assert_eq!(job.queue, QueueClass::Chat);
        assert_eq!(job.status, JobStatus::Queued);

        let fetched = q.status(&job.id).await.unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.payload, job.payload);
        assert_eq!(fetched.kind, "search");
        assert!(fetched.result.is_none());
    }

    #[tokio::test]
    async fn test_unknown_job_not_found() {
        let q = queue().await;
        assert!(matches!(
            q.status("missing").await,
            Err(KbError::NotFound { entity: "job", .. })
        ));
    }

    #[tokio::test]
    async fn test_claim_prefers_chat_then_fifo() {
        let q = queue().await;
        let idx1 = q.enqueue("p1", index("one")).await.unwrap();
        let reset = q.enqueue("p1", JobPayload::Reset).await.unwrap();
        let chat = q.enqueue("p1", search("q")).await.unwrap();
        let idx2 = q.enqueue("p1", index("two")).await.unwrap();

        let order: Vec<String> = {
            let mut v = Vec::new();
            while let Some(job) = q.claim("w1", &QueueClass::ALL).await.unwrap() {
                assert_eq!(job.status, JobStatus::Started);
                assert_eq!(job.worker_id.as_deref(), Some("w1"));
                assert!(job.started_at.is_some());
                v.push(job.id);
            }
            v
        };
        assert_eq!(order, vec![chat.id, idx1.id, idx2.id, reset.id]);
    }

    #[tokio::test]
    async fn test_claim_respects_assigned_classes() {
        let q = queue().await;
        q.enqueue("p1", search("q")).await.unwrap();
        assert!(q
            .claim("w1", &[QueueClass::Indexing])
            .await
            .unwrap()
            .is_none());
        assert!(q.claim("w1", &[]).await.unwrap().is_none());
        assert!(q.claim("w1", &[QueueClass::Chat]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_terminates_exactly_once() {
        let q = queue().await;
        let job = q.enqueue("p1", search("q")).await.unwrap();

        // Not started yet: terminal transitions do not apply
        assert!(!q.finish(&job.id, &serde_json::json!({})).await.unwrap());

        q.claim("w1", &QueueClass::ALL).await.unwrap().unwrap();
        let err = JobError {
            kind: "job_timeout".into(),
            message: "too slow".into(),
        };
        assert!(q.fail(&job.id, &err).await.unwrap());
        // Late result is rejected
        assert!(!q
            .finish(&job.id, &serde_json::json!({"late": true}))
            .await
            .unwrap());

        let stored = q.status(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error, Some(err));
        assert!(stored.result.is_none());
        assert!(stored.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_finish_stores_result() {
        let q = queue().await;
        let job = q.enqueue("p1", index("x")).await.unwrap();
        q.claim("w1", &QueueClass::ALL).await.unwrap();
        let result = serde_json::json!({"success": true, "chunks_added": 3});
        assert!(q.finish(&job.id, &result).await.unwrap());
        let stored = q.status(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Finished);
        assert_eq!(stored.result, Some(result));
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn test_list_filters_and_limits() {
        let q = queue().await;
        for i in 0..5 {
            q.enqueue("p1", search(&format!("q{}", i))).await.unwrap();
        }
        q.claim("w1", &QueueClass::ALL).await.unwrap();

        assert_eq!(q.list(None, 50).await.unwrap().len(), 5);
        assert_eq!(q.list(None, 2).await.unwrap().len(), 2);
        assert_eq!(
            q.list(Some(JobStatus::Queued), 50).await.unwrap().len(),
            4
        );
        assert_eq!(
            q.list(Some(JobStatus::Started), 50).await.unwrap().len(),
            1
        );
    }
}
