//! Project registry: the authoritative record of every project.
//!
//! Backed by the `projects` table of the shared SQLite database, so the API
//! process and any number of worker processes see one registry. Each write
//! is a single statement or a single transaction; readers never observe a
//! half-applied update.
//!
//! Creation and deletion also manage the project's storage area:
//!
//! - `create` inserts inside a transaction, allocates the area, and commits
//!   only once the area exists.
//! - `delete` removes the area first and keeps the row if that fails, so a
//!   project is never forgotten while its files are still on disk.

use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{KbError, Result};
use crate::metrics;
use crate::models::{
    from_millis, now_millis, Project, ProjectConfig, ProjectCreate, ProjectStats, ProjectUpdate,
};
use crate::storage::StorageLayout;

#[derive(Clone)]
pub struct ProjectRegistry {
    pool: SqlitePool,
    storage: StorageLayout,
}

/// New stats for [`ProjectRegistry::update_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsUpdate {
    pub total_chunks: u64,
    pub storage_size: u64,
    pub files_count: u64,
}

fn project_from_row(row: &SqliteRow) -> Result<Project> {
    let tags_json: String = row.try_get("tags_json")?;
    let tags: Vec<String> = serde_json::from_str(&tags_json)?;
    Ok(Project {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        tags,
        config: ProjectConfig {
            chunk_size: row.try_get::<i64, _>("chunk_size")? as usize,
            chunk_overlap: row.try_get::<i64, _>("chunk_overlap")? as usize,
        },
        total_chunks: row.try_get::<i64, _>("total_chunks")? as u64,
        storage_size: row.try_get::<i64, _>("storage_size")? as u64,
        files_count: row.try_get::<i64, _>("files_count")? as u64,
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

fn tags_to_json(tags: &[String]) -> Result<String> {
    Ok(serde_json::to_string(&Value::from(tags.to_vec()))?)
}

impl ProjectRegistry {
    pub fn new(pool: SqlitePool, storage: StorageLayout) -> Self {
        Self { pool, storage }
    }

    pub fn storage(&self) -> &StorageLayout {
        &self.storage
    }

    pub async fn create(&self, req: ProjectCreate) -> Result<Project> {
        req.validate()?;

        let now = from_millis(now_millis());
        let project = Project {
            id: Uuid::new_v4().to_string(),
            name: req.name.trim().to_string(),
            description: req.description,
            tags: req.tags,
            config: req.config.unwrap_or_default(),
            total_chunks: 0,
            storage_size: 0,
            files_count: 0,
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO projects (id, name, description, tags_json, chunk_size, chunk_overlap,
                                  total_chunks, storage_size, files_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, 0, 0, ?, ?)
            "#,
        )
        .bind(&project.id)
        .bind(&project.name)
        .bind(&project.description)
        .bind(tags_to_json(&project.tags)?)
        .bind(project.config.chunk_size as i64)
        .bind(project.config.chunk_overlap as i64)
        .bind(project.created_at.timestamp_millis())
        .bind(project.updated_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        if let Err(e) = self.storage.create_area(&project.id) {
            // Area removal precedes the rollback
            let _ = self.storage.remove_area(&project.id);
            if let Err(rb) = tx.rollback().await {
                tracing::error!(project_id = %project.id, error = %rb, "project insert rollback failed");
            }
            return Err(e);
        }

        if let Err(e) = tx.commit().await {
            let _ = self.storage.remove_area(&project.id);
            return Err(e.into());
        }

        tracing::info!(project_id = %project.id, name = %project.name, "project created");
        metrics::set_project_gauges(&project);
        Ok(project)
    }

    pub async fn get(&self, id: &str) -> Result<Project> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| KbError::project_not_found(id))?;
        project_from_row(&row)
    }

    /// All projects, oldest first.
    pub async fn list(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query("SELECT * FROM projects ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(project_from_row).collect()
    }

    pub async fn count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM projects")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    /// Apply the fields present in `update`; absent fields keep their value.
    pub async fn update(&self, id: &str, update: ProjectUpdate) -> Result<Project> {
        update.validate()?;

        let tags_json = update.tags.as_deref().map(tags_to_json).transpose()?;
        let (chunk_size, chunk_overlap) = match update.config {
            Some(cfg) => (
                Some(cfg.chunk_size as i64),
                Some(cfg.chunk_overlap as i64),
            ),
            None => (None, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE projects SET
                name = COALESCE(?, name),
                description = COALESCE(?, description),
                tags_json = COALESCE(?, tags_json),
                chunk_size = COALESCE(?, chunk_size),
                chunk_overlap = COALESCE(?, chunk_overlap),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(update.name.as_deref().map(str::trim))
        .bind(update.description.as_deref())
        .bind(tags_json)
        .bind(chunk_size)
        .bind(chunk_overlap)
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(KbError::project_not_found(id));
        }
        self.get(id).await
    }

    /// Delete a project and its storage area. Returns `false` if the project
    /// did not exist.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let project = match self.get(id).await {
            Ok(p) => p,
            Err(KbError::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };

        self.storage.remove_area(id)?;

        sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        tracing::info!(project_id = %id, "project deleted");
        metrics::clear_project_gauges(&project);
        Ok(true)
    }

    /// Overwrite the stats counters. Callers compute the new values.
    pub async fn update_stats(&self, id: &str, stats: StatsUpdate) -> Result<Project> {
        let result = sqlx::query(
            r#"
            UPDATE projects
            SET total_chunks = ?, storage_size = ?, files_count = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(stats.total_chunks as i64)
        .bind(stats.storage_size as i64)
        .bind(stats.files_count as i64)
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(KbError::project_not_found(id));
        }
        let project = self.get(id).await?;
        metrics::set_project_gauges(&project);
        Ok(project)
    }

    pub async fn stats(&self, id: &str) -> Result<ProjectStats> {
        Ok(ProjectStats::from(&self.get(id).await?))
    }
}
