use crate::db::{self, OptionalRowExt};
use crate::paths::AppPaths;
use crate::{EngineError, Result};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRow {
    pub id: String,
    pub url: String,
    pub status: JobStatus,
    pub title: Option<String>,
    /// Range URL this job was expanded from, if any.
    pub expanded_from: Option<String>,
    pub error: Option<String>,
    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub finished_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub url: String,
    pub title: Option<String>,
    pub expanded_from: Option<String>,
}

impl NewJob {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRow {
    pub id: String,
    pub job_id: String,
    /// Resolved direct image URL.
    pub url: String,
    pub file_path: String,
    pub thumbnail_path: Option<String>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct NewPhoto {
    pub job_id: String,
    pub url: String,
    pub file_path: String,
    pub thumbnail_path: Option<String>,
}

/// Durable record of download requests and the photos they produced.
///
/// State transitions are conditional on the current status, so two workers
/// racing on the same row cannot both win a claim.
pub trait JobStore: Send + Sync {
    /// Inserts a pending job. Returns the existing row (and `false`) when the
    /// URL is already known.
    fn enqueue(&self, job: NewJob) -> Result<(JobRow, bool)>;
    fn get_job(&self, id: &str) -> Result<Option<JobRow>>;
    /// Oldest pending rows first.
    fn poll_batch(&self, limit: usize) -> Result<Vec<JobRow>>;
    /// pending -> processing. `false` when another worker got there first.
    fn claim(&self, id: &str) -> Result<bool>;
    /// processing -> completed.
    fn complete(&self, id: &str) -> Result<bool>;
    /// processing -> failed.
    fn fail(&self, id: &str, error: &str) -> Result<bool>;
    /// Startup recovery: every processing row goes back to pending.
    fn requeue_processing(&self) -> Result<usize>;
    fn delete_pending(&self, id: &str) -> Result<()>;
    fn list_jobs(&self, limit: usize, offset: usize) -> Result<Vec<JobRow>>;
    /// Processing rows first, then pending, each oldest first.
    fn list_active_jobs(&self) -> Result<Vec<JobRow>>;

    /// Idempotent on `file_path`: a second insert returns the stored row.
    fn insert_photo(&self, photo: NewPhoto) -> Result<PhotoRow>;
    fn photos_for_job(&self, job_id: &str) -> Result<Vec<PhotoRow>>;
    /// Favorites (newest favorite first), then every other photo (newest first).
    fn repair_candidates(&self) -> Result<Vec<PhotoRow>>;
    fn mark_favorite(&self, photo_id: &str) -> Result<()>;
}

const JOB_COLUMNS: &str =
    "id, url, status, title, expanded_from, error, created_at_ms, started_at_ms, finished_at_ms";
const PHOTO_COLUMNS: &str = "p.id, p.job_id, p.url, p.file_path, p.thumbnail_path, p.created_at_ms";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    paths: AppPaths,
}

impl SqliteStore {
    pub fn open(paths: AppPaths) -> Result<Self> {
        db::ensure_schema(&paths)?;
        Ok(Self { paths })
    }

    fn conn(&self) -> Result<Connection> {
        db::open(&self.paths)
    }

    fn transition(&self, id: &str, from: JobStatus, to: JobStatus, error: Option<&str>) -> Result<bool> {
        db::with_busy_retry(|| {
            let conn = self.conn()?;
            let now = now_ms();
            let updated = match to {
                JobStatus::Processing => conn.execute(
                    "UPDATE jobs SET status=?1, started_at_ms=?2, error=NULL WHERE id=?3 AND status=?4",
                    params![to.as_str(), now, id, from.as_str()],
                )?,
                _ => conn.execute(
                    "UPDATE jobs SET status=?1, finished_at_ms=?2, error=?3 WHERE id=?4 AND status=?5",
                    params![to.as_str(), now, error, id, from.as_str()],
                )?,
            };
            Ok(updated == 1)
        })
    }
}

impl JobStore for SqliteStore {
    fn enqueue(&self, job: NewJob) -> Result<(JobRow, bool)> {
        db::with_busy_retry(|| {
            let conn = self.conn()?;
            let inserted = conn.execute(
                "INSERT INTO jobs (id, url, status, title, expanded_from, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(url) DO NOTHING",
                params![
                    Uuid::new_v4().to_string(),
                    &job.url,
                    JobStatus::Pending.as_str(),
                    &job.title,
                    &job.expanded_from,
                    now_ms()
                ],
            )?;
            let row = conn.query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE url=?1"),
                params![&job.url],
                job_from_row,
            )?;
            Ok((row, inserted == 1))
        })
    }

    fn get_job(&self, id: &str) -> Result<Option<JobRow>> {
        db::with_busy_retry(|| {
            let conn = self.conn()?;
            let row = conn
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id=?1"),
                    params![id],
                    job_from_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    fn poll_batch(&self, limit: usize) -> Result<Vec<JobRow>> {
        db::with_busy_retry(|| {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status=?1
                 ORDER BY created_at_ms ASC, rowid ASC LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(
                    params![JobStatus::Pending.as_str(), limit as i64],
                    job_from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn claim(&self, id: &str) -> Result<bool> {
        self.transition(id, JobStatus::Pending, JobStatus::Processing, None)
    }

    fn complete(&self, id: &str) -> Result<bool> {
        self.transition(id, JobStatus::Processing, JobStatus::Completed, None)
    }

    fn fail(&self, id: &str, error: &str) -> Result<bool> {
        self.transition(id, JobStatus::Processing, JobStatus::Failed, Some(error))
    }

    fn requeue_processing(&self) -> Result<usize> {
        db::with_busy_retry(|| {
            let conn = self.conn()?;
            let updated = conn.execute(
                "UPDATE jobs SET status=?1, started_at_ms=NULL WHERE status=?2",
                params![JobStatus::Pending.as_str(), JobStatus::Processing.as_str()],
            )?;
            Ok(updated)
        })
    }

    fn delete_pending(&self, id: &str) -> Result<()> {
        db::with_busy_retry(|| {
            let conn = self.conn()?;
            let deleted = conn.execute(
                "DELETE FROM jobs WHERE id=?1 AND status=?2",
                params![id, JobStatus::Pending.as_str()],
            )?;
            if deleted == 1 {
                return Ok(());
            }
            let status: Option<String> = conn
                .query_row("SELECT status FROM jobs WHERE id=?1", params![id], |row| {
                    row.get(0)
                })
                .optional()?;
            match status {
                Some(status) => Err(EngineError::JobNotPending {
                    id: id.to_string(),
                    status,
                }),
                None => Err(EngineError::JobNotFound(id.to_string())),
            }
        })
    }

    fn list_jobs(&self, limit: usize, offset: usize) -> Result<Vec<JobRow>> {
        db::with_busy_retry(|| {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 ORDER BY created_at_ms DESC, rowid DESC LIMIT ?1 OFFSET ?2"
            ))?;
            let rows = stmt
                .query_map(params![limit as i64, offset as i64], job_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn list_active_jobs(&self) -> Result<Vec<JobRow>> {
        db::with_busy_retry(|| {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN (?1, ?2)
                 ORDER BY CASE status WHEN ?1 THEN 0 ELSE 1 END, created_at_ms ASC, rowid ASC"
            ))?;
            let rows = stmt
                .query_map(
                    params![
                        JobStatus::Processing.as_str(),
                        JobStatus::Pending.as_str()
                    ],
                    job_from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn insert_photo(&self, photo: NewPhoto) -> Result<PhotoRow> {
        db::with_busy_retry(|| {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO photos (id, job_id, url, file_path, thumbnail_path, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(file_path) DO NOTHING",
                params![
                    Uuid::new_v4().to_string(),
                    &photo.job_id,
                    &photo.url,
                    &photo.file_path,
                    &photo.thumbnail_path,
                    now_ms()
                ],
            )?;
            let row = conn.query_row(
                &format!("SELECT {PHOTO_COLUMNS} FROM photos p WHERE p.file_path=?1"),
                params![&photo.file_path],
                photo_from_row,
            )?;
            Ok(row)
        })
    }

    fn photos_for_job(&self, job_id: &str) -> Result<Vec<PhotoRow>> {
        db::with_busy_retry(|| {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {PHOTO_COLUMNS} FROM photos p WHERE p.job_id=?1
                 ORDER BY p.created_at_ms ASC, p.rowid ASC"
            ))?;
            let rows = stmt
                .query_map(params![job_id], photo_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn repair_candidates(&self) -> Result<Vec<PhotoRow>> {
        db::with_busy_retry(|| {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                r#"
SELECT {PHOTO_COLUMNS}
FROM photos p
LEFT JOIN favorites f ON f.photo_id = p.id
ORDER BY
  CASE WHEN f.photo_id IS NULL THEN 1 ELSE 0 END,
  f.created_at_ms DESC,
  f.rowid DESC,
  p.created_at_ms DESC,
  p.rowid DESC
"#
            ))?;
            let rows = stmt
                .query_map([], photo_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn mark_favorite(&self, photo_id: &str) -> Result<()> {
        db::with_busy_retry(|| {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO favorites (photo_id, created_at_ms) VALUES (?1, ?2)
                 ON CONFLICT(photo_id) DO UPDATE SET created_at_ms=excluded.created_at_ms",
                params![photo_id, now_ms()],
            )?;
            Ok(())
        })
    }
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRow> {
    let status: String = row.get(2)?;
    let status = JobStatus::from_str(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown job status: {status}").into(),
        )
    })?;
    Ok(JobRow {
        id: row.get(0)?,
        url: row.get(1)?,
        status,
        title: row.get(3)?,
        expanded_from: row.get(4)?,
        error: row.get(5)?,
        created_at_ms: row.get(6)?,
        started_at_ms: row.get(7)?,
        finished_at_ms: row.get(8)?,
    })
}

fn photo_from_row(row: &Row<'_>) -> rusqlite::Result<PhotoRow> {
    Ok(PhotoRow {
        id: row.get(0)?,
        job_id: row.get(1)?,
        url: row.get(2)?,
        file_path: row.get(3)?,
        thumbnail_path: row.get(4)?,
        created_at_ms: row.get(5)?,
    })
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
