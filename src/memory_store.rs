use crate::store::{now_ms, JobRow, JobStatus, JobStore, NewJob, NewPhoto, PhotoRow};
use crate::{EngineError, Result};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// In-process `JobStore`. Insertion order breaks timestamp ties, matching the
/// rowid ordering of the SQLite store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: Vec<JobRow>,
    photos: Vec<PhotoRow>,
    favorites: Vec<(String, i64)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Forces a row into `status`, bypassing the transition rules. Useful for
    /// staging crash scenarios.
    pub fn set_status(&self, id: &str, status: JobStatus) -> Result<()> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))?;
        job.status = status;
        Ok(())
    }

    fn transition(&self, id: &str, from: JobStatus, to: JobStatus, error: Option<&str>) -> bool {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.iter_mut().find(|j| j.id == id && j.status == from) else {
            return false;
        };
        job.status = to;
        if to == JobStatus::Processing {
            job.started_at_ms = Some(now_ms());
            job.error = None;
        } else {
            job.finished_at_ms = Some(now_ms());
            job.error = error.map(str::to_string);
        }
        true
    }
}

impl JobStore for MemoryStore {
    fn enqueue(&self, job: NewJob) -> Result<(JobRow, bool)> {
        let mut inner = self.lock();
        if let Some(existing) = inner.jobs.iter().find(|j| j.url == job.url) {
            return Ok((existing.clone(), false));
        }
        let row = JobRow {
            id: Uuid::new_v4().to_string(),
            url: job.url,
            status: JobStatus::Pending,
            title: job.title,
            expanded_from: job.expanded_from,
            error: None,
            created_at_ms: now_ms(),
            started_at_ms: None,
            finished_at_ms: None,
        };
        inner.jobs.push(row.clone());
        Ok((row, true))
    }

    fn get_job(&self, id: &str) -> Result<Option<JobRow>> {
        Ok(self.lock().jobs.iter().find(|j| j.id == id).cloned())
    }

    fn poll_batch(&self, limit: usize) -> Result<Vec<JobRow>> {
        let inner = self.lock();
        let mut pending: Vec<&JobRow> = inner
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .collect();
        pending.sort_by_key(|j| j.created_at_ms);
        Ok(pending.into_iter().take(limit).cloned().collect())
    }

    fn claim(&self, id: &str) -> Result<bool> {
        Ok(self.transition(id, JobStatus::Pending, JobStatus::Processing, None))
    }

    fn complete(&self, id: &str) -> Result<bool> {
        Ok(self.transition(id, JobStatus::Processing, JobStatus::Completed, None))
    }

    fn fail(&self, id: &str, error: &str) -> Result<bool> {
        Ok(self.transition(id, JobStatus::Processing, JobStatus::Failed, Some(error)))
    }

    fn requeue_processing(&self) -> Result<usize> {
        let mut inner = self.lock();
        let mut count = 0;
        for job in inner
            .jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Processing)
        {
            job.status = JobStatus::Pending;
            job.started_at_ms = None;
            count += 1;
        }
        Ok(count)
    }

    fn delete_pending(&self, id: &str) -> Result<()> {
        let mut inner = self.lock();
        let idx = inner
            .jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))?;
        let status = inner.jobs[idx].status;
        if status != JobStatus::Pending {
            return Err(EngineError::JobNotPending {
                id: id.to_string(),
                status: status.to_string(),
            });
        }
        inner.jobs.remove(idx);

        let Inner {
            photos, favorites, ..
        } = &mut *inner;
        let removed: Vec<String> = photos
            .iter()
            .filter(|p| p.job_id == id)
            .map(|p| p.id.clone())
            .collect();
        photos.retain(|p| p.job_id != id);
        favorites.retain(|(photo_id, _)| !removed.contains(photo_id));
        Ok(())
    }

    fn list_jobs(&self, limit: usize, offset: usize) -> Result<Vec<JobRow>> {
        let inner = self.lock();
        let mut rows: Vec<&JobRow> = inner.jobs.iter().rev().collect();
        rows.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        Ok(rows.into_iter().skip(offset).take(limit).cloned().collect())
    }

    fn list_active_jobs(&self) -> Result<Vec<JobRow>> {
        let inner = self.lock();
        let mut rows: Vec<&JobRow> = inner
            .jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Processing | JobStatus::Pending))
            .collect();
        rows.sort_by_key(|j| (j.status != JobStatus::Processing, j.created_at_ms));
        Ok(rows.into_iter().cloned().collect())
    }

    fn insert_photo(&self, photo: NewPhoto) -> Result<PhotoRow> {
        let mut inner = self.lock();
        if let Some(existing) = inner.photos.iter().find(|p| p.file_path == photo.file_path) {
            return Ok(existing.clone());
        }
        if !inner.jobs.iter().any(|j| j.id == photo.job_id) {
            return Err(EngineError::JobNotFound(photo.job_id));
        }
        let row = PhotoRow {
            id: Uuid::new_v4().to_string(),
            job_id: photo.job_id,
            url: photo.url,
            file_path: photo.file_path,
            thumbnail_path: photo.thumbnail_path,
            created_at_ms: now_ms(),
        };
        inner.photos.push(row.clone());
        Ok(row)
    }

    fn photos_for_job(&self, job_id: &str) -> Result<Vec<PhotoRow>> {
        Ok(self
            .lock()
            .photos
            .iter()
            .filter(|p| p.job_id == job_id)
            .cloned()
            .collect())
    }

    fn repair_candidates(&self) -> Result<Vec<PhotoRow>> {
        let inner = self.lock();
        let mut favorites: Vec<(usize, &(String, i64))> = inner.favorites.iter().enumerate().collect();
        favorites.sort_by(|(ia, a), (ib, b)| b.1.cmp(&a.1).then(ib.cmp(ia)));

        let mut out: Vec<PhotoRow> = favorites
            .iter()
            .filter_map(|(_, (photo_id, _))| inner.photos.iter().find(|p| &p.id == photo_id))
            .cloned()
            .collect();

        let mut rest: Vec<(usize, &PhotoRow)> = inner
            .photos
            .iter()
            .enumerate()
            .filter(|(_, p)| !inner.favorites.iter().any(|(id, _)| id == &p.id))
            .collect();
        rest.sort_by(|(ia, a), (ib, b)| b.created_at_ms.cmp(&a.created_at_ms).then(ib.cmp(ia)));
        out.extend(rest.into_iter().map(|(_, p)| p.clone()));
        Ok(out)
    }

    fn mark_favorite(&self, photo_id: &str) -> Result<()> {
        let mut inner = self.lock();
        let now = now_ms();
        match inner.favorites.iter().position(|(id, _)| id == photo_id) {
            Some(idx) => inner.favorites[idx].1 = now,
            None => inner.favorites.push((photo_id.to_string(), now)),
        }
        Ok(())
    }
}
