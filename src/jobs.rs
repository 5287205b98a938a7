use crate::config::EngineConfig;
use crate::enumerate;
use crate::fetch::{strip_fragment, HtmlSource};
use crate::gallery::GalleryPipeline;
use crate::store::{JobRow, JobStatus, JobStore, NewJob};
use crate::{EngineError, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Queues a thread or post URL. A `[range]` URL is expanded into one job per
/// post. Returns job ids in post order; known URLs map to their existing job.
pub fn submit(
    store: &dyn JobStore,
    pages: &dyn HtmlSource,
    url: &str,
    title: Option<&str>,
    page_delay: Duration,
) -> Result<Vec<String>> {
    let url = url.trim();
    strip_fragment(&enumerate::strip_range_marker(url))?;
    let title = title
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    if !enumerate::is_range(url) {
        let (row, created) = store.enqueue(NewJob {
            url: url.to_string(),
            title,
            expanded_from: None,
        })?;
        if created {
            log::info!("queued job {} for {url}", row.id);
        }
        return Ok(vec![row.id]);
    }

    let posts = enumerate::enumerate_posts(pages, url, page_delay)?;
    if posts.is_empty() {
        log::warn!("no posts found for {url}");
    }
    let mut ids = Vec::with_capacity(posts.len());
    let mut created_count = 0_usize;
    for post in posts {
        let (row, created) = store.enqueue(NewJob {
            url: post.url(),
            title: title.clone(),
            expanded_from: Some(url.to_string()),
        })?;
        if created {
            created_count += 1;
        }
        ids.push(row.id);
    }
    log::info!(
        "expanded {url} into {} jobs ({created_count} new)",
        ids.len()
    );
    Ok(ids)
}

pub fn status(store: &dyn JobStore, job_id: &str) -> Result<JobStatus> {
    store
        .get_job(job_id)?
        .map(|job| job.status)
        .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))
}

/// Administrative removal; only pending jobs may be deleted.
pub fn delete_pending_job(store: &dyn JobStore, job_id: &str) -> Result<()> {
    store.delete_pending(job_id)?;
    log::info!("deleted pending job {job_id}");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub workers: usize,
    pub poll_batch: usize,
    /// Sleep after an empty poll.
    pub idle_poll: Duration,
    /// Pause after a non-empty batch has been handed out.
    pub busy_poll: Duration,
}

impl From<&EngineConfig> for SchedulerSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            poll_batch: config.poll_batch.max(1),
            idle_poll: Duration::from_millis(config.idle_poll_ms),
            busy_poll: Duration::from_millis(config.busy_poll_ms),
        }
    }
}

#[derive(Debug)]
pub struct JobRunnerHandle {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl JobRunnerHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Blocks until every thread has exited. Call `stop` first unless the
    /// caller intends to run forever.
    pub fn wait(self) {
        for handle in self.threads {
            if handle.join().is_err() {
                log::error!("runner thread panicked");
            }
        }
    }
}

/// Worker pool over a `JobStore`: one dispatcher polls and claims pending
/// rows and feeds them through a bounded channel to a fixed set of workers.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    pipeline: Arc<GalleryPipeline>,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        pipeline: Arc<GalleryPipeline>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            pipeline,
            settings,
        }
    }

    /// Rows left in `processing` belong to a dead process.
    pub fn recover(&self) -> Result<usize> {
        let requeued = self.store.requeue_processing()?;
        if requeued > 0 {
            log::warn!("requeued {requeued} interrupted jobs");
        }
        Ok(requeued)
    }

    /// Runs an already claimed job to a terminal state.
    pub fn run_job(&self, job: &JobRow) -> Result<JobStatus> {
        let log = self.pipeline.job_log();
        log.line(
            &job.id,
            "info",
            "job_started",
            serde_json::json!({ "url": job.url }),
        );

        match self.pipeline.process(job) {
            Ok(summary) => {
                self.store.complete(&job.id)?;
                log.line(
                    &job.id,
                    "info",
                    "job_completed",
                    serde_json::json!({
                        "posts": summary.posts,
                        "images_found": summary.images_found,
                        "stored": summary.stored,
                        "already_present": summary.already_present,
                        "unsupported": summary.unsupported,
                        "failed": summary.failed,
                    }),
                );
                Ok(JobStatus::Completed)
            }
            Err(err) => {
                let message = err.to_string();
                self.store.fail(&job.id, &message)?;
                log.line(
                    &job.id,
                    "error",
                    "job_failed",
                    serde_json::json!({ "error": message }),
                );
                Ok(JobStatus::Failed)
            }
        }
    }

    /// Polls one batch and runs every row it manages to claim on the calling
    /// thread. Returns how many jobs ran.
    pub fn run_pending_once(&self) -> Result<usize> {
        let mut ran = 0;
        for job in self.store.poll_batch(self.settings.poll_batch)? {
            if !self.store.claim(&job.id)? {
                continue;
            }
            self.run_job(&job)?;
            ran += 1;
        }
        Ok(ran)
    }

    pub fn start(self) -> Result<JobRunnerHandle> {
        self.recover()?;

        let stop = Arc::new(AtomicBool::new(false));
        let workers = self.settings.workers.max(1);
        let (tx, rx) = bounded::<JobRow>(workers);

        let mut threads = Vec::with_capacity(workers + 1);
        for idx in 0..workers {
            let scheduler = self.clone();
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("galleryrip-worker-{idx}"))
                .spawn(move || scheduler.worker_loop(rx))?;
            threads.push(handle);
        }
        drop(rx);

        let stop_dispatch = stop.clone();
        let handle = thread::Builder::new()
            .name("galleryrip-dispatch".to_string())
            .spawn(move || self.dispatch_loop(tx, stop_dispatch))?;
        threads.push(handle);

        log::info!("scheduler started with {workers} workers");
        Ok(JobRunnerHandle { stop, threads })
    }

    fn dispatch_loop(&self, tx: Sender<JobRow>, stop: Arc<AtomicBool>) {
        while !stop.load(Ordering::SeqCst) {
            let batch = match self.store.poll_batch(self.settings.poll_batch) {
                Ok(v) => v,
                Err(err) => {
                    log::warn!("poll failed: {err}");
                    sleep_unless_stopped(self.settings.idle_poll, &stop);
                    continue;
                }
            };

            if batch.is_empty() {
                sleep_unless_stopped(self.settings.idle_poll, &stop);
                continue;
            }

            for job in batch {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                match self.store.claim(&job.id) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(err) => {
                        log::warn!("claim failed for {}: {err}", job.id);
                        continue;
                    }
                }
                // Blocks while every worker is busy.
                if tx.send(job).is_err() {
                    return;
                }
            }
            sleep_unless_stopped(self.settings.busy_poll, &stop);
        }
        log::info!("dispatcher stopped");
    }

    fn worker_loop(&self, rx: Receiver<JobRow>) {
        while let Ok(job) = rx.recv() {
            if let Err(err) = self.run_job(&job) {
                log::error!("job {} could not be finalized: {err}", job.id);
            }
        }
    }
}

pub(crate) fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let mut remaining = total;
    while !remaining.is_zero() && !stop.load(Ordering::SeqCst) {
        let step = remaining.min(STOP_CHECK_INTERVAL);
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::{Downloader, FileDownloader};
    use crate::joblog::JobLog;
    use crate::memory_store::MemoryStore;
    use crate::resolver::HostRegistry;
    use std::collections::HashMap;
    use std::path::Path;
    use std::time::Instant;

    struct Pages(HashMap<String, String>);

    impl HtmlSource for Pages {
        fn fetch_html_with_cookie(&self, url: &str, _cookie: Option<&str>) -> Result<String> {
            self.0.get(url).cloned().ok_or_else(|| EngineError::HttpStatus {
                url: url.to_string(),
                status: 404,
                body_excerpt: String::new(),
            })
        }
    }

    struct WriteUrl;

    impl FileDownloader for WriteUrl {
        fn download_to(&self, url: &str, dest: &Path) -> Result<()> {
            std::fs::write(dest, url)?;
            Ok(())
        }
    }

    const THREAD: &str = "https://forum.example/threads/9-set";

    fn thread_pages() -> Pages {
        let page1 = r#"
<div id="post_message_1"><a href="https://pixhost.to/show/1/a.jpg"><img src="https://t1.pixhost.to/thumbs/1/a.jpg"></a></div>
<div id="post_message_2"><a href="https://pixhost.to/show/1/b.jpg"><img src="https://t1.pixhost.to/thumbs/1/b.jpg"></a></div>
"#;
        let mut map = HashMap::new();
        map.insert(THREAD.to_string(), page1.to_string());
        map.insert(format!("{THREAD}/page2"), page1.to_string());
        Pages(map)
    }

    fn scheduler(dir: &Path, store: Arc<MemoryStore>, workers: usize) -> Scheduler {
        let pages: Arc<dyn HtmlSource> = Arc::new(thread_pages());
        let downloader = Downloader::new(store.clone(), Arc::new(WriteUrl), 200);
        let pipeline = GalleryPipeline::new(
            pages,
            HostRegistry::builtin(),
            downloader,
            dir.join("downloads"),
            JobLog::new(dir.join("logs")),
        );
        Scheduler::new(
            store,
            Arc::new(pipeline),
            SchedulerSettings {
                workers,
                poll_batch: 10,
                idle_poll: Duration::from_millis(20),
                busy_poll: Duration::from_millis(5),
            },
        )
    }

    #[test]
    fn range_submission_expands_once_per_post() {
        let store = MemoryStore::new();
        let pages = thread_pages();
        let url = format!("{THREAD}[range]");

        let ids = submit(&store, &pages, &url, Some("Set"), Duration::ZERO).expect("submit");
        assert_eq!(ids.len(), 2);
        let job = store.get_job(&ids[1]).expect("get").expect("row");
        assert_eq!(job.url, format!("{THREAD}#post2"));
        assert_eq!(job.expanded_from.as_deref(), Some(url.as_str()));
        assert_eq!(job.title.as_deref(), Some("Set"));

        let again = submit(&store, &pages, &url, None, Duration::ZERO).expect("resubmit");
        assert_eq!(again, ids);
        assert_eq!(store.list_jobs(10, 0).expect("list").len(), 2);
    }

    #[test]
    fn submit_rejects_invalid_urls_and_status_reports_missing_jobs() {
        let store = MemoryStore::new();
        let pages = thread_pages();
        assert!(submit(&store, &pages, "nope", None, Duration::ZERO).is_err());
        let err = status(&store, "missing").expect_err("missing");
        assert!(matches!(err, EngineError::JobNotFound(_)), "err={err:?}");
    }

    #[test]
    fn failing_job_is_terminal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let (job, _) = store
            .enqueue(NewJob::new("https://forum.example/threads/404#post1"))
            .expect("enqueue");
        let scheduler = scheduler(dir.path(), store.clone(), 1);

        assert_eq!(scheduler.run_pending_once().expect("run"), 1);
        assert_eq!(status(store.as_ref(), &job.id).expect("status"), JobStatus::Failed);
        assert_eq!(scheduler.run_pending_once().expect("run again"), 0);

        let row = store.get_job(&job.id).expect("get").expect("row");
        assert!(row.error.as_deref().unwrap_or_default().contains("404"));
        let events = scheduler.pipeline.job_log().read(&job.id).expect("events");
        assert_eq!(events.last().expect("event")["event"], "job_failed");
    }

    #[test]
    fn worker_pool_drains_the_queue_and_stops() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let pages = thread_pages();
        let ids = submit(
            store.as_ref(),
            &pages,
            &format!("{THREAD}[range]"),
            None,
            Duration::ZERO,
        )
        .expect("submit");

        let handle = scheduler(dir.path(), store.clone(), 2).start().expect("start");
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            let done = ids
                .iter()
                .all(|id| status(store.as_ref(), id).map(|s| s.is_terminal()).unwrap_or(false));
            if done {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        handle.stop();
        handle.wait();

        for id in &ids {
            assert_eq!(status(store.as_ref(), id).expect("status"), JobStatus::Completed);
            assert_eq!(store.photos_for_job(id).expect("photos").len(), 1);
        }
        let gallery = dir.path().join("downloads").join("9-set");
        assert!(gallery.join("1").join("a.jpg").exists());
        assert!(gallery.join("2").join("b.jpg").exists());
    }

    #[test]
    fn start_recovers_interrupted_jobs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let (job, _) = store
            .enqueue(NewJob::new(format!("{THREAD}#post1")))
            .expect("enqueue");
        store.set_status(&job.id, JobStatus::Processing).expect("force");

        let scheduler = scheduler(dir.path(), store.clone(), 1);
        assert_eq!(scheduler.recover().expect("recover"), 1);
        assert_eq!(status(store.as_ref(), &job.id).expect("status"), JobStatus::Pending);
    }
}
