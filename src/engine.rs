use crate::config::{self, EngineConfig};
use crate::downloader::{Downloader, FileDownloader, HttpFileDownloader};
use crate::fetch::{HtmlSource, PageFetcher, UreqTransport};
use crate::gallery::GalleryPipeline;
use crate::joblog::JobLog;
use crate::jobs::{self, JobRunnerHandle, Scheduler, SchedulerSettings};
use crate::paths::AppPaths;
use crate::repair::{self, RepairScannerHandle, RepairSummary};
use crate::resolver::HostRegistry;
use crate::store::{JobRow, JobStatus, JobStore, SqliteStore};
use crate::{EngineError, Result};
use std::sync::Arc;
use std::time::Duration;

/// Everything wired together for one base directory.
pub struct Engine {
    paths: AppPaths,
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    pages: Arc<dyn HtmlSource>,
    pipeline: Arc<GalleryPipeline>,
    repair_downloader: Arc<Downloader>,
}

impl Engine {
    /// Loads `config/engine.json` (or defaults) and opens the SQLite store.
    pub fn open(paths: AppPaths) -> Result<Self> {
        paths.ensure_dirs()?;
        let config = config::load_engine_config(&paths)?;
        Self::with_config(paths, config)
    }

    pub fn with_config(paths: AppPaths, config: EngineConfig) -> Result<Self> {
        paths.ensure_dirs()?;
        let store: Arc<dyn JobStore> = Arc::new(SqliteStore::open(paths.clone())?);
        let fetcher = PageFetcher::new(UreqTransport::new(&config.fetch), config.fetch.clone())
            .with_diagnostics_path(paths.last_response_path());
        let pages: Arc<dyn HtmlSource> = Arc::new(fetcher);
        let files: Arc<dyn FileDownloader> = Arc::new(HttpFileDownloader::new(&config.fetch));
        Ok(Self::from_parts(paths, config, store, pages, files))
    }

    /// Assembles an engine around caller-provided collaborators.
    pub fn from_parts(
        paths: AppPaths,
        config: EngineConfig,
        store: Arc<dyn JobStore>,
        pages: Arc<dyn HtmlSource>,
        files: Arc<dyn FileDownloader>,
    ) -> Self {
        let registry = HostRegistry::from_rules(&config.hosts);
        let download_root = paths.effective_download_dir(config.download_dir.as_deref());
        let pipeline = GalleryPipeline::new(
            pages.clone(),
            registry,
            Downloader::new(store.clone(), files.clone(), config.thumbnail_width),
            download_root,
            JobLog::new(paths.job_logs_dir()),
        )
        .with_page_delay(Duration::from_millis(config.fetch.page_delay_ms));
        let repair_downloader = Arc::new(Downloader::new(
            store.clone(),
            files,
            config.thumbnail_width,
        ));

        Self {
            paths,
            config,
            store,
            pages,
            pipeline: Arc::new(pipeline),
            repair_downloader,
        }
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn job_log(&self) -> &JobLog {
        self.pipeline.job_log()
    }

    pub fn submit(&self, url: &str, title: Option<&str>) -> Result<Vec<String>> {
        jobs::submit(
            self.store.as_ref(),
            self.pages.as_ref(),
            url,
            title,
            self.pipeline.page_delay(),
        )
    }

    pub fn status(&self, job_id: &str) -> Result<JobStatus> {
        jobs::status(self.store.as_ref(), job_id)
    }

    pub fn job(&self, job_id: &str) -> Result<JobRow> {
        self.store
            .get_job(job_id)?
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))
    }

    pub fn list_jobs(&self, limit: usize, offset: usize) -> Result<Vec<JobRow>> {
        self.store.list_jobs(limit, offset)
    }

    pub fn list_active_jobs(&self) -> Result<Vec<JobRow>> {
        self.store.list_active_jobs()
    }

    pub fn delete_pending_job(&self, job_id: &str) -> Result<()> {
        jobs::delete_pending_job(self.store.as_ref(), job_id)
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.store.clone(),
            self.pipeline.clone(),
            SchedulerSettings::from(&self.config),
        )
    }

    /// Recovers interrupted jobs and starts the worker pool.
    pub fn start_workers(&self) -> Result<JobRunnerHandle> {
        self.scheduler().start()
    }

    pub fn repair_once(&self) -> Result<RepairSummary> {
        repair::run_repair_sweep(
            self.store.as_ref(),
            &self.repair_downloader,
            self.config.repair_concurrency,
        )
    }

    pub fn start_repair(&self) -> Result<RepairScannerHandle> {
        repair::start_repair_scanner(
            self.store.clone(),
            self.repair_downloader.clone(),
            self.config.repair_concurrency,
            Duration::from_secs(self.config.repair_interval_secs.max(1)),
        )
    }
}
