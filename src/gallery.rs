use crate::downloader::{DownloadOutcome, Downloader};
use crate::enumerate::{self, PostRef};
use crate::extract;
use crate::fetch::{strip_fragment, HtmlSource};
use crate::joblog::JobLog;
use crate::resolver::HostRegistry;
use crate::store::JobRow;
use crate::{EngineError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use url::Url;

fn invalid_chars_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[<>:"/\\|?*]"#).unwrap())
}

/// Replaces characters that are illegal in file names and trims `_` from
/// both ends.
pub fn sanitize_folder_name(name: &str) -> String {
    invalid_chars_re()
        .replace_all(name.trim(), "_")
        .trim_matches('_')
        .to_string()
}

/// Deterministic directory for a thread: last path segment of the thread URL,
/// `-<title>` when given, and a per-post subdirectory for expanded threads.
pub fn gallery_dir(
    root: &Path,
    thread_url: &str,
    title: Option<&str>,
    post_subdir: Option<&str>,
) -> Result<PathBuf> {
    let base = enumerate::thread_base(thread_url)?;
    let parsed = Url::parse(&base)?;
    let segment = parsed
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(str::to_string))
        .or_else(|| parsed.host_str().map(str::to_string))
        .unwrap_or_default();

    let mut name = sanitize_folder_name(&segment);
    if let Some(title) = title.map(sanitize_folder_name).filter(|t| !t.is_empty()) {
        name = format!("{name}-{title}");
    }
    if name.is_empty() {
        return Err(EngineError::InvalidUrl {
            url: thread_url.to_string(),
            reason: "no usable gallery name".to_string(),
        });
    }

    let mut dir = root.join(name);
    if let Some(post) = post_subdir.map(sanitize_folder_name).filter(|p| !p.is_empty()) {
        dir = dir.join(post);
    }
    Ok(dir)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostSummary {
    pub posts: usize,
    pub images_found: usize,
    pub stored: usize,
    pub already_present: usize,
    pub unsupported: usize,
    pub failed: usize,
}

impl PostSummary {
    fn absorb(&mut self, other: PostSummary) {
        self.posts += other.posts;
        self.images_found += other.images_found;
        self.stored += other.stored;
        self.already_present += other.already_present;
        self.unsupported += other.unsupported;
        self.failed += other.failed;
    }
}

/// Fetch, extract, resolve and download for one job.
pub struct GalleryPipeline {
    pages: Arc<dyn HtmlSource>,
    resolver: HostRegistry,
    downloader: Downloader,
    download_root: PathBuf,
    page_delay: Duration,
    job_log: JobLog,
}

impl GalleryPipeline {
    pub fn new(
        pages: Arc<dyn HtmlSource>,
        resolver: HostRegistry,
        downloader: Downloader,
        download_root: PathBuf,
        job_log: JobLog,
    ) -> Self {
        Self {
            pages,
            resolver,
            downloader,
            download_root,
            page_delay: Duration::ZERO,
            job_log,
        }
    }

    pub fn with_page_delay(mut self, page_delay: Duration) -> Self {
        self.page_delay = page_delay;
        self
    }

    pub fn pages(&self) -> &Arc<dyn HtmlSource> {
        &self.pages
    }

    pub fn page_delay(&self) -> Duration {
        self.page_delay
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    pub fn job_log(&self) -> &JobLog {
        &self.job_log
    }

    /// Per-image problems are counted, never returned. An error means a post
    /// page could not be processed.
    pub fn process(&self, job: &JobRow) -> Result<PostSummary> {
        if enumerate::is_range(&job.url) {
            return self.process_range(job);
        }

        let post = PostRef {
            thread_url: enumerate::thread_base(&job.url)?,
            page_url: strip_fragment(&job.url)?,
            post_id: enumerate::post_id_from_url(&job.url).unwrap_or_default(),
        };
        let subdir = job
            .expanded_from
            .as_ref()
            .filter(|_| !post.post_id.is_empty())
            .map(|_| post.post_id.as_str());
        let dir = gallery_dir(&self.download_root, &post.thread_url, job.title.as_deref(), subdir)?;
        self.process_post(job, &post, &dir)
    }

    fn process_range(&self, job: &JobRow) -> Result<PostSummary> {
        let posts = enumerate::enumerate_posts(self.pages.as_ref(), &job.url, self.page_delay)?;
        self.job_log.line(
            &job.id,
            "info",
            "range_expanded",
            serde_json::json!({ "posts": posts.len() }),
        );

        let mut summary = PostSummary::default();
        let mut first_error = None;
        for post in &posts {
            let dir = gallery_dir(
                &self.download_root,
                &post.thread_url,
                job.title.as_deref(),
                Some(&post.post_id),
            )?;
            match self.process_post(job, post, &dir) {
                Ok(part) => summary.absorb(part),
                Err(err) => {
                    self.job_log.line(
                        &job.id,
                        "error",
                        "post_failed",
                        serde_json::json!({ "post": post.url(), "error": err.to_string() }),
                    );
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }

    fn process_post(&self, job: &JobRow, post: &PostRef, dir: &Path) -> Result<PostSummary> {
        let html = self.pages.fetch_html(&post.page_url)?;
        let post_id = Some(post.post_id.as_str()).filter(|id| !id.is_empty());
        let links = extract::extract_images(&html, post_id)?;

        let mut summary = PostSummary {
            posts: 1,
            images_found: links.len(),
            ..PostSummary::default()
        };
        self.job_log.line(
            &job.id,
            "info",
            "post_fetched",
            serde_json::json!({
                "page": post.page_url,
                "post_id": post.post_id,
                "images": links.len(),
                "dir": dir.to_string_lossy(),
            }),
        );

        for link in &links {
            let image_url = match self.resolver.resolve(link, self.pages.as_ref()) {
                Ok(url) => url,
                Err(EngineError::UnsupportedHost { link }) => {
                    summary.unsupported += 1;
                    self.job_log.line(
                        &job.id,
                        "warn",
                        "image_unsupported_host",
                        serde_json::json!({ "link": link }),
                    );
                    continue;
                }
                Err(err) => {
                    summary.failed += 1;
                    self.job_log.line(
                        &job.id,
                        "warn",
                        "image_resolve_failed",
                        serde_json::json!({ "link": link.href, "error": err.to_string() }),
                    );
                    continue;
                }
            };

            match self.downloader.download_and_store(&job.id, &image_url, dir) {
                Ok(DownloadOutcome::Stored(photo)) => {
                    summary.stored += 1;
                    self.job_log.line(
                        &job.id,
                        "info",
                        "image_stored",
                        serde_json::json!({ "url": image_url, "file": photo.file_path }),
                    );
                }
                Ok(DownloadOutcome::AlreadyPresent(_)) => summary.already_present += 1,
                Err(err) => {
                    summary.failed += 1;
                    self.job_log.line(
                        &job.id,
                        "warn",
                        "image_download_failed",
                        serde_json::json!({ "url": image_url, "error": err.to_string() }),
                    );
                }
            }
        }
        Ok(summary)
    }
}
