use crate::config::FetchSettings;
use crate::{EngineError, Result};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use url::Url;

const MAX_PAGE_BYTES: u64 = 8 * 1024 * 1024;
const BODY_EXCERPT_CHARS: usize = 512;

/// Anything that can hand back the HTML of a page.
pub trait HtmlSource: Send + Sync {
    fn fetch_html_with_cookie(&self, url: &str, cookie: Option<&str>) -> Result<String>;

    fn fetch_html(&self, url: &str) -> Result<String> {
        self.fetch_html_with_cookie(url, None)
    }
}

impl<S: HtmlSource + ?Sized> HtmlSource for Arc<S> {
    fn fetch_html_with_cookie(&self, url: &str, cookie: Option<&str>) -> Result<String> {
        (**self).fetch_html_with_cookie(url, cookie)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    pub status: u16,
    pub body: String,
}

/// One HTTP exchange, without retry or challenge handling.
pub trait PageTransport: Send + Sync {
    fn get(&self, url: &str, cookie: Option<&str>) -> Result<RawPage>;
    /// Drops session cookies and re-acquires them from the site root.
    fn refresh_session(&self) -> Result<()>;
}

pub struct UreqTransport {
    agent: ureq::Agent,
    site_root: String,
}

impl UreqTransport {
    pub fn new(settings: &FetchSettings) -> Self {
        Self {
            agent: build_http_agent(settings),
            site_root: settings.site_root.clone(),
        }
    }
}

pub(crate) fn build_http_agent(settings: &FetchSettings) -> ureq::Agent {
    let mut config = ureq::Agent::config_builder();
    config = config
        .http_status_as_error(false)
        .timeout_global(Some(Duration::from_secs(settings.timeout_secs.max(1))))
        .user_agent(settings.user_agent.as_str());
    config.build().into()
}

impl PageTransport for UreqTransport {
    fn get(&self, url: &str, cookie: Option<&str>) -> Result<RawPage> {
        let mut request = self
            .agent
            .get(url)
            .header(
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            )
            .header("Accept-Language", "en-US,en;q=0.9")
            .header("Upgrade-Insecure-Requests", "1");
        if !self.site_root.trim().is_empty() {
            request = request.header("Referer", self.site_root.as_str());
        }
        if let Some(cookie) = cookie {
            let trimmed = cookie.trim();
            if !trimmed.is_empty() {
                request = request.header("Cookie", trimmed);
            }
        }

        let mut response = request.call().map_err(|err| EngineError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        let status = response.status().as_u16();

        let mut buf = Vec::new();
        response
            .body_mut()
            .as_reader()
            .take(MAX_PAGE_BYTES)
            .read_to_end(&mut buf)
            .map_err(|err| EngineError::Transport {
                url: url.to_string(),
                message: format!("failed reading response body: {err}"),
            })?;

        Ok(RawPage {
            status,
            body: String::from_utf8_lossy(&buf).into_owned(),
        })
    }

    fn refresh_session(&self) -> Result<()> {
        self.agent.cookie_jar_lock().clear();
        if self.site_root.trim().is_empty() {
            return Ok(());
        }
        let page = self.get(&self.site_root, None)?;
        log::debug!(
            "session refreshed from {} (http {})",
            self.site_root,
            page.status
        );
        Ok(())
    }
}

/// Page fetcher with bounded retry on transport failures and a single
/// session refresh when an anti-bot interstitial is served.
pub struct PageFetcher<T> {
    transport: T,
    settings: FetchSettings,
    diagnostics_path: Option<PathBuf>,
}

impl<T: PageTransport> PageFetcher<T> {
    pub fn new(transport: T, settings: FetchSettings) -> Self {
        Self {
            transport,
            settings,
            diagnostics_path: None,
        }
    }

    /// Non-200 bodies are written here, replacing the previous one.
    pub fn with_diagnostics_path(mut self, path: PathBuf) -> Self {
        self.diagnostics_path = Some(path);
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn get_with_retry(&self, url: &str, cookie: Option<&str>) -> Result<RawPage> {
        let attempts = self.settings.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.transport.get(url, cookie) {
                Ok(page) => return Ok(page),
                Err(err) if err.is_transient() && attempt < attempts => {
                    log::warn!("fetch attempt {attempt}/{attempts} failed: {err}");
                    thread::sleep(Duration::from_millis(self.settings.retry_delay_ms));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn is_challenge(&self, body: &str) -> bool {
        self.settings
            .challenge_markers
            .iter()
            .any(|marker| !marker.is_empty() && body.contains(marker.as_str()))
    }

    fn accept(&self, url: &str, page: RawPage) -> Result<String> {
        if page.status == 200 {
            return Ok(page.body);
        }
        if let Some(path) = &self.diagnostics_path {
            if let Err(err) = std::fs::write(path, &page.body) {
                log::debug!("could not write {}: {err}", path.display());
            }
        }
        Err(EngineError::HttpStatus {
            url: url.to_string(),
            status: page.status,
            body_excerpt: page.body.chars().take(BODY_EXCERPT_CHARS).collect(),
        })
    }
}

impl<T: PageTransport> HtmlSource for PageFetcher<T> {
    fn fetch_html_with_cookie(&self, url: &str, cookie: Option<&str>) -> Result<String> {
        let url = strip_fragment(url)?;

        let page = self.get_with_retry(&url, cookie)?;
        if !self.is_challenge(&page.body) {
            return self.accept(&url, page);
        }

        log::warn!("anti-bot challenge on {url}; refreshing session");
        self.transport.refresh_session()?;

        let page = self.get_with_retry(&url, cookie)?;
        if self.is_challenge(&page.body) {
            return Err(EngineError::AntiBotChallenge { url });
        }
        self.accept(&url, page)
    }
}

pub fn strip_fragment(raw: &str) -> Result<String> {
    let mut parsed = Url::parse(raw.trim()).map_err(|err| EngineError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(EngineError::InvalidUrl {
                url: raw.to_string(),
                reason: format!("unsupported scheme {other}"),
            })
        }
    }
    parsed.set_fragment(None);
    Ok(parsed.to_string())
}
