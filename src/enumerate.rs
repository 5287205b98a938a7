use crate::extract;
use crate::fetch::HtmlSource;
use crate::{EngineError, Result};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;
use url::Url;

pub const RANGE_MARKER: &str = "[range]";
const POST_FRAGMENT_PREFIX: &str = "post";

/// A single post inside a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRef {
    /// Thread URL without pagination.
    pub thread_url: String,
    /// Page the post was first seen on.
    pub page_url: String,
    pub post_id: String,
}

impl PostRef {
    pub fn url(&self) -> String {
        format!("{}#{POST_FRAGMENT_PREFIX}{}", self.page_url, self.post_id)
    }
}

pub fn is_range(url: &str) -> bool {
    url.contains(RANGE_MARKER)
}

pub fn strip_range_marker(url: &str) -> String {
    url.replace(RANGE_MARKER, "").trim().to_string()
}

/// `...#post123` -> `123`.
pub fn post_id_from_url(url: &str) -> Option<String> {
    let (_, fragment) = url.split_once('#')?;
    let id = fragment.strip_prefix(POST_FRAGMENT_PREFIX)?;
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
        Some(id.to_string())
    } else {
        None
    }
}

fn page_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/page\d+/?$").unwrap())
}

/// Thread URL with range marker, fragment and pagination removed.
pub fn thread_base(url: &str) -> Result<String> {
    let cleaned = strip_range_marker(url);
    let mut parsed = Url::parse(&cleaned).map_err(|err| EngineError::InvalidUrl {
        url: url.to_string(),
        reason: err.to_string(),
    })?;
    parsed.set_fragment(None);

    let path = page_suffix_re().replace(parsed.path(), "").to_string();
    parsed.set_path(&path);

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| k != "page")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(kept);
    }
    Ok(parsed.to_string())
}

/// Page 1 is the base itself.
pub fn page_url(base: &str, page: u32) -> String {
    if page <= 1 {
        return base.to_string();
    }
    if base.contains('?') {
        format!("{base}&page={page}")
    } else {
        format!("{}/page{page}", base.trim_end_matches('/'))
    }
}

/// Walks a thread page by page, collecting each post id once (first page
/// wins), until a page contributes nothing new. A URL naming a post is
/// returned as-is. Failure on the first page is an error; later failures end
/// the walk with what was found so far.
pub fn enumerate_posts(
    pages: &dyn HtmlSource,
    url: &str,
    page_delay: Duration,
) -> Result<Vec<PostRef>> {
    let cleaned = strip_range_marker(url);
    let base = thread_base(&cleaned)?;

    if let Some(post_id) = post_id_from_url(&cleaned) {
        let page = cleaned
            .split_once('#')
            .map(|(page, _)| page.to_string())
            .unwrap_or_else(|| cleaned.clone());
        return Ok(vec![PostRef {
            thread_url: base,
            page_url: page,
            post_id,
        }]);
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    let mut page = 1_u32;
    loop {
        let current = page_url(&base, page);
        let html = match pages.fetch_html(&current) {
            Ok(html) => html,
            Err(err) if page == 1 => return Err(err),
            Err(err) => {
                log::warn!("stopping enumeration of {base} at page {page}: {err}");
                break;
            }
        };

        let mut added = 0_usize;
        for post_id in extract::post_ids(&html)? {
            if seen.insert(post_id.clone()) {
                out.push(PostRef {
                    thread_url: base.clone(),
                    page_url: current.clone(),
                    post_id,
                });
                added += 1;
            }
        }
        log::debug!("page {page} of {base}: {added} new posts");
        if added == 0 {
            break;
        }

        page += 1;
        if !page_delay.is_zero() {
            thread::sleep(page_delay);
        }
    }

    log::info!("enumerated {} posts in {base}", out.len());
    Ok(out)
}
