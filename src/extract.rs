use crate::{EngineError, Result};
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;

pub const POST_ID_PREFIX: &str = "post_message_";
const VIEW_POST_ALT: &str = "View Post";

/// An anchored image inside a post: `href` usually points at the hosting
/// page, `img_src` at a thumbnail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLink {
    pub href: String,
    pub img_src: String,
}

fn selector(raw: &str) -> Result<Selector> {
    Selector::parse(raw).map_err(|err| EngineError::Selector {
        selector: raw.to_string(),
        message: err.to_string(),
    })
}

fn post_selector() -> Result<Selector> {
    selector(&format!("[id^='{POST_ID_PREFIX}']"))
}

/// Post ids in document order, each once.
pub fn post_ids(html: &str) -> Result<Vec<String>> {
    let document = Html::parse_document(html);
    let posts = post_selector()?;
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for el in document.select(&posts) {
        let Some(id) = el
            .value()
            .id()
            .and_then(|id| id.strip_prefix(POST_ID_PREFIX))
        else {
            continue;
        };
        if !id.is_empty() && seen.insert(id.to_string()) {
            out.push(id.to_string());
        }
    }
    Ok(out)
}

/// Anchored images of one post. With `post_id` the element whose id is
/// exactly `post_message_<id>` is used; without, the first post on the page.
/// Only the first matching element is read. A missing post yields no images.
pub fn extract_images(html: &str, post_id: Option<&str>) -> Result<Vec<ImageLink>> {
    let document = Html::parse_document(html);
    let posts = post_selector()?;
    let anchored_images = selector("a img")?;

    let wanted = post_id.map(|id| format!("{POST_ID_PREFIX}{id}"));
    let post = document.select(&posts).find(|el| match &wanted {
        Some(wanted) => el.value().id() == Some(wanted.as_str()),
        None => true,
    });
    let Some(post) = post else {
        log::debug!("post {} not present on page", post_id.unwrap_or("<first>"));
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    for img in post.select(&anchored_images) {
        if img.value().attr("alt").map(str::trim) == Some(VIEW_POST_ALT) {
            continue;
        }
        let Some(href) = enclosing_href(img, post) else {
            continue;
        };
        out.push(ImageLink {
            href,
            img_src: img.value().attr("src").unwrap_or_default().trim().to_string(),
        });
    }
    Ok(out)
}

fn enclosing_href(img: ElementRef<'_>, post: ElementRef<'_>) -> Option<String> {
    for node in img.ancestors() {
        if node.id() == post.id() {
            return None;
        }
        let Some(el) = ElementRef::wrap(node) else {
            continue;
        };
        if el.value().name() == "a" {
            return el
                .value()
                .attr("href")
                .map(str::trim)
                .filter(|href| !href.is_empty())
                .map(str::to_string);
        }
    }
    None
}
