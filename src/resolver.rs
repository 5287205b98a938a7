use crate::config::{default_host_rules, HostRule, StrategyConfig, UrlSource};
use crate::extract::ImageLink;
use crate::fetch::HtmlSource;
use crate::{EngineError, Result};
use scraper::{Html, Selector};
use std::sync::Arc;
use url::Url;

/// Turns one anchored image into a direct image URL.
pub trait ResolveStrategy: Send + Sync {
    fn resolve(&self, link: &ImageLink, pages: &dyn HtmlSource) -> Result<String>;
}

fn pick(link: &ImageLink, input: UrlSource) -> &str {
    match input {
        UrlSource::Link => &link.href,
        UrlSource::Thumbnail => &link.img_src,
    }
}

/// Pure substring rewrites; no network.
#[derive(Debug, Clone)]
pub struct RewriteStrategy {
    pub input: UrlSource,
    pub replacements: Vec<(String, String)>,
}

impl RewriteStrategy {
    pub fn apply(&self, raw: &str) -> String {
        self.replacements
            .iter()
            .filter(|(from, _)| !from.is_empty())
            .fold(raw.to_string(), |acc, (from, to)| acc.replace(from.as_str(), to))
    }
}

impl ResolveStrategy for RewriteStrategy {
    fn resolve(&self, link: &ImageLink, _pages: &dyn HtmlSource) -> Result<String> {
        let raw = pick(link, self.input);
        if raw.is_empty() {
            return Err(EngineError::ImageNotFound {
                url: link.href.clone(),
            });
        }
        Ok(self.apply(raw))
    }
}

/// Visits the hosting page and reads one attribute of the first element
/// matching `selector`.
#[derive(Debug, Clone)]
pub struct PageElementStrategy {
    pub selector: String,
    pub attr: String,
    pub cookie: Option<String>,
}

impl ResolveStrategy for PageElementStrategy {
    fn resolve(&self, link: &ImageLink, pages: &dyn HtmlSource) -> Result<String> {
        let selector = Selector::parse(&self.selector).map_err(|err| EngineError::Selector {
            selector: self.selector.clone(),
            message: err.to_string(),
        })?;
        let html = pages.fetch_html_with_cookie(&link.href, self.cookie.as_deref())?;
        let document = Html::parse_document(&html);
        let found = document
            .select(&selector)
            .filter_map(|el| el.value().attr(&self.attr))
            .map(str::trim)
            .find(|v| !v.is_empty())
            .ok_or_else(|| EngineError::ImageNotFound {
                url: link.href.clone(),
            })?;
        absolutize(&link.href, found)
    }
}

fn absolutize(page_url: &str, value: &str) -> Result<String> {
    if let Ok(url) = Url::parse(value) {
        return Ok(url.to_string());
    }
    Ok(Url::parse(page_url)?.join(value)?.to_string())
}

#[derive(Debug, Clone)]
pub struct IdentityStrategy {
    pub input: UrlSource,
}

impl ResolveStrategy for IdentityStrategy {
    fn resolve(&self, link: &ImageLink, _pages: &dyn HtmlSource) -> Result<String> {
        let raw = pick(link, self.input);
        if raw.is_empty() {
            return Err(EngineError::ImageNotFound {
                url: link.href.clone(),
            });
        }
        Ok(raw.to_string())
    }
}

/// Known host that cannot be ripped.
#[derive(Debug, Clone, Copy)]
pub struct UnsupportedStrategy;

impl ResolveStrategy for UnsupportedStrategy {
    fn resolve(&self, link: &ImageLink, _pages: &dyn HtmlSource) -> Result<String> {
        Err(EngineError::UnsupportedHost {
            link: link.href.clone(),
        })
    }
}

pub fn strategy_from_config(config: &StrategyConfig) -> Arc<dyn ResolveStrategy> {
    match config {
        StrategyConfig::Rewrite {
            input,
            replacements,
        } => Arc::new(RewriteStrategy {
            input: *input,
            replacements: replacements.clone(),
        }),
        StrategyConfig::PageElement {
            selector,
            attr,
            cookie,
        } => Arc::new(PageElementStrategy {
            selector: selector.clone(),
            attr: attr.clone(),
            cookie: cookie.clone(),
        }),
        StrategyConfig::Identity { input } => Arc::new(IdentityStrategy { input: *input }),
        StrategyConfig::Unsupported => Arc::new(UnsupportedStrategy),
    }
}

/// Ordered host table. The first entry whose key occurs in the anchor href
/// (case-insensitive) handles the link.
#[derive(Clone, Default)]
pub struct HostRegistry {
    entries: Vec<(String, Arc<dyn ResolveStrategy>)>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        Self::from_rules(&default_host_rules())
    }

    pub fn from_rules(rules: &[HostRule]) -> Self {
        let mut registry = Self::new();
        for rule in rules {
            registry.register(&rule.matcher, strategy_from_config(&rule.strategy));
        }
        registry
    }

    /// Appends a host. Earlier registrations take precedence.
    pub fn register(&mut self, matcher: &str, strategy: Arc<dyn ResolveStrategy>) {
        let key = matcher.trim().to_ascii_lowercase();
        if key.is_empty() {
            return;
        }
        self.entries.push((key, strategy));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, href: &str) -> Option<&Arc<dyn ResolveStrategy>> {
        let href = href.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(key, _)| href.contains(key.as_str()))
            .map(|(_, strategy)| strategy)
    }

    /// `UnsupportedHost` when no entry matches or the host is marked
    /// unsupported.
    pub fn resolve(&self, link: &ImageLink, pages: &dyn HtmlSource) -> Result<String> {
        let Some(strategy) = self.lookup(&link.href) else {
            return Err(EngineError::UnsupportedHost {
                link: link.href.clone(),
            });
        };
        strategy.resolve(link, pages)
    }
}
