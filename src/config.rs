use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

const MAX_WORKERS: usize = 16;
const MAX_POLL_BATCH: usize = 100;
const MAX_REPAIR_CONCURRENCY: usize = 32;
const MAX_FETCH_ATTEMPTS: u32 = 10;
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36";
const DEFAULT_SITE_ROOT: &str = "https://vipergirls.to/";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Overrides `<base>/downloads` when set.
    pub download_dir: Option<String>,
    pub workers: usize,
    pub poll_batch: usize,
    pub idle_poll_ms: u64,
    pub busy_poll_ms: u64,
    pub repair_concurrency: usize,
    pub repair_interval_secs: u64,
    pub thumbnail_width: u32,
    pub fetch: FetchSettings,
    pub hosts: Vec<HostRule>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: None,
            workers: 4,
            poll_batch: 10,
            idle_poll_ms: 10_000,
            busy_poll_ms: 2_000,
            repair_concurrency: 5,
            repair_interval_secs: 300,
            thumbnail_width: 200,
            fetch: FetchSettings::default(),
            hosts: default_host_rules(),
        }
    }
}

impl EngineConfig {
    fn clamped(mut self) -> Self {
        self.workers = self.workers.clamp(1, MAX_WORKERS);
        self.poll_batch = self.poll_batch.clamp(1, MAX_POLL_BATCH);
        self.repair_concurrency = self.repair_concurrency.clamp(1, MAX_REPAIR_CONCURRENCY);
        self.thumbnail_width = self.thumbnail_width.max(16);
        self.fetch.attempts = self.fetch.attempts.clamp(1, MAX_FETCH_ATTEMPTS);
        self.fetch.timeout_secs = self.fetch.timeout_secs.max(1);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub attempts: u32,
    pub retry_delay_ms: u64,
    pub timeout_secs: u64,
    /// Pause between thread pages while enumerating posts.
    pub page_delay_ms: u64,
    pub user_agent: String,
    /// Visited to obtain fresh session cookies after an anti-bot challenge.
    pub site_root: String,
    pub challenge_markers: Vec<String>,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay_ms: 5_000,
            timeout_secs: 60,
            page_delay_ms: 1_000,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            site_root: DEFAULT_SITE_ROOT.to_string(),
            challenge_markers: vec![
                "DDoS-Guard".to_string(),
                "Checking your browser".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRule {
    /// Case-insensitive substring matched against the anchor href.
    pub matcher: String,
    pub strategy: StrategyConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlSource {
    /// The anchor href, usually the hosting page.
    Link,
    /// The `<img src>` inside the anchor, usually a thumbnail.
    Thumbnail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    Rewrite {
        input: UrlSource,
        replacements: Vec<(String, String)>,
    },
    PageElement {
        selector: String,
        #[serde(default = "default_attr")]
        attr: String,
        #[serde(default)]
        cookie: Option<String>,
    },
    Identity {
        input: UrlSource,
    },
    Unsupported,
}

fn default_attr() -> String {
    "src".to_string()
}

fn rewrite(matcher: &str, pairs: &[(&str, &str)]) -> HostRule {
    HostRule {
        matcher: matcher.to_string(),
        strategy: StrategyConfig::Rewrite {
            input: UrlSource::Thumbnail,
            replacements: pairs
                .iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect(),
        },
    }
}

fn page_element(matcher: &str, selector: &str, cookie: Option<&str>) -> HostRule {
    HostRule {
        matcher: matcher.to_string(),
        strategy: StrategyConfig::PageElement {
            selector: selector.to_string(),
            attr: default_attr(),
            cookie: cookie.map(str::to_string),
        },
    }
}

fn unsupported(matcher: &str) -> HostRule {
    HostRule {
        matcher: matcher.to_string(),
        strategy: StrategyConfig::Unsupported,
    }
}

pub fn default_host_rules() -> Vec<HostRule> {
    vec![
        page_element("imagebam", "img.main-image", Some("nsfw_inter=1")),
        page_element("imgbox", "#img", None),
        rewrite("imx.to", &[("u/t", "u/i")]),
        page_element("turboimagehost", "#uImageCont img", None),
        rewrite("vipr.im", &[("/th", "/i")]),
        rewrite(
            "pixhost",
            &[("/thumbs", "/images"), ("https://t", "https://img")],
        ),
        rewrite("acidimg", &[("t.", "i."), ("/t", "/i")]),
        HostRule {
            matcher: "postimages.org".to_string(),
            strategy: StrategyConfig::Identity {
                input: UrlSource::Link,
            },
        },
        unsupported("pixxxels.cc"),
        unsupported("freeimage.us"),
    ]
}

pub fn load_engine_config(paths: &AppPaths) -> Result<EngineConfig> {
    load_engine_config_from(&paths.config_path())
}

pub fn load_engine_config_from(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let bytes = std::fs::read(path)?;
    let parsed: EngineConfig = serde_json::from_slice(&bytes).map_err(|e| EngineError::Config {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(parsed.clamped())
}

pub fn save_engine_config(paths: &AppPaths, config: &EngineConfig) -> Result<()> {
    let path = paths.config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let cfg = load_engine_config(&paths).expect("load");
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.repair_concurrency, 5);
        assert_eq!(cfg.fetch.attempts, 3);
        assert_eq!(cfg.fetch.timeout_secs, 60);
        assert_eq!(cfg.hosts, default_host_rules());
    }

    #[test]
    fn saved_config_reloads_with_clamped_limits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let cfg = EngineConfig {
            workers: 99,
            poll_batch: 0,
            ..EngineConfig::default()
        };
        save_engine_config(&paths, &cfg).expect("save");

        let loaded = load_engine_config(&paths).expect("load");
        assert_eq!(loaded.workers, MAX_WORKERS);
        assert_eq!(loaded.poll_batch, 1);
    }

    #[test]
    fn partial_config_fills_remaining_fields_from_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.json");
        std::fs::write(
            &path,
            r##"{
  "workers": 2,
  "hosts": [
    { "matcher": "example-host", "strategy": { "kind": "page_element", "selector": "#main" } },
    { "matcher": "thumbs.example", "strategy": { "kind": "rewrite", "input": "thumbnail", "replacements": [["/t/", "/i/"]] } }
  ]
}"##,
        )
        .expect("write");

        let cfg = load_engine_config_from(&path).expect("load");
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.thumbnail_width, 200);
        assert_eq!(cfg.hosts.len(), 2);
        assert_eq!(
            cfg.hosts[0].strategy,
            StrategyConfig::PageElement {
                selector: "#main".to_string(),
                attr: "src".to_string(),
                cookie: None,
            }
        );
    }

    #[test]
    fn malformed_config_reports_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.json");
        std::fs::write(&path, "{ not json").expect("write");
        let err = load_engine_config_from(&path).expect_err("should fail");
        assert!(matches!(err, EngineError::Config { .. }), "err={err:?}");
    }
}
