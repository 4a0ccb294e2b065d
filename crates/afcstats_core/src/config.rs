use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use toml::Value;

pub const DEFAULT_USER_AGENT: &str = "afcstats/0.2";
pub const DEFAULT_SUMMARY: &str =
    "Updating statistics for [[WP:WPAFC|WikiProject Articles for creation]].";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct StatisticsConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub afc: AfcSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
    /// Host name of the wiki itself; links to it are not counted as sources.
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AfcSection {
    pub page: String,
    pub pending_category: String,
    pub ignore_list: Vec<String>,
    pub summary: String,
    pub copyvio_template: String,
    /// Wiki page whose content must read `run` for unattended work to proceed.
    pub shutoff_page: Option<String>,
    pub templates: ChartTemplates,
    pub max_replag_secs: i64,
    pub stale_after_hours: i64,
    pub stale_batch: usize,
    pub retention_hours: i64,
    pub history_limit: usize,
    pub retry_delay_ms: u64,
    pub chart_row_limit: Option<usize>,
    pub sync_interval_secs: u64,
    pub save_interval_secs: u64,
}

impl Default for AfcSection {
    fn default() -> Self {
        Self {
            page: "Template:AFC statistics".to_string(),
            pending_category: "Pending AfC submissions".to_string(),
            ignore_list: Vec::new(),
            summary: DEFAULT_SUMMARY.to_string(),
            copyvio_template: "AfC suspected copyvio".to_string(),
            shutoff_page: None,
            templates: ChartTemplates::default(),
            max_replag_secs: 600,
            stale_after_hours: 48,
            stale_batch: 10,
            retention_hours: 36,
            history_limit: 50,
            retry_delay_ms: 5_000,
            chart_row_limit: None,
            sync_interval_secs: 240,
            save_interval_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChartTemplates {
    pub header: String,
    pub row: String,
    pub footer: String,
    pub more: String,
}

impl Default for ChartTemplates {
    fn default() -> Self {
        Self {
            header: "AFC statistics/header".to_string(),
            row: "#invoke:AfC|row".to_string(),
            footer: "AFC statistics/footer".to_string(),
            more: "AFC statistics/more".to_string(),
        }
    }
}

impl AfcSection {
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::hours(self.stale_after_hours)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }

    pub fn is_ignored(&self, title: &str) -> bool {
        self.ignore_list.iter().any(|ignored| ignored == title)
    }
}

impl StatisticsConfig {
    /// Resolve the wiki API URL: env > config > None.
    pub fn api_url_owned(&self) -> Option<String> {
        if let Ok(value) = env::var("WIKI_API_URL") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return Some(trimmed);
            }
        }
        self.wiki.api_url.clone()
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        if let Ok(value) = env::var("WIKI_USER_AGENT") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
        self.wiki
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// Wiki domain: config > host of the API URL.
    pub fn domain(&self) -> Option<String> {
        if let Some(domain) = &self.wiki.domain {
            return Some(domain.clone());
        }
        self.api_url_owned().and_then(|api| derive_domain(&api))
    }
}

/// Load and parse a config from a TOML file. Returns default if the file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<StatisticsConfig> {
    if !config_path.exists() {
        return Ok(StatisticsConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: StatisticsConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Set `[wiki].api_url` while preserving every other key. Returns `true` when a write occurred.
pub fn patch_api_url(config_path: &Path, api_url: &str) -> Result<bool> {
    let mut root = if config_path.exists() {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        toml::from_str::<Value>(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?
    } else {
        Value::Table(Default::default())
    };
    let original = root.clone();

    let root_table = root.as_table_mut().ok_or_else(|| {
        anyhow::anyhow!(
            "top-level TOML must be a table in {}",
            config_path.display()
        )
    })?;
    let wiki_entry = root_table
        .entry("wiki".to_string())
        .or_insert_with(|| Value::Table(Default::default()));
    let wiki_table = wiki_entry
        .as_table_mut()
        .ok_or_else(|| anyhow::anyhow!("[wiki] must be a table in {}", config_path.display()))?;
    wiki_table.insert("api_url".to_string(), Value::String(api_url.to_string()));

    if root == original {
        return Ok(false);
    }

    let parent = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("config path has no parent: {}", config_path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    let rendered = toml::to_string_pretty(&root).context("failed to serialize config TOML")?;
    fs::write(config_path, rendered)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    Ok(true)
}

pub fn derive_domain(api_url: &str) -> Option<String> {
    Url::parse(api_url.trim())
        .ok()
        .and_then(|url| url.host_str().map(ToString::to_string))
}
