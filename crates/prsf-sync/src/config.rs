use std::path::{Path, PathBuf};
use std::time::Duration;

use prsf_adapters::SourceKind;
use prsf_core::Destination;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

/// Scrape ticks below this are clamped up; the study boards are small sites.
pub const MIN_SCRAPE_INTERVAL_SECS: u64 = 900;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    /// Value written to `listings.site`, part of the natural key. Defaults to
    /// `source_id`, so renaming the display name never re-keys listings.
    #[serde(default)]
    pub site: Option<String>,
    pub enabled: bool,
    pub kind: SourceKind,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceConfig {
    pub fn site(&self) -> &str {
        self.site.as_deref().unwrap_or(&self.source_id)
    }
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub scrape_interval: Duration,
    pub sweep_interval: Duration,
    pub scheduler_enabled: bool,
    pub auto_post: bool,
    pub http_timeout_secs: u64,
    pub adapter_timeout: Duration,
    pub collector_timeout: Duration,
    pub user_agent: String,
    pub moderation_destination: Option<Destination>,
    pub default_destination: Option<Destination>,
    pub announce_batch: usize,
    pub webhook_url: Option<String>,
    pub browserless_url: Option<String>,
    pub browserless_token: Option<String>,
    pub web_port: u16,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or unparsable values fall
    /// back to defaults.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let secs = |key: &str, default: u64| var(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default);
        let non_empty = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let flag = |key: &str| {
            var(key)
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(false)
        };

        Self {
            database_url: non_empty("DATABASE_URL").unwrap_or_else(|| "sqlite://prsf.db".to_string()),
            scrape_interval: clamp_scrape_interval(secs("PRSF_SCRAPE_INTERVAL_SECS", MIN_SCRAPE_INTERVAL_SECS)),
            sweep_interval: Duration::from_secs(secs("PRSF_SWEEP_INTERVAL_SECS", 300).max(1)),
            scheduler_enabled: flag("PRSF_SCHEDULER_ENABLED"),
            auto_post: flag("PRSF_AUTO_POST"),
            http_timeout_secs: secs("PRSF_HTTP_TIMEOUT_SECS", 20),
            adapter_timeout: Duration::from_secs(secs("PRSF_ADAPTER_TIMEOUT_SECS", 20)),
            collector_timeout: Duration::from_secs(secs("PRSF_COLLECTOR_TIMEOUT_SECS", 25)),
            user_agent: non_empty("PRSF_USER_AGENT").unwrap_or_else(|| "prsf-bot/0.1".to_string()),
            moderation_destination: non_empty("PRSF_MODERATION_DESTINATION").map(Destination),
            default_destination: non_empty("PRSF_DEFAULT_DESTINATION").map(Destination),
            announce_batch: secs("PRSF_ANNOUNCE_BATCH", 10) as usize,
            webhook_url: non_empty("PRSF_WEBHOOK_URL"),
            browserless_url: non_empty("BROWSERLESS_URL"),
            browserless_token: non_empty("BROWSERLESS_TOKEN"),
            web_port: var("PRSF_WEB_PORT").and_then(|v| v.trim().parse().ok()).unwrap_or(8000),
            workspace_root: non_empty("PRSF_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }
}

pub fn clamp_scrape_interval(secs: u64) -> Duration {
    if secs < MIN_SCRAPE_INTERVAL_SECS {
        warn!(
            configured = secs,
            floor = MIN_SCRAPE_INTERVAL_SECS,
            "scrape interval below floor; clamping"
        );
        return Duration::from_secs(MIN_SCRAPE_INTERVAL_SECS);
    }
    Duration::from_secs(secs)
}
