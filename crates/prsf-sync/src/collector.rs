use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use prsf_adapters::{adapter_for_source, AdapterError, FetchContext, SourceAdapter};
use prsf_core::RawListing;
use prsf_storage::{BrowserRenderer, HttpClientConfig, HttpFetcher};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{SourceRegistry, SyncConfig};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub site: String,
    pub error: String,
}

#[derive(Debug, Default, Clone)]
pub struct CollectorReport {
    /// Union of successful fetches, first occurrence of each `(site, link)` kept.
    pub listings: Vec<RawListing>,
    pub succeeded: Vec<String>,
    pub failed: Vec<SourceFailure>,
    /// Adapters that need a scripted browser while none is configured.
    pub skipped: Vec<String>,
    pub duplicates: usize,
}

enum Slot {
    Skipped,
    Waiting,
    Done(Result<Vec<RawListing>, AdapterError>),
}

/// Runs every adapter concurrently under a per-adapter budget and a
/// collector-wide ceiling. One adapter's failure never affects the others.
pub struct Collector {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    http: Arc<HttpFetcher>,
    renderer: Option<BrowserRenderer>,
    adapter_timeout: Duration,
    collector_timeout: Duration,
}

impl Collector {
    pub fn new(
        adapters: Vec<Arc<dyn SourceAdapter>>,
        http: Arc<HttpFetcher>,
        renderer: Option<BrowserRenderer>,
        adapter_timeout: Duration,
        collector_timeout: Duration,
    ) -> Self {
        Self {
            adapters,
            http,
            renderer,
            adapter_timeout,
            collector_timeout,
        }
    }

    pub fn from_config(config: &SyncConfig, registry: &SourceRegistry) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..HttpClientConfig::default()
        })
        .context("building http fetcher")?;
        let renderer = config
            .browserless_url
            .as_deref()
            .map(|url| BrowserRenderer::new(url, config.browserless_token.as_deref(), config.adapter_timeout))
            .transpose()
            .context("building browser renderer")?;
        let adapters = registry
            .enabled()
            .map(|s| Arc::from(adapter_for_source(s.kind, s.site(), &s.listing_urls)))
            .collect::<Vec<Arc<dyn SourceAdapter>>>();
        info!(
            adapters = adapters.len(),
            browser = renderer.is_some(),
            "collector configured"
        );
        Ok(Self::new(
            adapters,
            Arc::new(http),
            renderer,
            config.adapter_timeout,
            config.collector_timeout,
        ))
    }

    pub fn sites(&self) -> Vec<String> {
        self.adapters.iter().map(|a| a.site().to_string()).collect()
    }

    pub async fn collect(&self, run_id: Uuid) -> CollectorReport {
        let ctx = FetchContext {
            run_id,
            http: self.http.clone(),
            renderer: self.renderer.clone(),
            budget: self.adapter_timeout,
            today: Utc::now().date_naive(),
        };

        let mut slots: Vec<Slot> = Vec::with_capacity(self.adapters.len());
        let mut tasks = JoinSet::new();
        for (idx, adapter) in self.adapters.iter().enumerate() {
            if adapter.requires_browser() && ctx.renderer.is_none() {
                info!(site = adapter.site(), "scripted browser not configured; skipping source");
                slots.push(Slot::Skipped);
                continue;
            }
            slots.push(Slot::Waiting);
            let adapter = adapter.clone();
            let ctx = ctx.clone();
            let budget = self.adapter_timeout;
            tasks.spawn(async move {
                let result = match tokio::time::timeout(budget, adapter.fetch(&ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(AdapterError::FetchTimeout {
                        site: adapter.site().to_string(),
                        budget,
                    }),
                };
                (idx, result)
            });
        }

        let deadline = Instant::now() + self.collector_timeout;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((idx, result)))) => slots[idx] = Slot::Done(result),
                Ok(Some(Err(err))) => warn!(%run_id, error = %err, "adapter task aborted"),
                Ok(None) => break,
                Err(_) => {
                    warn!(%run_id, ceiling = ?self.collector_timeout, pending = tasks.len(), "collector ceiling reached; abandoning remaining sources");
                    tasks.abort_all();
                    break;
                }
            }
        }

        let mut report = CollectorReport::default();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        for (adapter, slot) in self.adapters.iter().zip(slots) {
            let site = adapter.site().to_string();
            match slot {
                Slot::Skipped => report.skipped.push(site),
                Slot::Waiting => report.failed.push(SourceFailure {
                    error: format!("abandoned after the {:?} collector ceiling", self.collector_timeout),
                    site,
                }),
                Slot::Done(Err(err)) => {
                    warn!(%run_id, site = %site, error = %err, "source fetch failed");
                    report.failed.push(SourceFailure {
                        site,
                        error: err.to_string(),
                    });
                }
                Slot::Done(Ok(listings)) => {
                    debug!(%run_id, site = %site, found = listings.len(), "source fetched");
                    for raw in listings {
                        let raw = raw.normalized();
                        if raw.has_natural_key() {
                            let (s, l) = raw.natural_key();
                            if !seen.insert((s.to_string(), l.to_string())) {
                                report.duplicates += 1;
                                continue;
                            }
                        }
                        report.listings.push(raw);
                    }
                    report.succeeded.push(site);
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{raw, StaticAdapter};

    fn collector(adapters: Vec<StaticAdapter>, adapter_timeout: Duration, ceiling: Duration) -> Collector {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let adapters = adapters
            .into_iter()
            .map(|a| Arc::new(a) as Arc<dyn SourceAdapter>)
            .collect();
        Collector::new(adapters, http, None, adapter_timeout, ceiling)
    }

    #[tokio::test]
    async fn failing_and_slow_sources_do_not_block_the_rest() {
        let c = collector(
            vec![
                StaticAdapter::new("A", vec![raw("A", "http://a/1", "T1", "$10")]),
                StaticAdapter::new("B", vec![]).failing(),
                StaticAdapter::new("C", vec![raw("C", "http://c/1", "T", "")]).delayed(Duration::from_secs(5)),
            ],
            Duration::from_millis(100),
            Duration::from_secs(2),
        );
        let report = c.collect(Uuid::new_v4()).await;
        assert_eq!(report.succeeded, vec!["A".to_string()]);
        assert_eq!(report.listings.len(), 1);
        let failed: Vec<_> = report.failed.iter().map(|f| f.site.as_str()).collect();
        assert_eq!(failed, vec!["B", "C"]);
        assert!(report.failed[1].error.contains("budget"));
    }

    #[tokio::test]
    async fn collector_ceiling_abandons_hung_sources() {
        let c = collector(
            vec![
                StaticAdapter::new("A", vec![raw("A", "http://a/1", "T1", "")]),
                StaticAdapter::new("slow", vec![raw("slow", "http://s/1", "T", "")]).delayed(Duration::from_secs(10)),
            ],
            Duration::from_secs(30),
            Duration::from_millis(150),
        );
        let started = std::time::Instant::now();
        let report = c.collect(Uuid::new_v4()).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.succeeded, vec!["A".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].error.contains("ceiling"));
    }

    #[tokio::test]
    async fn duplicates_within_a_run_keep_first_occurrence() {
        let c = collector(
            vec![
                StaticAdapter::new(
                    "A",
                    vec![
                        raw("A", "http://x/1", "first", "$10"),
                        raw("A", " http://x/1 ", "second", "$20"),
                        raw("A", "http://x/2", "other", ""),
                    ],
                ),
                StaticAdapter::new("B", vec![raw("B", "http://x/1", "same link other site", "")]),
            ],
            Duration::from_secs(1),
            Duration::from_secs(2),
        );
        let report = c.collect(Uuid::new_v4()).await;
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.listings.len(), 3);
        assert_eq!(report.listings[0].title, "first");
        assert_eq!(report.listings[2].site, "B");
    }

    #[tokio::test]
    async fn browser_sources_are_skipped_without_renderer() {
        let browser = StaticAdapter::new("B", vec![raw("B", "http://b/1", "T", "")]).needing_browser();
        let calls = browser.calls.clone();
        let c = collector(vec![browser], Duration::from_secs(1), Duration::from_secs(2));
        let report = c.collect(Uuid::new_v4()).await;
        assert_eq!(report.skipped, vec!["B".to_string()]);
        assert!(report.listings.is_empty());
        assert!(report.failed.is_empty());
        assert_eq!(calls.load(std::sync::atomic::Ordering::Relaxed), 0);
    }
}
