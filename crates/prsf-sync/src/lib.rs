//! Ingestion, routing and alerting for scraped research-study listings.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use prsf_storage::ListingStore;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::JobScheduler;
use tracing::info;

pub mod alerts;
pub mod collector;
pub mod config;
pub mod guard;
pub mod pipeline;
pub mod publish;
pub mod rules;
pub mod scheduler;
pub mod status;
pub mod sweep;

#[cfg(test)]
pub(crate) mod testing;

pub use alerts::{AlertFanout, AlertOutcome, SavedSearchMatcher};
pub use collector::{Collector, CollectorReport, SourceFailure};
pub use config::{clamp_scrape_interval, ConfigError, SourceConfig, SourceRegistry, SyncConfig, MIN_SCRAPE_INTERVAL_SECS};
pub use guard::{JobGuard, JobPermit};
pub use pipeline::{IngestionPipeline, IngestionRunner, IngestionSummary, PipelineError, Trigger};
pub use publish::{DeliveryError, ListingPosted, LogPublisher, PostedEvents, PublishError, Publisher, WebhookPublisher};
pub use rules::{RouteDecision, RuleEngine};
pub use scheduler::{start_scheduler, ScheduleIntervals};
pub use status::{status_report, StatusReport};
pub use sweep::{AnnounceReport, RuleSweepReport, SweepConfig, SweepError, SweepReport, Sweeper};

/// Every long-lived component, wired from one [`SyncConfig`].
#[derive(Clone)]
pub struct SyncService {
    pub config: SyncConfig,
    pub store: ListingStore,
    pub runner: Arc<IngestionRunner>,
    pub sweeper: Arc<Sweeper>,
    pub events: PostedEvents,
    pub publisher: Arc<dyn Publisher>,
}

impl SyncService {
    /// Opening the store is the only fatal step; a missing source registry is too,
    /// since nothing could be scraped.
    pub async fn new(config: SyncConfig) -> Result<Self> {
        let store = ListingStore::open(&config.database_url)
            .await
            .context("opening listing store")?;
        let registry = SourceRegistry::load(&config.sources_path()).await?;
        let collector = Collector::from_config(&config, &registry)?;

        let publisher: Arc<dyn Publisher> = match config.webhook_url.as_deref() {
            Some(url) => Arc::new(
                WebhookPublisher::new(url, Duration::from_secs(config.http_timeout_secs))
                    .context("building webhook publisher")?,
            ),
            None => Arc::new(LogPublisher),
        };
        let events = PostedEvents::default();
        let sweeper = Arc::new(Sweeper::new(
            store.clone(),
            publisher.clone(),
            events.clone(),
            SweepConfig::from(&config),
        ));
        let runner = IngestionRunner::new(IngestionPipeline::new(collector, store.clone()));
        info!(
            database = %config.database_url,
            sources = registry.enabled().count(),
            webhook = config.webhook_url.is_some(),
            "sync service ready"
        );

        Ok(Self {
            config,
            store,
            runner,
            sweeper,
            events,
            publisher,
        })
    }

    pub async fn from_env() -> Result<Self> {
        Self::new(SyncConfig::from_env()).await
    }

    pub fn spawn_alert_worker(&self) -> JoinHandle<()> {
        Arc::new(AlertFanout::new(self.store.clone(), self.publisher.clone())).spawn_worker(&self.events)
    }

    /// `None` unless the scheduler is enabled in config.
    pub async fn maybe_start_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        let intervals = ScheduleIntervals {
            ingestion: self.config.scrape_interval,
            sweep: self.config.sweep_interval,
        };
        start_scheduler(self.runner.clone(), self.sweeper.clone(), intervals)
            .await
            .map(Some)
    }

    pub async fn status(&self) -> StatusReport {
        status_report(&self.store, &self.runner, Some(&self.sweeper), self.config.scheduler_enabled).await
    }
}
