use prsf_storage::{ListingStore, StoreStats};
use serde::Serialize;
use tracing::warn;

use crate::pipeline::{IngestionRunner, IngestionSummary};
use crate::sweep::Sweeper;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub store_ok: bool,
    pub missing_tables: Vec<String>,
    pub scheduler_enabled: bool,
    pub ingestion_running: bool,
    pub sweep_running: bool,
    pub skipped_ingestions: u64,
    pub last_ingestion: Option<IngestionSummary>,
    pub stats: Option<StoreStats>,
}

/// Read-only snapshot; store failures degrade to `store_ok = false`.
pub async fn status_report(
    store: &ListingStore,
    runner: &IngestionRunner,
    sweeper: Option<&Sweeper>,
    scheduler_enabled: bool,
) -> StatusReport {
    let store_ok = match store.ping().await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "store ping failed");
            false
        }
    };
    let missing_tables = store.schema_check().await.unwrap_or_else(|err| {
        warn!(error = %err, "schema check failed");
        Vec::new()
    });
    let stats = match store.stats().await {
        Ok(stats) => Some(stats),
        Err(err) => {
            warn!(error = %err, "loading stats failed");
            None
        }
    };

    StatusReport {
        store_ok,
        missing_tables,
        scheduler_enabled,
        ingestion_running: runner.guard().is_running(),
        sweep_running: sweeper.is_some_and(|s| s.guard().is_running()),
        skipped_ingestions: runner.guard().skipped_count(),
        last_ingestion: runner.last_summary().await,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use prsf_storage::{HttpClientConfig, HttpFetcher};

    use super::*;
    use crate::collector::Collector;
    use crate::pipeline::{IngestionPipeline, Trigger};

    #[tokio::test]
    async fn reports_store_health_and_last_run() {
        let store = ListingStore::in_memory().await.unwrap();
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let collector = Collector::new(Vec::new(), http, None, Duration::from_secs(1), Duration::from_secs(1));
        let runner = IngestionRunner::new(IngestionPipeline::new(collector, store.clone()));

        let before = status_report(&store, &runner, None, false).await;
        assert!(before.store_ok);
        assert!(before.missing_tables.is_empty());
        assert!(before.last_ingestion.is_none());

        runner.trigger(Trigger::Manual).await.unwrap();
        let after = status_report(&store, &runner, None, true).await;
        assert!(after.scheduler_enabled);
        assert_eq!(after.last_ingestion.unwrap().total_found, 0);
        assert_eq!(after.stats.unwrap().listings, 0);
    }
}
