use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::pipeline::{IngestionRunner, Trigger};
use crate::sweep::Sweeper;

#[derive(Debug, Clone, Copy)]
pub struct ScheduleIntervals {
    /// Already clamped to the scrape floor by the config layer.
    pub ingestion: Duration,
    pub sweep: Duration,
}

/// Builds and starts the two recurring jobs. Each tick goes through the job's
/// own guard, so a tick landing on a running job is skipped, not queued.
pub async fn start_scheduler(
    runner: Arc<IngestionRunner>,
    sweeper: Arc<Sweeper>,
    intervals: ScheduleIntervals,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let ingest_job = {
        let runner = runner.clone();
        let sweeper = sweeper.clone();
        Job::new_repeated_async(intervals.ingestion, move |_uuid, _lock| {
            let runner = runner.clone();
            let sweeper = sweeper.clone();
            Box::pin(async move {
                match runner.trigger(Trigger::Scheduled).await {
                    Ok(Some(_)) if sweeper.auto_post() => {
                        sweeper.run_sweep().await;
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "scheduled ingestion failed"),
                }
            })
        })
        .context("creating ingestion job")?
    };
    sched.add(ingest_job).await.context("adding ingestion job")?;

    let sweep_job = Job::new_repeated_async(intervals.sweep, move |_uuid, _lock| {
        let sweeper = sweeper.clone();
        Box::pin(async move {
            sweeper.run_sweep().await;
        })
    })
    .context("creating sweep job")?;
    sched.add(sweep_job).await.context("adding sweep job")?;

    sched.start().await.context("starting scheduler")?;
    info!(
        ingestion_every = ?intervals.ingestion,
        sweep_every = ?intervals.sweep,
        "scheduler started"
    );
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use prsf_adapters::SourceAdapter;
    use prsf_storage::{HttpClientConfig, HttpFetcher, ListingStore};

    use super::*;
    use crate::collector::Collector;
    use crate::pipeline::IngestionPipeline;
    use crate::publish::PostedEvents;
    use crate::sweep::SweepConfig;
    use crate::testing::{raw, RecordingPublisher, StaticAdapter};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ingestion_tick_fills_the_store() {
        let store = ListingStore::in_memory().await.unwrap();
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let adapter: Arc<dyn SourceAdapter> =
            Arc::new(StaticAdapter::new("A", vec![raw("A", "http://x/1", "T1", "$20")]));
        let collector = Collector::new(vec![adapter], http, None, Duration::from_secs(1), Duration::from_secs(2));
        let runner = IngestionRunner::new(IngestionPipeline::new(collector, store.clone()));
        let sweeper = Arc::new(Sweeper::new(
            store.clone(),
            Arc::new(RecordingPublisher::default()),
            PostedEvents::default(),
            SweepConfig::default(),
        ));

        let mut sched = start_scheduler(
            runner.clone(),
            sweeper,
            ScheduleIntervals {
                ingestion: Duration::from_secs(1),
                sweep: Duration::from_secs(60),
            },
        )
        .await
        .unwrap();

        for _ in 0..50 {
            if runner.last_summary().await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        sched.shutdown().await.unwrap();
        let summary = runner.last_summary().await.unwrap();
        assert_eq!(summary.trigger, Trigger::Scheduled);
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }
}
