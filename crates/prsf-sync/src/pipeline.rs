use std::sync::Arc;

use chrono::{DateTime, Utc};
use prsf_storage::{ListingStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::collector::{Collector, SourceFailure};
use crate::guard::JobGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionSummary {
    pub run_id: Uuid,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_found: usize,
    pub new_count: usize,
    pub updated_count: usize,
    pub pending_count: i64,
    pub duplicates: usize,
    pub failed_sources: Vec<SourceFailure>,
    pub skipped_sources: Vec<String>,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("ingestion write failed: {0}")]
    Store(#[from] StoreError),
}

/// Collect, then upsert. Not reentrant; callers go through [`IngestionRunner`].
pub struct IngestionPipeline {
    collector: Collector,
    store: ListingStore,
}

impl IngestionPipeline {
    pub fn new(collector: Collector, store: ListingStore) -> Self {
        Self { collector, store }
    }

    pub fn store(&self) -> &ListingStore {
        &self.store
    }

    pub async fn run(&self, trigger: Trigger) -> Result<IngestionSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingestion_run", %run_id, ?trigger);
        async move {
            let started_at = Utc::now();
            let report = self.collector.collect(run_id).await;
            let outcome = self.store.upsert(&report.listings).await?;
            let summary = IngestionSummary {
                run_id,
                trigger,
                started_at,
                finished_at: Utc::now(),
                total_found: report.listings.len(),
                new_count: outcome.new_count,
                updated_count: outcome.updated_count,
                pending_count: outcome.pending_after,
                duplicates: report.duplicates,
                failed_sources: report.failed,
                skipped_sources: report.skipped,
            };
            info!(
                found = summary.total_found,
                new = summary.new_count,
                updated = summary.updated_count,
                pending = summary.pending_count,
                failed_sources = summary.failed_sources.len(),
                "ingestion run complete"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }
}

/// Shared entry point for scheduled and manual ingestion; both go through one guard.
pub struct IngestionRunner {
    pipeline: IngestionPipeline,
    guard: JobGuard,
    last: RwLock<Option<IngestionSummary>>,
}

impl IngestionRunner {
    pub fn new(pipeline: IngestionPipeline) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            guard: JobGuard::new("ingestion"),
            last: RwLock::new(None),
        })
    }

    /// `Ok(None)` when another run is in flight; the skip is counted, not queued.
    pub async fn trigger(&self, trigger: Trigger) -> Result<Option<IngestionSummary>, PipelineError> {
        let Some(_permit) = self.guard.try_begin() else {
            return Ok(None);
        };
        match self.pipeline.run(trigger).await {
            Ok(summary) => {
                *self.last.write().await = Some(summary.clone());
                Ok(Some(summary))
            }
            Err(err) => {
                error!(?trigger, error = %err, "ingestion run failed");
                Err(err)
            }
        }
    }

    pub fn guard(&self) -> &JobGuard {
        &self.guard
    }

    pub fn store(&self) -> &ListingStore {
        self.pipeline.store()
    }

    pub async fn last_summary(&self) -> Option<IngestionSummary> {
        self.last.read().await.clone()
    }
}
