//! Announcement and rule sweeps, plus the manual approve/reject path.
//!
//! Every publication claims the listing, publishes, records the post (which
//! clears the moderation card) and emits `listing_posted`. A failed publish
//! leaves the listing pending so the next sweep retries it. A publish whose
//! record failed is remembered and only the record is retried.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use prsf_core::{Destination, Listing, ListingId, ListingState, MessageRef};
use prsf_storage::{ListingStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::guard::JobGuard;
use crate::publish::{ListingPosted, PostedEvents, PublishError, Publisher};
use crate::rules::RuleEngine;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("listing {0} has no destination: rule and default destination are both unset")]
    NoDestination(ListingId),
}

#[derive(Debug, Clone, Default)]
pub struct SweepConfig {
    pub moderation_destination: Option<Destination>,
    pub default_destination: Option<Destination>,
    pub announce_batch: usize,
    pub auto_post: bool,
}

impl From<&SyncConfig> for SweepConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            moderation_destination: config.moderation_destination.clone(),
            default_destination: config.default_destination.clone(),
            announce_batch: config.announce_batch,
            auto_post: config.auto_post,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct AnnounceReport {
    pub announced: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RuleSweepReport {
    pub matched: usize,
    pub posted: usize,
    pub failed: usize,
    pub unroutable: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub rules: Option<RuleSweepReport>,
    pub announce: AnnounceReport,
}

/// Listing ids with a post or reject in flight.
#[derive(Debug, Default)]
struct Claims(Mutex<HashSet<ListingId>>);

impl Claims {
    fn try_claim(&self, id: ListingId) -> Option<Claim<'_>> {
        let mut held = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        held.insert(id).then(|| Claim { claims: self, id })
    }
}

struct Claim<'a> {
    claims: &'a Claims,
    id: ListingId,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.claims
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

pub struct Sweeper {
    store: ListingStore,
    publisher: Arc<dyn Publisher>,
    events: PostedEvents,
    config: SweepConfig,
    guard: JobGuard,
    claims: Claims,
    /// Published but not yet recorded as posted.
    unrecorded: Mutex<HashMap<ListingId, MessageRef>>,
}

impl Sweeper {
    pub fn new(store: ListingStore, publisher: Arc<dyn Publisher>, events: PostedEvents, config: SweepConfig) -> Self {
        Self {
            store,
            publisher,
            events,
            config,
            guard: JobGuard::new("sweep"),
            claims: Claims::default(),
            unrecorded: Mutex::new(HashMap::new()),
        }
    }

    pub fn guard(&self) -> &JobGuard {
        &self.guard
    }

    pub fn auto_post(&self) -> bool {
        self.config.auto_post
    }

    /// Rule sweep (when auto-post is on) followed by the announcement sweep,
    /// so auto-routed listings never get a moderation card. `None` if a sweep
    /// is already running.
    pub async fn run_sweep(&self) -> Option<SweepReport> {
        let _permit = self.guard.try_begin()?;
        self.record_outstanding().await;
        let rules = if self.config.auto_post {
            Some(self.apply_rules().await)
        } else {
            None
        };
        let announce = self.announce_pending().await;
        Some(SweepReport { rules, announce })
    }

    pub async fn announce_pending(&self) -> AnnounceReport {
        let mut report = AnnounceReport::default();
        let Some(destination) = self.config.moderation_destination.as_ref() else {
            debug!("no moderation destination configured; announcements disabled");
            return report;
        };
        let pending = match self.store.unannounced_pending().await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(error = %err, "loading unannounced listings failed");
                return report;
            }
        };

        for listing in pending.into_iter().take(self.config.announce_batch) {
            let card = match self.publisher.publish(destination, &listing).await {
                Ok(card) => card,
                Err(err) => {
                    warn!(listing_id = listing.id, error = %err, "moderation card publish failed");
                    report.failed += 1;
                    continue;
                }
            };
            match self.store.mark_announced(listing.id, &card).await {
                Ok(()) => report.announced += 1,
                Err(err) => {
                    warn!(listing_id = listing.id, error = %err, "recording moderation card failed");
                    report.failed += 1;
                }
            }
        }
        if report.announced + report.failed > 0 {
            info!(announced = report.announced, failed = report.failed, "announcement sweep done");
        }
        report
    }

    pub async fn apply_rules(&self) -> RuleSweepReport {
        let mut report = RuleSweepReport::default();
        let loaded = async { Ok::<_, StoreError>((self.store.list_rules(true).await?, self.store.pending_listings().await?)) };
        let (rules, pending) = match loaded.await {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(error = %err, "loading rules or pending listings failed");
                return report;
            }
        };
        if rules.is_empty() || pending.is_empty() {
            return report;
        }

        for decision in RuleEngine::apply(&rules, &pending) {
            report.matched += 1;
            let Some(destination) = decision.destination.or_else(|| self.config.default_destination.clone()) else {
                debug!(listing_id = decision.listing.id, rule = %decision.rule_name, "rule has no destination and no default is set");
                report.unroutable += 1;
                continue;
            };
            match self.post(&decision.listing, &destination).await {
                Ok(true) => {
                    info!(listing_id = decision.listing.id, rule = %decision.rule_name, %destination, "auto-posted");
                    report.posted += 1;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(listing_id = decision.listing.id, rule = %decision.rule_name, error = %err, "auto-post failed; listing stays pending");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Publishes a pending listing. `Ok(false)` when it is no longer pending.
    pub async fn approve(&self, id: ListingId, destination: Option<Destination>) -> Result<bool, SweepError> {
        let Some(listing) = self.store.listing(id).await? else {
            return Err(StoreError::NotFound(id).into());
        };
        let destination = destination
            .or_else(|| self.config.default_destination.clone())
            .ok_or(SweepError::NoDestination(id))?;
        self.post(&listing, &destination).await
    }

    /// Rejects a pending listing for good. `Ok(false)` when it is no longer
    /// pending or a post for it is in flight.
    pub async fn reject(&self, id: ListingId) -> Result<bool, StoreError> {
        let Some(_claim) = self.claims.try_claim(id) else {
            debug!(listing_id = id, "post in flight; reject ignored");
            return Ok(false);
        };
        if self.lock_unrecorded().contains_key(&id) {
            return Ok(false);
        }
        if self.store.listing_state(id).await? != ListingState::Pending {
            return Ok(false);
        }
        let rejected = self.store.mark_rejected(id).await?;
        if rejected {
            info!(listing_id = id, "listing rejected");
        }
        Ok(rejected)
    }

    /// Retries the post record of listings that were published but not
    /// recorded. Returns how many are still outstanding.
    pub async fn record_outstanding(&self) -> usize {
        let outstanding: Vec<(ListingId, Destination)> = self
            .lock_unrecorded()
            .iter()
            .map(|(id, message)| (*id, message.destination.clone()))
            .collect();
        for (id, destination) in outstanding {
            let listing = match self.store.listing(id).await {
                Ok(Some(listing)) => listing,
                Ok(None) => {
                    self.lock_unrecorded().remove(&id);
                    continue;
                }
                Err(err) => {
                    warn!(listing_id = id, error = %err, "loading unrecorded listing failed");
                    continue;
                }
            };
            if let Err(err) = self.post(&listing, &destination).await {
                warn!(listing_id = id, error = %err, "recording earlier publish failed again");
            }
        }
        self.lock_unrecorded().len()
    }

    fn lock_unrecorded(&self) -> MutexGuard<'_, HashMap<ListingId, MessageRef>> {
        self.unrecorded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn post(&self, listing: &Listing, destination: &Destination) -> Result<bool, SweepError> {
        let Some(_claim) = self.claims.try_claim(listing.id) else {
            debug!(listing_id = listing.id, "publish already in flight");
            return Ok(false);
        };
        if self.store.listing_state(listing.id).await? != ListingState::Pending {
            self.lock_unrecorded().remove(&listing.id);
            return Ok(false);
        }
        let earlier = self.lock_unrecorded().remove(&listing.id);
        let message = match earlier {
            Some(message) => message,
            None => self.publisher.publish(destination, listing).await?,
        };
        match self.store.mark_posted(listing.id, &message).await {
            Ok(true) => {
                self.events.emit(ListingPosted {
                    listing: listing.clone(),
                    message,
                });
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(err) => {
                error!(
                    listing_id = listing.id,
                    message_id = %message.message_id,
                    error = %err,
                    "listing published but not recorded; the record will be retried"
                );
                self.lock_unrecorded().insert(listing.id, message);
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use prsf_adapters::SourceAdapter;
    use prsf_core::{AutoRuleParams, MessageRef, SavedSearchParams};
    use prsf_storage::{HttpClientConfig, HttpFetcher};

    use super::*;
    use crate::alerts::AlertFanout;
    use crate::collector::Collector;
    use crate::pipeline::{IngestionPipeline, IngestionRunner, Trigger};
    use crate::testing::{raw, RecordingPublisher, StaticAdapter};

    fn sweeper(store: &ListingStore, publisher: Arc<RecordingPublisher>, config: SweepConfig) -> Sweeper {
        Sweeper::new(store.clone(), publisher, PostedEvents::default(), config)
    }

    fn routing() -> SweepConfig {
        SweepConfig {
            announce_batch: 10,
            auto_post: true,
            ..Default::default()
        }
    }

    async fn seeded(listings: &[prsf_core::RawListing]) -> ListingStore {
        let store = ListingStore::in_memory().await.unwrap();
        store.upsert(listings).await.unwrap();
        store
    }

    #[tokio::test]
    async fn scrape_route_post_and_alert_end_to_end() {
        let store = ListingStore::in_memory().await.unwrap();
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let adapter: Arc<dyn SourceAdapter> =
            Arc::new(StaticAdapter::new("A", vec![raw("A", "http://x/1", "T1", "$200")]));
        let collector = Collector::new(vec![adapter], http, None, Duration::from_secs(2), Duration::from_secs(3));
        let runner = IngestionRunner::new(IngestionPipeline::new(collector, store.clone()));

        let summary = runner.trigger(Trigger::Manual).await.unwrap().unwrap();
        assert_eq!((summary.new_count, summary.pending_count), (1, 1));

        store
            .add_rule(
                "big",
                &AutoRuleParams {
                    min_amount: Some(100),
                    destination: Some(Destination::new("chan1")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .add_saved_search(
                "u1",
                "big payers",
                &SavedSearchParams {
                    min_amount: Some(150),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let publisher = Arc::new(RecordingPublisher::default());
        let events = PostedEvents::default();
        let worker = Arc::new(AlertFanout::new(store.clone(), publisher.clone())).spawn_worker(&events);
        let sweeper = Sweeper::new(store.clone(), publisher.clone(), events, routing());

        let report = sweeper.apply_rules().await;
        assert_eq!(report.posted, 1);
        assert_eq!(publisher.published()[0].0, Destination::new("chan1"));
        assert!(store.pending_listings().await.unwrap().is_empty());

        for _ in 0..50 {
            if !publisher.alerted_users().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(publisher.alerted_users(), vec!["u1".to_string()]);

        // a second sweep finds nothing to post
        assert_eq!(sweeper.apply_rules().await, RuleSweepReport::default());
        assert_eq!(publisher.published().len(), 1);
        worker.abort();
    }

    #[tokio::test]
    async fn publish_failure_leaves_listing_pending() {
        let store = seeded(&[raw("A", "http://x/1", "T1", "$200")]).await;
        store.add_rule("all", &AutoRuleParams::default()).await.unwrap();
        let config = SweepConfig {
            default_destination: Some(Destination::new("main")),
            ..routing()
        };
        let s = sweeper(&store, Arc::new(RecordingPublisher::failing_publish()), config);

        let report = s.apply_rules().await;
        assert_eq!((report.matched, report.failed, report.posted), (1, 1, 0));
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rule_without_destination_uses_default_or_stays_pending() {
        let store = seeded(&[raw("A", "http://x/1", "T1", "$200")]).await;
        store.add_rule("all", &AutoRuleParams::default()).await.unwrap();

        let publisher = Arc::new(RecordingPublisher::default());
        let report = sweeper(&store, publisher.clone(), routing()).apply_rules().await;
        assert_eq!(report.unroutable, 1);
        assert_eq!(store.pending_count().await.unwrap(), 1);

        let config = SweepConfig {
            default_destination: Some(Destination::new("main")),
            ..routing()
        };
        let report = sweeper(&store, publisher.clone(), config).apply_rules().await;
        assert_eq!(report.posted, 1);
        assert_eq!(publisher.published()[0].0, Destination::new("main"));
    }

    #[tokio::test]
    async fn rejected_listing_is_never_routed_even_after_clear() {
        let listings = [raw("A", "http://x/1", "T1", "$200")];
        let store = seeded(&listings).await;
        let id = store.pending_listings().await.unwrap()[0].id;
        store.add_rule("all", &AutoRuleParams::default()).await.unwrap();

        let publisher = Arc::new(RecordingPublisher::default());
        let config = SweepConfig {
            default_destination: Some(Destination::new("main")),
            ..routing()
        };
        let s = sweeper(&store, publisher.clone(), config);
        assert!(s.reject(id).await.unwrap());
        assert!(!s.reject(id).await.unwrap());

        store.clear().await.unwrap();
        store.upsert(&listings).await.unwrap();
        assert!(store.pending_listings().await.unwrap().is_empty());
        assert_eq!(s.apply_rules().await, RuleSweepReport::default());
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn announcements_respect_batch_and_are_not_repeated() {
        let store = seeded(&[
            raw("A", "http://x/1", "T1", ""),
            raw("A", "http://x/2", "T2", ""),
            raw("A", "http://x/3", "T3", ""),
        ])
        .await;
        let publisher = Arc::new(RecordingPublisher::default());
        let config = SweepConfig {
            moderation_destination: Some(Destination::new("mods")),
            announce_batch: 2,
            ..Default::default()
        };
        let s = sweeper(&store, publisher.clone(), config);

        assert_eq!(s.announce_pending().await.announced, 2);
        assert_eq!(s.announce_pending().await.announced, 1);
        assert_eq!(s.announce_pending().await.announced, 0);
        assert_eq!(publisher.published().len(), 3);
        assert!(store.unannounced_pending().await.unwrap().is_empty());
        assert_eq!(store.pending_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn announcements_are_off_without_moderation_destination() {
        let store = seeded(&[raw("A", "http://x/1", "T1", "")]).await;
        let publisher = Arc::new(RecordingPublisher::default());
        let s = sweeper(&store, publisher.clone(), routing());
        assert_eq!(s.announce_pending().await, AnnounceReport::default());
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn approve_posts_once_and_clears_card() {
        let store = seeded(&[raw("A", "http://x/1", "T1", "")]).await;
        let id = store.pending_listings().await.unwrap()[0].id;
        store
            .mark_announced(
                id,
                &MessageRef {
                    destination: Destination::new("mods"),
                    message_id: "card".into(),
                },
            )
            .await
            .unwrap();

        let publisher = Arc::new(RecordingPublisher::default());
        let s = sweeper(&store, publisher.clone(), SweepConfig::default());
        assert!(matches!(s.approve(id, None).await, Err(SweepError::NoDestination(_))));

        assert!(s.approve(id, Some(Destination::new("chan1"))).await.unwrap());
        assert!(!s.approve(id, Some(Destination::new("chan1"))).await.unwrap());
        assert_eq!(publisher.published().len(), 1);
        assert!(store.moderation_card(id).await.unwrap().is_none());
        assert_eq!(store.listing_state(id).await.unwrap(), ListingState::Posted);
        assert!(!s.reject(id).await.unwrap());
    }

    #[tokio::test]
    async fn run_sweep_routes_before_announcing() {
        let store = seeded(&[raw("A", "http://x/1", "T1", "$500"), raw("A", "http://x/2", "T2", "$5")]).await;
        store
            .add_rule(
                "big",
                &AutoRuleParams {
                    min_amount: Some(100),
                    destination: Some(Destination::new("chan1")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let config = SweepConfig {
            moderation_destination: Some(Destination::new("mods")),
            ..routing()
        };
        let s = sweeper(&store, Arc::new(RecordingPublisher::default()), config);

        let report = s.run_sweep().await.unwrap();
        assert_eq!(report.rules.unwrap().posted, 1);
        assert_eq!(report.announce.announced, 1);
        assert!(!s.guard().is_running());
    }

    #[tokio::test]
    async fn concurrent_approvals_publish_once() {
        let store = seeded(&[raw("A", "http://x/1", "T1", "$200")]).await;
        let id = store.pending_listings().await.unwrap()[0].id;
        let publisher = Arc::new(RecordingPublisher::slow_publish(Duration::from_millis(100)));
        let config = SweepConfig {
            default_destination: Some(Destination::new("main")),
            ..routing()
        };
        let s = sweeper(&store, publisher.clone(), config);

        let (a, b) = tokio::join!(s.approve(id, None), s.approve(id, None));
        assert_eq!([a.unwrap(), b.unwrap()].iter().filter(|posted| **posted).count(), 1);
        assert_eq!(publisher.published().len(), 1);
        assert_eq!(store.stats().await.unwrap().posts, 1);
    }

    #[tokio::test]
    async fn reject_during_publish_is_refused() {
        let store = seeded(&[raw("A", "http://x/1", "T1", "$200")]).await;
        let id = store.pending_listings().await.unwrap()[0].id;
        let publisher = Arc::new(RecordingPublisher::slow_publish(Duration::from_millis(100)));
        let s = sweeper(&store, publisher.clone(), SweepConfig::default());

        let (approved, rejected) = tokio::join!(s.approve(id, Some(Destination::new("chan1"))), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            s.reject(id).await
        });
        assert!(approved.unwrap());
        assert!(!rejected.unwrap());
        assert_eq!(store.listing_state(id).await.unwrap(), ListingState::Posted);
        assert!(!store.is_rejected("A", "http://x/1").await.unwrap());
    }

    #[tokio::test]
    async fn unrecorded_publish_is_recorded_later_without_republishing() {
        let store = seeded(&[raw("A", "http://x/1", "T1", "$200")]).await;
        let id = store.pending_listings().await.unwrap()[0].id;
        store.add_rule("all", &AutoRuleParams::default()).await.unwrap();
        sqlx::query("CREATE TRIGGER posts_down BEFORE INSERT ON posts BEGIN SELECT RAISE(ABORT, 'posts unavailable'); END")
            .execute(store.pool())
            .await
            .unwrap();

        let publisher = Arc::new(RecordingPublisher::default());
        let events = PostedEvents::default();
        let mut rx = events.subscribe();
        let config = SweepConfig {
            default_destination: Some(Destination::new("main")),
            ..routing()
        };
        let s = Sweeper::new(store.clone(), publisher.clone(), events, config);

        assert_eq!(s.apply_rules().await.failed, 1);
        assert_eq!(s.apply_rules().await.failed, 1);
        assert_eq!(publisher.published().len(), 1);
        assert_eq!(store.listing_state(id).await.unwrap(), ListingState::Pending);
        assert!(!s.reject(id).await.unwrap());
        assert_eq!(s.record_outstanding().await, 1);

        sqlx::query("DROP TRIGGER posts_down").execute(store.pool()).await.unwrap();
        let report = s.run_sweep().await.unwrap();
        assert_eq!(report.rules.unwrap(), RuleSweepReport::default());
        assert_eq!(store.listing_state(id).await.unwrap(), ListingState::Posted);
        assert_eq!(publisher.published().len(), 1);
        assert_eq!(rx.try_recv().unwrap().message.message_id, "m1");
        assert_eq!(s.record_outstanding().await, 0);
    }
}
