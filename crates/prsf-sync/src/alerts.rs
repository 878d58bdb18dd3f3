//! Saved-search matching and the alert fan-out fed by `listing_posted` events.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::join_all;
use prsf_core::{contains_ci, is_remote, Listing, SavedSearch};
use prsf_storage::ListingStore;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::publish::{PostedEvents, Publisher};

#[derive(Debug, Default, Clone, Copy)]
pub struct SavedSearchMatcher;

impl SavedSearchMatcher {
    /// AND of every configured filter. A location filter that is itself a
    /// remote term ("remote", "online", ...) matches any remote listing.
    pub fn matches(search: &SavedSearch, listing: &Listing) -> bool {
        if !search.keywords.is_empty() {
            let haystack = format!("{} {}", listing.title, listing.description).to_lowercase();
            if !search.keywords.iter().all(|k| haystack.contains(&k.to_lowercase())) {
                return false;
            }
        }
        if let Some(min) = search.min_amount {
            match listing.payout_amount() {
                Some(amount) if amount >= min as f64 => {}
                _ => return false,
            }
        }
        if let Some(location) = search.location.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
            let ok = if is_remote(location) {
                listing.is_remote()
            } else {
                contains_ci(&listing.location, Some(location))
            };
            if !ok {
                return false;
            }
        }
        if search.remote_only && !listing.is_remote() {
            return false;
        }
        contains_ci(&listing.method, search.method.as_deref()) && contains_ci(&listing.site, search.site.as_deref())
    }

    /// Distinct owners of matching enabled searches, so a user gets one alert
    /// per listing however many of their searches match.
    pub fn recipients(searches: &[SavedSearch], listing: &Listing) -> Vec<String> {
        searches
            .iter()
            .filter(|s| s.enabled && Self::matches(s, listing))
            .map(|s| s.user_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct AlertOutcome {
    pub recipients: usize,
    pub delivered: usize,
    pub failed: usize,
}

pub struct AlertFanout {
    store: ListingStore,
    publisher: Arc<dyn Publisher>,
}

impl AlertFanout {
    pub fn new(store: ListingStore, publisher: Arc<dyn Publisher>) -> Self {
        Self { store, publisher }
    }

    /// Best effort: one user's delivery failure never affects the others.
    pub async fn alert(&self, listing: &Listing) -> AlertOutcome {
        let searches = match self.store.enabled_saved_searches().await {
            Ok(searches) => searches,
            Err(err) => {
                warn!(listing_id = listing.id, error = %err, "loading saved searches failed; no alerts sent");
                return AlertOutcome::default();
            }
        };
        let recipients = SavedSearchMatcher::recipients(&searches, listing);
        if recipients.is_empty() {
            return AlertOutcome::default();
        }

        let results = join_all(recipients.iter().map(|user_id| async move {
            let result = self.publisher.deliver_direct(user_id, listing).await;
            if let Err(err) = &result {
                warn!(user_id = %user_id, listing_id = listing.id, error = %err, "alert delivery failed");
            }
            result
        }))
        .await;

        let delivered = results.iter().filter(|r| r.is_ok()).count();
        let outcome = AlertOutcome {
            recipients: recipients.len(),
            delivered,
            failed: results.len() - delivered,
        };
        info!(listing_id = listing.id, recipients = outcome.recipients, failed = outcome.failed, "alerts sent");
        outcome
    }

    /// Consumes `listing_posted` events in order until every emitter is gone.
    pub fn spawn_worker(self: Arc<Self>, events: &PostedEvents) -> JoinHandle<()> {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.alert(&event.listing).await;
            }
            debug!("listing_posted channel closed; alert worker stopping");
        })
    }
}
