//! In-memory fakes shared by the sync tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use prsf_adapters::{AdapterError, FetchContext, SourceAdapter};
use prsf_core::{AutoRule, Destination, Listing, ListingId, MessageRef, RawListing, SavedSearch};

use crate::publish::{DeliveryError, PublishError, Publisher};

pub fn listing(id: ListingId, site: &str, link: &str, payout: &str, location: &str) -> Listing {
    let now = Utc::now();
    Listing {
        id,
        site: site.into(),
        title: format!("Study {id}"),
        link: link.into(),
        payout: payout.into(),
        date_posted: String::new(),
        location: location.into(),
        method: String::new(),
        description: String::new(),
        image_url: String::new(),
        created_at: now,
        updated_at: now,
    }
}

pub fn rule(id: i64) -> AutoRule {
    AutoRule {
        id,
        name: format!("rule-{id}"),
        min_amount: None,
        require_remote: false,
        site_contains: None,
        method_contains: None,
        location_contains: None,
        destination: None,
        enabled: true,
        created_at: Utc::now(),
    }
}

pub fn search(id: i64, user: &str) -> SavedSearch {
    SavedSearch {
        id,
        user_id: user.into(),
        name: format!("search-{id}"),
        keywords: Vec::new(),
        min_amount: None,
        location: None,
        method: None,
        site: None,
        remote_only: false,
        enabled: true,
        created_at: Utc::now(),
    }
}

/// Records every publish and alert; can be told to fail either.
#[derive(Default)]
pub struct RecordingPublisher {
    fail_publish: bool,
    publish_delay: Option<Duration>,
    failing_users: HashSet<String>,
    published: Mutex<Vec<(Destination, ListingId)>>,
    alerted: Mutex<Vec<String>>,
    next_id: AtomicUsize,
}

impl RecordingPublisher {
    pub fn failing_for(users: &[&str]) -> Self {
        Self {
            failing_users: users.iter().map(|u| u.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn failing_publish() -> Self {
        Self {
            fail_publish: true,
            ..Default::default()
        }
    }

    pub fn slow_publish(delay: Duration) -> Self {
        Self {
            publish_delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn published(&self) -> Vec<(Destination, ListingId)> {
        self.published.lock().unwrap().clone()
    }

    pub fn alerted_users(&self) -> Vec<String> {
        let mut users = self.alerted.lock().unwrap().clone();
        users.sort();
        users
    }

    pub fn alert_count(&self) -> usize {
        self.alerted.lock().unwrap().len()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, destination: &Destination, listing: &Listing) -> Result<MessageRef, PublishError> {
        if self.fail_publish {
            return Err(PublishError::Rejected {
                destination: destination.clone(),
                message: "bridge down".into(),
            });
        }
        if let Some(delay) = self.publish_delay {
            tokio::time::sleep(delay).await;
        }
        self.published.lock().unwrap().push((destination.clone(), listing.id));
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(MessageRef {
            destination: destination.clone(),
            message_id: format!("m{n}"),
        })
    }

    async fn deliver_direct(&self, user_id: &str, _listing: &Listing) -> Result<(), DeliveryError> {
        if self.failing_users.contains(user_id) {
            return Err(DeliveryError::Rejected {
                user_id: user_id.into(),
                message: "dm closed".into(),
            });
        }
        self.alerted.lock().unwrap().push(user_id.to_string());
        Ok(())
    }
}

/// Adapter returning canned listings, optionally after a delay or with an error.
pub struct StaticAdapter {
    pub site: String,
    pub listings: Vec<RawListing>,
    pub delay: Option<Duration>,
    pub fail: bool,
    pub browser: bool,
    pub calls: Arc<AtomicUsize>,
}

impl StaticAdapter {
    pub fn new(site: &str, listings: Vec<RawListing>) -> Self {
        Self {
            site: site.into(),
            listings,
            delay: None,
            fail: false,
            browser: false,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn needing_browser(mut self) -> Self {
        self.browser = true;
        self
    }
}

#[async_trait]
impl SourceAdapter for StaticAdapter {
    fn site(&self) -> &str {
        &self.site
    }

    fn requires_browser(&self) -> bool {
        self.browser
    }

    async fn fetch(&self, _ctx: &FetchContext) -> Result<Vec<RawListing>, AdapterError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(AdapterError::parse(&self.site, "no listing container"));
        }
        Ok(self.listings.clone())
    }
}

pub fn raw(site: &str, link: &str, title: &str, payout: &str) -> RawListing {
    RawListing {
        payout: payout.into(),
        ..RawListing::new(site, title, link)
    }
}
