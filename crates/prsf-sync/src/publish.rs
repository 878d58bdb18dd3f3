//! Outbound publishing collaborator and the `listing_posted` event channel.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use prsf_core::{Destination, Listing, MessageRef};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publish to {destination} failed: {message}")]
    Rejected { destination: Destination, message: String },
    #[error("publish to {destination} failed: {source}")]
    Transport {
        destination: Destination,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("alert to user {user_id} failed: {message}")]
    Rejected { user_id: String, message: String },
    #[error("alert to user {user_id} failed: {source}")]
    Transport {
        user_id: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Chat-side collaborator. Implementations render the structured listing
/// however their platform wants; the core never formats markup.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, destination: &Destination, listing: &Listing) -> Result<MessageRef, PublishError>;

    async fn deliver_direct(&self, user_id: &str, listing: &Listing) -> Result<(), DeliveryError>;
}

/// Publisher used when no webhook is configured: logs and hands back a
/// synthetic message id.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, destination: &Destination, listing: &Listing) -> Result<MessageRef, PublishError> {
        info!(%destination, listing_id = listing.id, title = %listing.title, "publish (log only)");
        Ok(MessageRef {
            destination: destination.clone(),
            message_id: Uuid::new_v4().to_string(),
        })
    }

    async fn deliver_direct(&self, user_id: &str, listing: &Listing) -> Result<(), DeliveryError> {
        info!(user_id, listing_id = listing.id, title = %listing.title, "alert (log only)");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct WebhookReply {
    message_id: Option<String>,
}

/// Posts JSON envelopes to a bridge service that owns the chat binding.
#[derive(Debug, Clone)]
pub struct WebhookPublisher {
    client: reqwest::Client,
    url: String,
}

impl WebhookPublisher {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building webhook client")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn publish(&self, destination: &Destination, listing: &Listing) -> Result<MessageRef, PublishError> {
        let transport = |source| PublishError::Transport {
            destination: destination.clone(),
            source,
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&json!({ "kind": "publish", "destination": destination, "listing": listing }))
            .send()
            .await
            .map_err(transport)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PublishError::Rejected {
                destination: destination.clone(),
                message: format!("status {status}"),
            });
        }
        // bridges that do not report an id still count as delivered
        let reply: Option<WebhookReply> = resp.json().await.ok();
        let message_id = reply
            .and_then(|r| r.message_id)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        debug!(%destination, listing_id = listing.id, message_id, "published via webhook");
        Ok(MessageRef {
            destination: destination.clone(),
            message_id,
        })
    }

    async fn deliver_direct(&self, user_id: &str, listing: &Listing) -> Result<(), DeliveryError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&json!({ "kind": "alert", "user_id": user_id, "listing": listing }))
            .send()
            .await
            .map_err(|source| DeliveryError::Transport {
                user_id: user_id.to_string(),
                source,
            })?;
        if !resp.status().is_success() {
            return Err(DeliveryError::Rejected {
                user_id: user_id.to_string(),
                message: format!("status {}", resp.status()),
            });
        }
        Ok(())
    }
}

/// Emitted after a listing is published and recorded as posted.
#[derive(Debug, Clone)]
pub struct ListingPosted {
    pub listing: Listing,
    pub message: MessageRef,
}

/// Fan-out of [`ListingPosted`] to every live subscriber.
///
/// Each subscriber owns an unbounded queue, so a slow consumer delays its own
/// events but never loses them.
#[derive(Debug, Clone, Default)]
pub struct PostedEvents {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<ListingPosted>>>>,
}

impl PostedEvents {
    /// Returns how many subscribers got the event. Dropped receivers are pruned.
    pub fn emit(&self, event: ListingPosted) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ListingPosted> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }
}
