//! Durable listing store + pooled HTTP fetch utilities for PRSF.

mod http;
mod store;

pub use http::{
    BackoffPolicy, BrowserRenderer, FetchError, FetchedPage, HttpClientConfig, HttpFetcher, RenderError,
    TokenBucketConfig,
};
pub use store::{ListingPatch, ListingStore, StoreError, StoreStats, UpsertOutcome, REQUIRED_TABLES};
