//! Source adapter contract + the concrete study-listing adapters.
//!
//! Adapters only produce [`RawListing`] records. Normalization (payout ceilings,
//! remote detection) happens downstream in the matchers, and deduplication in
//! the collector.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use prsf_core::RawListing;
use prsf_storage::{BrowserRenderer, FetchError as HttpFetchError, HttpFetcher, RenderError};
use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

mod dates;
mod focus_groups;
mod next_data;
mod study_cards;

pub use dates::{detect_event, find_event_date_text, parse_event_range, EventRange};
pub use focus_groups::{
    enrich_from_detail, format_dollars, normalize_payout, parse_focus_groups, pretty_method,
    FocusGroupsAdapter, FocusGroupsCard,
};
pub use next_data::{parse_next_data, NextDataAdapter};
pub use study_cards::{parse_study_cards, StudyCardsAdapter};

/// Which parsing strategy a configured source uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    FocusGroups,
    StudyCards,
    NextData,
}

impl SourceKind {
    pub fn requires_browser(self) -> bool {
        !matches!(self, SourceKind::FocusGroups)
    }
}

/// Everything an adapter may use while fetching one run.
#[derive(Clone)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub http: Arc<HttpFetcher>,
    pub renderer: Option<BrowserRenderer>,
    /// Per-adapter fetch budget; enforced by the caller, reported in errors.
    pub budget: Duration,
    /// Reference day for year defaults and for dropping studies that already ran.
    pub today: NaiveDate,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{site}: fetch exceeded its {budget:?} budget")]
    FetchTimeout { site: String, budget: Duration },
    #[error("{site}: fetch failed: {source}")]
    FetchError {
        site: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    #[error("{site}: a scripted browser is required but none is configured")]
    BrowserRequired { site: String },
    #[error("{site}: unparsable document: {message}")]
    Parse { site: String, message: String },
}

impl AdapterError {
    pub fn from_http(site: &str, err: HttpFetchError, budget: Duration) -> Self {
        if err.is_timeout() {
            AdapterError::FetchTimeout {
                site: site.to_string(),
                budget,
            }
        } else {
            AdapterError::FetchError {
                site: site.to_string(),
                source: Box::new(err),
            }
        }
    }

    pub fn from_render(site: &str, err: RenderError) -> Self {
        AdapterError::FetchError {
            site: site.to_string(),
            source: Box::new(err),
        }
    }

    pub fn parse(site: &str, message: impl Into<String>) -> Self {
        AdapterError::Parse {
            site: site.to_string(),
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AdapterError::FetchTimeout { .. })
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Value written to `RawListing::site`; half of the natural key.
    fn site(&self) -> &str;

    fn requires_browser(&self) -> bool {
        false
    }

    /// Fetches every listing the source currently shows. Malformed entries are
    /// skipped; only transport failures or an unparsable page fail the call.
    async fn fetch(&self, ctx: &FetchContext) -> Result<Vec<RawListing>, AdapterError>;
}

/// Builds the adapter for a configured source.
///
/// `listing_urls` empty means the adapter's well-known default page.
pub fn adapter_for_source(kind: SourceKind, site: &str, listing_urls: &[String]) -> Box<dyn SourceAdapter> {
    match kind {
        SourceKind::FocusGroups => Box::new(FocusGroupsAdapter::new(site, listing_urls)),
        SourceKind::StudyCards => Box::new(StudyCardsAdapter::new(site, listing_urls)),
        SourceKind::NextData => Box::new(NextDataAdapter::new(site, listing_urls)),
    }
}

/// Renders `url` through the scripted browser, failing fast when none is configured.
pub(crate) async fn render_page(site: &str, ctx: &FetchContext, url: &str) -> Result<String, AdapterError> {
    let renderer = ctx
        .renderer
        .as_ref()
        .ok_or_else(|| AdapterError::BrowserRequired { site: site.to_string() })?;
    renderer
        .content(url)
        .await
        .map_err(|e| AdapterError::from_render(site, e))
}

pub(crate) fn urls_or_default(listing_urls: &[String], default: &str) -> Vec<String> {
    if listing_urls.is_empty() {
        vec![default.to_string()]
    } else {
        listing_urls.to_vec()
    }
}

pub(crate) fn selector(site: &str, css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::parse(site, format!("selector {css}: {e}")))
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

pub(crate) fn element_text(el: ElementRef<'_>) -> String {
    text_or_none(&el.text().collect::<Vec<_>>().join(" ")).unwrap_or_default()
}

pub(crate) fn select_first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope.select(sel).map(element_text).find(|t| !t.is_empty())
}

pub(crate) fn select_first_attr(scope: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    scope
        .select(sel)
        .find_map(|n| n.value().attr(attr))
        .and_then(text_or_none)
}

/// Resolves `href` against `base`; absolute URLs pass through unchanged.
pub(crate) fn absolutize(base: Option<&Url>, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    base?.join(href).ok().map(|u| u.to_string())
}
