//! Core domain model for PRSF: scraped listings, saved searches, auto-rules and
//! the shared normalization helpers the matchers rely on.

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Database row id of a stored listing.
pub type ListingId = i64;

/// Location terms that mark a study as remote-friendly.
pub const REMOTE_TERMS: [&str; 5] = ["remote", "virtual", "online", "nationwide", "national"];

/// Handoff contract from source adapters into the ingestion pipeline.
///
/// Every field is free text exactly as scraped; an empty string means the site
/// did not provide the value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawListing {
    pub site: String,
    pub title: String,
    pub link: String,
    pub payout: String,
    pub date_posted: String,
    pub location: String,
    pub method: String,
    pub description: String,
    pub image_url: String,
}

impl RawListing {
    pub fn new(site: impl Into<String>, title: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            title: title.into(),
            link: link.into(),
            ..Default::default()
        }
    }

    /// Trims every field so the natural key compares stably across runs.
    pub fn normalized(mut self) -> Self {
        for field in [
            &mut self.site,
            &mut self.title,
            &mut self.link,
            &mut self.payout,
            &mut self.date_posted,
            &mut self.location,
            &mut self.method,
            &mut self.description,
            &mut self.image_url,
        ] {
            let trimmed = field.trim();
            if trimmed.len() != field.len() {
                *field = trimmed.to_string();
            }
        }
        self
    }

    /// A record without both halves of the `(site, link)` key cannot be stored.
    pub fn has_natural_key(&self) -> bool {
        !self.site.trim().is_empty() && !self.link.trim().is_empty()
    }

    pub fn natural_key(&self) -> (&str, &str) {
        (self.site.trim(), self.link.trim())
    }

    pub fn fingerprint(&self) -> String {
        listing_fingerprint(&self.site, &self.title, &self.link)
    }
}

/// Canonical persisted listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub site: String,
    pub title: String,
    pub link: String,
    pub payout: String,
    pub date_posted: String,
    pub location: String,
    pub method: String,
    pub description: String,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Listing {
    pub fn payout_amount(&self) -> Option<f64> {
        max_payout_amount(&self.payout)
    }

    pub fn is_remote(&self) -> bool {
        is_remote(&self.location)
    }

    pub fn fingerprint(&self) -> String {
        listing_fingerprint(&self.site, &self.title, &self.link)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingState {
    Pending,
    Posted,
    Rejected,
}

/// Opaque reference to a chat destination (a channel id on the publishing side).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Destination(pub String);

impl Destination {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a published listing landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub destination: Destination,
    pub message_id: String,
}

/// Per-user standing query used only for alerting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedSearch {
    pub id: i64,
    pub user_id: String,
    pub name: String,
    pub keywords: Vec<String>,
    pub min_amount: Option<i64>,
    pub location: Option<String>,
    pub method: Option<String>,
    pub site: Option<String>,
    pub remote_only: bool,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SavedSearchParams {
    pub query: Option<String>,
    pub min_amount: Option<i64>,
    pub location: Option<String>,
    pub method: Option<String>,
    pub site: Option<String>,
    pub remote_only: bool,
}

/// Operator-defined routing rule; evaluated in id order, first match wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoRule {
    pub id: i64,
    pub name: String,
    pub min_amount: Option<i64>,
    pub require_remote: bool,
    pub site_contains: Option<String>,
    pub method_contains: Option<String>,
    pub location_contains: Option<String>,
    pub destination: Option<Destination>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoRuleParams {
    pub min_amount: Option<i64>,
    pub require_remote: bool,
    pub site_contains: Option<String>,
    pub method_contains: Option<String>,
    pub location_contains: Option<String>,
    pub destination: Option<Destination>,
}

/// Stable id derived from `(site, title, link)` for records not yet stored.
pub fn listing_fingerprint(site: &str, title: &str, link: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{site}|{title}|{link}").as_bytes());
    hex::encode(hasher.finalize())
}

pub fn is_remote(location: &str) -> bool {
    let lower = location.to_lowercase();
    REMOTE_TERMS.iter().any(|term| lower.contains(term))
}

/// Case-insensitive substring filter; an unset or blank needle always passes.
pub fn contains_ci(haystack: &str, needle: Option<&str>) -> bool {
    match needle.map(str::trim) {
        None | Some("") => true,
        Some(needle) => haystack.to_lowercase().contains(&needle.to_lowercase()),
    }
}

/// Splits a free-text query into lower-cased keywords.
pub fn parse_keywords(query: &str) -> Vec<String> {
    query
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// One money amount found in free text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PayoutAmount {
    pub value: f64,
    /// Leading `$`, `£` or `€`, if any.
    pub symbol: Option<char>,
    /// Trailing "USD".
    pub usd_suffix: bool,
}

impl PayoutAmount {
    pub fn is_currency_marked(&self) -> bool {
        self.symbol.is_some() || self.usd_suffix
    }
}

static AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?P<symbol>[$£€])?\s*(?P<value>\d+(?:,\d{3})*(?:\.\d+)?)(?P<usd>\s*usd\b)?")
        .expect("valid regex")
});

/// Every amount in `text`, in order. Commas are thousands separators.
pub fn payout_amounts(text: &str) -> impl Iterator<Item = PayoutAmount> + '_ {
    AMOUNT.captures_iter(text).filter_map(|caps| {
        let value = caps["value"].replace(',', "").parse::<f64>().ok()?;
        Some(PayoutAmount {
            value,
            symbol: caps.name("symbol").and_then(|m| m.as_str().chars().next()),
            usd_suffix: caps.name("usd").is_some(),
        })
    })
}

/// Reduces a free-text payout ("$75 - $150", "Up to 200 USD") to its largest amount.
///
/// Currency-marked amounts take precedence; bare numbers only count when the
/// text carries no marked amount at all, so "$50 for 90 minutes" yields 50.
pub fn max_payout_amount(payout: &str) -> Option<f64> {
    let amounts: Vec<PayoutAmount> = payout_amounts(payout).collect();
    let marked = amounts
        .iter()
        .filter(|a| a.is_currency_marked())
        .map(|a| a.value)
        .fold(None, max_opt);
    marked.or_else(|| amounts.iter().map(|a| a.value).fold(None, max_opt))
}

/// Largest `$`-prefixed amount, ignoring every other number.
pub fn max_dollar_amount(text: &str) -> Option<f64> {
    payout_amounts(text)
        .filter(|a| a.symbol == Some('$'))
        .map(|a| a.value)
        .fold(None, max_opt)
}

fn max_opt(acc: Option<f64>, v: f64) -> Option<f64> {
    Some(acc.map_or(v, |a| a.max(v)))
}
