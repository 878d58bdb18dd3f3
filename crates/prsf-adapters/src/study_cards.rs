//! Script-rendered study board (`[data-testid='study-card']` cards).

use async_trait::async_trait;
use prsf_core::RawListing;
use scraper::Html;
use tracing::info;
use url::Url;

use crate::{
    absolutize, render_page, select_first_attr, select_first_text, selector, urls_or_default,
    AdapterError, FetchContext, SourceAdapter,
};

pub const DEFAULT_LIST_URL: &str = "https://www.userinterviews.com/studies?study_method=online&study_state=open";

pub struct StudyCardsAdapter {
    site: String,
    listing_urls: Vec<String>,
}

impl StudyCardsAdapter {
    pub fn new(site: &str, listing_urls: &[String]) -> Self {
        Self {
            site: site.to_string(),
            listing_urls: urls_or_default(listing_urls, DEFAULT_LIST_URL),
        }
    }
}

#[async_trait]
impl SourceAdapter for StudyCardsAdapter {
    fn site(&self) -> &str {
        &self.site
    }

    fn requires_browser(&self) -> bool {
        true
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<Vec<RawListing>, AdapterError> {
        let mut listings = Vec::new();
        for url in &self.listing_urls {
            let html = render_page(&self.site, ctx, url).await?;
            listings.extend(parse_study_cards(&self.site, &html, url)?);
        }
        info!(site = %self.site, count = listings.len(), "scraped listings");
        Ok(listings)
    }
}

pub fn parse_study_cards(site: &str, html: &str, base_url: &str) -> Result<Vec<RawListing>, AdapterError> {
    let document = Html::parse_document(html);
    let base = Url::parse(base_url).ok();

    let card_sel = selector(site, "[data-testid='study-card']")?;
    let title_sel = selector(site, "[data-testid='study-title'], h2, h3")?;
    let link_sel = selector(site, "a[href*='/projects/']")?;
    let payout_sel = selector(site, "[data-testid='incentive-amount'], [data-testid='study-incentive']")?;
    let method_sel = selector(site, "[data-testid='method'], [data-testid='study-method']")?;
    let deadline_sel = selector(site, "time, [data-testid='study-deadline']")?;
    let location_sel = selector(site, "[data-testid='location'], [data-testid='study-location']")?;
    let description_sel = selector(site, "[data-testid='study-description']")?;

    let listings = document
        .select(&card_sel)
        .filter_map(|card| {
            let title = select_first_text(card, &title_sel)?;
            let href = select_first_attr(card, &link_sel, "href")?;
            let link = absolutize(base.as_ref(), &href)?;
            Some(RawListing {
                site: site.to_string(),
                title,
                link,
                payout: select_first_text(card, &payout_sel).unwrap_or_default(),
                date_posted: select_first_text(card, &deadline_sel).unwrap_or_default(),
                location: select_first_text(card, &location_sel).unwrap_or_else(|| "Remote".to_string()),
                method: select_first_text(card, &method_sel).unwrap_or_default(),
                description: select_first_text(card, &description_sel).unwrap_or_default(),
                image_url: String::new(),
            })
        })
        .collect();
    Ok(listings)
}
