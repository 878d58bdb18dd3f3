//! Plain-HTTP adapter for focusgroups.org-style category cards.

use async_trait::async_trait;
use chrono::NaiveDate;
use prsf_core::{max_dollar_amount, RawListing};
use scraper::{ElementRef, Html};
use tracing::{debug, info};
use url::Url;

use crate::dates::{detect_event, EventRange};
use crate::{
    absolutize, element_text, select_first_attr, select_first_text, selector, urls_or_default,
    AdapterError, FetchContext, SourceAdapter,
};

pub const DEFAULT_LIST_URL: &str = "https://focusgroups.org/all";

const DETAIL_DATE_SELECTORS: [&str; 8] = [
    ".study-date",
    ".date",
    ".dates",
    ".event-date",
    ".study-details",
    ".details",
    "section",
    "article",
];

const DETAIL_IMAGE_SELECTORS: [&str; 4] = [
    "article img",
    ".entry-content img",
    ".post-content img",
    "figure img",
];

/// One parsed card before the optional detail-page pass.
#[derive(Debug, Clone, PartialEq)]
pub struct FocusGroupsCard {
    pub listing: RawListing,
    pub event: Option<EventRange>,
}

impl FocusGroupsCard {
    /// Cards missing an event date or image get their detail page fetched.
    pub fn needs_detail(&self) -> bool {
        self.event.is_none() || self.listing.image_url.is_empty()
    }

    pub fn has_ended(&self, today: NaiveDate) -> bool {
        self.event.is_some_and(|e| e.has_ended(today))
    }
}

pub struct FocusGroupsAdapter {
    site: String,
    listing_urls: Vec<String>,
}

impl FocusGroupsAdapter {
    pub fn new(site: &str, listing_urls: &[String]) -> Self {
        Self {
            site: site.to_string(),
            listing_urls: urls_or_default(listing_urls, DEFAULT_LIST_URL),
        }
    }
}

#[async_trait]
impl SourceAdapter for FocusGroupsAdapter {
    fn site(&self) -> &str {
        &self.site
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<Vec<RawListing>, AdapterError> {
        let mut listings = Vec::new();
        for url in &self.listing_urls {
            let page = ctx
                .http
                .fetch_text(ctx.run_id, &self.site, url)
                .await
                .map_err(|e| AdapterError::from_http(&self.site, e, ctx.budget))?;
            let mut cards = parse_focus_groups(&self.site, &page.body, &page.final_url, ctx.today)?;

            for card in cards.iter_mut().filter(|c| c.needs_detail()) {
                match ctx.http.fetch_text(ctx.run_id, &self.site, &card.listing.link).await {
                    Ok(detail) => {
                        enrich_from_detail(&self.site, card, &detail.body, &detail.final_url, ctx.today)?
                    }
                    Err(err) => debug!(link = %card.listing.link, error = %err, "detail fetch failed"),
                }
            }

            listings.extend(
                cards
                    .into_iter()
                    .filter(|c| !c.has_ended(ctx.today))
                    .map(|c| c.listing),
            );
        }
        info!(site = %self.site, count = listings.len(), "scraped listings");
        Ok(listings)
    }
}

pub fn parse_focus_groups(
    site: &str,
    html: &str,
    base_url: &str,
    today: NaiveDate,
) -> Result<Vec<FocusGroupsCard>, AdapterError> {
    let document = Html::parse_document(html);
    let base = Url::parse(base_url).ok();

    let card_sel = selector(site, r#"a[href^="/category/"]"#)?;
    let panel_sel = selector(site, "div.study-pannel")?;
    let title_sel = selector(site, ".study-title")?;
    let dollars_sel = selector(site, ".details .dollars")?;
    let location_sel = selector(site, ".details .location")?;
    let description_sel = selector(site, ".details .description")?;
    let img_sel = selector(site, "img")?;

    let mut cards = Vec::new();
    for anchor in document.select(&card_sel) {
        let Some(panel) = anchor.select(&panel_sel).next() else {
            continue;
        };
        let href = anchor.value().attr("href").unwrap_or_default();
        let Some(link) = absolutize(base.as_ref(), href) else {
            continue;
        };
        let Some(title) = select_first_text(panel, &title_sel) else {
            continue;
        };
        let slug = method_slug(href);
        if slug == "clinical-trials" {
            continue;
        }

        let dollars = select_first_text(panel, &dollars_sel).unwrap_or_default();
        let payout = normalize_payout(if dollars.is_empty() { &title } else { &dollars });
        let location = select_first_text(panel, &location_sel)
            .map(|l| l.replacen("located", "", 1).trim().to_string())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| "Remote".to_string());
        let event = detect_event(&element_text(panel), today);
        let image_url = panel
            .select(&img_sel)
            .next()
            .and_then(|img| {
                let attrs = img.value();
                attrs
                    .attr("data-src")
                    .or_else(|| attrs.attr("data-lazy-src"))
                    .or_else(|| attrs.attr("src"))
            })
            .and_then(|src| absolutize(base.as_ref(), src))
            .unwrap_or_default();

        cards.push(FocusGroupsCard {
            listing: RawListing {
                site: site.to_string(),
                title,
                link,
                payout,
                date_posted: event.map(|e| e.label()).unwrap_or_default(),
                location,
                method: pretty_method(slug),
                description: select_first_text(panel, &description_sel).unwrap_or_default(),
                image_url,
            },
            event,
        });
    }
    Ok(cards)
}

/// Fills a card's missing event date and image from its detail page.
pub fn enrich_from_detail(
    site: &str,
    card: &mut FocusGroupsCard,
    html: &str,
    base_url: &str,
    today: NaiveDate,
) -> Result<(), AdapterError> {
    let document = Html::parse_document(html);
    let base = Url::parse(base_url).ok();

    if card.event.is_none() {
        card.event = detail_event(site, &document, today)?;
        if let Some(event) = card.event {
            card.listing.date_posted = event.label();
        }
    }
    if card.listing.image_url.is_empty() {
        if let Some(image) = detail_image(site, &document, base.as_ref())? {
            card.listing.image_url = image;
        }
    }
    Ok(())
}

fn detail_event(site: &str, document: &Html, today: NaiveDate) -> Result<Option<EventRange>, AdapterError> {
    for css in DETAIL_DATE_SELECTORS {
        let sel = selector(site, css)?;
        if let Some(event) = document
            .select(&sel)
            .find_map(|el| detect_event(&element_text(el), today))
        {
            return Ok(Some(event));
        }
    }
    Ok(detect_event(&element_text(document.root_element()), today))
}

fn detail_image(site: &str, document: &Html, base: Option<&Url>) -> Result<Option<String>, AdapterError> {
    for css in DETAIL_IMAGE_SELECTORS {
        let sel = selector(site, css)?;
        let mut candidates: Vec<(u32, ElementRef<'_>)> = document
            .select(&sel)
            .map(|img| {
                let width = img.value().attr("srcset").and_then(best_srcset).map_or(0, |(w, _)| w);
                (width, img)
            })
            .collect();
        if candidates.is_empty() {
            continue;
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        if let Some(url) = candidates.into_iter().find_map(|(_, img)| pick_src(img, base)) {
            return Ok(Some(url));
        }
    }

    let og_sel = selector(site, r#"meta[property="og:image"]"#)?;
    if let Some(content) = select_first_attr(document.root_element(), &og_sel, "content") {
        return Ok(absolutize(base, &content));
    }

    let img_sel = selector(site, "img")?;
    Ok(document.select(&img_sel).next().and_then(|img| pick_src(img, base)))
}

fn pick_src(img: ElementRef<'_>, base: Option<&Url>) -> Option<String> {
    let attrs = img.value();
    if let Some((_, url)) = attrs.attr("srcset").and_then(best_srcset) {
        return absolutize(base, url);
    }
    let src = attrs
        .attr("data-src")
        .or_else(|| attrs.attr("data-lazy-src"))
        .or_else(|| attrs.attr("src"))?;
    absolutize(base, src)
}

/// Widest candidate of a `srcset`; entries without a `w` descriptor count as 0.
fn best_srcset(srcset: &str) -> Option<(u32, &str)> {
    let mut best: Option<(u32, &str)> = None;
    for part in srcset.split(',') {
        let mut bits = part.split_whitespace();
        let Some(url) = bits.next() else {
            continue;
        };
        let width = bits
            .next()
            .and_then(|d| d.strip_suffix('w'))
            .and_then(|w| w.parse().ok())
            .unwrap_or(0);
        if best.map_or(true, |(w, _)| width > w) {
            best = Some((width, url));
        }
    }
    best
}

fn method_slug(href: &str) -> &str {
    let mut parts = href.trim_matches('/').split('/');
    match (parts.next(), parts.next()) {
        (Some("category"), Some(slug)) => slug,
        _ => "",
    }
}

pub fn pretty_method(slug: &str) -> String {
    let slug = slug.to_lowercase();
    let known = match slug.as_str() {
        "focus-groups" => "Focus Group",
        "interview-studies" => "Interview",
        "product-testing" => "Product Test",
        "diary-studies" => "Diary Study",
        "unmoderated-studies" => "Unmoderated",
        "survey-panels" => "Survey",
        _ => "",
    };
    if !known.is_empty() {
        return known.to_string();
    }
    slug.split('-')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            chars
                .next()
                .map(|c| c.to_uppercase().chain(chars).collect::<String>())
                .unwrap_or_default()
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Largest `$` amount in `text`, reformatted (`$1,200`, `$12.50`); empty if none.
pub fn normalize_payout(text: &str) -> String {
    max_dollar_amount(text).map(format_dollars).unwrap_or_default()
}

pub fn format_dollars(amount: f64) -> String {
    let cents = (amount * 100.0).round() as i64;
    let (whole, frac) = (cents / 100, cents % 100);
    let digits = whole.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if frac == 0 {
        format!("${grouped}")
    } else {
        format!("${grouped}.{frac:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture, today};

    const SITE: &str = "FocusGroups.org";
    const BASE: &str = "https://focusgroups.org/all";

    fn cards() -> Vec<FocusGroupsCard> {
        parse_focus_groups(SITE, &fixture("focus-groups/listing.html"), BASE, today()).unwrap()
    }

    #[test]
    fn listing_page_parses_cards_and_skips_malformed_entries() {
        let cards = cards();
        let titles: Vec<_> = cards.iter().map(|c| c.listing.title.as_str()).collect();
        assert_eq!(
            titles,
            vec![
                "Chicago Coffee Drinkers Focus Group",
                "Earn $200 for a 60 minute interview",
                "Try a New Kitchen Gadget at Home",
            ]
        );
    }

    #[test]
    fn card_fields_are_normalized() {
        let cards = cards();
        let first = &cards[0].listing;
        assert_eq!(first.site, SITE);
        assert_eq!(
            first.link,
            "https://focusgroups.org/category/focus-groups/chicago-coffee-drinkers"
        );
        assert_eq!(first.payout, "$150");
        assert_eq!(first.location, "Chicago, IL");
        assert_eq!(first.method, "Focus Group");
        assert_eq!(first.date_posted, "Mar 10, 2026");
        assert_eq!(first.image_url, "https://focusgroups.org/img/coffee.jpg");
        assert_eq!(first.description, "Share your morning routine with a small group.");

        let second = &cards[1].listing;
        assert_eq!(second.payout, "$200");
        assert_eq!(second.location, "Remote");
        assert_eq!(second.method, "Interview");
    }

    #[test]
    fn ended_studies_are_flagged() {
        let cards = cards();
        assert!(!cards[0].has_ended(today()));
        assert!(cards[1].has_ended(today()));
        assert!(!cards[2].has_ended(today()));
        assert!(cards[2].needs_detail());
    }

    #[test]
    fn detail_page_fills_missing_date_and_image() {
        let mut card = cards().remove(2);
        enrich_from_detail(
            SITE,
            &mut card,
            &fixture("focus-groups/detail.html"),
            "https://focusgroups.org/category/product-testing/kitchen-gadget",
            today(),
        )
        .unwrap();
        assert_eq!(card.listing.date_posted, "Mar 20–22, 2026");
        assert_eq!(card.listing.image_url, "https://cdn.focusgroups.org/gadget-1200.jpg");
        assert!(!card.needs_detail());
    }

    #[test]
    fn payout_formatting() {
        assert_eq!(normalize_payout("$75 - $1,150"), "$1,150");
        assert_eq!(normalize_payout("Earn $12.50 today"), "$12.50");
        assert_eq!(normalize_payout("No cash, gift card"), "");
        assert_eq!(format_dollars(1_234_567.0), "$1,234,567");
    }

    #[test]
    fn method_names() {
        assert_eq!(pretty_method("survey-panels"), "Survey");
        assert_eq!(pretty_method("taste-tests"), "Taste Tests");
        assert_eq!(pretty_method(""), "");
        assert_eq!(method_slug("/category/diary-studies/abc"), "diary-studies");
        assert_eq!(method_slug("/other/diary-studies"), "");
    }

    #[test]
    fn srcset_prefers_widest_candidate() {
        assert_eq!(
            best_srcset("a.jpg 300w, b.jpg 1200w, c.jpg 600w"),
            Some((1200, "b.jpg"))
        );
        assert_eq!(best_srcset("only.jpg"), Some((0, "only.jpg")));
        assert_eq!(best_srcset(""), None);
    }
}
