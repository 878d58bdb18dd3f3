//! Boards that ship their project list as a Next.js `__NEXT_DATA__` payload.

use async_trait::async_trait;
use prsf_core::RawListing;
use scraper::Html;
use serde_json::Value as JsonValue;
use tracing::info;
use url::Url;

use crate::{absolutize, render_page, selector, urls_or_default, AdapterError, FetchContext, SourceAdapter};

pub const DEFAULT_LIST_URL: &str = "https://respondent.io/research-projects";

const RESULTS_PATH: [&str; 4] = ["props", "pageProps", "pageData", "results"];

pub struct NextDataAdapter {
    site: String,
    listing_urls: Vec<String>,
}

impl NextDataAdapter {
    pub fn new(site: &str, listing_urls: &[String]) -> Self {
        Self {
            site: site.to_string(),
            listing_urls: urls_or_default(listing_urls, DEFAULT_LIST_URL),
        }
    }
}

#[async_trait]
impl SourceAdapter for NextDataAdapter {
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
            listings.extend(parse_next_data(&self.site, &html, url)?);
        }
        info!(site = %self.site, count = listings.len(), "scraped listings");
        Ok(listings)
    }
}

/// Extracts projects from the page's `__NEXT_DATA__` script.
///
/// A page without the script (or with invalid JSON in it) is unparsable; a
/// payload whose results path is missing simply yields no listings.
pub fn parse_next_data(site: &str, html: &str, base_url: &str) -> Result<Vec<RawListing>, AdapterError> {
    let payload = {
        let document = Html::parse_document(html);
        let script_sel = selector(site, "script#__NEXT_DATA__")?;
        document
            .select(&script_sel)
            .next()
            .map(|s| s.text().collect::<String>())
            .ok_or_else(|| AdapterError::parse(site, "missing __NEXT_DATA__ script"))?
    };
    let value: JsonValue = serde_json::from_str(&payload)
        .map_err(|e| AdapterError::parse(site, format!("invalid __NEXT_DATA__ JSON: {e}")))?;

    let base = Url::parse(base_url).ok();
    let Some(projects) = json_path(&value, &RESULTS_PATH).and_then(JsonValue::as_array) else {
        return Ok(Vec::new());
    };

    Ok(projects
        .iter()
        .filter(|p| p.is_object())
        .filter_map(|project| {
            let title = first_string(project, &["name", "title"])?;
            let link = first_string(project, &["public_url", "url"])
                .and_then(|href| absolutize(base.as_ref(), &href))?;
            Some(RawListing {
                site: site.to_string(),
                title,
                link,
                payout: first_string(project, &["reward"]).unwrap_or_default(),
                date_posted: first_string(project, &["published_at"]).unwrap_or_default(),
                location: first_string(project, &["location"]).unwrap_or_else(|| "Remote".to_string()),
                method: first_string(project, &["method"]).unwrap_or_default(),
                description: first_string(project, &["description"]).unwrap_or_default(),
                image_url: String::new(),
            })
        })
        .collect())
}

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

/// First non-blank value among `keys`, numbers rendered as text.
fn first_string(value: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        let text = match value.get(*key)? {
            JsonValue::String(s) => s.trim().to_string(),
            JsonValue::Number(n) => n.to_string(),
            _ => return None,
        };
        (!text.is_empty()).then_some(text)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture;

    const BASE: &str = "https://respondent.io/research-projects";

    #[test]
    fn projects_are_read_from_next_data() {
        let listings = parse_next_data("Respondent", &fixture("next-data/listing.html"), BASE).unwrap();
        assert_eq!(listings.len(), 2);

        let first = &listings[0];
        assert_eq!(first.title, "Cloud cost tooling for platform engineers");
        assert_eq!(first.link, "https://respondent.io/p/cloud-cost-tooling");
        assert_eq!(first.payout, "250");
        assert_eq!(first.method, "Remote interview");
        assert_eq!(first.location, "Remote");
        assert_eq!(first.date_posted, "2026-02-27T16:00:00Z");

        let second = &listings[1];
        assert_eq!(second.title, "Nurses on shift scheduling");
        assert_eq!(second.link, "https://respondent.io/projects/view/nurse-shifts");
        assert_eq!(second.payout, "$150");
        assert_eq!(second.location, "Boston, MA");
    }

    #[test]
    fn missing_script_is_a_parse_error() {
        let err = parse_next_data("Respondent", "<html><body>blocked</body></html>", BASE).unwrap_err();
        assert!(matches!(err, AdapterError::Parse { .. }));
    }

    #[test]
    fn missing_results_path_yields_nothing() {
        let html = r#"<script id="__NEXT_DATA__" type="application/json">{"props":{"pageProps":{}}}</script>"#;
        assert!(parse_next_data("Respondent", html, BASE).unwrap().is_empty());
    }
}
