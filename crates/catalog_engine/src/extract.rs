use std::sync::LazyLock;

use catalog_core::ListingItem;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

static YEAR_IN_PARENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((\d{4})\)").expect("year pattern is valid"));

/// Turns one listing page into candidate items.
pub trait ListingExtractor: Send + Sync {
    fn extract(&self, html: &str, page_url: &str) -> Vec<ListingItem>;
}

/// CSS selectors describing where each field lives inside a listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingSelectors {
    pub entry: String,
    pub primary_anchor: String,
    pub secondary_anchor: String,
    pub year_label: String,
    pub image: String,
    /// Attribute holding the deferred image URL; preferred over `src`.
    pub lazy_image_attribute: String,
}

impl Default for ListingSelectors {
    fn default() -> Self {
        Self {
            entry: "div.post.post-t1".to_string(),
            primary_anchor: "a.post-link.post-title-primary".to_string(),
            secondary_anchor: "a.post-link.post-title-secondary".to_string(),
            year_label: "div.yearshort > span.left".to_string(),
            image: "div.post-image-wrapper img.post-image".to_string(),
            lazy_image_attribute: "data-lazy".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid selector `{selector}`: {message}")]
pub struct SelectorError {
    pub selector: String,
    pub message: String,
}

/// Extractor for "post card" listings: one entry per `entry` match, with a
/// primary anchor carrying title and link and a secondary anchor carrying the
/// alternate title and `(YYYY)`.
#[derive(Debug, Clone)]
pub struct PostListingExtractor {
    entry: Selector,
    primary_anchor: Selector,
    secondary_anchor: Selector,
    year_label: Selector,
    image: Selector,
    lazy_image_attribute: String,
}

impl PostListingExtractor {
    pub fn new(selectors: ListingSelectors) -> Result<Self, SelectorError> {
        Ok(Self {
            entry: parse_selector(&selectors.entry)?,
            primary_anchor: parse_selector(&selectors.primary_anchor)?,
            secondary_anchor: parse_selector(&selectors.secondary_anchor)?,
            year_label: parse_selector(&selectors.year_label)?,
            image: parse_selector(&selectors.image)?,
            lazy_image_attribute: selectors.lazy_image_attribute,
        })
    }

    fn extract_entry(&self, entry: ElementRef, base: Option<&Url>) -> Option<ListingItem> {
        let primary = entry.select(&self.primary_anchor).next();
        let link = primary
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| resolve_url(href, base))?;
        let title = primary
            .and_then(|a| a.value().attr("title"))
            .unwrap_or_default()
            .to_string();

        let secondary = entry.select(&self.secondary_anchor).next();
        let secondary_title = secondary
            .and_then(|a| a.value().attr("title"))
            .unwrap_or_default()
            .to_string();
        let secondary_text = secondary
            .map(|a| a.text().collect::<String>())
            .unwrap_or_default();

        let year = match YEAR_IN_PARENS.captures(&secondary_text) {
            Some(caps) => caps[1].to_string(),
            None => entry
                .select(&self.year_label)
                .next()
                .map(|label| label.text().collect::<String>().trim().to_string())
                .unwrap_or_default(),
        };

        let image_url = entry
            .select(&self.image)
            .next()
            .and_then(|img| {
                img.value()
                    .attr(&self.lazy_image_attribute)
                    .or_else(|| img.value().attr("src"))
            })
            .and_then(|src| resolve_url(src, base))
            .unwrap_or_default();

        Some(ListingItem {
            title,
            secondary_title,
            year,
            link,
            image_url,
        })
    }
}

impl Default for PostListingExtractor {
    fn default() -> Self {
        Self::new(ListingSelectors::default()).expect("default listing selectors are valid")
    }
}

impl ListingExtractor for PostListingExtractor {
    fn extract(&self, html: &str, page_url: &str) -> Vec<ListingItem> {
        let document = Html::parse_document(html);
        let base = Url::parse(page_url).ok();
        document
            .select(&self.entry)
            .filter_map(|entry| self.extract_entry(entry, base.as_ref()))
            .collect()
    }
}

fn parse_selector(selector: &str) -> Result<Selector, SelectorError> {
    Selector::parse(selector).map_err(|err| SelectorError {
        selector: selector.to_string(),
        message: err.to_string(),
    })
}

/// Resolve `reference` against `base`. Fragments, bare queries and
/// `javascript:` links are not items and resolve to `None`.
fn resolve_url(reference: &str, base: Option<&Url>) -> Option<String> {
    let trimmed = reference.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with('#') || lower.starts_with("javascript:") {
        return None;
    }
    if let Ok(url) = Url::parse(trimmed) {
        return Some(url.into());
    }
    base.and_then(|base| base.join(trimmed).ok()).map(Into::into)
}
