use std::sync::Arc;

use catalog_core::{EnrichedItem, ListingItem, MediaKind};
use regex::Regex;

use crate::{decode_html, DecodeError, FetchError, Fetcher};

/// Embedded player host used by the reference site.
pub const DEFAULT_EMBED_HOST: &str = "vidsrc.me";

/// Finds the playback URL inside a detail page body.
pub trait PlaybackLocator: Send + Sync {
    fn locate(&self, body: &str) -> Option<String>;
}

/// Matches a lazy-loaded player URL such as
/// `data-lazy="https://vidsrc.me/embed/movie?imdb=tt0111161"`.
#[derive(Debug, Clone)]
pub struct EmbedPatternLocator {
    pattern: Regex,
}

impl EmbedPatternLocator {
    /// The pattern must have one capture group holding the URL.
    pub fn from_pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn for_kind(kind: MediaKind, embed_host: &str) -> Result<Self, regex::Error> {
        let pattern = format!(
            r#"data-lazy="(https://{host}/embed/{segment}\?imdb=tt\d+)""#,
            host = regex::escape(embed_host),
            segment = kind.embed_segment(),
        );
        Self::from_pattern(&pattern)
    }
}

impl PlaybackLocator for EmbedPatternLocator {
    fn locate(&self, body: &str) -> Option<String> {
        self.pattern
            .captures(body)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .filter(|url| !url.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnrichError {
    #[error("detail fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("detail page undecodable: {0}")]
    Decode(#[from] DecodeError),
    #[error("no playback url on detail page {link}")]
    NotFound { link: String },
}

/// Follows a candidate's detail link and attaches the playback URL.
#[derive(Clone)]
pub struct DetailEnricher {
    fetcher: Arc<dyn Fetcher>,
    locator: Arc<dyn PlaybackLocator>,
}

impl DetailEnricher {
    pub fn new(fetcher: Arc<dyn Fetcher>, locator: Arc<dyn PlaybackLocator>) -> Self {
        Self { fetcher, locator }
    }

    /// One GET, no retry. Any failure discards the candidate.
    pub async fn enrich(
        &self,
        item: ListingItem,
        referer: Option<&str>,
    ) -> Result<EnrichedItem, EnrichError> {
        let output = self.fetcher.fetch(&item.link, referer).await?;
        let decoded = decode_html(&output.bytes, output.metadata.content_type.as_deref())?;
        let link = item.link.clone();
        self.locator
            .locate(&decoded.html)
            .and_then(|video_url| EnrichedItem::new(item, video_url))
            .ok_or(EnrichError::NotFound { link })
    }
}
