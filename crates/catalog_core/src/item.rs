use std::fmt;

use serde::{Deserialize, Serialize};

/// Which listing a crawl targets. Selects the source pages and the playback pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Movie,
    Show,
}

impl MediaKind {
    pub const ALL: [MediaKind; 2] = [MediaKind::Movie, MediaKind::Show];

    /// Collection name used by stores (`movies`, `shows`).
    pub fn collection(self) -> &'static str {
        match self {
            MediaKind::Movie => "movies",
            MediaKind::Show => "shows",
        }
    }

    /// Path segment of the embedded player for this kind.
    pub fn embed_segment(self) -> &'static str {
        match self {
            MediaKind::Movie => "movie",
            MediaKind::Show => "tv",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

/// One listing entry as found on a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListingItem {
    pub title: String,
    #[serde(rename = "titleEnglish", default)]
    pub secondary_title: String,
    #[serde(default)]
    pub year: String,
    /// Absolute detail link; also the dedup key.
    pub link: String,
    #[serde(rename = "image", default)]
    pub image_url: String,
}

impl ListingItem {
    pub fn dedup_key(&self) -> &str {
        &self.link
    }
}

/// A listing entry that survived enrichment. `video_url` is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedItem {
    #[serde(flatten)]
    pub listing: ListingItem,
    #[serde(rename = "videoUrl")]
    pub video_url: String,
}

impl EnrichedItem {
    /// Returns `None` when `video_url` is blank.
    pub fn new(listing: ListingItem, video_url: impl Into<String>) -> Option<Self> {
        let video_url = video_url.into();
        if video_url.trim().is_empty() {
            return None;
        }
        Some(Self { listing, video_url })
    }

    pub fn link(&self) -> &str {
        &self.listing.link
    }

    pub fn title(&self) -> &str {
        &self.listing.title
    }
}
