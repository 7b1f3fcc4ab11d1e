//! Harvest engine: fetching, rate limiting, extraction, enrichment and storage.
mod decode;
mod enrich;
mod extract;
mod fetch;
mod limiter;
mod persist;
mod pipeline;
mod store;
mod types;

pub use decode::{decode_html, DecodeError, DecodedHtml};
pub use enrich::{DetailEnricher, EmbedPatternLocator, EnrichError, PlaybackLocator, DEFAULT_EMBED_HOST};
pub use extract::{ListingExtractor, ListingSelectors, PostListingExtractor, SelectorError};
pub use fetch::{FetchSettings, Fetcher, ReqwestFetcher};
pub use limiter::{DomainLimiter, DomainPermit, ThrottledFetcher};
pub use persist::{ensure_data_dir, AtomicFileWriter, PersistError};
pub use pipeline::{CrawlError, CrawlJob, Harvester, PipelineSettings};
pub use store::{CatalogStore, Clock, JsonFileStore, MemoryStore, StoreError};
pub use types::{FailureKind, FetchError, FetchMetadata, FetchOutput};
