//! Catalog core: item model, run-scoped dedup state and crawl rules.
mod item;
mod listing;
mod rate_limit;
mod run_state;

pub use item::{EnrichedItem, ListingItem, MediaKind};
pub use listing::{ListingSource, ListingSourceError, PAGE_PLACEHOLDER};
pub use rate_limit::{domain_matches, RateLimitRule};
pub use run_state::RunState;
