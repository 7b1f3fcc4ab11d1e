//! Crawl-dedup-enrich pipeline.
//!
//! A run is three stages joined by bounded channels:
//!
//! 1. page stage: one visit per listing URL, at most the rule's parallelism
//!    dispatched at a time so detail fetches interleave with listing fetches;
//! 2. extraction stage: listing markup into candidates, dropping links that
//!    are already known;
//! 3. enrichment stage: a bounded pool following each candidate's detail link.
//!
//! Every outbound request goes through the same [`DomainLimiter`], so the
//! domain's parallelism ceiling covers listing and detail fetches together.
//! Page and item failures are logged and absorbed; only store failures during
//! the precondition checks abort a run.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use catalog_core::{
    EnrichedItem, ListingItem, ListingSource, ListingSourceError, MediaKind, RateLimitRule,
    RunState,
};
use catalog_logging::{harvest_debug, harvest_info, harvest_warn};
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    decode_html, CatalogStore, DecodeError, DetailEnricher, DomainLimiter, EnrichError,
    FailureKind, FetchError, Fetcher, ListingExtractor, PlaybackLocator, StoreError,
    ThrottledFetcher,
};

#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error("store precondition failed: {0}")]
    Store(#[from] StoreError),
    #[error("bad listing source: {0}")]
    Source(#[from] ListingSourceError),
}

/// What to crawl.
#[derive(Debug, Clone)]
pub struct CrawlJob {
    pub kind: MediaKind,
    pub source: ListingSource,
    pub rule: RateLimitRule,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Fetched listing pages waiting for extraction.
    pub page_buffer: usize,
    /// Candidates waiting for enrichment.
    pub candidate_buffer: usize,
    /// Concurrent detail fetches; `None` uses the rule's parallelism.
    pub enrich_concurrency: Option<usize>,
    /// Return an empty result without crawling when the store already has items.
    pub skip_when_populated: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            page_buffer: 16,
            candidate_buffer: 64,
            enrich_concurrency: None,
            skip_when_populated: true,
        }
    }
}

struct FetchedPage {
    url: String,
    html: String,
}

struct Candidate {
    item: ListingItem,
    listing_url: String,
}

#[derive(Debug, Default)]
struct RunCounters {
    pages_ok: AtomicUsize,
    pages_failed: AtomicUsize,
    rate_limited: AtomicUsize,
    candidates: AtomicUsize,
    skipped_known: AtomicUsize,
    enrich_failed: AtomicUsize,
    no_playback: AtomicUsize,
    duplicates: AtomicUsize,
}

impl RunCounters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Relaxed)
    }
}

pub struct Harvester {
    fetcher: Arc<dyn Fetcher>,
    extractor: Arc<dyn ListingExtractor>,
    locator: Arc<dyn PlaybackLocator>,
    settings: PipelineSettings,
}

impl Harvester {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        extractor: Arc<dyn ListingExtractor>,
        locator: Arc<dyn PlaybackLocator>,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            locator,
            settings: PipelineSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run to completion. Returns the newly accepted items, in no particular order.
    pub async fn run(
        &self,
        store: &dyn CatalogStore,
        job: &CrawlJob,
    ) -> Result<Vec<EnrichedItem>, CrawlError> {
        self.run_until_cancelled(store, job, CancellationToken::new())
            .await
    }

    /// Like [`Harvester::run`], but stops dispatching work once `cancel` fires and
    /// returns what was accepted so far.
    pub async fn run_until_cancelled(
        &self,
        store: &dyn CatalogStore,
        job: &CrawlJob,
        cancel: CancellationToken,
    ) -> Result<Vec<EnrichedItem>, CrawlError> {
        if self.settings.skip_when_populated && store.has_existing_items().await? {
            harvest_info!("{} already harvested, skipping crawl", job.kind);
            return Ok(Vec::new());
        }
        let existing = store.existing_links().await?;
        let page_urls = job.source.page_urls()?;
        harvest_info!(
            "Crawling {} listing pages for {} ({} links already stored)",
            page_urls.len(),
            job.kind,
            existing.len()
        );

        let state = RunState::seeded(existing);
        let limiter = Arc::new(DomainLimiter::new(vec![job.rule.clone()]));
        let fetcher = ThrottledFetcher::new(self.fetcher.clone(), limiter.clone());
        let enricher = DetailEnricher::new(Arc::new(fetcher.clone()), self.locator.clone());
        let counters = RunCounters::default();

        let (page_tx, page_rx) = mpsc::channel(self.settings.page_buffer.max(1));
        let (candidate_tx, candidate_rx) = mpsc::channel(self.settings.candidate_buffer.max(1));
        let enrich_limit = self
            .settings
            .enrich_concurrency
            .unwrap_or_else(|| job.rule.parallelism())
            .max(1);

        {
            let stages = async {
                tokio::join!(
                    fetch_pages(
                        &fetcher,
                        page_urls,
                        job.rule.parallelism(),
                        page_tx,
                        &cancel,
                        &counters
                    ),
                    self.extract_candidates(page_rx, candidate_tx, &state, &counters, &cancel),
                    enrich_candidates(
                        candidate_rx,
                        &enricher,
                        &state,
                        enrich_limit,
                        &counters,
                        &cancel
                    ),
                )
            };
            tokio::pin!(stages);
            tokio::select! {
                _ = &mut stages => {}
                _ = cancel.cancelled() => {
                    harvest_warn!("{} crawl cancelled, finishing in-flight work", job.kind);
                    limiter.close();
                    stages.await;
                }
            }
        }

        let accepted = state.accepted_count();
        let items = state.drain();
        harvest_info!(
            "{} crawl finished: {} new, pages ok/failed {}/{} (429: {}), candidates {}, \
             already known {}, enrichment failed {}, no playback url {}, duplicates {}",
            job.kind,
            accepted,
            RunCounters::get(&counters.pages_ok),
            RunCounters::get(&counters.pages_failed),
            RunCounters::get(&counters.rate_limited),
            RunCounters::get(&counters.candidates),
            RunCounters::get(&counters.skipped_known),
            RunCounters::get(&counters.enrich_failed),
            RunCounters::get(&counters.no_playback),
            RunCounters::get(&counters.duplicates),
        );
        Ok(items)
    }

    async fn extract_candidates(
        &self,
        mut page_rx: mpsc::Receiver<FetchedPage>,
        candidate_tx: mpsc::Sender<Candidate>,
        state: &RunState,
        counters: &RunCounters,
        cancel: &CancellationToken,
    ) {
        while let Some(page) = page_rx.recv().await {
            if cancel.is_cancelled() {
                break;
            }
            let items = self.extractor.extract(&page.html, &page.url);
            harvest_debug!("{} listing entries on {}", items.len(), page.url);
            for item in items {
                RunCounters::bump(&counters.candidates);
                harvest_info!("Found: {} ({})", item.title, item.year);
                if state.contains(item.dedup_key()) {
                    RunCounters::bump(&counters.skipped_known);
                    continue;
                }
                let candidate = Candidate {
                    item,
                    listing_url: page.url.clone(),
                };
                if candidate_tx.send(candidate).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn fetch_pages(
    fetcher: &dyn Fetcher,
    page_urls: Vec<String>,
    limit: usize,
    page_tx: mpsc::Sender<FetchedPage>,
    cancel: &CancellationToken,
    counters: &RunCounters,
) {
    // Unbounded dispatch would queue every page on the domain gate ahead of
    // the first detail fetch.
    stream::iter(page_urls)
        .for_each_concurrent(limit, |url| {
            let page_tx = page_tx.clone();
            async move {
                if cancel.is_cancelled() {
                    return;
                }
                match fetch_page(fetcher, &url).await {
                    Ok(html) => {
                        RunCounters::bump(&counters.pages_ok);
                        let _ = page_tx.send(FetchedPage { url, html }).await;
                    }
                    Err(PageFailure::Fetch(err)) if err.kind == FailureKind::Cancelled => {}
                    Err(PageFailure::Fetch(err)) => {
                        RunCounters::bump(&counters.pages_failed);
                        if err.is_rate_limited() {
                            RunCounters::bump(&counters.rate_limited);
                            harvest_warn!("Error 429 on {}, skipping...", url);
                        } else {
                            harvest_warn!("Request to {} failed: {}", url, err);
                        }
                    }
                    Err(PageFailure::Decode(err)) => {
                        RunCounters::bump(&counters.pages_failed);
                        harvest_warn!("Listing page {} undecodable: {}", url, err);
                    }
                }
            }
        })
        .await;
}

enum PageFailure {
    Fetch(FetchError),
    Decode(DecodeError),
}

async fn fetch_page(fetcher: &dyn Fetcher, url: &str) -> Result<String, PageFailure> {
    harvest_debug!("Dispatching listing page {}", url);
    let output = fetcher.fetch(url, None).await.map_err(PageFailure::Fetch)?;
    let decoded = decode_html(&output.bytes, output.metadata.content_type.as_deref())
        .map_err(PageFailure::Decode)?;
    Ok(decoded.html)
}

async fn enrich_candidates(
    candidate_rx: mpsc::Receiver<Candidate>,
    enricher: &DetailEnricher,
    state: &RunState,
    limit: usize,
    counters: &RunCounters,
    cancel: &CancellationToken,
) {
    let candidates = stream::unfold(candidate_rx, |mut rx| async move {
        rx.recv().await.map(|candidate| (candidate, rx))
    });
    candidates
        .for_each_concurrent(limit, |candidate| async move {
            if cancel.is_cancelled() {
                return;
            }
            // Another worker may have accepted the same link since extraction.
            if state.contains(candidate.item.dedup_key()) {
                RunCounters::bump(&counters.skipped_known);
                return;
            }
            let title = candidate.item.title.clone();
            match enricher
                .enrich(candidate.item, Some(&candidate.listing_url))
                .await
            {
                Ok(item) => {
                    if !state.accept(item) {
                        RunCounters::bump(&counters.duplicates);
                    }
                }
                Err(EnrichError::NotFound { link }) => {
                    RunCounters::bump(&counters.no_playback);
                    harvest_warn!("Warning: could not get video URL for {} ({})", title, link);
                }
                Err(err) => {
                    RunCounters::bump(&counters.enrich_failed);
                    if matches!(&err, EnrichError::Fetch(fetch) if fetch.is_rate_limited()) {
                        RunCounters::bump(&counters.rate_limited);
                    }
                    harvest_warn!("Warning: could not get video URL for {}: {}", title, err);
                }
            }
        })
        .await;
}
