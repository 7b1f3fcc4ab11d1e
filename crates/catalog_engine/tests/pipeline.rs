use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use catalog_core::{EnrichedItem, ListingItem, ListingSource, MediaKind, RateLimitRule};
use catalog_engine::{
    CatalogStore, CrawlError, CrawlJob, EmbedPatternLocator, FetchError, FetchOutput,
    FetchSettings, Fetcher, Harvester, MemoryStore, PipelineSettings, PostListingExtractor,
    ReqwestFetcher, StoreError, DEFAULT_EMBED_HOST,
};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn listing_html(server: &MockServer, slugs: &[&str]) -> String {
    let entries: String = slugs
        .iter()
        .map(|slug| {
            format!(
                r#"<div class="post post-t1">
                     <a class="post-link post-title-primary" href="{base}/m/{slug}" title="{slug}">{slug}</a>
                     <a class="post-link post-title-secondary" title="{slug} en">{slug} (2020)</a>
                   </div>"#,
                base = server.uri(),
            )
        })
        .collect();
    format!("<html><body>{entries}</body></html>")
}

fn html(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "text/html; charset=utf-8")
}

async fn mount_listing(server: &MockServer, page: u32, slugs: &[&str]) {
    Mock::given(method("GET"))
        .and(path(format!("/list/page/{page}/")))
        .respond_with(html(listing_html(server, slugs)))
        .mount(server)
        .await;
}

async fn mount_detail(server: &MockServer, slug: &str, imdb: Option<u32>) {
    let body = match imdb {
        Some(id) => format!(
            r#"<html><iframe data-lazy="https://vidsrc.me/embed/movie?imdb=tt{id}"></iframe></html>"#
        ),
        None => "<html>no player yet</html>".to_string(),
    };
    Mock::given(method("GET"))
        .and(path(format!("/m/{slug}")))
        .respond_with(html(body))
        .mount(server)
        .await;
}

fn job(server: &MockServer, pages: u32, parallelism: usize) -> CrawlJob {
    CrawlJob {
        kind: MediaKind::Movie,
        source: ListingSource::new(format!("{}/list/page/{{page}}/", server.uri()), pages),
        rule: RateLimitRule::new("127.0.0.1", parallelism)
            .with_delay(Duration::ZERO, Duration::ZERO),
    }
}

fn harvester_with(fetcher: Arc<dyn Fetcher>, settings: PipelineSettings) -> Harvester {
    let locator = EmbedPatternLocator::for_kind(MediaKind::Movie, DEFAULT_EMBED_HOST).unwrap();
    Harvester::new(
        fetcher,
        Arc::new(PostListingExtractor::default()),
        Arc::new(locator),
    )
    .with_settings(settings)
}

fn harvester(settings: PipelineSettings) -> Harvester {
    let fetcher = ReqwestFetcher::new(FetchSettings::default()).unwrap();
    harvester_with(Arc::new(fetcher), settings)
}

fn dedup_mode() -> PipelineSettings {
    PipelineSettings {
        skip_when_populated: false,
        ..PipelineSettings::default()
    }
}

fn stored(link: String) -> EnrichedItem {
    EnrichedItem::new(
        ListingItem {
            title: "known".to_string(),
            link,
            ..ListingItem::default()
        },
        "https://vidsrc.me/embed/movie?imdb=tt1",
    )
    .unwrap()
}

fn sorted_links(items: &[EnrichedItem]) -> Vec<String> {
    let mut links: Vec<String> = items.iter().map(|item| item.link().to_string()).collect();
    links.sort();
    links
}

#[tokio::test]
async fn accepts_only_new_enrichable_candidates() {
    catalog_logging::initialize_for_tests();
    let server = MockServer::start().await;
    mount_listing(&server, 1, &["a", "b", "c"]).await;
    Mock::given(method("GET"))
        .and(path("/m/a"))
        .and(header("referer", format!("{}/list/page/1/", server.uri()).as_str()))
        .respond_with(html(
            r#"<iframe data-lazy="https://vidsrc.me/embed/movie?imdb=tt0000001"></iframe>"#
                .to_string(),
        ))
        .expect(1)
        .mount(&server)
        .await;
    mount_detail(&server, "b", Some(2)).await;
    mount_detail(&server, "c", None).await;

    let store = MemoryStore::with_items(vec![stored(format!("{}/m/b", server.uri()))]);
    let items = harvester(dedup_mode())
        .run(&store, &job(&server, 1, 2))
        .await
        .unwrap();

    assert_eq!(items.len(), 1);
    let item = &items[0];
    assert_eq!(item.link(), format!("{}/m/a", server.uri()));
    assert_eq!(item.listing.title, "a");
    assert_eq!(item.listing.secondary_title, "a en");
    assert_eq!(item.listing.year, "2020");
    assert_eq!(item.video_url, "https://vidsrc.me/embed/movie?imdb=tt0000001");
}

#[tokio::test]
async fn repeated_listings_yield_each_link_once() {
    let server = MockServer::start().await;
    mount_listing(&server, 1, &["a", "b"]).await;
    mount_listing(&server, 2, &["b", "a"]).await;
    mount_listing(&server, 3, &["a", "c"]).await;
    mount_detail(&server, "a", Some(1)).await;
    mount_detail(&server, "b", Some(2)).await;
    mount_detail(&server, "c", Some(3)).await;

    let items = harvester(PipelineSettings::default())
        .run(&MemoryStore::new(), &job(&server, 3, 3))
        .await
        .unwrap();

    let links = sorted_links(&items);
    let unique: HashSet<_> = links.iter().collect();
    assert_eq!(unique.len(), links.len());
    assert_eq!(
        links,
        vec![
            format!("{}/m/a", server.uri()),
            format!("{}/m/b", server.uri()),
            format!("{}/m/c", server.uri()),
        ]
    );
}

#[tokio::test]
async fn second_run_finds_nothing_new() {
    let server = MockServer::start().await;
    mount_listing(&server, 1, &["a", "b"]).await;
    mount_detail(&server, "a", Some(1)).await;
    mount_detail(&server, "b", Some(2)).await;

    let store = MemoryStore::new();
    let first = harvester(PipelineSettings::default())
        .run(&store, &job(&server, 1, 2))
        .await
        .unwrap();
    assert_eq!(first.len(), 2);
    store.insert_batch(&first).await.unwrap();

    let skipped = harvester(PipelineSettings::default())
        .run(&store, &job(&server, 1, 2))
        .await
        .unwrap();
    assert!(skipped.is_empty());

    let deduped = harvester(dedup_mode())
        .run(&store, &job(&server, 1, 2))
        .await
        .unwrap();
    assert!(deduped.is_empty());
}

#[tokio::test]
async fn populated_store_skips_crawl_entirely() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let store = MemoryStore::with_items(vec![stored("https://site.test/m/old".to_string())]);
    let items = harvester(PipelineSettings::default())
        .run(&store, &job(&server, 5, 2))
        .await
        .unwrap();
    assert!(items.is_empty());
}

#[tokio::test]
async fn failed_enrichment_is_dropped_silently() {
    let server = MockServer::start().await;
    mount_listing(&server, 1, &["a", "b"]).await;
    Mock::given(method("GET"))
        .and(path("/m/a"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/m/b"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let items = harvester(PipelineSettings::default())
        .run(&MemoryStore::new(), &job(&server, 1, 2))
        .await
        .unwrap();
    assert!(items.is_empty());
}

#[tokio::test]
async fn failing_page_does_not_stop_others() {
    let server = MockServer::start().await;
    mount_listing(&server, 1, &["a"]).await;
    Mock::given(method("GET"))
        .and(path("/list/page/2/"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/list/page/3/"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;
    mount_listing(&server, 4, &["d"]).await;
    mount_detail(&server, "a", Some(1)).await;
    mount_detail(&server, "d", Some(4)).await;

    let items = harvester(PipelineSettings::default())
        .run(&MemoryStore::new(), &job(&server, 4, 2))
        .await
        .unwrap();
    assert_eq!(
        sorted_links(&items),
        vec![
            format!("{}/m/a", server.uri()),
            format!("{}/m/d", server.uri()),
        ]
    );
}

/// Records how many requests are in flight at once, and when and in which
/// order they started.
struct TrackingFetcher {
    inner: ReqwestFetcher,
    in_flight: Mutex<usize>,
    max_in_flight: Mutex<usize>,
    starts: Mutex<Vec<Instant>>,
    urls: Mutex<Vec<String>>,
}

impl TrackingFetcher {
    fn new() -> Self {
        Self {
            inner: ReqwestFetcher::new(FetchSettings::default()).unwrap(),
            in_flight: Mutex::new(0),
            max_in_flight: Mutex::new(0),
            starts: Mutex::new(Vec::new()),
            urls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl Fetcher for TrackingFetcher {
    async fn fetch(&self, url: &str, referer: Option<&str>) -> Result<FetchOutput, FetchError> {
        self.starts.lock().unwrap().push(Instant::now());
        self.urls.lock().unwrap().push(url.to_string());
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            *in_flight += 1;
            let mut max = self.max_in_flight.lock().unwrap();
            *max = (*max).max(*in_flight);
        }
        let result = self.inner.fetch(url, referer).await;
        *self.in_flight.lock().unwrap() -= 1;
        result
    }
}

#[tokio::test]
async fn domain_parallelism_and_spacing_hold() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(html("<html></html>".to_string()).set_delay(Duration::from_millis(60)))
        .mount(&server)
        .await;

    let tracker = Arc::new(TrackingFetcher::new());
    let mut job = job(&server, 8, 2);
    job.rule = job
        .rule
        .with_delay(Duration::from_millis(20), Duration::from_millis(10));

    let items = harvester_with(tracker.clone(), PipelineSettings::default())
        .run(&MemoryStore::new(), &job)
        .await
        .unwrap();
    assert!(items.is_empty());

    assert_eq!(*tracker.max_in_flight.lock().unwrap(), 2);
    let mut starts = tracker.starts.lock().unwrap().clone();
    assert_eq!(starts.len(), 8);
    starts.sort();
    for pair in starts.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= Duration::from_millis(15), "starts only {gap:?} apart");
    }
}

async fn mount_any_detail(server: &MockServer, delay: Duration) {
    Mock::given(method("GET"))
        .and(path_regex("^/m/"))
        .respond_with(
            html(
                r#"<iframe data-lazy="https://vidsrc.me/embed/movie?imdb=tt0000042"></iframe>"#
                    .to_string(),
            )
            .set_delay(delay),
        )
        .mount(server)
        .await;
}

async fn mount_numbered_listings(server: &MockServer, pages: u32, per_page: usize) {
    for page in 1..=pages {
        let slugs: Vec<String> = (0..per_page).map(|i| format!("p{page}-{i}")).collect();
        let slugs: Vec<&str> = slugs.iter().map(String::as_str).collect();
        mount_listing(server, page, &slugs).await;
    }
}

#[tokio::test]
async fn detail_fetches_interleave_with_listing_pages() {
    let server = MockServer::start().await;
    mount_numbered_listings(&server, 30, 1).await;
    mount_any_detail(&server, Duration::ZERO).await;

    let tracker = Arc::new(TrackingFetcher::new());
    let items = harvester_with(tracker.clone(), PipelineSettings::default())
        .run(&MemoryStore::new(), &job(&server, 30, 1))
        .await
        .unwrap();
    assert_eq!(items.len(), 30);

    let urls = tracker.urls.lock().unwrap().clone();
    assert_eq!(urls.len(), 60);
    let first_detail = urls.iter().position(|url| url.contains("/m/")).unwrap();
    let last_listing = urls.iter().rposition(|url| url.contains("/list/")).unwrap();
    assert!(
        first_detail < last_listing,
        "first detail request at {first_detail}, last listing request at {last_listing}"
    );
}

#[tokio::test]
async fn domain_bound_covers_listing_and_detail_requests() {
    let server = MockServer::start().await;
    mount_numbered_listings(&server, 6, 4).await;
    mount_any_detail(&server, Duration::from_millis(30)).await;

    let tracker = Arc::new(TrackingFetcher::new());
    let settings = PipelineSettings {
        enrich_concurrency: Some(8),
        ..PipelineSettings::default()
    };
    let items = harvester_with(tracker.clone(), settings)
        .run(&MemoryStore::new(), &job(&server, 6, 2))
        .await
        .unwrap();

    assert_eq!(items.len(), 24);
    assert_eq!(tracker.urls.lock().unwrap().len(), 30);
    let max_in_flight = *tracker.max_in_flight.lock().unwrap();
    assert!(max_in_flight <= 2, "{max_in_flight} requests in flight at once");
}

struct UnavailableStore;

#[async_trait::async_trait]
impl CatalogStore for UnavailableStore {
    async fn has_existing_items(&self) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn existing_links(&self) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn insert_batch(&self, _items: &[EnrichedItem]) -> Result<usize, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn search_by_title(&self, _query: &str) -> Result<Vec<EnrichedItem>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn all_items(&self) -> Result<Vec<EnrichedItem>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

#[tokio::test]
async fn store_failure_aborts_before_crawling() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    for settings in [PipelineSettings::default(), dedup_mode()] {
        let err = harvester(settings)
            .run(&UnavailableStore, &job(&server, 2, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::Store(StoreError::Unavailable(_))));
    }
}

#[tokio::test]
async fn bad_template_is_rejected() {
    let server = MockServer::start().await;
    let mut job = job(&server, 2, 1);
    job.source = ListingSource::new(format!("{}/list/", server.uri()), 2);

    let err = harvester(PipelineSettings::default())
        .run(&MemoryStore::new(), &job)
        .await
        .unwrap_err();
    assert!(matches!(err, CrawlError::Source(_)));
}

#[tokio::test]
async fn cancelled_before_start_returns_empty() {
    let server = MockServer::start().await;
    mount_listing(&server, 1, &["a"]).await;
    mount_detail(&server, "a", Some(1)).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let items = harvester(PipelineSettings::default())
        .run_until_cancelled(&MemoryStore::new(), &job(&server, 1, 1), cancel)
        .await
        .unwrap();
    assert!(items.is_empty());
}

#[tokio::test]
async fn cancel_mid_run_stops_pending_pages() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(html("<html></html>".to_string()).set_delay(Duration::from_millis(200)))
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let begin = Instant::now();
    let items = harvester(PipelineSettings::default())
        .run_until_cancelled(&MemoryStore::new(), &job(&server, 20, 1), cancel)
        .await
        .unwrap();
    assert!(items.is_empty());
    // Only the one in-flight page is waited for.
    assert!(begin.elapsed() < Duration::from_secs(2));
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
}
