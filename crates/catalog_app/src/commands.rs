use std::io::{self, Write};
use std::sync::Arc;

use anyhow::Context;
use catalog_core::{EnrichedItem, MediaKind};
use catalog_engine::{
    CatalogStore, Clock, EmbedPatternLocator, Fetcher, Harvester, JsonFileStore,
    PostListingExtractor, ReqwestFetcher,
};
use catalog_logging::{harvest_info, harvest_warn};
use chrono::{SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::HarvestConfig;

fn utc_clock() -> Clock {
    Arc::new(|| Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn open_store(config: &HarvestConfig, kind: MediaKind) -> anyhow::Result<JsonFileStore> {
    JsonFileStore::open(&config.data_dir, kind, utc_clock())
        .with_context(|| format!("opening {} store in {}", kind, config.data_dir.display()))
}

/// Crawl each kind in turn and append what was found. Ctrl-C stops dispatching
/// new requests; whatever was accepted so far is still stored.
pub(crate) async fn crawl(config: &HarvestConfig, kinds: &[MediaKind]) -> anyhow::Result<()> {
    let fetcher: Arc<dyn Fetcher> = Arc::new(ReqwestFetcher::new(config.fetch_settings()?)?);
    let extractor = Arc::new(PostListingExtractor::new(config.selectors.clone())?);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            harvest_warn!("Interrupt received, stopping after in-flight requests");
            trigger.cancel();
        }
    });

    for &kind in kinds {
        if cancel.is_cancelled() {
            break;
        }
        let store = open_store(config, kind)?;
        let job = config.crawl_job(kind)?;
        let locator = EmbedPatternLocator::for_kind(kind, &config.embed_host)
            .context("building playback pattern")?;
        let harvester = Harvester::new(fetcher.clone(), extractor.clone(), Arc::new(locator))
            .with_settings(config.pipeline_settings());

        let items = harvester
            .run_until_cancelled(&store, &job, cancel.clone())
            .await
            .with_context(|| format!("crawling {kind}"))?;

        if items.is_empty() {
            harvest_info!("No new {} to insert", kind);
            continue;
        }
        let inserted = store
            .insert_batch(&items)
            .await
            .with_context(|| format!("storing new {kind}"))?;
        harvest_info!("Inserted {} new {}", inserted, kind);
    }
    Ok(())
}

pub(crate) async fn search(
    config: &HarvestConfig,
    kinds: &[MediaKind],
    query: &str,
) -> anyhow::Result<()> {
    anyhow::ensure!(!query.trim().is_empty(), "search query is required");
    let mut out = io::stdout().lock();
    for &kind in kinds {
        let items = open_store(config, kind)?.search_by_title(query).await?;
        harvest_info!("{} {} match `{}`", items.len(), kind, query);
        write_json_lines(&mut out, &items)?;
    }
    Ok(())
}

pub(crate) async fn list(config: &HarvestConfig, kinds: &[MediaKind]) -> anyhow::Result<()> {
    let mut out = io::stdout().lock();
    for &kind in kinds {
        let items = open_store(config, kind)?.all_items().await?;
        write_json_lines(&mut out, &items)?;
    }
    Ok(())
}

fn write_json_lines(out: &mut impl Write, items: &[EnrichedItem]) -> anyhow::Result<()> {
    for item in items {
        serde_json::to_writer(&mut *out, item)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}
