use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use catalog_core::{ListingSource, MediaKind, RateLimitRule};
use catalog_engine::{
    CrawlJob, FetchSettings, ListingSelectors, PipelineSettings, DEFAULT_EMBED_HOST,
};
use catalog_logging::LogDestination;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path:?}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("dns override for `{host}` has invalid address `{address}`")]
    DnsOverride { host: String, address: String },
    #[error("listing template `{0}` has no host")]
    NoHost(String),
}

/// Everything the CLI needs, read from a RON file. Every field has a default,
/// so an empty file (or no file) crawls the reference site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub data_dir: PathBuf,
    pub log: LogDestination,
    pub log_file: Option<PathBuf>,
    pub embed_host: String,
    pub selectors: ListingSelectors,
    pub fetch: FetchConfig,
    pub pipeline: PipelineConfig,
    pub movies: SourceConfig,
    pub shows: SourceConfig,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            log: LogDestination::Terminal,
            log_file: None,
            embed_host: DEFAULT_EMBED_HOST.to_string(),
            selectors: ListingSelectors::default(),
            fetch: FetchConfig::default(),
            pipeline: PipelineConfig::default(),
            movies: SourceConfig {
                url_template: "https://mykadri.tv/filmebi_qartulad/page/{page}/".to_string(),
                first_page: 1,
                page_count: 332,
                domain_pattern: None,
                max_parallelism: 2,
                min_delay_ms: 500,
                jitter_ms: 200,
            },
            shows: SourceConfig {
                url_template: "https://mykadri.tv/serialebi_qartulad/page/{page}/".to_string(),
                first_page: 1,
                page_count: 38,
                domain_pattern: None,
                max_parallelism: 1,
                min_delay_ms: 2000,
                jitter_ms: 500,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub redirect_limit: usize,
    pub max_bytes: u64,
    /// Empty keeps the built-in desktop browser pool.
    pub user_agents: Vec<String>,
    pub accept_language: Option<String>,
    pub dns_overrides: Vec<DnsOverride>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        let settings = FetchSettings::default();
        Self {
            connect_timeout_ms: settings.connect_timeout.as_millis() as u64,
            request_timeout_ms: settings.request_timeout.as_millis() as u64,
            redirect_limit: settings.redirect_limit,
            max_bytes: settings.max_bytes,
            user_agents: Vec::new(),
            accept_language: None,
            dns_overrides: Vec::new(),
        }
    }
}

/// `host` is resolved to `address` (`ip:port`) instead of asking system DNS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsOverride {
    pub host: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub page_buffer: usize,
    pub candidate_buffer: usize,
    pub enrich_concurrency: Option<usize>,
    pub skip_when_populated: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let settings = PipelineSettings::default();
        Self {
            page_buffer: settings.page_buffer,
            candidate_buffer: settings.candidate_buffer,
            enrich_concurrency: settings.enrich_concurrency,
            skip_when_populated: settings.skip_when_populated,
        }
    }
}

/// One listing and the politeness rule for its domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub url_template: String,
    #[serde(default = "default_first_page")]
    pub first_page: u32,
    pub page_count: u32,
    /// Defaults to the template's host.
    #[serde(default)]
    pub domain_pattern: Option<String>,
    pub max_parallelism: usize,
    #[serde(default)]
    pub min_delay_ms: u64,
    #[serde(default)]
    pub jitter_ms: u64,
}

fn default_first_page() -> u32 {
    1
}

impl HarvestConfig {
    /// Read `path`, or return the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        ron::from_str(content).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    pub fn source(&self, kind: MediaKind) -> &SourceConfig {
        match kind {
            MediaKind::Movie => &self.movies,
            MediaKind::Show => &self.shows,
        }
    }

    pub fn fetch_settings(&self) -> Result<FetchSettings, ConfigError> {
        let defaults = FetchSettings::default();
        let dns_overrides = self
            .fetch
            .dns_overrides
            .iter()
            .map(|entry| {
                entry
                    .address
                    .parse::<SocketAddr>()
                    .map(|addr| (entry.host.clone(), addr))
                    .map_err(|_| ConfigError::DnsOverride {
                        host: entry.host.clone(),
                        address: entry.address.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(FetchSettings {
            connect_timeout: Duration::from_millis(self.fetch.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.fetch.request_timeout_ms),
            redirect_limit: self.fetch.redirect_limit,
            max_bytes: self.fetch.max_bytes,
            user_agents: if self.fetch.user_agents.is_empty() {
                defaults.user_agents
            } else {
                self.fetch.user_agents.clone()
            },
            accept_language: self
                .fetch
                .accept_language
                .clone()
                .unwrap_or(defaults.accept_language),
            dns_overrides,
            ..defaults
        })
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            page_buffer: self.pipeline.page_buffer,
            candidate_buffer: self.pipeline.candidate_buffer,
            enrich_concurrency: self.pipeline.enrich_concurrency,
            skip_when_populated: self.pipeline.skip_when_populated,
        }
    }

    pub fn crawl_job(&self, kind: MediaKind) -> Result<CrawlJob, ConfigError> {
        let source = self.source(kind);
        let listing = ListingSource {
            url_template: source.url_template.clone(),
            first_page: source.first_page,
            page_count: source.page_count,
        };
        let pattern = match &source.domain_pattern {
            Some(pattern) => pattern.clone(),
            None => template_host(&listing)?,
        };
        let rule = RateLimitRule::new(pattern, source.max_parallelism).with_delay(
            Duration::from_millis(source.min_delay_ms),
            Duration::from_millis(source.jitter_ms),
        );
        Ok(CrawlJob {
            kind,
            source: listing,
            rule,
        })
    }
}

fn template_host(listing: &ListingSource) -> Result<String, ConfigError> {
    Url::parse(&listing.page_url(listing.first_page))
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .ok_or_else(|| ConfigError::NoHost(listing.url_template.clone()))
}
