use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use catalog_core::{EnrichedItem, MediaKind};
use catalog_logging::harvest_info;
use serde::{Deserialize, Serialize};

use crate::persist::{ensure_data_dir, AtomicFileWriter, PersistError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("failed to read {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("collection file {path:?} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },
    #[error("failed to encode collection: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("persist error: {0}")]
    Persist(#[from] PersistError),
}

/// Persistent collection of enriched items for one media kind.
#[async_trait::async_trait]
pub trait CatalogStore: Send + Sync {
    async fn has_existing_items(&self) -> Result<bool, StoreError>;
    async fn existing_links(&self) -> Result<Vec<String>, StoreError>;
    /// Append `items`; returns how many were written.
    async fn insert_batch(&self, items: &[EnrichedItem]) -> Result<usize, StoreError>;
    /// Case-insensitive substring match on title or secondary title. A blank query matches nothing.
    async fn search_by_title(&self, query: &str) -> Result<Vec<EnrichedItem>, StoreError>;
    async fn all_items(&self) -> Result<Vec<EnrichedItem>, StoreError>;
}

fn matches_title(item: &EnrichedItem, needle: &str) -> bool {
    item.listing.title.to_lowercase().contains(needle)
        || item.listing.secondary_title.to_lowercase().contains(needle)
}

fn search(items: &[EnrichedItem], query: &str) -> Vec<EnrichedItem> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }
    items
        .iter()
        .filter(|item| matches_title(item, &needle))
        .cloned()
        .collect()
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<Vec<EnrichedItem>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: Vec<EnrichedItem>) -> Self {
        Self {
            items: Mutex::new(items),
        }
    }

    fn snapshot(&self) -> Vec<EnrichedItem> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait::async_trait]
impl CatalogStore for MemoryStore {
    async fn has_existing_items(&self) -> Result<bool, StoreError> {
        Ok(!self.snapshot().is_empty())
    }

    async fn existing_links(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.snapshot().iter().map(|i| i.link().to_string()).collect())
    }

    async fn insert_batch(&self, items: &[EnrichedItem]) -> Result<usize, StoreError> {
        let mut guard = self
            .items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.extend_from_slice(items);
        Ok(items.len())
    }

    async fn search_by_title(&self, query: &str) -> Result<Vec<EnrichedItem>, StoreError> {
        Ok(search(&self.snapshot(), query))
    }

    async fn all_items(&self) -> Result<Vec<EnrichedItem>, StoreError> {
        Ok(self.snapshot())
    }
}

/// Timestamp source for `updated_utc`.
pub type Clock = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Debug, Serialize, Deserialize)]
struct CollectionFile {
    collection: String,
    #[serde(default)]
    updated_utc: String,
    #[serde(default)]
    items: Vec<EnrichedItem>,
}

/// One JSON document per media kind, e.g. `{dir}/movies.json`.
pub struct JsonFileStore {
    dir: PathBuf,
    kind: MediaKind,
    clock: Clock,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    pub fn open(dir: impl Into<PathBuf>, kind: MediaKind, clock: Clock) -> Result<Self, StoreError> {
        let dir = dir.into();
        ensure_data_dir(&dir)?;
        Ok(Self {
            dir,
            kind,
            clock,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    fn filename(&self) -> String {
        format!("{}.json", self.kind.collection())
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(self.filename())
    }

    fn load(&self) -> Result<Vec<EnrichedItem>, StoreError> {
        let path = self.path();
        let content = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Read { path, source }),
        };
        let file: CollectionFile = serde_json::from_slice(&content).map_err(|err| {
            StoreError::Corrupt {
                path: path.clone(),
                message: err.to_string(),
            }
        })?;
        if file.collection != self.kind.collection() {
            return Err(StoreError::Corrupt {
                path,
                message: format!(
                    "holds collection `{}`, expected `{}`",
                    file.collection,
                    self.kind.collection()
                ),
            });
        }
        Ok(file.items)
    }

    fn save(&self, items: Vec<EnrichedItem>) -> Result<PathBuf, StoreError> {
        let file = CollectionFile {
            collection: self.kind.collection().to_string(),
            updated_utc: (self.clock)(),
            items,
        };
        let content = serde_json::to_vec_pretty(&file)?;
        let writer = AtomicFileWriter::new(self.dir.clone());
        Ok(writer.write(&self.filename(), &content)?)
    }
}

#[async_trait::async_trait]
impl CatalogStore for JsonFileStore {
    async fn has_existing_items(&self) -> Result<bool, StoreError> {
        Ok(!self.load()?.is_empty())
    }

    async fn existing_links(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .load()?
            .into_iter()
            .map(|item| item.listing.link)
            .collect())
    }

    async fn insert_batch(&self, items: &[EnrichedItem]) -> Result<usize, StoreError> {
        if items.is_empty() {
            return Ok(0);
        }
        let _guard = self.write_lock.lock().await;
        let mut stored = self.load()?;
        stored.extend_from_slice(items);
        let total = stored.len();
        let path = self.save(stored)?;
        harvest_info!(
            "Stored {} new {} in {} ({} total)",
            items.len(),
            self.kind,
            path.display(),
            total
        );
        Ok(items.len())
    }

    async fn search_by_title(&self, query: &str) -> Result<Vec<EnrichedItem>, StoreError> {
        Ok(search(&self.load()?, query))
    }

    async fn all_items(&self) -> Result<Vec<EnrichedItem>, StoreError> {
        self.load()
    }
}
