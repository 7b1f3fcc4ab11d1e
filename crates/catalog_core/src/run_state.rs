use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use crate::EnrichedItem;

#[derive(Debug, Default)]
struct Inner {
    seen: HashSet<String>,
    accepted: Vec<EnrichedItem>,
}

/// Run-scoped dedup set and output list, guarded by a single lock.
///
/// The set only grows. `accept` tests membership, inserts the key and appends
/// the item in one critical section, so two workers racing on the same link
/// can never both get their item in.
#[derive(Debug, Default)]
pub struct RunState {
    inner: Mutex<Inner>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the set with links that are already persisted.
    pub fn seeded<I, S>(existing_links: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let seen = existing_links.into_iter().map(Into::into).collect();
        Self {
            inner: Mutex::new(Inner {
                seen,
                accepted: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every mutation is a single insert or push, so a poisoned guard is still consistent.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Non-binding membership check, used to skip enrichment of known links.
    pub fn contains(&self, key: &str) -> bool {
        self.lock().seen.contains(key)
    }

    /// Atomically insert `key`; true iff it was not present.
    pub fn check_and_insert(&self, key: &str) -> bool {
        let mut inner = self.lock();
        if inner.seen.contains(key) {
            return false;
        }
        inner.seen.insert(key.to_string())
    }

    /// Atomically claim the item's link and append the item. False if the link was already seen.
    pub fn accept(&self, item: EnrichedItem) -> bool {
        let mut inner = self.lock();
        if !inner.seen.insert(item.link().to_string()) {
            return false;
        }
        inner.accepted.push(item);
        true
    }

    pub fn seen_count(&self) -> usize {
        self.lock().seen.len()
    }

    pub fn accepted_count(&self) -> usize {
        self.lock().accepted.len()
    }

    /// Consume the state, returning accepted items in completion order.
    pub fn drain(self) -> Vec<EnrichedItem> {
        self.inner
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .accepted
    }
}
