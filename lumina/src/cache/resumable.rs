//! Registry of partially downloaded responses, used to resume interrupted
//! transfers with `Range`/`If-Range` requests.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::loading::Validator;

/// Bytes retained from an interrupted download plus the validator that
/// makes resuming safe.
#[derive(Debug, Clone)]
pub(crate) struct ResumableData {
    pub data: Bytes,
    pub validator: Validator,
    pub expected_total: Option<u64>,
}

#[derive(Debug)]
struct StoredEntry {
    data: ResumableData,
    tick: u64,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: HashMap<String, StoredEntry>,
    total_bytes: u64,
    tick: u64,
}

/// Process-wide, byte-bounded map from URL to resumable state. Oversized
/// entries are refused; older entries are evicted LRU once the soft limit
/// is exceeded.
#[derive(Debug)]
pub(crate) struct ResumableDataStorage {
    size_limit: u64,
    state: Mutex<RegistryState>,
}

impl ResumableDataStorage {
    pub(crate) const DEFAULT_SIZE_LIMIT: u64 = 32 * 1024 * 1024;

    pub(crate) fn new(size_limit: u64) -> Self {
        Self {
            size_limit,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Remove and return the retained state for `url`, if any.
    pub(crate) fn take(&self, url: &str) -> Option<ResumableData> {
        let mut state = self.state.lock();
        let entry = state.entries.remove(url)?;
        state.total_bytes = state.total_bytes.saturating_sub(entry.data.data.len() as u64);
        Some(entry.data)
    }

    pub(crate) fn put(&self, url: String, data: ResumableData) {
        let size = data.data.len() as u64;
        if size == 0 || size > self.size_limit {
            return;
        }
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;
        if let Some(previous) = state.entries.insert(url, StoredEntry { data, tick }) {
            state.total_bytes = state
                .total_bytes
                .saturating_sub(previous.data.data.len() as u64);
        }
        state.total_bytes = state.total_bytes.saturating_add(size);

        while state.total_bytes > self.size_limit {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.tick)
                .map(|(url, _)| url.clone());
            let Some(url) = oldest else { break };
            if let Some(entry) = state.entries.remove(&url) {
                state.total_bytes = state
                    .total_bytes
                    .saturating_sub(entry.data.data.len() as u64);
                debug!(%url, "evicted resumable state");
            }
        }
    }

    #[cfg(test)]
    fn total_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }
}
