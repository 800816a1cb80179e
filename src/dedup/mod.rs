pub mod fingerprint;
pub mod merge;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexMap;
use tracing::debug;

use crate::config::DedupConfig;
use crate::record::{Fingerprint, Record};
pub use fingerprint::fingerprint;
use merge::{merge_into, Votes};

/// Fingerprints already accepted or durably persisted in this pipeline.
/// Shared by the deduplicator (producer side) and the checkpoint store
/// (worker side); only ever grows.
#[derive(Clone, Debug, Default)]
pub struct ProcessedSet {
    inner: Arc<Mutex<HashSet<Fingerprint>>>,
}

impl ProcessedSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<Fingerprint>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns true when the fingerprint was not present before.
    pub fn insert(&self, fingerprint: Fingerprint) -> bool {
        self.lock().insert(fingerprint)
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.lock().contains(fingerprint)
    }

    pub fn extend(&self, fingerprints: impl IntoIterator<Item = Fingerprint>) {
        self.lock().extend(fingerprints);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Outcome of offering a record to the deduplicator.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub is_new: bool,
    pub merged: Record,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DedupStats {
    pub accepted: usize,
    pub duplicates: usize,
    pub merged: usize,
}

struct Retained {
    record: Record,
    votes: Votes,
}

/// Decides whether a candidate is a new entity and folds repeat sightings
/// into the record kept for that entity.
pub struct Deduplicator {
    processed: ProcessedSet,
    retained: IndexMap<Fingerprint, Retained>,
    capacity: usize,
    list_cap: usize,
    stats: DedupStats,
}

impl Deduplicator {
    pub fn new(processed: ProcessedSet, config: &DedupConfig) -> Self {
        Deduplicator {
            processed,
            retained: IndexMap::new(),
            capacity: config.merge_cache_capacity.max(1),
            list_cap: config.list_cap,
            stats: DedupStats::default(),
        }
    }

    pub fn processed(&self) -> &ProcessedSet {
        &self.processed
    }

    pub fn stats(&self) -> DedupStats {
        self.stats
    }

    pub fn accept(&mut self, mut record: Record) -> Accepted {
        let fp = fingerprint(&record);
        record.fingerprint = Some(fp.clone());

        if self.processed.insert(fp.clone()) {
            self.stats.accepted += 1;
            self.retain(fp, record.clone());
            return Accepted {
                is_new: true,
                merged: record,
            };
        }

        self.stats.duplicates += 1;
        let merged = match self.retained.shift_remove(&fp) {
            Some(mut kept) => {
                let merged = merge_into(&kept.record, &record, &mut kept.votes, self.list_cap);
                self.stats.merged += 1;
                kept.record = merged.clone();
                self.insert_retained(fp.clone(), kept);
                merged
            }
            None => {
                // Known from a previous run or evicted; this sighting becomes the base.
                self.retain(fp.clone(), record.clone());
                record
            }
        };
        debug!(fingerprint = %fp, "duplicate candidate merged");
        Accepted {
            is_new: false,
            merged,
        }
    }

    fn retain(&mut self, fp: Fingerprint, record: Record) {
        let votes = Votes::seed(&record);
        self.insert_retained(fp, Retained { record, votes });
    }

    fn insert_retained(&mut self, fp: Fingerprint, retained: Retained) {
        while self.retained.len() >= self.capacity {
            self.retained.shift_remove_index(0);
        }
        self.retained.insert(fp, retained);
    }

    pub fn retained_len(&self) -> usize {
        self.retained.len()
    }
}
