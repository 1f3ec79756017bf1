//! In-process TTL caches for upstream process metadata.

use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use ump_common::process::{ProcessDescriptor, ProcessSummary};

struct Entry<V> {
    inserted_at: Instant,
    value: V,
}

/// A concurrent map whose entries expire lazily on read.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, Entry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        {
            let entries = self.entries.read().expect("poisoned cache lock");
            match entries.get(key) {
                Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: drop it so the map does not grow without bound.
        self.entries
            .write()
            .expect("poisoned cache lock")
            .remove(key);
        None
    }

    pub fn put(&self, key: K, value: V) {
        self.entries.write().expect("poisoned cache lock").insert(
            key,
            Entry {
                inserted_at: Instant::now(),
                value,
            },
        );
    }

    pub fn invalidate(&self, key: &K) {
        self.entries
            .write()
            .expect("poisoned cache lock")
            .remove(key);
    }
}

/// Process metadata cache: per-provider summary lists plus per-process
/// descriptors. Descriptors are keyed by canonical id only; a secondary
/// index maps bare ids onto the canonical ids that carry them, and is
/// pruned whenever a canonical entry turns out to be expired, so the two
/// views cannot drift apart.
pub struct ProcessCache {
    lists: TtlCache<String, Vec<ProcessSummary>>,
    descriptors: TtlCache<String, ProcessDescriptor>,
    bare_index: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl ProcessCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            lists: TtlCache::new(ttl),
            descriptors: TtlCache::new(ttl),
            bare_index: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_list(&self, provider: &str) -> Option<Vec<ProcessSummary>> {
        self.lists.get(&provider.to_owned())
    }

    pub fn put_list(&self, provider: &str, summaries: Vec<ProcessSummary>) {
        self.lists.put(provider.to_owned(), summaries);
    }

    pub fn get_descriptor(&self, canonical: &str) -> Option<ProcessDescriptor> {
        match self.descriptors.get(&canonical.to_owned()) {
            Some(descriptor) => Some(descriptor),
            None => {
                self.unindex(canonical);
                None
            }
        }
    }

    /// Canonical ids currently indexed under a bare id, in stable order.
    /// Entries that expired since indexing are pruned as a side effect.
    pub fn descriptors_for_bare(&self, bare: &str) -> Vec<ProcessDescriptor> {
        let canonicals: Vec<String> = {
            let index = self.bare_index.read().expect("poisoned cache lock");
            match index.get(bare) {
                Some(set) => set.iter().cloned().collect(),
                None => return Vec::new(),
            }
        };

        canonicals
            .iter()
            .filter_map(|canonical| self.get_descriptor(canonical))
            .collect()
    }

    pub fn put_descriptor(&self, descriptor: &ProcessDescriptor) {
        let canonical = descriptor.summary.id.clone();
        let Ok(id) = descriptor.summary.process_id() else {
            return;
        };
        self.descriptors.put(canonical.clone(), descriptor.clone());
        self.bare_index
            .write()
            .expect("poisoned cache lock")
            .entry(id.bare().to_owned())
            .or_default()
            .insert(canonical);
    }

    fn unindex(&self, canonical: &str) {
        let mut index = self.bare_index.write().expect("poisoned cache lock");
        index.retain(|_, set| {
            set.remove(canonical);
            !set.is_empty()
        });
    }
}
