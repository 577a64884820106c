//! In-memory cache index
//!
//! Three views over the same relationships, always updated together:
//! - key → digest (many keys may share one digest)
//! - digest → set of referencing keys
//! - digest → [`Item`]
//!
//! The index performs no I/O. Callers hold the cache lock around every
//! mutation and keep the files under [`crate::CacheLayout`] in step.

use chrono::{DateTime, Utc};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Requirements on caller-supplied cache keys
///
/// `Display` produces the persisted form and `FromStr` parses it back when the
/// index is rebuilt at startup. The displayed form must be non-empty and must
/// not contain a comma.
pub trait CacheKey: Ord + Clone + fmt::Display + FromStr + Send + 'static {}

impl<T> CacheKey for T where T: Ord + Clone + fmt::Display + FromStr + Send + 'static {}

/// Read-only view of one resident digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub(crate) path: PathBuf,
    pub(crate) length: u64,
    pub(crate) digest: String,
    pub(crate) accessed_at: DateTime<Utc>,
    pub(crate) properties: BTreeMap<String, String>,
}

impl Item {
    pub(crate) fn new(
        path: PathBuf,
        length: u64,
        digest: String,
        accessed_at: DateTime<Utc>,
        properties: BTreeMap<String, String>,
    ) -> Self {
        Self {
            path,
            length,
            digest,
            accessed_at,
            properties,
        }
    }

    /// Path of the content file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Content length in bytes
    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Content digest
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Last time the item was stored or read
    #[must_use]
    pub fn accessed_at(&self) -> DateTime<Utc> {
        self.accessed_at
    }

    /// User properties stored alongside the content
    #[must_use]
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Look up a single user property
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}

#[derive(Debug)]
struct Resident {
    item: Item,
    /// Insertion order; breaks access-time ties during eviction
    seq: u64,
}

/// Key/digest/item maps plus the running byte total
#[derive(Debug)]
pub(crate) struct CacheIndex<K> {
    key_to_digest: BTreeMap<K, String>,
    references: BTreeMap<String, BTreeSet<K>>,
    items: BTreeMap<String, Resident>,
    num_bytes: u64,
    next_seq: u64,
}

impl<K: CacheKey> CacheIndex<K> {
    pub(crate) fn new() -> Self {
        Self {
            key_to_digest: BTreeMap::new(),
            references: BTreeMap::new(),
            items: BTreeMap::new(),
            num_bytes: 0,
            next_seq: 0,
        }
    }

    pub(crate) fn digest_of(&self, key: &K) -> Option<&str> {
        self.key_to_digest.get(key).map(String::as_str)
    }

    pub(crate) fn item(&self, digest: &str) -> Option<&Item> {
        self.items.get(digest).map(|r| &r.item)
    }

    pub(crate) fn references(&self, digest: &str) -> Option<&BTreeSet<K>> {
        self.references.get(digest)
    }

    /// Persisted string forms of the keys referencing `digest`, in key order
    pub(crate) fn key_strings(&self, digest: &str) -> Vec<String> {
        self.references
            .get(digest)
            .map(|keys| keys.iter().map(ToString::to_string).collect())
            .unwrap_or_default()
    }

    /// Key strings referencing `digest` once `key` is taken away
    pub(crate) fn key_strings_except(&self, digest: &str, key: &K) -> Vec<String> {
        self.references
            .get(digest)
            .map(|keys| {
                keys.iter()
                    .filter(|k| *k != key)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn is_unreferenced(&self, digest: &str) -> bool {
        self.references
            .get(digest)
            .is_none_or(BTreeSet::is_empty)
    }

    pub(crate) fn contains_key(&self, key: &K) -> bool {
        self.key_to_digest.contains_key(key)
    }

    pub(crate) fn contains_digest(&self, digest: &str) -> bool {
        self.items.contains_key(digest)
    }

    pub(crate) fn num_files(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn num_bytes(&self) -> u64 {
        self.num_bytes
    }

    pub(crate) fn num_keys(&self) -> usize {
        self.key_to_digest.len()
    }

    /// Insert a new item or replace the metadata of a resident one
    ///
    /// Only a newly inserted item adds to the byte total and takes the next
    /// insertion sequence number.
    pub(crate) fn upsert_item(&mut self, item: Item) {
        match self.items.entry(item.digest.clone()) {
            Entry::Occupied(mut slot) => slot.get_mut().item = item,
            Entry::Vacant(slot) => {
                self.num_bytes += item.length;
                slot.insert(Resident {
                    item,
                    seq: self.next_seq,
                });
                self.next_seq += 1;
            }
        }
    }

    /// Point `key` at `digest`, returning the digest it previously pointed at
    /// if that was a different one
    pub(crate) fn attach(&mut self, key: K, digest: &str) -> Option<String> {
        self.references
            .entry(digest.to_string())
            .or_default()
            .insert(key.clone());
        let previous = self.key_to_digest.insert(key.clone(), digest.to_string())?;
        if previous == digest {
            return None;
        }
        if let Some(keys) = self.references.get_mut(&previous) {
            keys.remove(&key);
        }
        Some(previous)
    }

    /// Drop `key`, returning the digest it pointed at
    pub(crate) fn detach(&mut self, key: &K) -> Option<String> {
        let digest = self.key_to_digest.remove(key)?;
        if let Some(keys) = self.references.get_mut(&digest) {
            keys.remove(key);
        }
        Some(digest)
    }

    /// Remove a digest together with every key still pointing at it
    pub(crate) fn remove_digest(&mut self, digest: &str) -> Option<Item> {
        if let Some(keys) = self.references.remove(digest) {
            for key in keys {
                if self.key_to_digest.get(&key).is_some_and(|d| d == digest) {
                    self.key_to_digest.remove(&key);
                }
            }
        }
        let resident = self.items.remove(digest)?;
        self.num_bytes = self.num_bytes.saturating_sub(resident.item.length);
        Some(resident.item)
    }

    /// Bump the access time of a resident digest
    pub(crate) fn touch(&mut self, digest: &str, now: DateTime<Utc>) -> Option<&Item> {
        let resident = self.items.get_mut(digest)?;
        resident.item.accessed_at = now;
        Some(&resident.item)
    }

    /// Resident digests, least recently accessed first
    pub(crate) fn eviction_order(&self) -> Vec<String> {
        let mut order: Vec<(DateTime<Utc>, u64, &String)> = self
            .items
            .iter()
            .map(|(digest, r)| (r.item.accessed_at, r.seq, digest))
            .collect();
        order.sort_unstable();
        order.into_iter().map(|(_, _, digest)| digest.clone()).collect()
    }
}
