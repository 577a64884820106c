//! Capacity-driven eviction
//!
//! The budget is soft. When the cache holds more files or bytes than allowed,
//! resident digests are visited least recently accessed first and removed
//! until both limits hold again. A digest is skipped while it is younger than
//! the minimum lifetime or when the removal callback vetoes it; if everything
//! left is protected the cache simply stays over budget.

use crate::index::{CacheIndex, CacheKey, Item};
use crate::layout::CacheLayout;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Veto hook consulted before an item is evicted; `false` keeps the item
pub type RemoveCallback = Arc<dyn Fn(&Item) -> bool + Send + Sync>;

/// Limits and protections applied by the eviction pass
#[derive(Clone, Default)]
pub struct EvictionPolicy {
    pub(crate) max_files: Option<usize>,
    pub(crate) max_bytes: Option<u64>,
    pub(crate) min_lifetime: Duration,
    pub(crate) remove_callback: Option<RemoveCallback>,
}

impl fmt::Debug for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvictionPolicy")
            .field("max_files", &self.max_files)
            .field("max_bytes", &self.max_bytes)
            .field("min_lifetime", &self.min_lifetime)
            .field("remove_callback", &self.remove_callback.is_some())
            .finish()
    }
}

impl EvictionPolicy {
    /// Maximum number of content files
    #[must_use]
    pub fn max_files(&self) -> Option<usize> {
        self.max_files
    }

    /// Maximum total content bytes
    #[must_use]
    pub fn max_bytes(&self) -> Option<u64> {
        self.max_bytes
    }

    /// Grace period protecting recently touched items
    #[must_use]
    pub fn min_lifetime(&self) -> Duration {
        self.min_lifetime
    }

    /// Whether `files` and `bytes` both fit the configured limits
    #[must_use]
    pub fn within_budget(&self, files: usize, bytes: u64) -> bool {
        self.max_files.is_none_or(|max| files <= max)
            && self.max_bytes.is_none_or(|max| bytes <= max)
    }

    /// Whether `item` is still inside its grace period at `now`
    #[must_use]
    pub fn is_protected(&self, item: &Item, now: DateTime<Utc>) -> bool {
        let grace = TimeDelta::from_std(self.min_lifetime).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(item.accessed_at()) <= grace
    }

    /// Whether the removal callback lets `item` go
    #[must_use]
    pub fn allows_removal(&self, item: &Item) -> bool {
        self.remove_callback
            .as_ref()
            .is_none_or(|callback| callback(item))
    }
}

/// Outcome of one eviction pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Digests removed, in eviction order
    pub evicted: Vec<String>,
    /// Bytes released by the removed digests
    pub bytes_freed: u64,
    /// Keys that pointed at removed digests
    pub keys_dropped: usize,
    /// Candidates skipped because of the minimum lifetime or because they were
    /// just stored
    pub protected: usize,
    /// Candidates skipped because the removal callback refused
    pub vetoed: usize,
}

/// Evict digests until the index fits `policy` or nothing else is evictable
///
/// `spare` is never a candidate; a put passes the digest it just committed so
/// the returned item is still resident.
pub(crate) fn prune<K: CacheKey>(
    index: &mut CacheIndex<K>,
    layout: &CacheLayout,
    policy: &EvictionPolicy,
    now: DateTime<Utc>,
    spare: Option<&str>,
) -> PruneReport {
    let mut report = PruneReport::default();
    if policy.within_budget(index.num_files(), index.num_bytes()) {
        return report;
    }

    for digest in index.eviction_order() {
        if policy.within_budget(index.num_files(), index.num_bytes()) {
            break;
        }
        let Some(item) = index.item(&digest) else {
            continue;
        };
        if spare == Some(digest.as_str()) || policy.is_protected(item, now) {
            report.protected += 1;
            continue;
        }
        if !policy.allows_removal(item) {
            report.vetoed += 1;
            continue;
        }

        let keys = index.references(&digest).map_or(0, BTreeSet::len);
        layout.delete_digest_files(&digest);
        if let Some(item) = index.remove_digest(&digest) {
            tracing::debug!(
                digest = %digest,
                size = item.length(),
                keys,
                "Evicted cache entry"
            );
            report.bytes_freed += item.length();
            report.keys_dropped += keys;
            report.evicted.push(digest);
        }
    }

    if !policy.within_budget(index.num_files(), index.num_bytes()) {
        tracing::debug!(
            files = index.num_files(),
            bytes = index.num_bytes(),
            protected = report.protected,
            vetoed = report.vetoed,
            "Cache remains over budget; no further entries are evictable"
        );
    }
    report
}
