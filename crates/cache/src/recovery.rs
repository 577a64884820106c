//! Rebuilding the index from disk at startup
//!
//! The scan is best effort. Content files are visited oldest-modified first
//! and each one is either restored with the keys listed in its property file
//! or discarded. A broken entry never aborts startup; the cache prefers losing
//! an entry over refusing to start.

use crate::index::{CacheIndex, CacheKey, Item};
use crate::layout::{CacheLayout, remove_if_exists};
use crate::properties::{self, PropertyRecord};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Summary of one startup scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Digests restored into the index
    pub restored: usize,
    /// Content files deleted because their metadata was missing or unusable
    pub discarded: usize,
    /// Property files left in place without matching content
    pub orphaned_properties: usize,
    /// Leftover entries removed from the scratch directory
    pub purged_tmp: usize,
}

#[derive(Debug)]
struct ContentFile {
    digest: String,
    path: PathBuf,
    length: u64,
    modified: DateTime<Utc>,
}

/// Prepare the directories and rebuild the index from what is on disk
///
/// # Errors
///
/// Returns [`Error::Configuration`] if the cache directories cannot be created;
/// problems with individual entries are logged and absorbed
pub(crate) fn recover<K: CacheKey>(layout: &CacheLayout) -> Result<(CacheIndex<K>, RecoveryReport)> {
    layout.create_dirs()?;

    let mut report = RecoveryReport {
        purged_tmp: layout.purge_tmp(),
        ..RecoveryReport::default()
    };
    let mut index = CacheIndex::new();

    for file in list_content_files(layout) {
        let props_path = layout.properties_path(&file.digest);
        let parsed = properties::read(&props_path).and_then(|record| {
            let keys = parse_keys::<K>(&record, &props_path)?;
            Ok((keys, record.user))
        });
        let (keys, user) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(
                    digest = %file.digest,
                    "Discarding cached content: {e}"
                );
                remove_if_exists(&file.path);
                if matches!(e, Error::CorruptProperties { .. }) {
                    remove_if_exists(&props_path);
                }
                report.discarded += 1;
                continue;
            }
        };

        index.upsert_item(Item::new(
            file.path,
            file.length,
            file.digest.clone(),
            file.modified,
            user,
        ));
        for key in keys {
            if let Some(previous) = index.attach(key, &file.digest) {
                release_superseded(layout, &mut index, &previous, &mut report);
            }
        }
    }

    report.restored = index.num_files();
    report.orphaned_properties = count_orphaned_properties(layout, &index);

    tracing::info!(
        root = %layout.root().display(),
        restored = report.restored,
        discarded = report.discarded,
        orphaned_properties = report.orphaned_properties,
        purged_tmp = report.purged_tmp,
        files = index.num_files(),
        bytes = index.num_bytes(),
        keys = index.num_keys(),
        "Cache index rebuilt"
    );
    Ok((index, report))
}

fn parse_keys<K: CacheKey>(record: &PropertyRecord, path: &Path) -> Result<Vec<K>> {
    record
        .keys
        .iter()
        .map(|s| {
            s.parse::<K>().map_err(|_| {
                Error::corrupt_properties(path, format!("unparsable key {s:?}"))
            })
        })
        .collect()
}

/// A key listed by two property files belongs to the newer one; the older
/// digest is rewritten or, once unreferenced, deleted
fn release_superseded<K: CacheKey>(
    layout: &CacheLayout,
    index: &mut CacheIndex<K>,
    digest: &str,
    report: &mut RecoveryReport,
) {
    if index.is_unreferenced(digest) {
        tracing::warn!(digest = %digest, "Dropping content whose keys were all claimed by newer entries");
        index.remove_digest(digest);
        layout.delete_digest_files(digest);
        report.discarded += 1;
    } else if let Err(e) = properties::persist_for(layout, index, digest) {
        tracing::warn!(digest = %digest, "Failed to rewrite property file: {e}");
    }
}

/// Regular files directly under `data/`, oldest modification first
fn list_content_files(layout: &CacheLayout) -> Vec<ContentFile> {
    let mut files: Vec<ContentFile> = WalkDir::new(layout.data_dir())
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Skipping unreadable data directory entry: {e}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let Some(digest) = entry.file_name().to_str().map(str::to_string) else {
                tracing::warn!(path = %entry.path().display(), "Skipping non UTF-8 content file name");
                return None;
            };
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), "Cannot stat content file: {e}");
                    return None;
                }
            };
            let modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            Some(ContentFile {
                digest,
                path: entry.into_path(),
                length: metadata.len(),
                modified,
            })
        })
        .collect();

    files.sort_by(|a, b| {
        a.modified
            .cmp(&b.modified)
            .then_with(|| a.digest.cmp(&b.digest))
    });
    files
}

/// Property files without content are reported, not deleted
fn count_orphaned_properties<K: CacheKey>(layout: &CacheLayout, index: &CacheIndex<K>) -> usize {
    let entries = match fs::read_dir(layout.properties_dir()) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(
                path = %layout.properties_dir().display(),
                "Cannot list property directory: {e}"
            );
            return 0;
        }
    };

    let mut orphaned = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let Some(digest) = CacheLayout::digest_of_properties_file(&path) else {
            continue;
        };
        if !index.contains_digest(&digest) {
            tracing::debug!(
                digest = %digest,
                path = %path.display(),
                "Property file has no matching content; leaving it in place"
            );
            orphaned += 1;
        }
    }
    orphaned
}
