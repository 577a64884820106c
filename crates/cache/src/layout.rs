//! On-disk layout of a cache root
//!
//! ```text
//! <root>/
//!   data/<digest>                    content, one file per distinct blob
//!   properties/<digest>.properties   referencing keys + user metadata
//!   tmp/                             in-progress writes, purged at startup
//! ```

use crate::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

const DATA_DIR: &str = "data";
const PROPERTIES_DIR: &str = "properties";
const TMP_DIR: &str = "tmp";
const PROPERTIES_EXTENSION: &str = "properties";

/// Resolved directories of one cache instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    root: PathBuf,
    data_dir: PathBuf,
    properties_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl CacheLayout {
    /// Describe the layout under `root` without touching the filesystem
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            data_dir: root.join(DATA_DIR),
            properties_dir: root.join(PROPERTIES_DIR),
            tmp_dir: root.join(TMP_DIR),
            root,
        }
    }

    /// Cache root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding content files
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Directory holding property files
    #[must_use]
    pub fn properties_dir(&self) -> &Path {
        &self.properties_dir
    }

    /// Scratch directory for in-progress writes
    #[must_use]
    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// Path of the content file for `digest`
    #[must_use]
    pub fn content_path(&self, digest: &str) -> PathBuf {
        self.data_dir.join(digest)
    }

    /// Path of the property file for `digest`
    #[must_use]
    pub fn properties_path(&self, digest: &str) -> PathBuf {
        self.properties_dir
            .join(format!("{digest}.{PROPERTIES_EXTENSION}"))
    }

    /// Digest named by a property file path, if it has the right extension
    #[must_use]
    pub fn digest_of_properties_file(path: &Path) -> Option<String> {
        if path.extension()? != PROPERTIES_EXTENSION {
            return None;
        }
        path.file_stem()?.to_str().map(str::to_string)
    }

    /// Create all three directories
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if any directory cannot be created
    pub fn create_dirs(&self) -> Result<()> {
        for dir in [&self.data_dir, &self.properties_dir, &self.tmp_dir] {
            fs::create_dir_all(dir).map_err(|e| {
                Error::configuration(format!(
                    "cannot create cache directory {}: {e}",
                    dir.display()
                ))
            })?;
        }
        Ok(())
    }

    /// Delete everything inside the scratch directory, returning how many
    /// entries were removed; individual failures are logged and skipped
    pub fn purge_tmp(&self) -> usize {
        let entries = match fs::read_dir(&self.tmp_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    path = %self.tmp_dir.display(),
                    "Cannot list scratch directory: {e}"
                );
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    "Failed to remove aborted write: {e}"
                ),
            }
        }
        removed
    }

    /// Remove the content and property files of `digest`, logging failures
    ///
    /// Returns `true` when no content file is left behind.
    pub fn delete_digest_files(&self, digest: &str) -> bool {
        let content_gone = remove_if_exists(&self.content_path(digest));
        remove_if_exists(&self.properties_path(digest));
        content_gone
    }
}

/// Remove a file, treating an already missing file as success
pub(crate) fn remove_if_exists(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            tracing::warn!(path = %path.display(), "Failed to delete cache file: {e}");
            false
        }
    }
}
