//! Cache configuration and cache-root resolution

use crate::{Error, Result};
use dirs::{cache_dir, home_dir};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides the cache root
pub const CACHE_DIR_ENV: &str = "STOWAGE_CACHE_DIR";

/// Serializable cache settings, typically loaded from a TOML file
///
/// ```toml
/// root = "/var/cache/stowage"
/// max_files = 10000
/// max_bytes = 1073741824
/// min_lifetime_ms = 60000
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Cache root; resolved with [`default_cache_root`] when unset
    pub root: Option<PathBuf>,
    /// Maximum number of distinct content files (unbounded when unset)
    pub max_files: Option<usize>,
    /// Maximum total content bytes (unbounded when unset)
    pub max_bytes: Option<u64>,
    /// Grace period in milliseconds protecting recently touched entries
    pub min_lifetime_ms: u64,
}

impl CacheConfig {
    /// Parse a TOML document
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the document is invalid
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| Error::configuration(format!("invalid cache configuration: {e}")))
    }

    /// Load a TOML configuration file
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read and
    /// [`Error::Configuration`] if it does not parse
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(e, path, "read"))?;
        Self::from_toml_str(&content)
    }

    /// Grace period as a [`Duration`]
    #[must_use]
    pub fn min_lifetime(&self) -> Duration {
        Duration::from_millis(self.min_lifetime_ms)
    }

    /// The configured root, or the default location
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if no writable default exists
    pub fn resolve_root(&self) -> Result<PathBuf> {
        match &self.root {
            Some(root) => Ok(root.clone()),
            None => default_cache_root(),
        }
    }
}

/// Inputs for determining the default cache root
#[derive(Debug, Clone)]
struct RootInputs {
    override_dir: Option<PathBuf>,
    xdg_cache_home: Option<PathBuf>,
    os_cache_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    temp_dir: PathBuf,
}

fn cache_root_from_inputs(inputs: RootInputs) -> Result<PathBuf> {
    // Resolution order (first writable wins):
    // 1) STOWAGE_CACHE_DIR (explicit override)
    // 2) XDG_CACHE_HOME/stowage
    // 3) OS cache dir/stowage
    // 4) ~/.stowage/cache
    // 5) TMPDIR/stowage/cache
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Some(dir) = inputs.override_dir.filter(|p| !p.as_os_str().is_empty()) {
        candidates.push(dir);
    }
    if let Some(xdg) = inputs.xdg_cache_home {
        candidates.push(xdg.join("stowage"));
    }
    if let Some(os_cache) = inputs.os_cache_dir {
        candidates.push(os_cache.join("stowage"));
    }
    if let Some(home) = inputs.home_dir {
        candidates.push(home.join(".stowage/cache"));
    }
    candidates.push(inputs.temp_dir.join("stowage/cache"));

    for path in candidates {
        if path.starts_with("/homeless-shelter") {
            continue;
        }
        // Existing directories may be read-only (e.g. a CI-provided $HOME)
        if path.exists() {
            let probe = path.join(".write_probe");
            match fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&probe)
            {
                Ok(_) => {
                    let _ = fs::remove_file(&probe);
                    return Ok(path);
                }
                Err(_) => continue,
            }
        }
        if fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        }
    }
    Err(Error::configuration(
        "Failed to determine a writable cache directory",
    ))
}

/// Resolve the default cache root from the environment
///
/// # Errors
///
/// Returns [`Error::Configuration`] if none of the candidates is writable
pub fn default_cache_root() -> Result<PathBuf> {
    let inputs = RootInputs {
        override_dir: std::env::var(CACHE_DIR_ENV)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from),
        xdg_cache_home: std::env::var("XDG_CACHE_HOME")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from),
        os_cache_dir: cache_dir(),
        home_dir: home_dir(),
        temp_dir: std::env::temp_dir(),
    };
    cache_root_from_inputs(inputs)
}
