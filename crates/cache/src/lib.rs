//! Persistent, content-addressed file cache with key deduplication
//!
//! A [`FileCache`] maps caller keys to files on local disk. Content is stored
//! once per digest no matter how many keys reference it:
//! - `data/<digest>` holds the bytes
//! - `properties/<digest>.properties` lists the referencing keys plus user metadata
//! - `tmp/` receives uploads before they are renamed into place
//!
//! # Overview
//!
//! The in-memory index is rebuilt from disk at [`FileCache::startup`], so a
//! cache survives process restarts. Capacity limits on file count and total
//! bytes are enforced after every put by evicting the least recently accessed
//! content, subject to a minimum lifetime and an optional veto callback.
//!
//! # Configuration
//!
//! Limits can be set on [`FileCacheBuilder`] directly or loaded from TOML via
//! [`CacheConfig`]. Without an explicit root the cache lives under
//! `$STOWAGE_CACHE_DIR`, then the platform cache directory.

mod cache;
mod config;
mod digest;
mod error;
mod eviction;
mod index;
mod layout;
mod properties;
mod recovery;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use cache::{CacheStats, FileCache, FileCacheBuilder};
pub use config::{CACHE_DIR_ENV, CacheConfig, default_cache_root};
pub use digest::{
    ContentHasher, ContentSummary, DigestWriter, HasherFactory, Sha256Digests, copy_with_digest,
    is_valid_digest,
};
pub use eviction::{EvictionPolicy, PruneReport, RemoveCallback};
pub use index::{CacheKey, Item};
pub use layout::CacheLayout;
pub use properties::{
    KEYS_PROPERTY, PropertyRecord, parse as parse_properties, read as read_properties,
    serialize as serialize_properties, validate_key_string, write as write_properties,
};
pub use recovery::RecoveryReport;
