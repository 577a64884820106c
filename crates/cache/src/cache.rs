//! The persistent, deduplicating file cache

use crate::config::CacheConfig;
use crate::digest::{self, ContentSummary, HasherFactory, Sha256Digests};
use crate::eviction::{self, EvictionPolicy, PruneReport};
use crate::index::{CacheIndex, CacheKey, Item};
use crate::layout::{CacheLayout, remove_if_exists};
use crate::properties::{self, KEYS_PROPERTY};
use crate::recovery::{self, RecoveryReport};
use crate::{Error, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Point-in-time counters of a cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Distinct content files
    pub files: usize,
    /// Total content bytes
    pub bytes: u64,
    /// Keys referencing content
    pub keys: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Ready,
}

struct State<K> {
    lifecycle: Lifecycle,
    index: CacheIndex<K>,
}

impl<K> State<K> {
    fn ensure_started(&self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Ready => Ok(()),
            Lifecycle::Uninitialized => Err(Error::NotStarted),
        }
    }
}

/// Content-addressed file cache shared by many logical keys
///
/// Identical content stored under different keys is kept once, named by its
/// digest. A content file is deleted when its last key is removed or when the
/// eviction policy reclaims it. All index state sits behind one mutex; the
/// bulk copy of new content happens outside it.
///
/// ```no_run
/// use stowage_cache::FileCache;
///
/// let cache = FileCache::<String>::builder("/var/cache/stowage")
///     .max_files(10_000)
///     .open()?;
///
/// cache.put("greeting".to_string(), &mut "hello".as_bytes())?;
/// if let Some(item) = cache.get(&"greeting".to_string())? {
///     assert_eq!(item.length(), 5);
/// }
/// # Ok::<(), stowage_cache::Error>(())
/// ```
pub struct FileCache<K> {
    layout: CacheLayout,
    policy: EvictionPolicy,
    hasher: Arc<dyn HasherFactory>,
    state: Mutex<State<K>>,
}

/// Builder for [`FileCache`]
pub struct FileCacheBuilder<K> {
    root: PathBuf,
    policy: EvictionPolicy,
    hasher: Arc<dyn HasherFactory>,
    _key: PhantomData<fn() -> K>,
}

impl<K: CacheKey> FileCacheBuilder<K> {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            policy: EvictionPolicy::default(),
            hasher: Arc::new(Sha256Digests),
            _key: PhantomData,
        }
    }

    /// Start from a [`CacheConfig`], resolving the default root if unset
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if no cache root can be determined
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        let mut builder = Self::new(config.resolve_root()?);
        builder.policy.max_files = config.max_files;
        builder.policy.max_bytes = config.max_bytes;
        builder.policy.min_lifetime = config.min_lifetime();
        Ok(builder)
    }

    /// Maximum number of distinct content files
    #[must_use]
    pub fn max_files(mut self, max_files: usize) -> Self {
        self.policy.max_files = Some(max_files);
        self
    }

    /// Maximum total size of all content files
    #[must_use]
    pub fn max_bytes(mut self, max_bytes: u64) -> Self {
        self.policy.max_bytes = Some(max_bytes);
        self
    }

    /// Protect items touched within `min_lifetime` from eviction
    #[must_use]
    pub fn min_lifetime(mut self, min_lifetime: Duration) -> Self {
        self.policy.min_lifetime = min_lifetime;
        self
    }

    /// Consult `callback` before evicting an item; returning `false` keeps it
    ///
    /// The callback runs while the cache lock is held and must not call back
    /// into the cache.
    #[must_use]
    pub fn remove_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Item) -> bool + Send + Sync + 'static,
    {
        self.policy.remove_callback = Some(Arc::new(callback));
        self
    }

    /// Replace the default SHA-256 digest calculator
    #[must_use]
    pub fn hasher<H: HasherFactory + 'static>(mut self, hasher: H) -> Self {
        self.hasher = Arc::new(hasher);
        self
    }

    /// Build an uninitialized cache; call [`FileCache::startup`] before use
    #[must_use]
    pub fn build(self) -> FileCache<K> {
        FileCache {
            layout: CacheLayout::new(self.root),
            policy: self.policy,
            hasher: self.hasher,
            state: Mutex::new(State {
                lifecycle: Lifecycle::Uninitialized,
                index: CacheIndex::new(),
            }),
        }
    }

    /// Build the cache and run [`FileCache::startup`]
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the cache directories cannot be created
    pub fn open(self) -> Result<FileCache<K>> {
        let cache = self.build();
        cache.startup()?;
        Ok(cache)
    }
}

impl<K: CacheKey> FileCache<K> {
    /// Configure a cache rooted at `root`
    #[must_use]
    pub fn builder(root: impl Into<PathBuf>) -> FileCacheBuilder<K> {
        FileCacheBuilder::new(root.into())
    }

    /// Create the cache directories and rebuild the index from disk
    ///
    /// Runs once per instance. Entries with missing or unusable metadata are
    /// discarded rather than failing startup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] on a second call and
    /// [`Error::Configuration`] if the cache root is unusable
    pub fn startup(&self) -> Result<RecoveryReport> {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Ready {
            return Err(Error::AlreadyStarted);
        }
        let (index, report) = recovery::recover(&self.layout)?;
        state.index = index;
        state.lifecycle = Lifecycle::Ready;
        Ok(report)
    }

    /// Whether [`FileCache::startup`] has completed
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state.lock().lifecycle == Lifecycle::Ready
    }

    /// Directory layout of this cache
    #[must_use]
    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Eviction settings of this cache
    #[must_use]
    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    /// Look up `key`, refreshing its access time on a hit
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] before startup
    pub fn get(&self, key: &K) -> Result<Option<Item>> {
        let mut state = self.state.lock();
        state.ensure_started()?;

        let Some(digest) = state.index.digest_of(key).map(str::to_string) else {
            tracing::debug!(key = %key, "Cache miss");
            return Ok(None);
        };

        let content_path = self.layout.content_path(&digest);
        if !content_path.is_file() {
            tracing::warn!(
                key = %key,
                digest = %digest,
                path = %content_path.display(),
                "Content file disappeared; dropping entry"
            );
            state.index.remove_digest(&digest);
            remove_if_exists(&self.layout.properties_path(&digest));
            return Ok(None);
        }

        tracing::debug!(key = %key, digest = %digest, "Cache hit");
        Ok(state.index.touch(&digest, Utc::now()).cloned())
    }

    /// Store the content of `reader` under `key`
    ///
    /// # Errors
    ///
    /// See [`FileCache::put_with_properties`]
    pub fn put<R: Read + ?Sized>(&self, key: K, reader: &mut R) -> Result<Item> {
        self.put_with_properties(key, reader, BTreeMap::new())
    }

    /// Store the content of `reader` under `key` with user properties
    ///
    /// The reader is consumed to its end but not closed. Properties are merged
    /// over those already stored for the same content. The eviction pass that
    /// follows never removes the content just stored, so the cache may stay
    /// over budget until a later put or [`FileCache::prune`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if the key's string form is empty or holds
    /// a comma, [`Error::NotStarted`] before startup, [`Error::InvalidDigest`]
    /// for an unusable custom digest, and [`Error::Io`] if the content or its
    /// property file cannot be written, including the rewritten property file of
    /// content the key moves away from. A failed put leaves no content file
    /// behind and the index unchanged.
    pub fn put_with_properties<R: Read + ?Sized>(
        &self,
        key: K,
        reader: &mut R,
        user_properties: BTreeMap<String, String>,
    ) -> Result<Item> {
        properties::validate_key_string(&key.to_string())?;
        self.state.lock().ensure_started()?;

        let (staged, summary) = self.stage(reader)?;
        if !digest::is_valid_digest(&summary.digest) {
            return Err(Error::InvalidDigest {
                digest: summary.digest,
            });
        }

        let mut state = self.state.lock();
        let item = self.commit(&mut state.index, key, staged, summary, user_properties)?;

        let report = eviction::prune(
            &mut state.index,
            &self.layout,
            &self.policy,
            Utc::now(),
            Some(item.digest()),
        );
        if !report.evicted.is_empty() {
            tracing::debug!(
                evicted = report.evicted.len(),
                bytes_freed = report.bytes_freed,
                "Pruned cache after put"
            );
        }
        Ok(item)
    }

    /// Drop `key`; returns `true` if this deleted the underlying content file
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] before startup and [`Error::Io`] if the
    /// property file of still-referenced content cannot be rewritten, in which
    /// case the key stays in place
    pub fn remove(&self, key: &K) -> Result<bool> {
        let mut state = self.state.lock();
        state.ensure_started()?;
        let index = &mut state.index;

        let Some(digest) = index.digest_of(key).map(str::to_string) else {
            return Ok(false);
        };
        let remaining = index.key_strings_except(&digest, key);

        if remaining.is_empty() {
            index.detach(key);
            index.remove_digest(&digest);
            self.layout.delete_digest_files(&digest);
            tracing::debug!(key = %key, digest = %digest, "Removed last reference; deleted content");
            return Ok(true);
        }

        let user = index
            .item(&digest)
            .map(|item| item.properties().clone())
            .unwrap_or_default();
        properties::write(
            &self.layout.properties_path(&digest),
            self.layout.tmp_dir(),
            &remaining,
            &user,
        )?;
        index.detach(key);
        tracing::debug!(key = %key, digest = %digest, remaining = remaining.len(), "Removed reference");
        Ok(false)
    }

    /// Run the eviction pass now
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] before startup
    pub fn prune(&self) -> Result<PruneReport> {
        let mut state = self.state.lock();
        state.ensure_started()?;
        Ok(eviction::prune(
            &mut state.index,
            &self.layout,
            &self.policy,
            Utc::now(),
            None,
        ))
    }

    /// Whether `key` references content
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.state.lock().index.contains_key(key)
    }

    /// Whether content with `digest` is resident
    #[must_use]
    pub fn contains_digest(&self, digest: &str) -> bool {
        self.state.lock().index.contains_digest(digest)
    }

    /// Number of distinct content files
    #[must_use]
    pub fn num_files(&self) -> usize {
        self.state.lock().index.num_files()
    }

    /// Total bytes of all content files
    #[must_use]
    pub fn num_bytes(&self) -> u64 {
        self.state.lock().index.num_bytes()
    }

    /// Number of keys
    #[must_use]
    pub fn num_keys(&self) -> usize {
        self.state.lock().index.num_keys()
    }

    /// All three counters, read consistently
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            files: state.index.num_files(),
            bytes: state.index.num_bytes(),
            keys: state.index.num_keys(),
        }
    }

    /// Copy content into a scratch file, hashing on the way
    fn stage<R: Read + ?Sized>(&self, reader: &mut R) -> Result<(NamedTempFile, ContentSummary)> {
        let tmp_dir = self.layout.tmp_dir();
        let file = tempfile::Builder::new()
            .prefix("put-")
            .tempfile_in(tmp_dir)
            .map_err(|e| Error::io(e, tmp_dir, "create temp file"))?;
        digest::copy_with_digest(reader, file, self.hasher.new_hasher())
            .map_err(|e| Error::io_no_path(e, "copy content"))
    }

    /// Publish staged content and its metadata; caller holds the lock
    fn commit(
        &self,
        index: &mut CacheIndex<K>,
        key: K,
        staged: NamedTempFile,
        summary: ContentSummary,
        user_properties: BTreeMap<String, String>,
    ) -> Result<Item> {
        let digest = summary.digest;
        let content_path = self.layout.content_path(&digest);
        let existing = index.item(&digest).cloned();

        if existing.is_some() {
            if let Err(e) = staged.close() {
                tracing::warn!(digest = %digest, "Failed to delete duplicate upload: {e}");
            }
        } else {
            staged
                .persist(&content_path)
                .map_err(|e| Error::io(e.error, &content_path, "rename"))?;
        }

        let mut keys: BTreeSet<K> = index.references(&digest).cloned().unwrap_or_default();
        keys.insert(key.clone());
        let key_strings: Vec<String> = keys.iter().map(ToString::to_string).collect();

        let created = existing.is_none();
        let now = Utc::now();
        let mut item = existing.unwrap_or_else(|| {
            Item::new(
                content_path.clone(),
                summary.length,
                digest.clone(),
                now,
                BTreeMap::new(),
            )
        });
        item.properties.extend(user_properties);
        item.properties.remove(KEYS_PROPERTY);
        item.accessed_at = now;

        // A key moving away from shared content is dropped from that content's
        // property file first, so a restart cannot hand the key back to it
        let moved_from = index
            .digest_of(&key)
            .filter(|previous| *previous != digest)
            .map(str::to_string);
        let rewrite_previous = moved_from
            .as_deref()
            .map(|previous| (previous, index.key_strings_except(previous, &key)))
            .filter(|(_, remaining)| !remaining.is_empty());
        if let Some((previous, remaining)) = &rewrite_previous {
            let user = index
                .item(previous)
                .map(|item| item.properties().clone())
                .unwrap_or_default();
            if let Err(e) = properties::write(
                &self.layout.properties_path(previous),
                self.layout.tmp_dir(),
                remaining,
                &user,
            ) {
                if created {
                    remove_if_exists(&content_path);
                }
                return Err(e);
            }
        }

        if let Err(e) = properties::write(
            &self.layout.properties_path(&digest),
            self.layout.tmp_dir(),
            &key_strings,
            &item.properties,
        ) {
            if created {
                remove_if_exists(&content_path);
            }
            if let Some((previous, _)) = rewrite_previous
                && let Err(restore) = properties::persist_for(&self.layout, index, previous)
            {
                tracing::warn!(digest = %previous, "Failed to restore property file: {restore}");
            }
            return Err(e);
        }

        index.upsert_item(item.clone());
        if let Some(previous) = index.attach(key.clone(), &digest)
            && index.is_unreferenced(&previous)
        {
            index.remove_digest(&previous);
            self.layout.delete_digest_files(&previous);
            tracing::debug!(digest = %previous, "Deleted content no longer referenced");
        }
        tracing::debug!(
            key = %key,
            digest = %digest,
            size = item.length(),
            created,
            "Stored content"
        );
        Ok(item)
    }
}
