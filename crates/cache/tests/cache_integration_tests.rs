//! Integration tests for the file cache
//!
//! Exercises the public API end to end: deduplication, reference counting,
//! capacity limits, restart recovery, and concurrent access.

use stowage_cache::{
    CacheConfig, ContentHasher, Error, FileCache, FileCacheBuilder, HasherFactory, Item,
    Sha256Digests,
};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

fn open(root: &Path) -> FileCache<String> {
    FileCache::builder(root).open().unwrap()
}

fn put_str(cache: &FileCache<String>, key: &str, content: &str) -> Item {
    cache.put(key.to_string(), &mut content.as_bytes()).unwrap()
}

fn read_item(item: &Item) -> String {
    fs::read_to_string(item.path()).unwrap()
}

fn count_entries(dir: &Path) -> usize {
    fs::read_dir(dir).unwrap().count()
}

#[test]
fn test_hello_shared_by_two_keys() {
    let tmp = TempDir::new().unwrap();
    let cache = open(tmp.path());

    put_str(&cache, "a", "hello");
    put_str(&cache, "b", "hello");
    assert!(!cache.remove(&"a".to_string()).unwrap());

    let item = cache.get(&"b".to_string()).unwrap().expect("b should hit");
    assert_eq!(item.length(), 5);
    assert_eq!(read_item(&item), "hello");
    assert_eq!(cache.num_keys(), 1);
    assert_eq!(cache.num_files(), 1);
}

#[test]
fn test_identical_content_is_stored_once() {
    let tmp = TempDir::new().unwrap();
    let cache = open(tmp.path());

    put_str(&cache, "first", "payload");
    let files_before = cache.num_files();
    put_str(&cache, "second", "payload");

    assert_eq!(cache.num_files(), files_before);
    assert_eq!(cache.num_keys(), 2);
    assert_eq!(count_entries(cache.layout().data_dir()), 1);
    assert_eq!(count_entries(cache.layout().properties_dir()), 1);
}

#[test]
fn test_reference_counting_deletes_on_last_remove() {
    let tmp = TempDir::new().unwrap();
    let cache = open(tmp.path());

    let item = put_str(&cache, "k1", "shared");
    put_str(&cache, "k2", "shared");

    assert!(!cache.remove(&"k1".to_string()).unwrap());
    assert!(item.path().exists());
    assert!(cache.contains_digest(item.digest()));

    assert!(cache.remove(&"k2".to_string()).unwrap());
    assert!(!item.path().exists());
    assert!(!cache.contains_digest(item.digest()));
    assert_eq!(cache.num_bytes(), 0);
}

#[test]
fn test_capacity_enforced_after_every_put() {
    let tmp = TempDir::new().unwrap();
    let max_files = 4;
    let cache = FileCache::<u32>::builder(tmp.path())
        .max_files(max_files)
        .open()
        .unwrap();

    for i in 0..(max_files as u32 + 5) {
        cache
            .put(i, &mut format!("content-{i}").as_bytes())
            .unwrap();
        assert!(
            cache.num_files() <= max_files,
            "{} files after put {i}",
            cache.num_files()
        );
    }
    // The most recent put always survives
    assert!(cache.contains(&(max_files as u32 + 4)));
    assert_eq!(count_entries(cache.layout().data_dir()), max_files);
}

#[test]
fn test_byte_budget_enforced() {
    let tmp = TempDir::new().unwrap();
    let cache = FileCache::<u32>::builder(tmp.path())
        .max_bytes(25)
        .open()
        .unwrap();

    for i in 0..6u32 {
        cache.put(i, &mut format!("{i:010}").as_bytes()).unwrap();
        assert!(cache.num_bytes() <= 25);
    }
    assert_eq!(cache.num_files(), 2);
}

#[test]
fn test_grace_period_protects_recent_items() {
    let tmp = TempDir::new().unwrap();
    let cache = FileCache::<u32>::builder(tmp.path())
        .max_files(1)
        .min_lifetime(Duration::from_secs(3600))
        .open()
        .unwrap();

    for i in 0..5u32 {
        cache.put(i, &mut i.to_string().as_bytes()).unwrap();
    }

    // Everything is inside the grace period, so the cache stays over budget
    assert_eq!(cache.num_files(), 5);
    for i in 0..5u32 {
        assert!(cache.contains(&i));
    }
    let report = cache.prune().unwrap();
    assert!(report.evicted.is_empty());
    assert_eq!(report.protected, 5);
}

#[test]
fn test_remove_callback_can_veto_eviction() {
    let tmp = TempDir::new().unwrap();
    let consulted = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&consulted);
    let cache = FileCache::<String>::builder(tmp.path())
        .max_files(1)
        .remove_callback(move |item| {
            seen.fetch_add(1, Ordering::SeqCst);
            item.property("pinned").is_none()
        })
        .open()
        .unwrap();

    cache
        .put_with_properties(
            "pinned".to_string(),
            &mut "keep me".as_bytes(),
            BTreeMap::from([("pinned".to_string(), "yes".to_string())]),
        )
        .unwrap();
    put_str(&cache, "loose-1", "one");
    put_str(&cache, "loose-2", "two");

    // The pinned item is older but vetoed, so the next oldest goes instead;
    // content stored by the current put is never a candidate
    assert!(cache.contains(&"pinned".to_string()));
    assert!(!cache.contains(&"loose-1".to_string()));
    assert!(cache.contains(&"loose-2".to_string()));
    assert_eq!(cache.num_files(), 2);
    assert_eq!(consulted.load(Ordering::SeqCst), 3);
}

#[test]
fn test_recovery_round_trip() {
    let tmp = TempDir::new().unwrap();
    let mut expected = BTreeMap::new();
    let (files, bytes) = {
        let cache = open(tmp.path());
        for i in 0..8 {
            let key = format!("key-{i}");
            // Pairs of keys share content
            let content = format!("content-{}", i / 2);
            let item = cache
                .put_with_properties(
                    key.clone(),
                    &mut content.as_bytes(),
                    BTreeMap::from([("index".to_string(), i.to_string())]),
                )
                .unwrap();
            expected.insert(key, (item.digest().to_string(), content));
        }
        (cache.num_files(), cache.num_bytes())
    };

    let reopened = open(tmp.path());
    assert_eq!(reopened.num_files(), files);
    assert_eq!(reopened.num_bytes(), bytes);
    assert_eq!(reopened.num_keys(), expected.len());

    for (key, (digest, content)) in &expected {
        let item = reopened.get(key).unwrap().expect("key survives restart");
        assert_eq!(item.digest(), digest);
        assert_eq!(item.length(), content.len() as u64);
        assert_eq!(read_item(&item), *content);
        assert!(item.property("index").is_some());
    }
}

#[test]
fn test_missing_properties_discards_content_on_restart() {
    let tmp = TempDir::new().unwrap();
    let digest = {
        let cache = open(tmp.path());
        put_str(&cache, "x", "doomed");
        put_str(&cache, "y", "doomed");
        let item = put_str(&cache, "survivor", "fine");
        assert!(item.path().exists());
        let doomed = cache.get(&"x".to_string()).unwrap().unwrap();
        fs::remove_file(cache.layout().properties_path(doomed.digest())).unwrap();
        doomed.digest().to_string()
    };

    let cache = FileCacheBuilder::<String>::from_config(&CacheConfig {
        root: Some(tmp.path().to_path_buf()),
        ..CacheConfig::default()
    })
    .unwrap()
    .build();
    let report = cache.startup().unwrap();

    assert_eq!(report.discarded, 1);
    assert!(!cache.contains(&"x".to_string()));
    assert!(!cache.contains(&"y".to_string()));
    assert!(!cache.contains_digest(&digest));
    assert!(!cache.layout().content_path(&digest).exists());
    assert!(cache.contains(&"survivor".to_string()));
}

#[test]
fn test_corrupt_properties_do_not_block_startup() {
    let tmp = TempDir::new().unwrap();
    let digest = {
        let cache = open(tmp.path());
        let item = put_str(&cache, "k", "value");
        item.digest().to_string()
    };
    let props = tmp.path().join("properties").join(format!("{digest}.properties"));
    fs::write(&props, "garbage without separator\n").unwrap();

    let cache = open(tmp.path());
    assert_eq!(cache.num_files(), 0);
    assert!(!cache.contains(&"k".to_string()));
    assert!(!props.exists());
}

#[test]
fn test_leftover_uploads_are_purged() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir_all(tmp.path().join("tmp")).unwrap();
    fs::write(tmp.path().join("tmp").join("put-interrupted"), b"half").unwrap();

    let cache = FileCache::<String>::builder(tmp.path()).build();
    let report = cache.startup().unwrap();

    assert_eq!(report.purged_tmp, 1);
    assert_eq!(count_entries(cache.layout().tmp_dir()), 0);
}

#[test]
fn test_lifecycle_errors() {
    let tmp = TempDir::new().unwrap();
    let cache = FileCache::<String>::builder(tmp.path()).build();

    assert!(matches!(
        cache.get(&"k".to_string()),
        Err(Error::NotStarted)
    ));
    assert_eq!(cache.num_files(), 0);

    cache.startup().unwrap();
    assert!(matches!(cache.startup(), Err(Error::AlreadyStarted)));
}

#[test]
fn test_comma_in_key_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let cache = open(tmp.path());

    let err = cache
        .put("left,right".to_string(), &mut "v".as_bytes())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidKey { .. }));
    assert_eq!(cache.num_keys(), 0);
    assert_eq!(count_entries(cache.layout().data_dir()), 0);
}

#[test]
fn test_reput_moves_key_to_new_content() {
    let tmp = TempDir::new().unwrap();
    let cache = open(tmp.path());

    let v1 = put_str(&cache, "doc", "version one");
    let v2 = put_str(&cache, "doc", "version two");

    assert!(!v1.path().exists());
    let item = cache.get(&"doc".to_string()).unwrap().unwrap();
    assert_eq!(item.digest(), v2.digest());
    assert_eq!(read_item(&item), "version two");
    assert_eq!(cache.num_files(), 1);
}

#[test]
fn test_digest_defaults_to_sha256() {
    let tmp = TempDir::new().unwrap();
    let cache = open(tmp.path());

    let item = put_str(&cache, "k", "hello world");
    assert_eq!(
        item.digest(),
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
    );
    assert_eq!(item.digest(), Sha256Digests.digest_bytes(b"hello world"));
}

/// Names content by its length, so equal-length content deduplicates
struct LengthDigests;

struct LengthHasher(u64);

impl ContentHasher for LengthHasher {
    fn update(&mut self, bytes: &[u8]) {
        self.0 += bytes.len() as u64;
    }

    fn finish(self: Box<Self>) -> String {
        format!("len-{}", self.0)
    }
}

impl HasherFactory for LengthDigests {
    fn new_hasher(&self) -> Box<dyn ContentHasher> {
        Box::new(LengthHasher(0))
    }
}

#[test]
fn test_custom_hasher_drives_deduplication() {
    let tmp = TempDir::new().unwrap();
    let cache = FileCache::<String>::builder(tmp.path())
        .hasher(LengthDigests)
        .open()
        .unwrap();

    let a = put_str(&cache, "a", "abc");
    let b = put_str(&cache, "b", "xyz");

    assert_eq!(a.digest(), "len-3");
    assert_eq!(b.digest(), "len-3");
    assert_eq!(cache.num_files(), 1);
    // First writer's bytes are kept
    assert_eq!(read_item(&b), "abc");
}

#[test]
fn test_concurrent_puts_and_gets() {
    let tmp = TempDir::new().unwrap();
    let cache = Arc::new(open(tmp.path()));
    let errors = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let errors = Arc::clone(&errors);
            thread::spawn(move || {
                for i in 0..20 {
                    let key = format!("t{t}-{i}");
                    // Half the content is shared across threads
                    let content = if i % 2 == 0 {
                        format!("shared-{i}")
                    } else {
                        format!("own-{t}-{i}")
                    };
                    if let Err(e) = cache.put(key.clone(), &mut content.as_bytes()) {
                        errors.lock().unwrap().push(e.to_string());
                        continue;
                    }
                    match cache.get(&key) {
                        Ok(Some(item)) if item.length() == content.len() as u64 => {}
                        other => errors.lock().unwrap().push(format!("{key}: {other:?}")),
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(errors.lock().unwrap().is_empty(), "{:?}", errors.lock().unwrap());
    assert_eq!(cache.num_keys(), 160);
    // 10 shared contents plus 80 per-thread ones
    assert_eq!(cache.num_files(), 90);
    assert_eq!(count_entries(cache.layout().data_dir()), 90);
    assert_eq!(count_entries(cache.layout().tmp_dir()), 0);
}

#[test]
fn test_stats_serialize() {
    let tmp = TempDir::new().unwrap();
    let cache = open(tmp.path());
    put_str(&cache, "a", "abcd");

    let json = serde_json::to_value(cache.stats()).unwrap();
    assert_eq!(json, serde_json::json!({"files": 1, "bytes": 4, "keys": 1}));
}

#[derive(Clone, Default)]
struct CapturedLogs {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).to_string()
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_operations_emit_tracing_events() {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("stowage_cache=debug"))
        .with_ansi(false)
        .with_writer(logs.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let tmp = TempDir::new().unwrap();
    let cache = open(tmp.path());
    put_str(&cache, "a", "traced");
    assert!(cache.get(&"a".to_string()).unwrap().is_some());
    assert!(cache.get(&"missing".to_string()).unwrap().is_none());

    let text = logs.text();
    assert!(text.contains("Cache index rebuilt"), "{text}");
    assert!(text.contains("Stored content"), "{text}");
    assert!(text.contains("Cache hit"), "{text}");
    assert!(text.contains("Cache miss"), "{text}");
    assert!(text.contains("key=missing"), "{text}");
}

#[test]
fn test_failed_property_write_leaves_no_content() {
    let tmp = TempDir::new().unwrap();
    let cache = open(tmp.path());

    // A plain file where the property directory should be
    let props_dir = cache.layout().properties_dir().to_path_buf();
    fs::remove_dir(&props_dir).unwrap();
    fs::write(&props_dir, b"not a directory").unwrap();

    let err = cache
        .put("k".to_string(), &mut "hello".as_bytes())
        .unwrap_err();
    assert!(matches!(err, Error::Io { .. }), "{err:?}");
    assert_eq!(count_entries(cache.layout().data_dir()), 0);
    assert_eq!(count_entries(cache.layout().tmp_dir()), 0);
    assert_eq!(cache.num_files(), 0);
    assert_eq!(cache.num_keys(), 0);
    assert_eq!(cache.num_bytes(), 0);
    assert!(!cache.contains(&"k".to_string()));
}

#[test]
fn test_failed_put_keeps_existing_entries_intact() {
    let tmp = TempDir::new().unwrap();
    let cache = open(tmp.path());
    let existing = put_str(&cache, "existing", "kept");
    let existing_props = cache.layout().properties_path(existing.digest());
    let props_before = fs::read(&existing_props).unwrap();

    // A directory where the new content's property file would go
    let blocked = cache
        .layout()
        .properties_path(&Sha256Digests.digest_bytes(b"hello"));
    fs::create_dir(&blocked).unwrap();

    let err = cache
        .put("k".to_string(), &mut "hello".as_bytes())
        .unwrap_err();
    assert!(matches!(err, Error::Io { .. }), "{err:?}");
    assert_eq!(fs::read(&existing_props).unwrap(), props_before);
    assert_eq!(count_entries(cache.layout().data_dir()), 1);
    assert_eq!(count_entries(cache.layout().tmp_dir()), 0);
    assert_eq!(cache.num_files(), 1);
    assert_eq!(cache.num_keys(), 1);
    assert_eq!(cache.num_bytes(), 4);
    assert!(!cache.contains(&"k".to_string()));
}

#[test]
fn test_unusable_scratch_directory_fails_put() {
    let tmp = TempDir::new().unwrap();
    let cache = open(tmp.path());
    put_str(&cache, "existing", "kept");

    // A plain file where the scratch directory should be
    let tmp_dir = cache.layout().tmp_dir().to_path_buf();
    fs::remove_dir(&tmp_dir).unwrap();
    fs::write(&tmp_dir, b"not a directory").unwrap();

    let err = cache
        .put("k".to_string(), &mut "hello".as_bytes())
        .unwrap_err();
    assert!(matches!(err, Error::Io { .. }), "{err:?}");
    assert_eq!(count_entries(cache.layout().data_dir()), 1);
    assert_eq!(cache.num_files(), 1);
    assert_eq!(cache.num_keys(), 1);
    assert_eq!(cache.num_bytes(), 4);
    assert!(!cache.contains(&"k".to_string()));
}
