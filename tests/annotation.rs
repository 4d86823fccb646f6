use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::TempDir;

use genodex::annotation::{
    AnnotationCache, AnnotationOptions, Annotations, PreloadSummary, parse_annotations,
};
use genodex::domain::GroupId;
use genodex::error::GenodexError;
use genodex::remote::RemoteFiles;
use genodex::retry::{Pause, RetryPolicy};

const ISO1_GFF: &str = include_str!("fixtures/ISO1_annotations.gff3");

#[derive(Default)]
struct RecordingPause {
    pauses: Mutex<Vec<Duration>>,
}

impl RecordingPause {
    fn recorded(&self) -> Vec<Duration> {
        self.pauses.lock().unwrap().clone()
    }
}

impl Pause for RecordingPause {
    fn pause(&self, duration: Duration) {
        self.pauses.lock().unwrap().push(duration);
    }
}

#[derive(Default)]
struct MockServer {
    files: HashMap<String, Vec<u8>>,
    failures: Mutex<VecDeque<GenodexError>>,
    lists: AtomicUsize,
    downloads: AtomicUsize,
}

impl MockServer {
    fn with_file(mut self, path: &str, content: &[u8]) -> Self {
        self.files.insert(path.to_string(), content.to_vec());
        self
    }

    fn fail_next(self, error: GenodexError) -> Self {
        self.failures.lock().unwrap().push_back(error);
        self
    }

    fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

impl RemoteFiles for MockServer {
    fn list(&self, dir: &str) -> Result<Vec<String>, GenodexError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let mut names: Vec<String> = self
            .files
            .keys()
            .filter_map(|path| path.strip_prefix(dir)?.strip_prefix('/'))
            .filter(|name| !name.contains('/'))
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    fn download(&self, path: &str, destination: &Path) -> Result<(), GenodexError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let content = self.files.get(path).ok_or(GenodexError::RemoteStatus {
            status: 404,
            message: path.to_string(),
        })?;
        fs::write(destination, content).map_err(|err| GenodexError::Filesystem(err.to_string()))
    }
}

fn server() -> MockServer {
    MockServer::default()
        .with_file("ISO1/annotation/ISO1_annotations.gff3", ISO1_GFF.as_bytes())
        .with_file("ISO1/annotation/README.txt", b"not an annotation file")
        .with_file("ISO2/annotation/ISO2_annotations.gff3", ISO1_GFF.as_bytes())
}

fn options(scratch: &TempDir) -> AnnotationOptions {
    AnnotationOptions {
        scratch_dir: scratch.path().to_path_buf(),
        ..AnnotationOptions::default()
    }
}

fn cache(
    remote: MockServer,
    options: AnnotationOptions,
) -> (AnnotationCache<MockServer>, Arc<RecordingPause>) {
    let pause = Arc::new(RecordingPause::default());
    let cache =
        AnnotationCache::new(remote, options, RetryPolicy::default()).with_pause(pause.clone());
    (cache, pause)
}

fn group(value: &str) -> GroupId {
    value.parse().unwrap()
}

#[test]
fn parses_fixture_feature_lines() {
    let parsed = parse_annotations(ISO1_GFF.as_bytes(), &AnnotationOptions::default()).unwrap();
    assert_eq!(parsed.len(), 3);
    assert_eq!(parsed.alt_len(), 2);
    assert_eq!(parsed.skipped_lines(), 2);

    let record = parsed.get("BU_0003").unwrap();
    assert_eq!(
        record.product.as_deref(),
        Some("hypothetical protein; truncated")
    );
    assert_eq!((record.start, record.end), (950, 1200));
    assert_eq!(record.strand, Some('+'));
    assert!(parsed.get("gene-BU_0001").is_none());
}

#[test]
fn group_is_fetched_once() {
    let scratch = TempDir::new().unwrap();
    let (cache, _) = cache(server(), options(&scratch));
    let iso1 = group("ISO1");

    let first = cache.lookup(&iso1, "BU_0001").unwrap().unwrap();
    assert_eq!(first.name.as_deref(), Some("dnaA"));
    assert!(cache.lookup(&iso1, "BU_0002").unwrap().is_some());
    assert!(cache.lookup(&iso1, "BU_9999").unwrap().is_none());

    assert_eq!(cache.remote().downloads(), 1);
    assert_eq!(cache.load_count(), 1);
    assert!(cache.is_loaded(&iso1));
    assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[test]
fn alternate_id_resolves_same_record() {
    let scratch = TempDir::new().unwrap();
    let (cache, _) = cache(server(), options(&scratch));

    let record = cache.lookup(&group("ISO1"), "WP_000002.1").unwrap().unwrap();
    assert_eq!(record.id, "BU_0002");
    assert_eq!(record.name.as_deref(), Some("dnaN"));
    assert_eq!(record.alt_id.as_deref(), Some("WP_000002.1"));
}

#[test]
fn concurrent_lookups_share_one_fetch() {
    let scratch = TempDir::new().unwrap();
    let (cache, _) = cache(server(), options(&scratch));
    let iso1 = group("ISO1");

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                assert!(cache.lookup(&iso1, "BU_0001").unwrap().is_some());
            });
        }
    });
    assert_eq!(cache.remote().downloads(), 1);
}

#[test]
fn transient_connection_errors_are_retried() {
    let scratch = TempDir::new().unwrap();
    let remote = server()
        .fail_next(GenodexError::RemoteConnect("connection reset".to_string()))
        .fail_next(GenodexError::RemoteConnect("connection reset".to_string()));
    let (cache, pause) = cache(remote, options(&scratch));

    let record = cache.lookup(&group("ISO1"), "BU_0001").unwrap();
    assert!(record.is_some());
    assert_eq!(cache.remote().downloads(), 3);
    assert_eq!(
        pause.recorded(),
        vec![Duration::from_secs(5), Duration::from_secs(10)]
    );
}

#[test]
fn retries_stop_after_max_attempts() {
    let scratch = TempDir::new().unwrap();
    let mut remote = server();
    for _ in 0..5 {
        remote = remote.fail_next(GenodexError::RemoteHttp("502 bad gateway".to_string()));
    }
    let (cache, pause) = cache(remote, options(&scratch));

    let err = cache.lookup(&group("ISO1"), "BU_0001").unwrap_err();
    assert_matches!(err, GenodexError::RemoteHttp(_));
    assert_eq!(cache.remote().downloads(), 5);
    assert_eq!(pause.recorded().len(), 4);
    assert_eq!(pause.recorded()[0], Duration::from_secs(1));
}

#[test]
fn missing_file_is_not_retried_or_remembered() {
    let scratch = TempDir::new().unwrap();
    let (cache, pause) = cache(server(), options(&scratch));
    let missing = group("ISO9");

    let err = cache.lookup(&missing, "BU_0001").unwrap_err();
    assert_matches!(err, GenodexError::AnnotationNotFound { .. });
    assert!(pause.recorded().is_empty());
    assert_eq!(cache.remote().lists(), 1);

    let err = cache.lookup(&missing, "BU_0001").unwrap_err();
    assert_matches!(err, GenodexError::AnnotationNotFound { .. });
    assert_eq!(cache.remote().lists(), 2);
    assert_eq!(cache.remote().downloads(), 0);
}

#[test]
fn negative_ttl_suppresses_repeat_fetches() {
    let scratch = TempDir::new().unwrap();
    let options = AnnotationOptions {
        negative_ttl: Some(Duration::from_secs(60)),
        ..options(&scratch)
    };
    let (cache, _) = cache(server(), options);
    let missing = group("ISO9");

    assert_matches!(
        cache.lookup(&missing, "BU_0001"),
        Err(GenodexError::AnnotationNotFound { .. })
    );
    assert_matches!(
        cache.lookup(&missing, "BU_0001"),
        Err(GenodexError::AnnotationUnavailable { .. })
    );
    assert_eq!(cache.remote().lists(), 1);
}

#[test]
fn trait_lookup_swallows_failures() {
    let scratch = TempDir::new().unwrap();
    let (cache, _) = cache(server(), options(&scratch));
    let annotations: &dyn Annotations = &cache;

    assert!(annotations.annotation(&group("ISO9"), "BU_0001").is_none());
    assert!(annotations.annotation(&group("ISO1"), "BU_0001").is_some());
}

#[test]
fn gzipped_annotation_files_are_read() {
    let scratch = TempDir::new().unwrap();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(ISO1_GFF.as_bytes()).unwrap();
    let compressed = encoder.finish().unwrap();
    let remote =
        MockServer::default().with_file("ISO3/annotation/ISO3_annotations.gff3.gz", &compressed);
    let (cache, _) = cache(remote, options(&scratch));

    let record = cache.lookup(&group("ISO3"), "WP_000001.1").unwrap().unwrap();
    assert_eq!(record.id, "BU_0001");
}

#[test]
fn preload_continues_past_failures() {
    let scratch = TempDir::new().unwrap();
    let (cache, pause) = cache(server(), options(&scratch));
    let groups = [group("ISO1"), group("ISO9"), group("ISO2")];

    let summary = cache.preload(&groups);
    assert_eq!(
        summary,
        PreloadSummary {
            loaded: 2,
            skipped: 0,
            failed: 1,
        }
    );
    assert_eq!(
        pause.recorded(),
        vec![Duration::from_millis(500), Duration::from_secs(5)]
    );
    assert_eq!(cache.loaded_groups(), vec![group("ISO1"), group("ISO2")]);

    let again = cache.preload(&[group("ISO1"), group("ISO2")]);
    assert_eq!(again.skipped, 2);
    assert_eq!(pause.recorded().len(), 2);
    assert_eq!(cache.remote().downloads(), 2);
}

#[test]
fn clear_forces_refetch() {
    let scratch = TempDir::new().unwrap();
    let (cache, _) = cache(server(), options(&scratch));
    let iso1 = group("ISO1");

    cache.lookup(&iso1, "BU_0001").unwrap();
    cache.clear();
    assert!(!cache.is_loaded(&iso1));
    cache.lookup(&iso1, "BU_0001").unwrap();
    assert_eq!(cache.remote().downloads(), 2);
}

#[test]
fn expired_negative_entry_allows_refetch() {
    let scratch = TempDir::new().unwrap();
    let options = AnnotationOptions {
        negative_ttl: Some(Duration::ZERO),
        ..options(&scratch)
    };
    let (cache, _) = cache(server(), options);
    let missing = group("ISO9");

    for _ in 0..3 {
        assert_matches!(
            cache.lookup(&missing, "BU_0001"),
            Err(GenodexError::AnnotationNotFound { .. })
        );
    }
    assert_eq!(cache.remote().lists(), 3);
}
