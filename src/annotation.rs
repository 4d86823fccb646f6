//! Per-group annotation cache backed by the remote file server.
//!
//! Each group (isolate) has one GFF3-style annotation file on the server. The
//! first lookup for a group downloads and parses that file, after which every
//! lookup for the group is served from memory. Records are indexed by their
//! primary id and, when present, by an alternate cross-reference id.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use flate2::read::MultiGzDecoder;
use regex::Regex;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::domain::{AnnotationRecord, GroupId};
use crate::error::GenodexError;
use crate::remote::RemoteFiles;
use crate::retry::{Pause, RetryPolicy, ThreadPause};

const GFF_COLUMNS: usize = 9;

#[derive(Debug, Clone)]
pub struct AnnotationOptions {
    /// Directory between `<group>/` and the annotation file on the server.
    pub subpath: String,
    pub feature_type: String,
    pub id_attribute: String,
    pub alt_attribute: String,
    pub alt_prefix: String,
    pub scratch_dir: PathBuf,
    /// How long a failed group is left alone before the next attempt.
    /// `None` retries on every lookup.
    pub negative_ttl: Option<Duration>,
    pub preload_delay: Duration,
    pub preload_failure_delay: Duration,
}

impl Default for AnnotationOptions {
    fn default() -> Self {
        Self {
            subpath: "annotation".to_string(),
            feature_type: "CDS".to_string(),
            id_attribute: "ID".to_string(),
            alt_attribute: "Dbxref".to_string(),
            alt_prefix: "RefSeq:".to_string(),
            scratch_dir: std::env::temp_dir(),
            negative_ttl: None,
            preload_delay: Duration::from_millis(500),
            preload_failure_delay: Duration::from_secs(5),
        }
    }
}

/// Parsed contents of one group's annotation file.
#[derive(Debug, Default)]
pub struct GroupAnnotations {
    by_id: HashMap<String, Arc<AnnotationRecord>>,
    by_alt_id: HashMap<String, Arc<AnnotationRecord>>,
    skipped_lines: usize,
}

impl GroupAnnotations {
    pub fn get(&self, identifier: &str) -> Option<&Arc<AnnotationRecord>> {
        self.by_id
            .get(identifier)
            .or_else(|| self.by_alt_id.get(identifier))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn alt_len(&self) -> usize {
        self.by_alt_id.len()
    }

    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }
}

/// Parses a GFF3 feature section, keeping only `options.feature_type` lines.
/// Malformed lines and lines without a primary id are skipped and counted.
pub fn parse_annotations<R: BufRead>(
    reader: R,
    options: &AnnotationOptions,
) -> Result<GroupAnnotations, GenodexError> {
    let mut parsed = GroupAnnotations::default();
    for line in reader.lines() {
        let line = line.map_err(|err| GenodexError::Filesystem(err.to_string()))?;
        let line = line.trim_end_matches('\r');
        if line.starts_with("##FASTA") {
            break;
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let columns: Vec<&str> = line.split('\t').collect();
        if columns.len() != GFF_COLUMNS {
            parsed.skipped_lines += 1;
            continue;
        }
        if columns[2] != options.feature_type {
            continue;
        }
        let Some(record) = parse_record(&columns, options) else {
            parsed.skipped_lines += 1;
            continue;
        };
        let record = Arc::new(record);
        if let Some(alt_id) = record.alt_id.clone() {
            parsed.by_alt_id.insert(alt_id, Arc::clone(&record));
        }
        parsed.by_id.insert(record.id.clone(), record);
    }
    Ok(parsed)
}

fn parse_record(columns: &[&str], options: &AnnotationOptions) -> Option<AnnotationRecord> {
    let attributes = parse_attributes(columns[8]);
    let id = attributes.get(options.id_attribute.as_str())?.clone();
    let alt_id = attributes
        .get(options.alt_attribute.as_str())
        .and_then(|xrefs| {
            xrefs
                .split(',')
                .map(str::trim)
                .find_map(|xref| xref.strip_prefix(options.alt_prefix.as_str()))
        })
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    let name = attributes
        .get("Name")
        .or_else(|| attributes.get("gene"))
        .cloned();
    Some(AnnotationRecord {
        id,
        alt_id,
        name,
        seqid: columns[0].to_string(),
        source: columns[1].to_string(),
        feature_type: columns[2].to_string(),
        start: columns[3].parse().ok()?,
        end: columns[4].parse().ok()?,
        score: columns[5].parse().ok(),
        strand: match columns[6] {
            "+" => Some('+'),
            "-" => Some('-'),
            _ => None,
        },
        phase: columns[7].parse().ok(),
        product: attributes.get("product").cloned(),
    })
}

/// `key=value;key=value`, values percent-decoded.
pub fn parse_attributes(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), unescape(value.trim())))
        })
        .collect()
}

fn unescape(value: &str) -> String {
    if !value.contains('%') {
        return value.to_string();
    }
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Lookup seam used by the row transforms.
pub trait Annotations {
    /// `None` when the identifier is unknown or the group could not be loaded.
    fn annotation(&self, group: &GroupId, identifier: &str) -> Option<Arc<AnnotationRecord>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PreloadSummary {
    pub loaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct AnnotationCache<R: RemoteFiles> {
    remote: R,
    options: AnnotationOptions,
    policy: RetryPolicy,
    pause: Arc<dyn Pause>,
    groups: RwLock<HashMap<GroupId, Arc<GroupAnnotations>>>,
    failures: Mutex<HashMap<GroupId, Instant>>,
    // Held for the whole load sequence so a group is fetched at most once.
    load_lock: Mutex<()>,
    loads: AtomicUsize,
}

impl<R: RemoteFiles> AnnotationCache<R> {
    pub fn new(remote: R, options: AnnotationOptions, policy: RetryPolicy) -> Self {
        Self {
            remote,
            options,
            policy,
            pause: Arc::new(ThreadPause),
            groups: RwLock::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            load_lock: Mutex::new(()),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn with_pause(mut self, pause: Arc<dyn Pause>) -> Self {
        self.pause = pause;
        self
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Number of load sequences started (successful or not).
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn is_loaded(&self, group: &GroupId) -> bool {
        self.groups
            .read()
            .map(|groups| groups.contains_key(group))
            .unwrap_or(false)
    }

    pub fn loaded_groups(&self) -> Vec<GroupId> {
        let mut groups: Vec<GroupId> = self
            .groups
            .read()
            .map(|groups| groups.keys().cloned().collect())
            .unwrap_or_default();
        groups.sort();
        groups
    }

    pub fn clear(&self) {
        if let Ok(mut groups) = self.groups.write() {
            groups.clear();
        }
        if let Ok(mut failures) = self.failures.lock() {
            failures.clear();
        }
    }

    /// Resolves `identifier` against the primary ids, then the alternate ids,
    /// of `group`, loading the group first if needed.
    pub fn lookup(
        &self,
        group: &GroupId,
        identifier: &str,
    ) -> Result<Option<Arc<AnnotationRecord>>, GenodexError> {
        let annotations = self.ensure_loaded(group)?;
        Ok(annotations.get(identifier).cloned())
    }

    /// Loads every group not yet in the cache, pausing between remote fetches.
    /// A failing group is logged and skipped.
    pub fn preload(&self, groups: &[GroupId]) -> PreloadSummary {
        let mut summary = PreloadSummary::default();
        let pending: Vec<&GroupId> = groups
            .iter()
            .filter(|group| {
                let loaded = self.is_loaded(group);
                if loaded {
                    summary.skipped += 1;
                }
                !loaded
            })
            .collect();
        let total = pending.len();
        for (index, group) in pending.into_iter().enumerate() {
            let delay = match self.ensure_loaded(group) {
                Ok(_) => {
                    summary.loaded += 1;
                    self.options.preload_delay
                }
                Err(err) => {
                    warn!(group = %group, error = %err, "annotation preload failed");
                    summary.failed += 1;
                    self.options.preload_failure_delay
                }
            };
            if index + 1 < total {
                self.pause.pause(delay);
            }
        }
        info!(
            loaded = summary.loaded,
            skipped = summary.skipped,
            failed = summary.failed,
            "annotation preload finished"
        );
        summary
    }

    fn cached(&self, group: &GroupId) -> Option<Arc<GroupAnnotations>> {
        self.groups
            .read()
            .ok()
            .and_then(|groups| groups.get(group).cloned())
    }

    fn ensure_loaded(&self, group: &GroupId) -> Result<Arc<GroupAnnotations>, GenodexError> {
        if let Some(annotations) = self.cached(group) {
            return Ok(annotations);
        }
        let _guard = self
            .load_lock
            .lock()
            .map_err(|_| GenodexError::Filesystem("annotation load lock poisoned".to_string()))?;
        if let Some(annotations) = self.cached(group) {
            return Ok(annotations);
        }
        self.check_negative_cache(group)?;

        self.loads.fetch_add(1, Ordering::SeqCst);
        match self.load_group(group) {
            Ok(annotations) => {
                let annotations = Arc::new(annotations);
                let mut groups = self.groups.write().map_err(|_| {
                    GenodexError::Filesystem("annotation cache lock poisoned".to_string())
                })?;
                groups.insert(group.clone(), Arc::clone(&annotations));
                if let Ok(mut failures) = self.failures.lock() {
                    failures.remove(group);
                }
                Ok(annotations)
            }
            Err(err) => {
                if self.options.negative_ttl.is_some() {
                    if let Ok(mut failures) = self.failures.lock() {
                        failures.insert(group.clone(), Instant::now());
                    }
                }
                Err(err)
            }
        }
    }

    fn check_negative_cache(&self, group: &GroupId) -> Result<(), GenodexError> {
        let Some(ttl) = self.options.negative_ttl else {
            return Ok(());
        };
        let failed_at = self
            .failures
            .lock()
            .ok()
            .and_then(|failures| failures.get(group).copied());
        let Some(elapsed) = failed_at.map(|at| at.elapsed()) else {
            return Ok(());
        };
        if elapsed >= ttl {
            return Ok(());
        }
        Err(GenodexError::AnnotationUnavailable {
            group: group.to_string(),
            retry_in_secs: ttl.saturating_sub(elapsed).as_secs(),
        })
    }

    fn load_group(&self, group: &GroupId) -> Result<GroupAnnotations, GenodexError> {
        fs::create_dir_all(&self.options.scratch_dir)
            .map_err(|err| GenodexError::Filesystem(err.to_string()))?;
        let (file_name, scratch) = self.policy.run(
            self.pause.as_ref(),
            |attempt| {
                debug!(group = %group, attempt, "fetching annotation file");
                let file_name = self.resolve_file_name(group)?;
                let scratch = tempfile::Builder::new()
                    .prefix("genodex-")
                    .suffix(&format!("-{file_name}"))
                    .tempfile_in(&self.options.scratch_dir)
                    .map_err(|err| GenodexError::Filesystem(err.to_string()))?;
                let remote_path = format!("{}/{}", self.remote_dir(group), file_name);
                self.remote.download(&remote_path, scratch.path())?;
                Ok((file_name, scratch))
            },
            |err: &GenodexError| (!err.is_permanent()).then(|| err.failure_class()),
        )?;

        let annotations = parse_scratch(&scratch, &file_name, &self.options)?;
        scratch
            .close()
            .map_err(|err| GenodexError::Filesystem(err.to_string()))?;
        info!(
            group = %group,
            records = annotations.len(),
            alternate = annotations.alt_len(),
            skipped = annotations.skipped_lines(),
            "loaded annotations"
        );
        Ok(annotations)
    }

    fn remote_dir(&self, group: &GroupId) -> String {
        let subpath = self.options.subpath.trim_matches('/');
        if subpath.is_empty() {
            group.to_string()
        } else {
            format!("{group}/{subpath}")
        }
    }

    fn resolve_file_name(&self, group: &GroupId) -> Result<String, GenodexError> {
        let dir = self.remote_dir(group);
        let pattern = Regex::new(&format!(
            r"^{}_annotations\.[A-Za-z0-9]+(\.gz)?$",
            regex::escape(group.as_str())
        ))
        .map_err(|err| GenodexError::InvalidGroupId(err.to_string()))?;
        self.remote
            .list(&dir)?
            .into_iter()
            .find(|name| pattern.is_match(name))
            .ok_or(GenodexError::AnnotationNotFound {
                group: group.to_string(),
                dir,
            })
    }
}

fn parse_scratch(
    scratch: &NamedTempFile,
    file_name: &str,
    options: &AnnotationOptions,
) -> Result<GroupAnnotations, GenodexError> {
    let file = File::open(scratch.path()).map_err(|err| GenodexError::Filesystem(err.to_string()))?;
    let reader: Box<dyn Read> = if file_name.ends_with(".gz") {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };
    parse_annotations(BufReader::new(reader), options)
}

impl<R: RemoteFiles> Annotations for AnnotationCache<R> {
    fn annotation(&self, group: &GroupId, identifier: &str) -> Option<Arc<AnnotationRecord>> {
        match self.lookup(group, identifier) {
            Ok(record) => record,
            Err(err) => {
                warn!(group = %group, error = %err, "annotation lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_are_unescaped() {
        let attrs = parse_attributes("ID=BU_001;product=ABC transporter%2C permease;Name=");
        assert_eq!(attrs["ID"], "BU_001");
        assert_eq!(attrs["product"], "ABC transporter, permease");
        assert_eq!(attrs["Name"], "");
    }

    #[test]
    fn stops_at_fasta_section() {
        let gff = "##gff-version 3\n\
contig_1\tBakta\tCDS\t10\t90\t.\t+\t0\tID=A_1\n\
##FASTA\n\
contig_1\tBakta\tCDS\t100\t200\t.\t+\t0\tID=A_2\n";
        let parsed = parse_annotations(gff.as_bytes(), &AnnotationOptions::default()).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(parsed.get("A_1").is_some());
        assert!(parsed.get("A_2").is_none());
    }
}
