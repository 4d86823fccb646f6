//! Streaming row-to-document ingestion with batched bulk writes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::GenodexError;
use crate::index::{BulkOperation, IndexSettings, IndexWriter, ItemOutcome, Visibility};
use crate::source::{DelimitedReader, Row, collect_inputs};

/// Result of converting one input row.
#[derive(Debug, Clone, PartialEq)]
pub enum Transformed {
    Op(BulkOperation),
    /// Row dropped; the reason is reported in the run summary.
    Skip(&'static str),
}

pub trait RowTransform {
    fn transform(&self, row: &Row) -> Transformed;
}

impl<F> RowTransform for F
where
    F: Fn(&Row) -> Transformed,
{
    fn transform(&self, row: &Row) -> Transformed {
        self(row)
    }
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub index: String,
    pub batch_size: usize,
    pub chunk_size: usize,
    pub visibility: Visibility,
    /// Relax refresh interval and replicas for the duration of the run.
    pub optimize_writes: bool,
    pub refresh_every_rows: Option<u64>,
    pub refresh_every: Option<Duration>,
}

impl IngestOptions {
    pub fn new(index: &str) -> Self {
        Self {
            index: index.to_string(),
            batch_size: 500,
            chunk_size: 10_000,
            visibility: Visibility::BestEffort,
            optimize_writes: true,
            refresh_every_rows: None,
            refresh_every: None,
        }
    }
}

/// Counters for documents sent through a [`BatchWriter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteStats {
    pub attempted: u64,
    pub indexed: u64,
    /// Conditional updates that matched existing data.
    pub unchanged: u64,
    pub failed: u64,
    pub batches: u64,
    pub failed_batches: u64,
}

/// Accumulates operations and sends them once `batch_size` is reached.
/// Write failures are logged and counted, never returned.
pub struct BatchWriter<'a, W: IndexWriter> {
    writer: &'a W,
    index: &'a str,
    visibility: Visibility,
    batch_size: usize,
    pending: Vec<BulkOperation>,
    stats: WriteStats,
}

impl<'a, W: IndexWriter> BatchWriter<'a, W> {
    pub fn new(writer: &'a W, index: &'a str, batch_size: usize, visibility: Visibility) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            writer,
            index,
            visibility,
            batch_size,
            pending: Vec::with_capacity(batch_size),
            stats: WriteStats::default(),
        }
    }

    pub fn push(&mut self, operation: BulkOperation) {
        self.pending.push(operation);
        if self.pending.len() >= self.batch_size {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        let count = batch.len() as u64;
        self.stats.attempted += count;
        self.stats.batches += 1;
        match self.writer.bulk(self.index, &batch, self.visibility) {
            Ok(response) => {
                for item in &response.items {
                    match &item.outcome {
                        ItemOutcome::Created | ItemOutcome::Updated => self.stats.indexed += 1,
                        ItemOutcome::Noop => self.stats.unchanged += 1,
                        ItemOutcome::Failed { status, reason } => {
                            self.stats.failed += 1;
                            warn!(index = self.index, id = %item.id, status, reason = %reason, "document rejected");
                        }
                    }
                }
                let answered = response.items.len() as u64;
                if answered < count {
                    self.stats.failed += count - answered;
                    warn!(index = self.index, missing = count - answered, "bulk response missing items");
                }
                debug!(index = self.index, documents = count, "bulk batch written");
            }
            Err(err) => {
                self.stats.failed += count;
                self.stats.failed_batches += 1;
                let first = batch.first().map(BulkOperation::id).unwrap_or_default();
                let last = batch.last().map(BulkOperation::id).unwrap_or_default();
                warn!(index = self.index, documents = count, first = %first, last = %last, error = %err, "bulk batch failed");
            }
        }
    }

    pub fn stats(&self) -> WriteStats {
        self.stats
    }

    /// Flushes the trailing partial batch and returns the totals.
    pub fn finish(mut self) -> WriteStats {
        self.flush();
        self.stats
    }
}

/// Captures the index's near-real-time settings and relaxes them for a bulk
/// load. The captured values are written back by [`RelaxedSettings::restore`],
/// or on drop if the run unwinds first.
pub struct RelaxedSettings<'a, W: IndexWriter> {
    writer: &'a W,
    index: String,
    original: IndexSettings,
    restored: bool,
}

impl<'a, W: IndexWriter> RelaxedSettings<'a, W> {
    pub fn apply(writer: &'a W, index: &str) -> Result<Self, GenodexError> {
        let original = writer.settings(index)?;
        writer.put_settings(index, &IndexSettings::bulk_load())?;
        info!(index, original = ?original, "relaxed index settings for bulk load");
        Ok(Self {
            writer,
            index: index.to_string(),
            original,
            restored: false,
        })
    }

    pub fn original(&self) -> &IndexSettings {
        &self.original
    }

    pub fn restore(mut self) -> Result<(), GenodexError> {
        self.restored = true;
        self.writer.put_settings(&self.index, &self.original)?;
        info!(index = %self.index, "restored index settings");
        Ok(())
    }
}

impl<W: IndexWriter> Drop for RelaxedSettings<'_, W> {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        if let Err(err) = self.writer.put_settings(&self.index, &self.original) {
            error!(index = %self.index, error = %err, "failed to restore index settings");
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub index: String,
    pub files: u64,
    pub rows_read: u64,
    pub rows_skipped: u64,
    pub skipped_by_reason: BTreeMap<String, u64>,
    #[serde(flatten)]
    pub writes: WriteStats,
    pub refreshes: u64,
    pub settings_restored: bool,
    pub started_at: String,
    pub finished_at: String,
}

impl IngestSummary {
    pub fn record_skip(&mut self, reason: &str) {
        self.rows_skipped += 1;
        *self.skipped_by_reason.entry(reason.to_string()).or_default() += 1;
    }
}

pub struct StreamingIngestor<W: IndexWriter> {
    writer: W,
    options: IngestOptions,
}

impl<W: IndexWriter> StreamingIngestor<W> {
    pub fn new(writer: W, options: IngestOptions) -> Self {
        Self { writer, options }
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// Streams every input through `transform` into the index.
    ///
    /// Unreadable inputs and an unreachable store (while capturing settings)
    /// abort the run. Per-row and per-batch failures are counted instead.
    pub fn run(
        &self,
        inputs: &[PathBuf],
        transform: &dyn RowTransform,
    ) -> Result<IngestSummary, GenodexError> {
        let files = collect_inputs(inputs)?;
        let mut summary = IngestSummary {
            index: self.options.index.clone(),
            started_at: chrono::Utc::now().to_rfc3339(),
            ..IngestSummary::default()
        };

        let guard = if self.options.optimize_writes {
            Some(RelaxedSettings::apply(&self.writer, &self.options.index)?)
        } else {
            None
        };

        let result = self.stream(&files, transform, &mut summary);

        summary.settings_restored = match guard {
            Some(guard) => match guard.restore() {
                Ok(()) => true,
                Err(err) => {
                    error!(index = %self.options.index, error = %err, "failed to restore index settings");
                    false
                }
            },
            None => true,
        };
        result?;

        summary.finished_at = chrono::Utc::now().to_rfc3339();
        info!(
            index = %summary.index,
            files = summary.files,
            rows = summary.rows_read,
            skipped = summary.rows_skipped,
            indexed = summary.writes.indexed,
            unchanged = summary.writes.unchanged,
            failed = summary.writes.failed,
            "ingest finished"
        );
        Ok(summary)
    }

    fn stream(
        &self,
        files: &[PathBuf],
        transform: &dyn RowTransform,
        summary: &mut IngestSummary,
    ) -> Result<(), GenodexError> {
        let options = &self.options;
        let mut batch = BatchWriter::new(
            &self.writer,
            &options.index,
            options.batch_size,
            options.visibility,
        );
        let mut refresh = RefreshSchedule::new(options.refresh_every_rows, options.refresh_every);
        let result = self.stream_files(files, transform, summary, &mut batch, &mut refresh);
        // Rows transformed before a fatal read error are still written.
        summary.writes = batch.finish();
        result
    }

    fn stream_files(
        &self,
        files: &[PathBuf],
        transform: &dyn RowTransform,
        summary: &mut IngestSummary,
        batch: &mut BatchWriter<'_, W>,
        refresh: &mut RefreshSchedule,
    ) -> Result<(), GenodexError> {
        let options = &self.options;
        for path in files {
            let mut reader = DelimitedReader::open(path)?;
            summary.files += 1;
            info!(path = %path.display(), "reading input");
            loop {
                let chunk = reader.next_chunk(options.chunk_size)?;
                if chunk.is_empty() {
                    break;
                }
                for row in &chunk {
                    summary.rows_read += 1;
                    let transformed = match row.defect() {
                        Some(reason) => Transformed::Skip(reason),
                        None => transform.transform(row),
                    };
                    match transformed {
                        Transformed::Op(operation) => batch.push(operation),
                        Transformed::Skip(reason) => {
                            debug!(path = %path.display(), line = row.line(), reason, "row skipped");
                            summary.record_skip(reason);
                        }
                    }
                    if refresh.tick() {
                        batch.flush();
                        match self.writer.refresh(&options.index) {
                            Ok(()) => summary.refreshes += 1,
                            Err(err) => warn!(index = %options.index, error = %err, "refresh failed"),
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Decides when an intermediate refresh is due, by row count or elapsed time.
struct RefreshSchedule {
    every_rows: Option<u64>,
    every: Option<Duration>,
    rows: u64,
    last: Instant,
}

impl RefreshSchedule {
    fn new(every_rows: Option<u64>, every: Option<Duration>) -> Self {
        Self {
            every_rows: every_rows.filter(|n| *n > 0),
            every,
            rows: 0,
            last: Instant::now(),
        }
    }

    fn tick(&mut self) -> bool {
        if self.every_rows.is_none() && self.every.is_none() {
            return false;
        }
        self.rows += 1;
        let by_rows = self.every_rows.is_some_and(|n| self.rows >= n);
        let by_time = self.every.is_some_and(|every| self.last.elapsed() >= every);
        if by_rows || by_time {
            self.rows = 0;
            self.last = Instant::now();
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_schedule_counts_rows() {
        let mut schedule = RefreshSchedule::new(Some(3), None);
        let fired: Vec<bool> = (0..7).map(|_| schedule.tick()).collect();
        assert_eq!(fired, [false, false, true, false, false, true, false]);
    }

    #[test]
    fn refresh_schedule_fires_on_elapsed_time() {
        let mut schedule = RefreshSchedule::new(None, Some(Duration::from_secs(60)));
        assert!(!schedule.tick());

        schedule.last = Instant::now()
            .checked_sub(Duration::from_secs(61))
            .unwrap_or(schedule.last);
        assert!(schedule.tick());
        assert_eq!(schedule.rows, 0);
        assert!(schedule.last.elapsed() < Duration::from_secs(60));
        assert!(!schedule.tick());
    }

    #[test]
    fn refresh_schedule_with_zero_interval_fires_every_row() {
        let mut schedule = RefreshSchedule::new(None, Some(Duration::ZERO));
        assert!((0..5).all(|_| schedule.tick()));
    }

    #[test]
    fn refresh_schedule_disabled() {
        let mut schedule = RefreshSchedule::new(None, None);
        assert!((0..100).all(|_| !schedule.tick()));
    }
}
