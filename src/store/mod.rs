//! Append-only, time-indexed sample logs with a periodic save checkpoint.
//!
//! A session keeps two stores: temperature [`Sample`]s and
//! [`CommandRecord`]s. Records are kept in memory in insertion order; when a
//! CSV path is attached, every save checkpoint appends the rows written since
//! the previous save (the header is written once, on the first save). A row
//! counts as saved once it has been flushed, so a save that fails halfway
//! is resumed from the first unwritten row without duplicates.

pub mod paths;
pub mod record;

pub use paths::LogPaths;
pub use record::{CommandRecord, Record, Sample, COMMAND_HEADING, PV_HEADING, SP_HEADING};

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::{PidError, PidResult};

/// Whether the `count`-th append (1-based) is a save checkpoint.
///
/// Fires exactly when `count % every == 0`.
pub fn is_checkpoint(count: usize, every: usize) -> bool {
    count >= 1 && every >= 1 && count % every == 0
}

/// Ordered log of records with an optional CSV sink.
#[derive(Debug)]
pub struct SampleStore<R: Record> {
    records: Vec<R>,
    started: Instant,
    save_every: usize,
    datetime_format: String,
    csv_path: Option<PathBuf>,
    persisted: usize,
    header_written: bool,
    checkpoints: usize,
}

impl<R: Record> SampleStore<R> {
    /// A store that never touches the disk.
    pub fn in_memory(save_every: usize, datetime_format: impl Into<String>) -> Self {
        Self {
            records: Vec::new(),
            started: Instant::now(),
            save_every: save_every.max(1),
            datetime_format: datetime_format.into(),
            csv_path: None,
            persisted: 0,
            header_written: false,
            checkpoints: 0,
        }
    }

    /// A store persisted to `path` on every save checkpoint.
    pub fn with_csv(
        path: impl Into<PathBuf>,
        save_every: usize,
        datetime_format: impl Into<String>,
    ) -> Self {
        Self {
            csv_path: Some(path.into()),
            ..Self::in_memory(save_every, datetime_format)
        }
    }

    /// Offset of "now" from the start of the store.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Append a record and run the save checkpoint policy.
    ///
    /// Returns `true` when this append was a checkpoint.
    pub fn append(&mut self, record: R) -> PidResult<bool> {
        self.records.push(record);
        if !is_checkpoint(self.records.len(), self.save_every) {
            return Ok(false);
        }
        self.checkpoints += 1;
        self.flush()?;
        Ok(true)
    }

    /// The last `n` records, or all of them if fewer exist.
    pub fn tail(&self, n: usize) -> &[R] {
        let start = self.records.len().saturating_sub(n);
        &self.records[start..]
    }

    /// All records in insertion order.
    pub fn records(&self) -> &[R] {
        &self.records
    }

    /// Number of records appended so far.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no record has been appended yet.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of save checkpoints that have fired.
    pub fn checkpoints(&self) -> usize {
        self.checkpoints
    }

    /// Appends between two checkpoints.
    pub fn save_every(&self) -> usize {
        self.save_every
    }

    /// CSV output path, if persistence is enabled.
    pub fn csv_path(&self) -> Option<&Path> {
        self.csv_path.as_deref()
    }

    /// Write every record not yet on disk. No-op without a CSV path or when
    /// nothing new was appended.
    pub fn flush(&mut self) -> PidResult<()> {
        let Some(path) = self.csv_path.clone() else {
            return Ok(());
        };
        if self.persisted == self.records.len() {
            return Ok(());
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PidError::storage(&path, e))?;
        let before = self.persisted;
        self.write_pending(file, &path)?;
        debug!(
            "Saved {} row(s) to '{}'",
            self.persisted - before,
            path.display()
        );
        Ok(())
    }

    /// Write the header (once) and the pending rows to `out`.
    ///
    /// Each row is flushed before it counts as saved, so after a failure the
    /// next save starts at the first row that did not reach `out`.
    fn write_pending<W: io::Write>(&mut self, mut out: W, path: &Path) -> PidResult<()> {
        if !self.header_written {
            let mut header: Vec<String> = record::time_headings(&self.datetime_format).into();
            header.extend(R::value_headings().iter().map(ToString::to_string));
            write_line(&mut out, &header).map_err(|e| PidError::storage(path, e))?;
            self.header_written = true;
        }

        while self.persisted < self.records.len() {
            let row = &self.records[self.persisted];
            let mut fields: Vec<String> = record::time_values(row, &self.datetime_format)
                .map_err(|_| {
                    PidError::storage(
                        path,
                        io::Error::new(
                            io::ErrorKind::InvalidInput,
                            format!("invalid datetime format '{}'", self.datetime_format),
                        ),
                    )
                })?
                .into();
            fields.extend(row.values());
            write_line(&mut out, &fields).map_err(|e| PidError::storage(path, e))?;
            self.persisted += 1;
        }
        Ok(())
    }
}

/// Encode one CSV line and hand it to `out` in a single `write_all`.
fn write_line<W: io::Write>(out: &mut W, fields: &[String]) -> csv::Result<()> {
    let mut line = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    line.write_record(fields)?;
    let bytes = line.into_inner().map_err(|e| e.into_error())?;
    out.write_all(&bytes)?;
    out.flush()?;
    Ok(())
}
