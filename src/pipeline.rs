//! Batch-to-Container pipeline.
//!
//! A run moves through these steps, strictly one after another:
//!
//! 1. [`prepare_sources`]: download and unpack the archive unless that work
//!    is already done.
//! 2. [`convert_split`] for every configured split, in order. Each member is
//!    read, every row is encoded, and every record is appended to the split's
//!    container.
//! 3. Optionally [`verify_container`] on every output.
//! 4. Log the metrics and write them out if requested.
//! 5. [`cleanup_sources`]: remove the archive and the extracted directory.
//!
//! The first error aborts the run. A container being written when the error
//! happens is closed and left in place.

use crate::batch::read_batch;
use crate::config::{DatasetConfig, RunOptions, Split, SplitSpec};
use crate::error::{ConvertError, Result};
use crate::example::{decode_record, encode_record};
use crate::io::archive::Extractor;
use crate::io::fetch::{Fetcher, ProgressReporter};
use crate::io::tfrecord::{RecordReader, RecordWriter};
use crate::metrics::MetricsCollector;
use log::{debug, info, warn};
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Where a split is in its conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Pending,
    Reading,
    Encoding,
    Written,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Pending => "pending",
            Stage::Reading => "reading",
            Stage::Encoding => "encoding",
            Stage::Written => "written",
            Stage::Done => "done",
        };
        f.write_str(s)
    }
}

fn enter(stage: Stage, split: Split, detail: impl fmt::Display) {
    debug!("[{split}] {stage}: {detail}");
}

/// What [`prepare_sources`] had to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// The extracted directory was already present.
    AlreadyExtracted,
    /// The archive was present and only needed unpacking.
    Extracted,
    /// The archive was downloaded (this many bytes) and unpacked.
    Downloaded(u64),
}

/// Result of converting one split.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitReport {
    pub split: Split,
    pub output: PathBuf,
    /// Members read, in order.
    pub members: Vec<String>,
    pub records: u64,
    /// Container size in bytes, framing included.
    pub bytes: u64,
}

/// Result of a complete run.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub outcome: PrepareOutcome,
    pub splits: Vec<SplitReport>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn total_records(&self) -> u64 {
        self.splits.iter().map(|s| s.records).sum()
    }
}

/// Make sure the extracted member directory exists below `data_dir`.
///
/// Nothing is fetched or extracted when the directory is already there. An
/// archive left by an earlier run is extracted without downloading again.
///
/// # Errors
///
/// Returns `Network` or `Extraction` from the collaborators, `Io` if the data
/// directory cannot be created, and `Extraction` if unpacking did not produce
/// the configured directory.
pub fn prepare_sources(
    config: &DatasetConfig,
    data_dir: &Path,
    fetcher: &dyn Fetcher,
    extractor: &dyn Extractor,
    progress: &mut dyn ProgressReporter,
) -> Result<PrepareOutcome> {
    fs::create_dir_all(data_dir).map_err(|e| ConvertError::io(data_dir, e))?;

    let input_dir = config.input_dir(data_dir);
    if input_dir.is_dir() {
        info!("dataset already downloaded to {}", input_dir.display());
        return Ok(PrepareOutcome::AlreadyExtracted);
    }

    let archive = config.archive_path(data_dir);
    let outcome = if archive.is_file() {
        debug!("reusing archive {}", archive.display());
        PrepareOutcome::Extracted
    } else {
        info!("Downloading {}", config.archive_file_name());
        let bytes = fetcher.fetch(&config.url, &archive, progress)?;
        info!(
            "Successfully downloaded {} {} bytes.",
            config.archive_file_name(),
            bytes
        );
        PrepareOutcome::Downloaded(bytes)
    };

    extractor.extract(&archive, data_dir)?;
    if !input_dir.is_dir() {
        return Err(ConvertError::Extraction {
            path: archive,
            reason: format!("archive did not contain {}", config.extracted_dir),
        });
    }
    Ok(outcome)
}

fn remove_existing(output: &Path) -> Result<()> {
    match fs::remove_file(output) {
        Ok(()) => {
            debug!("removed previous {}", output.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ConvertError::io(output, e)),
    }
}

/// Convert the members of one split into a fresh container at `output`.
///
/// Any file already at `output` is deleted first, so the container only ever
/// holds the records of the latest run.
///
/// # Errors
///
/// Returns `NotFound`/`Format` for a bad member and `Io` for write or close
/// failures. The partial container is closed and left on disk.
pub fn convert_split(
    spec: &SplitSpec,
    input_dir: &Path,
    output: &Path,
    metrics: &mut MetricsCollector,
) -> Result<SplitReport> {
    let split = spec.split;
    enter(Stage::Pending, split, output.display());
    remove_existing(output)?;

    info!("Generating {}", output.display());
    let started = Instant::now();
    let mut writer = RecordWriter::create(output)?;
    let written = write_members(&mut writer, spec, input_dir, metrics);
    let closed = writer.close();
    written?;
    closed?;

    let report = SplitReport {
        split,
        output: output.to_path_buf(),
        members: spec.members.clone(),
        records: writer.records_written(),
        bytes: writer.bytes_written(),
    };
    enter(
        Stage::Written,
        split,
        format_args!("{} records, {} bytes", report.records, report.bytes),
    );
    metrics.increment_counter(&format!("records.{split}"), report.records);
    metrics.increment_counter(&format!("bytes.{split}"), report.bytes);
    metrics.increment_counter("records_total", report.records);
    let secs = started.elapsed().as_secs_f64();
    if secs > 0.0 {
        metrics.set_gauge(
            &format!("throughput.{split}"),
            report.records as f64 / secs,
            "Records written per second",
        );
    }
    Ok(report)
}

fn write_members(
    writer: &mut RecordWriter<File>,
    spec: &SplitSpec,
    input_dir: &Path,
    metrics: &mut MetricsCollector,
) -> Result<()> {
    for member in &spec.members {
        let path = input_dir.join(member);
        enter(Stage::Reading, spec.split, path.display());
        let batch = read_batch(&path)?;
        metrics.increment_counter("members_read", 1);

        enter(
            Stage::Encoding,
            spec.split,
            format_args!("{member}: {} rows of {} bytes", batch.len(), batch.stride()),
        );
        for (image, label) in batch.rows() {
            writer.append(&encode_record(image, label))?;
        }
    }
    Ok(())
}

/// Convert every configured split in order, stopping at the first failure.
///
/// # Errors
///
/// Propagates the first error from [`convert_split`].
pub fn convert_all(
    config: &DatasetConfig,
    data_dir: &Path,
    metrics: &mut MetricsCollector,
) -> Result<Vec<SplitReport>> {
    let input_dir = config.input_dir(data_dir);
    let mut reports = Vec::with_capacity(config.splits.len());
    for spec in &config.splits {
        let output = config.output_path(data_dir, spec.split);
        reports.push(convert_split(spec, &input_dir, &output, metrics)?);
    }
    Ok(reports)
}

/// Re-read a container, checking every frame and decoding every record.
///
/// Returns the number of records read.
///
/// # Errors
///
/// Returns `CorruptRecord` on a checksum failure, a truncated frame, or a record
/// count different from `expected`, and `Format` for an undecodable record.
pub fn verify_container(path: &Path, expected: u64) -> Result<u64> {
    let mut reader = RecordReader::open(path)?;
    let mut count = 0u64;
    for frame in reader.by_ref() {
        decode_record(&frame?, path)?;
        count += 1;
    }
    if count != expected {
        return Err(ConvertError::CorruptRecord {
            path: path.to_path_buf(),
            offset: reader.offset(),
            reason: format!("expected {expected} records, found {count}"),
        });
    }
    debug!("verified {}: {count} records", path.display());
    Ok(count)
}

/// Delete the downloaded archive and the extracted directory.
///
/// Failures are logged and otherwise ignored; the outputs are already complete.
pub fn cleanup_sources(config: &DatasetConfig, data_dir: &Path) {
    info!("Removing original files.");
    let archive = config.archive_path(data_dir);
    if let Err(e) = fs::remove_file(&archive)
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!("could not remove {}: {e}", archive.display());
    }
    let input_dir = config.input_dir(data_dir);
    if let Err(e) = fs::remove_dir_all(&input_dir)
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!("could not remove {}: {e}", input_dir.display());
    }
}

/// Run the whole conversion: prepare, convert, optionally verify, clean up.
///
/// Metrics are saved before cleanup, so a failed metrics write leaves the
/// sources in place.
///
/// # Errors
///
/// Returns `Config` for an invalid layout and otherwise the first error of any
/// step. Cleanup failures are not errors.
pub fn run(
    config: &DatasetConfig,
    options: &RunOptions,
    fetcher: &dyn Fetcher,
    extractor: &dyn Extractor,
    progress: &mut dyn ProgressReporter,
) -> Result<RunSummary> {
    config.validate()?;
    let data_dir = options.resolved_data_dir();
    let mut metrics = MetricsCollector::new();
    metrics.record_start();

    info!("Download from {} and extract.", config.url);
    let outcome = prepare_sources(config, &data_dir, fetcher, extractor, progress)?;
    let splits = convert_all(config, &data_dir, &mut metrics)?;

    if options.verify {
        for report in &splits {
            verify_container(&report.output, report.records)?;
        }
        info!("Verified {} containers", splits.len());
    }

    metrics.record_end();
    metrics.log_summary();
    if let Some(path) = &options.metrics_out {
        metrics.save_to_file(path)?;
    }
    if options.keep_sources {
        debug!("keeping sources in {}", data_dir.display());
    } else {
        cleanup_sources(config, &data_dir);
    }
    for report in &splits {
        enter(Stage::Done, report.split, report.output.display());
    }
    info!("Done!");

    Ok(RunSummary {
        outcome,
        splits,
        elapsed: metrics.elapsed().unwrap_or_default(),
    })
}
