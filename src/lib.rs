//! # tfrecord-convert
//!
//! Turns a pickled image-classification dataset into TFRecord containers that
//! a training pipeline can stream.
//!
//! The dataset ships as one archive of *members*: pickled dictionaries each
//! holding a flat buffer of fixed-size images and a list of integer labels.
//! A run downloads and unpacks the archive, then writes every `(image, label)`
//! row of every member into one container per split:
//!
//! | split        | members                          | output                 |
//! |--------------|----------------------------------|------------------------|
//! | `train`      | `data_batch_1` .. `data_batch_4` | `train.tfrecords`      |
//! | `validation` | `data_batch_5`                   | `validation.tfrecords` |
//! | `eval`       | `test_batch`                     | `eval.tfrecords`       |
//!
//! ## Quick Start
//!
//! ```no_run
//! use tfrecord_convert::*;
//!
//! # fn main() -> tfrecord_convert::Result<()> {
//! let config = DatasetConfig::default();
//! let options = RunOptions::new("data");
//! let summary = run(
//!     &config,
//!     &options,
//!     &HttpFetcher::new()?,
//!     &ArchiveExtractor::new(),
//!     &mut NoProgress,
//! )?;
//! println!("{} records written", summary.total_records());
//! # Ok(())
//! # }
//! ```
//!
//! ## Record layout
//!
//! Each record is a serialized `tf.train.Example` with two features: `image`
//! (a bytes list holding the raw pixels) and `label` (an int64 list holding
//! one value). Records are framed the TFRecord way: length, checksum of the
//! length, payload, checksum of the payload.
//!
//! ## Ordering
//!
//! Splits are converted in configuration order, members in list order, rows
//! in ascending index order. Nothing runs concurrently, so a container holds
//! its records in exactly that sequence.
//!
//! ## Feature Flags
//!
//! - `compression-gzip` - `.tar.gz` / `.tgz` archives
//! - `compression-zstd` - `.tar.zst` archives
//! - `compression-bzip2` - `.tar.bz2` archives
//! - `compression-xz` - `.tar.xz` archives
//!
//! Zip archives and plain tarballs need no feature.
//!
//! ## Module Overview
//!
//! - [`pickle`] - restricted decoder for the member file format
//! - [`batch`] - typed view of one member
//! - [`example`] - record encoding and decoding
//! - [`io`] - download, extraction and container framing
//! - [`pipeline`] - the conversion run itself
//! - [`config`] - dataset layout and run options
//! - [`metrics`] - counters reported at the end of a run
//! - [`testing`] - fixtures for tests of code built on this crate

pub mod batch;
pub mod config;
pub mod error;
pub mod example;
pub mod io;
pub mod metrics;
pub mod pickle;
pub mod pipeline;
pub mod testing;

pub use batch::{Batch, read_batch};
pub use config::{DatasetConfig, RunOptions, Split, SplitSpec};
pub use error::{ConvertError, Result};
pub use example::{Record, decode_record, encode_record};
pub use io::{
    ArchiveExtractor, Extractor, Fetcher, HttpFetcher, NoProgress, ProgressReporter,
    RecordReader, RecordWriter,
};
pub use metrics::MetricsCollector;
pub use pipeline::{
    PrepareOutcome, RunSummary, SplitReport, Stage, cleanup_sources, convert_all, convert_split,
    prepare_sources, run, verify_container,
};
