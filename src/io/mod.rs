//! Everything that touches bytes on disk or on the wire.
//!
//! - [`fetch`]: download the dataset archive
//! - [`archive`]: unpack zip and tar archives
//! - [`compression`]: decoders for compressed tarballs
//! - [`tfrecord`]: write and read the output containers

pub mod archive;
pub mod compression;
pub mod fetch;
pub mod tfrecord;

pub use archive::{ArchiveExtractor, Extractor};
pub use fetch::{Fetcher, HttpFetcher, NoProgress, ProgressReporter};
pub use tfrecord::{RecordReader, RecordWriter};
