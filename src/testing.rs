//! Testing utilities for conversion runs.
//!
//! Everything here builds inputs in memory so tests never touch the network:
//!
//! - **Pickle fixtures**: [`PickleBuilder`] emits protocol-2 opcodes;
//!   [`plain_batch_pickle`] and [`numpy_batch_pickle`] produce complete
//!   archive members in the two layouts found in the wild
//! - **Archives**: [`zip_archive_bytes`] packs members into a zip image
//! - **Collaborators**: [`FakeFetcher`] serves a prepared payload,
//!   [`CountingExtractor`] counts extraction calls, and [`RecordingProgress`]
//!   keeps every progress update
//!
//! # Quick Start
//!
//! ```no_run
//! use tfrecord_convert::testing::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let member = plain_batch_pickle(&[1, 2, 3, 4, 5, 6], &[7, 8]);
//! write_member(dir.path(), "data_batch_1", &member)?;
//! # Ok(())
//! # }
//! ```

use crate::error::{ConvertError, Result};
use crate::example::{Record, decode_record};
use crate::io::archive::Extractor;
use crate::io::fetch::{Fetcher, ProgressReporter, StreamError, stream_to_file};
use crate::io::tfrecord::RecordReader;
use std::cell::Cell;
use std::fs;
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};

// ========== Pickle fixtures ==========

/// Appends protocol-2 pickle opcodes to a buffer.
///
/// The builder does not track the stack; callers emit opcodes in the order the
/// pickle machine expects them.
#[derive(Clone, Debug)]
pub struct PickleBuilder {
    out: Vec<u8>,
}

impl Default for PickleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PickleBuilder {
    /// Start a stream with a `PROTO 2` header.
    #[must_use]
    pub fn new() -> Self {
        Self {
            out: vec![0x80, 2],
        }
    }

    pub fn mark(&mut self) -> &mut Self {
        self.op(b'(')
    }

    pub fn none(&mut self) -> &mut Self {
        self.op(b'N')
    }

    pub fn boolean(&mut self, value: bool) -> &mut Self {
        self.op(if value { 0x88 } else { 0x89 })
    }

    /// Smallest integer opcode that holds `value`.
    pub fn int(&mut self, value: i64) -> &mut Self {
        if let Ok(v) = u8::try_from(value) {
            self.op(b'K').raw(&[v])
        } else if let Ok(v) = u16::try_from(value) {
            self.op(b'M').raw(&v.to_le_bytes())
        } else if let Ok(v) = i32::try_from(value) {
            self.op(b'J').raw(&v.to_le_bytes())
        } else {
            self.op(0x8a).raw(&[8]).raw(&value.to_le_bytes())
        }
    }

    /// A text string (`SHORT_BINUNICODE` or `BINUNICODE`).
    pub fn unicode(&mut self, value: &str) -> &mut Self {
        match u8::try_from(value.len()) {
            Ok(n) => self.op(0x8c).raw(&[n]),
            Err(_) => self.op(b'X').raw(&(value.len() as u32).to_le_bytes()),
        };
        self.raw(value.as_bytes())
    }

    /// A Python 2 `str`, which decodes to bytes.
    pub fn binstring(&mut self, value: &[u8]) -> &mut Self {
        match u8::try_from(value.len()) {
            Ok(n) => self.op(b'U').raw(&[n]),
            Err(_) => self.op(b'T').raw(&(value.len() as u32).to_le_bytes()),
        };
        self.raw(value)
    }

    /// Python 3 `bytes` as written under protocol 2: `_codecs.encode(text, "latin1")`.
    pub fn latin1_bytes(&mut self, value: &[u8]) -> &mut Self {
        let text: String = value.iter().map(|&b| char::from(b)).collect();
        self.global("_codecs", "encode")
            .unicode(&text)
            .unicode("latin1")
            .op(0x86)
            .reduce()
    }

    /// `GLOBAL module\nname\n`.
    pub fn global(&mut self, module: &str, name: &str) -> &mut Self {
        self.op(b'c')
            .raw(module.as_bytes())
            .raw(b"\n")
            .raw(name.as_bytes())
            .raw(b"\n")
    }

    pub fn empty_dict(&mut self) -> &mut Self {
        self.op(b'}')
    }

    pub fn empty_list(&mut self) -> &mut Self {
        self.op(b']')
    }

    /// `SETITEMS`: pairs pushed since the last mark go into the dict below it.
    pub fn setitems(&mut self) -> &mut Self {
        self.op(b'u')
    }

    /// `APPENDS`: items pushed since the last mark go into the list below it.
    pub fn appends(&mut self) -> &mut Self {
        self.op(b'e')
    }

    /// `TUPLE`: everything since the last mark.
    pub fn tuple(&mut self) -> &mut Self {
        self.op(b't')
    }

    pub fn tuple1(&mut self) -> &mut Self {
        self.op(0x85)
    }

    pub fn tuple2(&mut self) -> &mut Self {
        self.op(0x86)
    }

    pub fn tuple3(&mut self) -> &mut Self {
        self.op(0x87)
    }

    pub fn reduce(&mut self) -> &mut Self {
        self.op(b'R')
    }

    pub fn build(&mut self) -> &mut Self {
        self.op(b'b')
    }

    /// `BINPUT`: memoize the top of the stack under `index`.
    pub fn put(&mut self, index: u8) -> &mut Self {
        self.op(b'q').raw(&[index])
    }

    /// `BINGET`: push the value memoized under `index`.
    pub fn get(&mut self, index: u8) -> &mut Self {
        self.op(b'h').raw(&[index])
    }

    /// A `uint8` numpy array of the given shape, as `ndarray.__reduce__` emits it.
    ///
    /// The shape is written as given, so it need not match `data`.
    pub fn uint8_array(&mut self, data: &[u8], shape: &[i64]) -> &mut Self {
        // _reconstruct(ndarray, (0,), b"b")
        self.global("numpy.core.multiarray", "_reconstruct")
            .global("numpy", "ndarray")
            .int(0)
            .tuple1()
            .latin1_bytes(b"b")
            .tuple3()
            .reduce();

        // (version, shape, dtype, is_fortran, rawdata)
        self.mark().int(1).mark();
        for &dim in shape {
            self.int(dim);
        }
        self.tuple();
        self.global("numpy", "dtype")
            .unicode("u1")
            .boolean(false)
            .boolean(true)
            .tuple3()
            .reduce();
        self.mark()
            .int(3)
            .unicode("|")
            .none()
            .none()
            .none()
            .int(-1)
            .int(-1)
            .int(0)
            .tuple()
            .build();
        self.boolean(false).latin1_bytes(data).tuple().build()
    }

    /// A list of ints.
    pub fn int_list(&mut self, values: &[i64]) -> &mut Self {
        self.empty_list();
        if values.is_empty() {
            return self;
        }
        self.mark();
        for &v in values {
            self.int(v);
        }
        self.appends()
    }

    /// Append raw bytes without an opcode.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.out.extend_from_slice(bytes);
        self
    }

    fn op(&mut self, code: u8) -> &mut Self {
        self.out.push(code);
        self
    }

    /// Terminate with `STOP` and return the stream.
    #[must_use]
    pub fn finish(&mut self) -> Vec<u8> {
        self.op(b'.');
        std::mem::take(&mut self.out)
    }
}

/// A member as Python 2 writes it: byte-string keys, `data` as a raw string.
///
/// Includes the `batch_label` and `filenames` entries real batches carry.
#[must_use]
pub fn plain_batch_pickle(data: &[u8], labels: &[i64]) -> Vec<u8> {
    let mut p = PickleBuilder::new();
    p.empty_dict().mark();
    p.binstring(b"batch_label").binstring(b"training batch 1 of 5");
    p.binstring(b"labels").int_list(labels);
    p.binstring(b"data").binstring(data);
    p.binstring(b"filenames").empty_list();
    p.setitems().finish()
}

/// A member as numpy writes it from Python 3: text keys, `data` as a
/// `uint8` array of shape `(labels.len(), stride)`.
#[must_use]
pub fn numpy_batch_pickle(data: &[u8], labels: &[i64], stride: usize) -> Vec<u8> {
    let mut p = PickleBuilder::new();
    p.empty_dict().mark();
    p.unicode("labels").int_list(labels);
    p.unicode("data")
        .uint8_array(data, &[labels.len() as i64, stride as i64]);
    p.setitems().finish()
}

/// Write `bytes` to `dir/name`, creating `dir` first.
///
/// # Errors
///
/// Returns any filesystem error.
pub fn write_member(dir: &Path, name: &str, bytes: &[u8]) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(name);
    fs::write(&path, bytes)?;
    Ok(path)
}

// ========== Archives ==========

/// Pack `(path, contents)` entries into an in-memory zip archive.
///
/// # Errors
///
/// Returns an error if the zip writer fails.
pub fn zip_archive_bytes(entries: &[(&str, &[u8])]) -> io::Result<Vec<u8>> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, contents) in entries {
        zip.start_file(*name, options).map_err(io::Error::other)?;
        zip.write_all(contents)?;
    }
    let cursor = zip.finish().map_err(io::Error::other)?;
    Ok(cursor.into_inner())
}

/// Decode every record of a container.
///
/// # Errors
///
/// Returns the first framing or decoding error.
pub fn read_records(path: &Path) -> Result<Vec<Record>> {
    RecordReader::open(path)?
        .map(|frame| frame.and_then(|bytes| decode_record(&bytes, path)))
        .collect()
}

// ========== Collaborators ==========

/// A [`Fetcher`] that writes a fixed payload instead of downloading.
#[derive(Debug, Default)]
pub struct FakeFetcher {
    payload: Vec<u8>,
    failure: Option<String>,
    calls: Cell<usize>,
}

impl FakeFetcher {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    /// A fetcher whose every call fails with `Network`.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Default::default()
        }
    }

    /// Number of `fetch` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl Fetcher for FakeFetcher {
    fn fetch(&self, url: &str, dest: &Path, progress: &mut dyn ProgressReporter) -> Result<u64> {
        self.calls.set(self.calls.get() + 1);
        if let Some(reason) = &self.failure {
            return Err(ConvertError::Network {
                url: url.to_string(),
                reason: reason.clone(),
            });
        }
        let total = Some(self.payload.len() as u64);
        stream_to_file(self.payload.as_slice(), dest, total, progress).map_err(|e| match e {
            StreamError::Read(e) => ConvertError::Network {
                url: url.to_string(),
                reason: e.to_string(),
            },
            StreamError::Write(path, e) => ConvertError::io(path, e),
        })
    }
}

/// Wraps an [`Extractor`] and counts how often it runs.
#[derive(Debug, Default)]
pub struct CountingExtractor<E> {
    inner: E,
    calls: Cell<usize>,
}

impl<E: Extractor> CountingExtractor<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl<E: Extractor> Extractor for CountingExtractor<E> {
    fn extract(&self, archive: &Path, dest: &Path) -> Result<()> {
        self.calls.set(self.calls.get() + 1);
        self.inner.extract(archive, dest)
    }
}

/// Keeps every `(downloaded, total)` update it receives.
#[derive(Clone, Debug, Default)]
pub struct RecordingProgress {
    pub updates: Vec<(u64, Option<u64>)>,
    pub finished: bool,
}

impl ProgressReporter for RecordingProgress {
    fn on_progress(&mut self, downloaded: u64, total: Option<u64>) {
        self.updates.push((downloaded, total));
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}
