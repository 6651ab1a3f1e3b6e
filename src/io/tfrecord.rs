//! TFRecord container framing.
//!
//! A container is a plain sequence of frames:
//!
//! ```text
//! u64  length                 (little endian)
//! u32  masked_crc32c(length)  (little endian, over the 8 length bytes)
//! [u8] payload                (length bytes)
//! u32  masked_crc32c(payload) (little endian)
//! ```
//!
//! [`RecordWriter`] appends frames strictly in call order; [`RecordReader`]
//! iterates them back and checks both checksums.
//!
//! # Notes
//! - The writer buffers, but only as a byte stream: the order of frames on disk
//!   always equals the order of [`RecordWriter::append`] calls.
//! - [`RecordWriter::close`] flushes and releases the file; calling it again is
//!   a no-op. Dropping an unclosed writer flushes on a best-effort basis and
//!   logs any failure.

use crate::error::{ConvertError, Result};
use log::warn;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const MASK_DELTA: u32 = 0xa282_ead8;

/// Bytes of framing around each payload.
pub const FRAME_OVERHEAD: u64 = 8 + 4 + 4;

/// CRC32C rotated and offset so that checksums of checksums stay well distributed.
pub fn masked_crc32c(bytes: &[u8]) -> u32 {
    let crc = crc32c::crc32c(bytes);
    crc.rotate_right(15).wrapping_add(MASK_DELTA)
}

fn write_frame(w: &mut impl Write, record: &[u8]) -> io::Result<()> {
    let len = (record.len() as u64).to_le_bytes();
    w.write_all(&len)?;
    w.write_all(&masked_crc32c(&len).to_le_bytes())?;
    w.write_all(record)?;
    w.write_all(&masked_crc32c(record).to_le_bytes())
}

/// Sequential writer of length-prefixed, checksummed frames.
pub struct RecordWriter<W: Write> {
    inner: Option<BufWriter<W>>,
    path: PathBuf,
    records: u64,
    bytes: u64,
}

impl RecordWriter<File> {
    /// Create (or truncate) a container file at `path`.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be created.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let f = File::create(path).map_err(|e| ConvertError::io(path, e))?;
        Ok(Self::new(f, path))
    }
}

impl<W: Write> RecordWriter<W> {
    /// Wrap an arbitrary sink. `path` is used in error messages.
    pub fn new(writer: W, path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Some(BufWriter::new(writer)),
            path: path.into(),
            records: 0,
            bytes: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Frames appended so far.
    pub fn records_written(&self) -> u64 {
        self.records
    }

    /// Bytes appended so far, framing included.
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Append one frame holding `record`.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the writer is closed or the underlying write fails.
    pub fn append(&mut self, record: &[u8]) -> Result<()> {
        let w = self.inner.as_mut().ok_or_else(|| {
            ConvertError::io(
                &self.path,
                io::Error::new(io::ErrorKind::BrokenPipe, "append after close"),
            )
        })?;
        write_frame(w, record).map_err(|e| ConvertError::io(&self.path, e))?;
        self.records += 1;
        self.bytes += record.len() as u64 + FRAME_OVERHEAD;
        Ok(())
    }

    /// Flush buffered frames and release the sink. A second call does nothing.
    ///
    /// # Errors
    ///
    /// Returns `Io` if flushing fails. The writer counts as closed either way.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut w) = self.inner.take() else {
            return Ok(());
        };
        w.flush().map_err(|e| ConvertError::io(&self.path, e))?;
        let inner = w
            .into_inner()
            .map_err(|e| ConvertError::io(&self.path, e.into_error()))?;
        drop(inner);
        Ok(())
    }
}

impl<W: Write> Drop for RecordWriter<W> {
    fn drop(&mut self) {
        if let Some(w) = self.inner.as_mut()
            && let Err(e) = w.flush()
        {
            warn!("flush of {} on drop failed: {e}", self.path.display());
        }
    }
}

/// Iterator over the payloads of a container.
///
/// Yields `Err(CorruptRecord)` once on a checksum mismatch or a truncated frame
/// and then stops.
pub struct RecordReader<R: Read> {
    inner: BufReader<R>,
    path: PathBuf,
    offset: u64,
    done: bool,
}

impl RecordReader<File> {
    /// Open a container file for reading.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the file does not exist and `Io` otherwise.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let f = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ConvertError::NotFound {
                path: path.to_path_buf(),
            },
            _ => ConvertError::io(path, e),
        })?;
        Ok(Self::new(f, path))
    }
}

impl<R: Read> RecordReader<R> {
    pub fn new(reader: R, path: impl Into<PathBuf>) -> Self {
        Self {
            inner: BufReader::new(reader),
            path: path.into(),
            offset: 0,
            done: false,
        }
    }

    /// Byte offset of the next frame.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn corrupt(&mut self, offset: u64, reason: impl Into<String>) -> ConvertError {
        self.done = true;
        ConvertError::CorruptRecord {
            path: self.path.clone(),
            offset,
            reason: reason.into(),
        }
    }

    /// Fill `buf` completely. `Ok(false)` means a clean end of input before any byte.
    fn read_full(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn read_frame(&mut self) -> Option<Result<Vec<u8>>> {
        let start = self.offset;
        let mut header = [0u8; 12];
        match self.read_full(&mut header) {
            Ok(false) => {
                self.done = true;
                return None;
            }
            Ok(true) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Some(Err(self.corrupt(start, "truncated frame header")));
            }
            Err(e) => {
                self.done = true;
                return Some(Err(ConvertError::io(&self.path, e)));
            }
        }

        let (len_bytes, len_crc) = header.split_at(8);
        let mut len_buf = [0u8; 8];
        len_buf.copy_from_slice(len_bytes);
        let mut crc_buf = [0u8; 4];
        crc_buf.copy_from_slice(len_crc);
        if masked_crc32c(&len_buf) != u32::from_le_bytes(crc_buf) {
            return Some(Err(self.corrupt(start, "length checksum mismatch")));
        }
        let len = u64::from_le_bytes(len_buf);

        // Grow the payload only as bytes arrive; a corrupt length can be huge.
        let mut payload = Vec::new();
        if let Err(e) = (&mut self.inner).take(len).read_to_end(&mut payload) {
            self.done = true;
            return Some(Err(ConvertError::io(&self.path, e)));
        }
        if (payload.len() as u64) < len {
            return Some(Err(self.corrupt(start, "truncated frame body")));
        }
        let mut data_crc = [0u8; 4];
        match self.read_full(&mut data_crc) {
            Ok(true) => {}
            Ok(false) => return Some(Err(self.corrupt(start, "truncated frame body"))),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Some(Err(self.corrupt(start, "truncated frame body")));
            }
            Err(e) => {
                self.done = true;
                return Some(Err(ConvertError::io(&self.path, e)));
            }
        }
        if masked_crc32c(&payload) != u32::from_le_bytes(data_crc) {
            return Some(Err(self.corrupt(start, "payload checksum mismatch")));
        }
        self.offset += len + FRAME_OVERHEAD;
        Some(Ok(payload))
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        self.read_frame()
    }
}
