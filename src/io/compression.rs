//! Decompression for tarball archives.
//!
//! Archives may arrive as `.tar.gz`, `.tar.zst`, `.tar.bz2` or `.tar.xz`. Each
//! format is a [`CompressionCodec`]; [`auto_detect_reader`] wraps a raw file
//! stream with the matching decoder.
//!
//! ## Built-in Codecs
//!
//! When enabled via feature flags, the following codecs are available:
//! - **Gzip** (`.gz`, `.tgz`) - via `flate2` crate (feature: `compression-gzip`)
//! - **Zstd** (`.zst`, `.tzst`) - via `zstd` crate (feature: `compression-zstd`)
//! - **Bzip2** (`.bz2`, `.tbz2`) - via `bzip2` crate (feature: `compression-bzip2`)
//! - **Xz** (`.xz`, `.txz`) - via `xz2` crate (feature: `compression-xz`)
//!
//! ## Detection
//! File extensions are checked first, falling back to magic bytes when the
//! name is not recognised. A stream that matches neither passes through
//! unchanged (a plain `.tar`).

use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// Decompression algorithm for one archive wrapper format.
pub trait CompressionCodec: Send + Sync {
    /// Human-readable codec name (e.g., "gzip", "zstd").
    fn name(&self) -> &str;

    /// Lowercase file suffixes, with the leading dot.
    fn extensions(&self) -> &[&str];

    /// Leading bytes of every stream in this format.
    fn magic_bytes(&self) -> &[u8];

    /// Wrap a reader with decompression.
    fn wrap_reader(&self, reader: Box<dyn Read>) -> std::io::Result<Box<dyn Read>>;
}

/// Codecs compiled into this build.
pub fn builtin_codecs() -> Vec<Box<dyn CompressionCodec>> {
    vec![
        #[cfg(feature = "compression-gzip")]
        Box::new(GzipCodec),
        #[cfg(feature = "compression-zstd")]
        Box::new(ZstdCodec),
        #[cfg(feature = "compression-bzip2")]
        Box::new(Bzip2Codec),
        #[cfg(feature = "compression-xz")]
        Box::new(XzCodec),
    ]
}

/// Find the codec whose extension ends `path` (case-insensitive).
pub fn detect_from_extension(path: impl AsRef<Path>) -> Option<Box<dyn CompressionCodec>> {
    let name = path.as_ref().to_string_lossy().to_lowercase();
    builtin_codecs()
        .into_iter()
        .find(|codec| codec.extensions().iter().any(|ext| name.ends_with(ext)))
}

/// Match the buffered head of a stream against codec signatures without consuming it.
fn detect_from_magic<R: BufRead>(reader: &mut R) -> Option<Box<dyn CompressionCodec>> {
    let buf = reader.fill_buf().ok()?;
    if buf.is_empty() {
        return None;
    }
    builtin_codecs()
        .into_iter()
        .find(|codec| buf.starts_with(codec.magic_bytes()))
}

/// Wrap `reader` with the decoder matching `path_hint` or the stream's magic bytes.
///
/// Returns the codec name alongside the reader, `None` when the stream is passed
/// through uncompressed.
///
/// # Errors
///
/// Returns an error if the selected decoder fails to initialise.
pub fn auto_detect_reader<R: Read + 'static>(
    reader: R,
    path_hint: impl AsRef<Path>,
) -> std::io::Result<(Box<dyn Read>, Option<String>)> {
    if let Some(codec) = detect_from_extension(&path_hint) {
        let name = codec.name().to_string();
        return Ok((codec.wrap_reader(Box::new(reader))?, Some(name)));
    }

    let mut buf_reader = BufReader::new(reader);
    if let Some(codec) = detect_from_magic(&mut buf_reader) {
        let name = codec.name().to_string();
        return Ok((codec.wrap_reader(Box::new(buf_reader))?, Some(name)));
    }

    Ok((Box::new(buf_reader), None))
}

// ============================================================================
// Built-in Codec Implementations
// ============================================================================

#[cfg(feature = "compression-gzip")]
struct GzipCodec;

#[cfg(feature = "compression-gzip")]
impl CompressionCodec for GzipCodec {
    fn name(&self) -> &str {
        "gzip"
    }

    fn extensions(&self) -> &[&str] {
        &[".gz", ".gzip", ".tgz"]
    }

    fn magic_bytes(&self) -> &[u8] {
        &[0x1f, 0x8b]
    }

    fn wrap_reader(&self, reader: Box<dyn Read>) -> std::io::Result<Box<dyn Read>> {
        use flate2::read::MultiGzDecoder;
        Ok(Box::new(MultiGzDecoder::new(reader)))
    }
}

#[cfg(feature = "compression-zstd")]
struct ZstdCodec;

#[cfg(feature = "compression-zstd")]
impl CompressionCodec for ZstdCodec {
    fn name(&self) -> &str {
        "zstd"
    }

    fn extensions(&self) -> &[&str] {
        &[".zst", ".zstd", ".tzst"]
    }

    fn magic_bytes(&self) -> &[u8] {
        &[0x28, 0xb5, 0x2f, 0xfd]
    }

    fn wrap_reader(&self, reader: Box<dyn Read>) -> std::io::Result<Box<dyn Read>> {
        zstd::stream::read::Decoder::new(reader).map(|d| Box::new(d) as Box<dyn Read>)
    }
}

#[cfg(feature = "compression-bzip2")]
struct Bzip2Codec;

#[cfg(feature = "compression-bzip2")]
impl CompressionCodec for Bzip2Codec {
    fn name(&self) -> &str {
        "bzip2"
    }

    fn extensions(&self) -> &[&str] {
        &[".bz2", ".bzip2", ".tbz", ".tbz2"]
    }

    fn magic_bytes(&self) -> &[u8] {
        b"BZh"
    }

    fn wrap_reader(&self, reader: Box<dyn Read>) -> std::io::Result<Box<dyn Read>> {
        use bzip2::read::MultiBzDecoder;
        Ok(Box::new(MultiBzDecoder::new(reader)))
    }
}

#[cfg(feature = "compression-xz")]
struct XzCodec;

#[cfg(feature = "compression-xz")]
impl CompressionCodec for XzCodec {
    fn name(&self) -> &str {
        "xz"
    }

    fn extensions(&self) -> &[&str] {
        &[".xz", ".txz"]
    }

    fn magic_bytes(&self) -> &[u8] {
        &[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]
    }

    fn wrap_reader(&self, reader: Box<dyn Read>) -> std::io::Result<Box<dyn Read>> {
        use xz2::read::XzDecoder;
        Ok(Box::new(XzDecoder::new(reader)))
    }
}
