//! Extractor: unpack a downloaded archive into a directory.
//!
//! Zip archives are recognised by a `.zip` suffix or the `PK\x03\x04`
//! signature. Everything else is read as a tar stream, decompressed through
//! [`crate::io::compression`] when the name or magic bytes call for it.

use crate::error::{ConvertError, Result};
use crate::io::compression::auto_detect_reader;
use log::debug;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Unpacks an archive file into a destination directory.
pub trait Extractor {
    /// Extract every entry of `archive` below `dest`, creating `dest` if needed.
    ///
    /// # Errors
    ///
    /// Returns `Extraction` when the archive cannot be read or unpacked.
    fn extract(&self, archive: &Path, dest: &Path) -> Result<()>;
}

/// Container kinds [`ArchiveExtractor`] understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    /// Tar, possibly wrapped in gzip/zstd/bzip2/xz.
    Tar,
}

impl ArchiveFormat {
    /// Decide from the file name first, then from the leading bytes.
    ///
    /// # Errors
    ///
    /// Returns `Extraction` if the file cannot be opened for sniffing.
    pub fn detect(path: &Path) -> Result<Self> {
        let name = path.to_string_lossy().to_lowercase();
        if name.ends_with(".zip") {
            return Ok(ArchiveFormat::Zip);
        }
        let mut head = [0u8; 4];
        let mut f = File::open(path).map_err(|e| extraction(path, e))?;
        let n = read_head(&mut f, &mut head).map_err(|e| extraction(path, e))?;
        if &head[..n] == ZIP_MAGIC {
            Ok(ArchiveFormat::Zip)
        } else {
            Ok(ArchiveFormat::Tar)
        }
    }
}

fn read_head(f: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = f.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn extraction(path: &Path, reason: impl ToString) -> ConvertError {
    ConvertError::Extraction {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Extracts zip archives and (compressed) tarballs from the local filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct ArchiveExtractor;

impl ArchiveExtractor {
    pub fn new() -> Self {
        Self
    }

    fn extract_zip(&self, archive: &Path, dest: &Path) -> Result<()> {
        let f = File::open(archive).map_err(|e| extraction(archive, e))?;
        let mut zip = zip::ZipArchive::new(f).map_err(|e| extraction(archive, e))?;
        debug!("{}: zip with {} entries", archive.display(), zip.len());
        zip.extract(dest).map_err(|e| extraction(archive, e))
    }

    fn extract_tar(&self, archive: &Path, dest: &Path) -> Result<()> {
        let f = File::open(archive).map_err(|e| extraction(archive, e))?;
        let (reader, codec) = auto_detect_reader(f, archive).map_err(|e| extraction(archive, e))?;
        debug!(
            "{}: tar stream ({})",
            archive.display(),
            codec.as_deref().unwrap_or("uncompressed")
        );
        let mut tar = tar::Archive::new(reader);
        tar.unpack(dest).map_err(|e| extraction(archive, e))
    }
}

impl Extractor for ArchiveExtractor {
    fn extract(&self, archive: &Path, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest).map_err(|e| ConvertError::io(dest, e))?;
        match ArchiveFormat::detect(archive)? {
            ArchiveFormat::Zip => self.extract_zip(archive, dest),
            ArchiveFormat::Tar => self.extract_tar(archive, dest),
        }
    }
}
