//! Fetcher: download a remote archive to local storage.
//!
//! Progress is reported through an explicit [`ProgressReporter`] passed into
//! each fetch, so the downloader has no dependency on how (or whether) progress
//! is displayed. Any `FnMut(u64, Option<u64>)` closure is a reporter.

use crate::error::{ConvertError, Result};
use log::debug;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Receives `(bytes_downloaded, total_bytes)` updates during a download.
///
/// `total_bytes` is `None` when the server does not announce a length.
pub trait ProgressReporter {
    fn on_progress(&mut self, downloaded: u64, total: Option<u64>);

    /// Called once after the last chunk has been written.
    fn finish(&mut self) {}
}

impl<F> ProgressReporter for F
where
    F: FnMut(u64, Option<u64>),
{
    fn on_progress(&mut self, downloaded: u64, total: Option<u64>) {
        self(downloaded, total)
    }
}

/// Reporter that discards every update.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn on_progress(&mut self, _downloaded: u64, _total: Option<u64>) {}
}

/// Downloads a URL into a local file.
pub trait Fetcher {
    /// Download `url` to `dest`, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns `Network` for transport or HTTP failures and `Io` when the
    /// destination cannot be written.
    fn fetch(&self, url: &str, dest: &Path, progress: &mut dyn ProgressReporter) -> Result<u64>;
}

const CHUNK_SIZE: usize = 64 * 1024;

/// Blocking HTTP(S) fetcher with no request timeout.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    /// Build a client without a request timeout; a download runs until it
    /// completes or the connection fails.
    ///
    /// # Errors
    ///
    /// Returns `Network` if the HTTP client cannot be initialised.
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(None::<Duration>)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConvertError::Network {
                url: String::new(),
                reason: format!("build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path, progress: &mut dyn ProgressReporter) -> Result<u64> {
        let network = |reason: String| ConvertError::Network {
            url: url.to_string(),
            reason,
        };
        let response = self
            .client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| network(e.to_string()))?;
        let total = response.content_length();
        debug!("GET {url}: content length {total:?}");

        let written = stream_to_file(response, dest, total, progress).map_err(|e| match e {
            StreamError::Read(e) => network(format!("read body: {e}")),
            StreamError::Write(path, e) => ConvertError::io(path, e),
        })?;
        Ok(written)
    }
}

/// Where a copy failed: reading the source or writing the destination.
#[derive(Debug)]
pub enum StreamError {
    Read(io::Error),
    Write(PathBuf, io::Error),
}

/// Path of the in-progress download for `dest`.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Copy `src` into `<dest>.part`, reporting progress after every chunk, then
/// rename it to `dest`. The partial file is removed if the copy fails.
///
/// # Errors
///
/// Returns [`StreamError::Read`] when `src` fails and [`StreamError::Write`]
/// when the destination cannot be written or renamed.
pub fn stream_to_file(
    mut src: impl Read,
    dest: &Path,
    total: Option<u64>,
    progress: &mut dyn ProgressReporter,
) -> std::result::Result<u64, StreamError> {
    let part = partial_path(dest);
    let write_err = |e: io::Error| StreamError::Write(part.clone(), e);

    let f = File::create(&part).map_err(write_err)?;
    let mut out = BufWriter::new(f);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut downloaded = 0u64;
    let copied = loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(StreamError::Read(e)),
        };
        if let Err(e) = out.write_all(&buf[..n]) {
            break Err(write_err(e));
        }
        downloaded += n as u64;
        progress.on_progress(downloaded, total);
    };
    let finished = copied.and_then(|()| out.flush().map_err(write_err));
    drop(out);
    if let Err(e) = finished {
        let _ = fs::remove_file(&part);
        return Err(e);
    }
    progress.finish();

    fs::rename(&part, dest).map_err(|e| StreamError::Write(dest.to_path_buf(), e))?;
    Ok(downloaded)
}
