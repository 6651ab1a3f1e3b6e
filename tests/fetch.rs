//! Tests for streaming downloads to disk.

use anyhow::Result;
use std::fs;
use std::io::{self, Read};
use tempfile::tempdir;
use tfrecord_convert::io::fetch::{StreamError, partial_path, stream_to_file};
use tfrecord_convert::testing::{FakeFetcher, RecordingProgress};
use tfrecord_convert::{ConvertError, Fetcher, NoProgress};

#[test]
fn partial_path_appends_suffix() {
    let p = partial_path(std::path::Path::new("/data/artistprediction.zip"));
    assert_eq!(p, std::path::Path::new("/data/artistprediction.zip.part"));
}

#[test]
fn progress_reports_running_totals() -> Result<()> {
    let dir = tempdir()?;
    let dest = dir.path().join("archive.zip");
    let payload = vec![7u8; 200_000];

    let mut progress = RecordingProgress::default();
    let written = stream_to_file(payload.as_slice(), &dest, Some(200_000), &mut progress)
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;

    assert_eq!(written, 200_000);
    assert_eq!(fs::read(&dest)?, payload);
    assert!(!partial_path(&dest).exists());
    assert!(progress.finished);
    assert!(progress.updates.windows(2).all(|w| w[0].0 < w[1].0));
    assert_eq!(progress.updates.last(), Some(&(200_000, Some(200_000))));
    Ok(())
}

#[test]
fn closures_are_progress_reporters() -> Result<()> {
    let dir = tempdir()?;
    let mut seen = Vec::new();
    let mut report = |done: u64, total: Option<u64>| seen.push((done, total));
    stream_to_file(&b"abc"[..], &dir.path().join("f"), None, &mut report)
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    assert_eq!(seen, vec![(3, None)]);
    Ok(())
}

struct FailingReader {
    sent: bool,
}

impl Read for FailingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.sent {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        }
        self.sent = true;
        buf[..4].copy_from_slice(b"part");
        Ok(4)
    }
}

#[test]
fn interrupted_download_leaves_nothing_behind() -> Result<()> {
    let dir = tempdir()?;
    let dest = dir.path().join("archive.zip");

    let err = stream_to_file(FailingReader { sent: false }, &dest, Some(100), &mut NoProgress)
        .unwrap_err();
    assert!(matches!(err, StreamError::Read(_)));
    assert!(!dest.exists());
    assert!(!partial_path(&dest).exists());
    Ok(())
}

#[test]
fn fake_fetcher_counts_and_writes() -> Result<()> {
    let dir = tempdir()?;
    let dest = dir.path().join("a.zip");
    let fetcher = FakeFetcher::new(b"payload".to_vec());

    let n = fetcher.fetch("https://example.invalid/a.zip", &dest, &mut NoProgress)?;
    assert_eq!(n, 7);
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(fs::read(&dest)?, b"payload");
    Ok(())
}

#[test]
fn failing_fetcher_reports_network_error() {
    let dir = tempdir().unwrap();
    let fetcher = FakeFetcher::failing("connection refused");
    let err = fetcher
        .fetch("https://example.invalid/a.zip", &dir.path().join("a.zip"), &mut NoProgress)
        .unwrap_err();
    match err {
        ConvertError::Network { url, reason } => {
            assert_eq!(url, "https://example.invalid/a.zip");
            assert_eq!(reason, "connection refused");
        }
        other => panic!("unexpected error {other}"),
    }
}
