//! End-to-end tests for the conversion pipeline.

use anyhow::Result;
use std::fs;
use std::path::Path;
use tempfile::tempdir;
use tfrecord_convert::config::DEFAULT_EXTRACTED_DIR;
use tfrecord_convert::metrics::MetricsCollector;
use tfrecord_convert::testing::{
    CountingExtractor, FakeFetcher, RecordingProgress, numpy_batch_pickle, plain_batch_pickle,
    read_records, write_member, zip_archive_bytes,
};
use tfrecord_convert::{
    ArchiveExtractor, ConvertError, DatasetConfig, NoProgress, PrepareOutcome, Record,
    RunOptions, Split, SplitSpec, convert_split, prepare_sources, run, verify_container,
};

const STRIDE: usize = 4;

/// Member `index` holds two images; labels are `2 * index` and `2 * index + 1`.
fn member_bytes(index: u8) -> Vec<u8> {
    let data: Vec<u8> = (0..2 * STRIDE as u8).map(|b| b + 10 * index).collect();
    let labels = [2 * i64::from(index), 2 * i64::from(index) + 1];
    if index % 2 == 0 {
        plain_batch_pickle(&data, &labels)
    } else {
        numpy_batch_pickle(&data, &labels, STRIDE)
    }
}

const MEMBERS: [&str; 6] = [
    "data_batch_1",
    "data_batch_2",
    "data_batch_3",
    "data_batch_4",
    "data_batch_5",
    "test_batch",
];

fn dataset_zip() -> Result<Vec<u8>> {
    let contents: Vec<(String, Vec<u8>)> = MEMBERS
        .iter()
        .enumerate()
        .map(|(i, name)| {
            (
                format!("{DEFAULT_EXTRACTED_DIR}/{name}"),
                member_bytes(i as u8),
            )
        })
        .collect();
    let entries: Vec<(&str, &[u8])> = contents
        .iter()
        .map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
        .collect();
    Ok(zip_archive_bytes(&entries)?)
}

fn labels(path: &Path) -> Result<Vec<i64>> {
    Ok(read_records(path)?.into_iter().map(|r| r.label).collect())
}

#[test]
fn records_follow_member_then_row_order() -> Result<()> {
    let dir = tempdir()?;
    write_member(dir.path(), "m1", &plain_batch_pickle(&[0; 6], &[1, 2]))?;
    write_member(dir.path(), "m2", &numpy_batch_pickle(&[0; 6], &[3, 4], 3))?;
    let spec = SplitSpec {
        split: Split::Train,
        members: vec!["m1".into(), "m2".into()],
    };
    let output = dir.path().join("train.tfrecords");

    let mut metrics = MetricsCollector::new();
    let report = convert_split(&spec, dir.path(), &output, &mut metrics)?;

    assert_eq!(labels(&output)?, vec![1, 2, 3, 4]);
    assert_eq!(report.records, 4);
    assert_eq!(report.bytes, fs::metadata(&output)?.len());
    assert_eq!(metrics.counter("records.train"), Some(4));
    assert_eq!(metrics.counter("members_read"), Some(2));
    assert!(metrics.gauge("throughput.train").is_some_and(|r| r > 0.0));
    Ok(())
}

#[test]
fn images_are_sliced_at_the_stride() -> Result<()> {
    let dir = tempdir()?;
    write_member(dir.path(), "m", &plain_batch_pickle(&[1, 2, 3, 4, 5, 6], &[7, 8]))?;
    let spec = SplitSpec {
        split: Split::Eval,
        members: vec!["m".into()],
    };
    let output = dir.path().join("eval.tfrecords");
    convert_split(&spec, dir.path(), &output, &mut MetricsCollector::new())?;

    assert_eq!(
        read_records(&output)?,
        vec![Record::new(vec![1, 2, 3], 7), Record::new(vec![4, 5, 6], 8)]
    );
    Ok(())
}

#[test]
fn rerun_overwrites_existing_container() -> Result<()> {
    let dir = tempdir()?;
    write_member(dir.path(), "m", &plain_batch_pickle(&[0; 4], &[5, 6]))?;
    let spec = SplitSpec {
        split: Split::Train,
        members: vec!["m".into()],
    };
    let output = dir.path().join("train.tfrecords");
    fs::write(&output, b"stale bytes from an older run")?;

    convert_split(&spec, dir.path(), &output, &mut MetricsCollector::new())?;
    convert_split(&spec, dir.path(), &output, &mut MetricsCollector::new())?;
    assert_eq!(labels(&output)?, vec![5, 6]);
    Ok(())
}

#[test]
fn full_run_converts_every_split_and_cleans_up() -> Result<()> {
    let dir = tempdir()?;
    let config = DatasetConfig::default();
    let fetcher = FakeFetcher::new(dataset_zip()?);
    let extractor = CountingExtractor::new(ArchiveExtractor::new());
    let mut progress = RecordingProgress::default();

    let options = RunOptions::new(dir.path());
    let summary = run(&config, &options, &fetcher, &extractor, &mut progress)?;

    assert!(matches!(summary.outcome, PrepareOutcome::Downloaded(n) if n > 0));
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(extractor.calls(), 1);
    assert!(progress.finished);

    let train = dir.path().join("train.tfrecords");
    let validation = dir.path().join("validation.tfrecords");
    let eval = dir.path().join("eval.tfrecords");
    assert_eq!(labels(&train)?, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    assert_eq!(labels(&validation)?, vec![8, 9]);
    assert_eq!(labels(&eval)?, vec![10, 11]);
    assert!(
        read_records(&train)?
            .iter()
            .all(|r| r.image.len() == STRIDE)
    );

    let counts: Vec<u64> = summary.splits.iter().map(|s| s.records).collect();
    assert_eq!(counts, vec![8, 2, 2]);
    assert_eq!(summary.total_records(), 12);

    assert!(!dir.path().join("artistprediction.zip").exists());
    assert!(!dir.path().join(DEFAULT_EXTRACTED_DIR).exists());
    Ok(())
}

#[test]
fn prepare_twice_does_no_work_the_second_time() -> Result<()> {
    let dir = tempdir()?;
    let config = DatasetConfig::default();
    let fetcher = FakeFetcher::new(dataset_zip()?);
    let extractor = CountingExtractor::new(ArchiveExtractor::new());

    let first = prepare_sources(&config, dir.path(), &fetcher, &extractor, &mut NoProgress)?;
    let second = prepare_sources(&config, dir.path(), &fetcher, &extractor, &mut NoProgress)?;

    assert!(matches!(first, PrepareOutcome::Downloaded(_)));
    assert_eq!(second, PrepareOutcome::AlreadyExtracted);
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(extractor.calls(), 1);
    Ok(())
}

#[test]
fn existing_archive_is_extracted_without_download() -> Result<()> {
    let dir = tempdir()?;
    let config = DatasetConfig::default();
    fs::write(dir.path().join("artistprediction.zip"), dataset_zip()?)?;
    let fetcher = FakeFetcher::failing("network must not be used");

    let outcome = prepare_sources(
        &config,
        dir.path(),
        &fetcher,
        &ArchiveExtractor::new(),
        &mut NoProgress,
    )?;
    assert_eq!(outcome, PrepareOutcome::Extracted);
    assert_eq!(fetcher.calls(), 0);
    assert!(dir.path().join(DEFAULT_EXTRACTED_DIR).join("test_batch").is_file());
    Ok(())
}

#[test]
fn missing_data_dir_is_created() -> Result<()> {
    let dir = tempdir()?;
    let data_dir = dir.path().join("nested").join("data");
    let fetcher = FakeFetcher::new(dataset_zip()?);
    prepare_sources(
        &DatasetConfig::default(),
        &data_dir,
        &fetcher,
        &ArchiveExtractor::new(),
        &mut NoProgress,
    )?;
    assert!(data_dir.join(DEFAULT_EXTRACTED_DIR).is_dir());
    Ok(())
}

#[test]
fn archive_without_expected_dir_is_extraction_error() -> Result<()> {
    let dir = tempdir()?;
    let fetcher = FakeFetcher::new(zip_archive_bytes(&[("other/data_batch_1", &b"x"[..])])?);
    let err = prepare_sources(
        &DatasetConfig::default(),
        dir.path(),
        &fetcher,
        &ArchiveExtractor::new(),
        &mut NoProgress,
    )
    .unwrap_err();
    assert!(matches!(err, ConvertError::Extraction { .. }), "{err}");
    Ok(())
}

#[test]
fn network_failure_aborts_before_conversion() -> Result<()> {
    let dir = tempdir()?;
    let fetcher = FakeFetcher::failing("503 Service Unavailable");
    let err = run(
        &DatasetConfig::default(),
        &RunOptions::new(dir.path()),
        &fetcher,
        &ArchiveExtractor::new(),
        &mut NoProgress,
    )
    .unwrap_err();

    assert!(matches!(err, ConvertError::Network { .. }), "{err}");
    assert!(!dir.path().join("train.tfrecords").exists());
    Ok(())
}

#[test]
fn missing_member_stops_the_run() -> Result<()> {
    let dir = tempdir()?;
    let input = dir.path().join(DEFAULT_EXTRACTED_DIR);
    for (i, name) in MEMBERS.iter().enumerate() {
        if *name != "data_batch_5" {
            write_member(&input, name, &member_bytes(i as u8))?;
        }
    }
    let fetcher = FakeFetcher::failing("already extracted");

    let err = run(
        &DatasetConfig::default(),
        &RunOptions::new(dir.path()),
        &fetcher,
        &ArchiveExtractor::new(),
        &mut NoProgress,
    )
    .unwrap_err();

    assert!(matches!(err, ConvertError::NotFound { .. }), "{err}");
    assert_eq!(labels(&dir.path().join("train.tfrecords"))?.len(), 8);
    // The failed split's container is left as written so far.
    assert!(dir.path().join("validation.tfrecords").exists());
    assert!(!dir.path().join("eval.tfrecords").exists());
    // Sources stay in place after a failure.
    assert!(input.is_dir());
    Ok(())
}

#[test]
fn keep_sources_verify_and_metrics_out() -> Result<()> {
    let dir = tempdir()?;
    let metrics_path = dir.path().join("metrics.json");
    let options = RunOptions {
        data_dir: dir.path().to_path_buf(),
        keep_sources: true,
        verify: true,
        metrics_out: Some(metrics_path.clone()),
    };
    let fetcher = FakeFetcher::new(dataset_zip()?);

    run(
        &DatasetConfig::default(),
        &options,
        &fetcher,
        &ArchiveExtractor::new(),
        &mut NoProgress,
    )?;

    assert!(dir.path().join("artistprediction.zip").is_file());
    assert!(dir.path().join(DEFAULT_EXTRACTED_DIR).is_dir());

    let metrics: serde_json::Value = serde_json::from_str(&fs::read_to_string(&metrics_path)?)?;
    assert_eq!(metrics["records.train"]["value"], 8);
    assert_eq!(metrics["records_total"]["value"], 12);
    assert_eq!(metrics["members_read"]["value"], 6);
    assert!(metrics.get("execution_time_ms").is_some());
    assert!(metrics["throughput.eval"]["value"].is_number());
    Ok(())
}

#[test]
fn failed_metrics_write_keeps_sources() -> Result<()> {
    let dir = tempdir()?;
    let options = RunOptions {
        metrics_out: Some(dir.path().join("no_such_dir").join("metrics.json")),
        ..RunOptions::new(dir.path())
    };
    let fetcher = FakeFetcher::new(dataset_zip()?);

    let err = run(
        &DatasetConfig::default(),
        &options,
        &fetcher,
        &ArchiveExtractor::new(),
        &mut NoProgress,
    )
    .unwrap_err();
    assert!(matches!(err, ConvertError::Io { .. }), "{err}");

    assert_eq!(labels(&dir.path().join("eval.tfrecords"))?, vec![10, 11]);
    assert!(dir.path().join("artistprediction.zip").is_file());
    assert!(dir.path().join(DEFAULT_EXTRACTED_DIR).is_dir());
    Ok(())
}

#[test]
fn verify_detects_count_mismatch() -> Result<()> {
    let dir = tempdir()?;
    write_member(dir.path(), "m", &plain_batch_pickle(&[0; 2], &[1, 2]))?;
    let spec = SplitSpec {
        split: Split::Train,
        members: vec!["m".into()],
    };
    let output = dir.path().join("train.tfrecords");
    convert_split(&spec, dir.path(), &output, &mut MetricsCollector::new())?;

    assert_eq!(verify_container(&output, 2)?, 2);
    let err = verify_container(&output, 3).unwrap_err();
    assert!(matches!(err, ConvertError::CorruptRecord { .. }), "{err}");
    Ok(())
}

#[test]
fn invalid_layout_fails_before_any_work() {
    let dir = tempdir().unwrap();
    let config = DatasetConfig {
        splits: vec![],
        ..Default::default()
    };
    let fetcher = FakeFetcher::new(Vec::new());
    let err = run(
        &config,
        &RunOptions::new(dir.path()),
        &fetcher,
        &ArchiveExtractor::new(),
        &mut NoProgress,
    )
    .unwrap_err();
    assert!(matches!(err, ConvertError::Config { .. }));
    assert_eq!(fetcher.calls(), 0);
}
