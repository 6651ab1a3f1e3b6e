//! Tests for TFRecord container framing.

use anyhow::Result;
use std::fs;
use std::io::Cursor;
use tempfile::tempdir;
use tfrecord_convert::io::tfrecord::{FRAME_OVERHEAD, masked_crc32c};
use tfrecord_convert::{ConvertError, RecordReader, RecordWriter};

#[test]
fn masked_crc_matches_known_value() {
    // crc32c("123456789") = 0xe3069283
    let crc: u32 = 0xe306_9283;
    let expected = crc.rotate_right(15).wrapping_add(0xa282_ead8);
    assert_eq!(masked_crc32c(b"123456789"), expected);
}

#[test]
fn frames_come_back_in_append_order() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("out.tfrecords");

    let payloads: Vec<Vec<u8>> = (0u8..50).map(|i| vec![i; usize::from(i)]).collect();
    let mut writer = RecordWriter::create(&path)?;
    for p in &payloads {
        writer.append(p)?;
    }
    writer.close()?;
    assert_eq!(writer.records_written(), 50);

    let size = fs::metadata(&path)?.len();
    assert_eq!(size, writer.bytes_written());
    let payload_bytes: u64 = payloads.iter().map(|p| p.len() as u64).sum();
    assert_eq!(size, payload_bytes + 50 * FRAME_OVERHEAD);

    let read: Vec<Vec<u8>> = RecordReader::open(&path)?.collect::<Result<_, _>>()?;
    assert_eq!(read, payloads);
    Ok(())
}

#[test]
fn frame_layout_is_length_crc_payload_crc() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("abc");
    let mut writer = RecordWriter::create(&path)?;
    writer.append(b"abc")?;
    writer.close()?;

    let mut expected = Vec::new();
    expected.extend_from_slice(&3u64.to_le_bytes());
    expected.extend_from_slice(&masked_crc32c(&3u64.to_le_bytes()).to_le_bytes());
    expected.extend_from_slice(b"abc");
    expected.extend_from_slice(&masked_crc32c(b"abc").to_le_bytes());
    assert_eq!(fs::read(&path)?, expected);

    let frames: Vec<Vec<u8>> =
        RecordReader::new(Cursor::new(expected), "mem").collect::<Result<_, _>>()?;
    assert_eq!(frames, vec![b"abc".to_vec()]);
    Ok(())
}

#[test]
fn double_close_is_a_no_op() -> Result<()> {
    let dir = tempdir()?;
    let mut writer = RecordWriter::create(dir.path().join("x"))?;
    writer.append(b"one")?;
    writer.close()?;
    writer.close()?;
    assert!(writer.is_closed());
    Ok(())
}

#[test]
fn append_after_close_is_io_error() -> Result<()> {
    let dir = tempdir()?;
    let mut writer = RecordWriter::create(dir.path().join("x"))?;
    writer.close()?;
    let err = writer.append(b"late").unwrap_err();
    assert!(matches!(err, ConvertError::Io { .. }), "{err}");
    assert!(!err.is_source_error());
    Ok(())
}

#[test]
fn drop_flushes_unclosed_writer() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("x");
    {
        let mut writer = RecordWriter::create(&path)?;
        writer.append(b"kept")?;
    }
    let frames: Vec<Vec<u8>> = RecordReader::open(&path)?.collect::<Result<_, _>>()?;
    assert_eq!(frames, vec![b"kept".to_vec()]);
    Ok(())
}

#[test]
fn flipped_payload_byte_is_corrupt_record() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("x");
    let mut writer = RecordWriter::create(&path)?;
    writer.append(b"first")?;
    writer.append(b"second")?;
    writer.close()?;

    let mut bytes = fs::read(&path)?;
    let second_payload = (5 + FRAME_OVERHEAD + 12) as usize;
    bytes[second_payload] ^= 0x01;
    fs::write(&path, &bytes)?;

    let mut reader = RecordReader::open(&path)?;
    assert_eq!(reader.next().transpose()?, Some(b"first".to_vec()));
    match reader.next() {
        Some(Err(ConvertError::CorruptRecord { offset, .. })) => {
            assert_eq!(offset, 5 + FRAME_OVERHEAD);
        }
        other => panic!("expected a corrupt record, got {other:?}"),
    }
    assert!(reader.next().is_none());
    Ok(())
}

#[test]
fn truncated_container_is_corrupt_record() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("x");
    let mut writer = RecordWriter::create(&path)?;
    writer.append(&[9; 100])?;
    writer.close()?;

    let bytes = fs::read(&path)?;
    fs::write(&path, &bytes[..bytes.len() - 10])?;

    let results: Vec<_> = RecordReader::open(&path)?.collect();
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(ConvertError::CorruptRecord { .. })));
    Ok(())
}

#[test]
fn oversized_declared_length_is_corrupt_record() {
    // A valid length checksum over a length no file could hold.
    let len = (1u64 << 62).to_le_bytes();
    let mut frame = len.to_vec();
    frame.extend_from_slice(&masked_crc32c(&len).to_le_bytes());
    frame.extend_from_slice(&[1, 2, 3, 4]);

    let results: Vec<_> = RecordReader::new(Cursor::new(frame), "huge").collect();
    assert_eq!(results.len(), 1);
    match &results[0] {
        Err(ConvertError::CorruptRecord { offset, reason, .. }) => {
            assert_eq!(*offset, 0);
            assert!(reason.contains("truncated"), "{reason}");
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn empty_file_has_no_frames() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("empty");
    RecordWriter::create(&path)?.close()?;
    assert_eq!(RecordReader::open(&path)?.count(), 0);
    Ok(())
}

#[test]
fn opening_missing_container_is_not_found() {
    assert!(matches!(
        RecordReader::open("/no/such/file.tfrecords"),
        Err(ConvertError::NotFound { .. })
    ));
}
