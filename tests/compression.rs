//! Tests for codec detection.

use std::io::{Cursor, Read};
use tfrecord_convert::io::compression::{auto_detect_reader, builtin_codecs, detect_from_extension};

#[test]
fn unknown_extension_and_magic_pass_through() -> anyhow::Result<()> {
    let (mut reader, codec) = auto_detect_reader(Cursor::new(b"plain tar bytes".to_vec()), "x.tar")?;
    assert_eq!(codec, None);
    let mut out = String::new();
    reader.read_to_string(&mut out)?;
    assert_eq!(out, "plain tar bytes");
    Ok(())
}

#[test]
fn builtin_codecs_follow_features() {
    let names: Vec<String> = builtin_codecs().iter().map(|c| c.name().to_string()).collect();
    assert_eq!(names.contains(&"gzip".to_string()), cfg!(feature = "compression-gzip"));
    assert_eq!(names.contains(&"zstd".to_string()), cfg!(feature = "compression-zstd"));
    assert_eq!(names.contains(&"bzip2".to_string()), cfg!(feature = "compression-bzip2"));
    assert_eq!(names.contains(&"xz".to_string()), cfg!(feature = "compression-xz"));
}

#[cfg(all(
    feature = "compression-gzip",
    feature = "compression-zstd",
    feature = "compression-bzip2",
    feature = "compression-xz"
))]
#[test]
fn extensions_map_to_codecs() {
    let name = |p: &str| detect_from_extension(p).map(|c| c.name().to_string());
    assert_eq!(name("a.tar.gz").as_deref(), Some("gzip"));
    assert_eq!(name("A.TGZ").as_deref(), Some("gzip"));
    assert_eq!(name("a.tar.zst").as_deref(), Some("zstd"));
    assert_eq!(name("a.tbz2").as_deref(), Some("bzip2"));
    assert_eq!(name("a.tar.xz").as_deref(), Some("xz"));
    assert_eq!(name("a.zip"), None);
}

#[cfg(feature = "compression-bzip2")]
#[test]
fn bzip2_stream_detected_by_magic() -> anyhow::Result<()> {
    use bzip2::Compression;
    use bzip2::write::BzEncoder;
    use std::io::Write;

    let mut enc = BzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(b"bz payload")?;
    let compressed = enc.finish()?;

    let (mut reader, codec) = auto_detect_reader(Cursor::new(compressed), "download")?;
    assert_eq!(codec.as_deref(), Some("bzip2"));
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    assert_eq!(out, b"bz payload");
    Ok(())
}

#[cfg(feature = "compression-xz")]
#[test]
fn xz_stream_detected_by_extension() -> anyhow::Result<()> {
    use std::io::Write;
    use xz2::write::XzEncoder;

    let mut enc = XzEncoder::new(Vec::new(), 6);
    enc.write_all(b"xz payload")?;
    let compressed = enc.finish()?;

    let (mut reader, codec) = auto_detect_reader(Cursor::new(compressed), "batches.txz")?;
    assert_eq!(codec.as_deref(), Some("xz"));
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    assert_eq!(out, b"xz payload");
    Ok(())
}
