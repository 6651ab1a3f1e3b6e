//! Tests for record encoding.

use prost::Message;
use std::path::Path;
use tfrecord_convert::example::proto::{self, feature::Kind};
use tfrecord_convert::example::{IMAGE_FEATURE, LABEL_FEATURE};
use tfrecord_convert::{ConvertError, Record, decode_record, encode_record};

#[test]
fn encode_then_decode_returns_the_pair() {
    let image: Vec<u8> = (0..=255).collect();
    for label in [0, 9, -1, i64::MAX] {
        let bytes = encode_record(&image, label);
        let record = decode_record(&bytes, Path::new("mem")).unwrap();
        assert_eq!(record, Record::new(image.clone(), label));
    }
}

#[test]
fn encoding_is_deterministic() {
    let a = encode_record(&[1, 2, 3], 7);
    let b = Record::new(vec![1, 2, 3], 7).encode();
    assert_eq!(a, b);
    assert_ne!(a, encode_record(&[1, 2, 3], 8));
}

#[test]
fn example_holds_exactly_two_features() {
    let bytes = encode_record(&[4, 5, 6], 8);
    let example = proto::Example::decode(bytes.as_slice()).unwrap();
    let features = example.features.unwrap().feature;

    let keys: Vec<_> = features.keys().map(String::as_str).collect();
    assert_eq!(keys, vec![IMAGE_FEATURE, LABEL_FEATURE]);
    assert_eq!(
        features[IMAGE_FEATURE].kind,
        Some(Kind::BytesList(proto::BytesList {
            value: vec![vec![4, 5, 6]]
        }))
    );
    assert_eq!(
        features[LABEL_FEATURE].kind,
        Some(Kind::Int64List(proto::Int64List { value: vec![8] }))
    );
}

#[test]
fn empty_image_round_trips() {
    let bytes = encode_record(&[], 3);
    let record = decode_record(&bytes, Path::new("mem")).unwrap();
    assert!(record.image.is_empty());
    assert_eq!(record.label, 3);
}

#[test]
fn decode_rejects_wrong_feature_types() {
    let mut feature = std::collections::BTreeMap::new();
    feature.insert(
        IMAGE_FEATURE.to_string(),
        proto::Feature {
            kind: Some(Kind::FloatList(proto::FloatList { value: vec![1.0] })),
        },
    );
    feature.insert(
        LABEL_FEATURE.to_string(),
        proto::Feature {
            kind: Some(Kind::Int64List(proto::Int64List { value: vec![1] })),
        },
    );
    let bytes = proto::Example {
        features: Some(proto::Features { feature }),
    }
    .encode_to_vec();

    let err = decode_record(&bytes, Path::new("mem")).unwrap_err();
    assert!(matches!(err, ConvertError::Format { .. }), "{err}");
}

#[test]
fn decode_rejects_garbage() {
    assert!(decode_record(&[0xff, 0xff, 0xff], Path::new("mem")).is_err());
    // An empty message decodes to an Example with no features.
    assert!(decode_record(&[], Path::new("mem")).is_err());
}
