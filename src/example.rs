//! Record Encoder: `(image, label)` pairs as serialized `tf.train.Example`s.
//!
//! Each record is a feature set with exactly two entries:
//!
//! - `image`: a `BytesList` holding the raw pixel bytes verbatim
//! - `label`: an `Int64List` holding the single label value
//!
//! Encoding is a pure function of its inputs. Map entries are written in key
//! order, so the same pair always produces the same bytes.

use crate::error::{ConvertError, Result};
use prost::Message;
use std::collections::BTreeMap;
use std::path::Path;

pub const IMAGE_FEATURE: &str = "image";
pub const LABEL_FEATURE: &str = "label";

// ---------------------------------------------------------------------------
// Minimal tf.train.Example protobuf types
// ---------------------------------------------------------------------------
//
// Field numbers follow tensorflow/core/example/{example,feature}.proto.

pub mod proto {
    use prost::Message;
    use std::collections::BTreeMap;

    /// Corresponds to `tensorflow.BytesList`.
    #[derive(Clone, PartialEq, Message)]
    pub struct BytesList {
        #[prost(bytes = "vec", repeated, tag = "1")]
        pub value: Vec<Vec<u8>>,
    }

    /// Corresponds to `tensorflow.FloatList`.
    #[derive(Clone, PartialEq, Message)]
    pub struct FloatList {
        #[prost(float, repeated, tag = "1")]
        pub value: Vec<f32>,
    }

    /// Corresponds to `tensorflow.Int64List`.
    #[derive(Clone, PartialEq, Message)]
    pub struct Int64List {
        #[prost(int64, repeated, tag = "1")]
        pub value: Vec<i64>,
    }

    /// Corresponds to `tensorflow.Feature`.
    #[derive(Clone, PartialEq, Message)]
    pub struct Feature {
        #[prost(oneof = "feature::Kind", tags = "1, 2, 3")]
        pub kind: Option<feature::Kind>,
    }

    pub mod feature {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Kind {
            #[prost(message, tag = "1")]
            BytesList(super::BytesList),
            #[prost(message, tag = "2")]
            FloatList(super::FloatList),
            #[prost(message, tag = "3")]
            Int64List(super::Int64List),
        }
    }

    /// Corresponds to `tensorflow.Features`.
    #[derive(Clone, PartialEq, Message)]
    pub struct Features {
        #[prost(btree_map = "string, message", tag = "1")]
        pub feature: BTreeMap<String, Feature>,
    }

    /// Corresponds to `tensorflow.Example`.
    #[derive(Clone, PartialEq, Message)]
    pub struct Example {
        #[prost(message, optional, tag = "1")]
        pub features: Option<Features>,
    }
}

use proto::feature::Kind;

/// One labelled image, the unit written to a container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub image: Vec<u8>,
    pub label: i64,
}

impl Record {
    pub fn new(image: impl Into<Vec<u8>>, label: i64) -> Self {
        Self {
            image: image.into(),
            label,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_record(&self.image, self.label)
    }
}

fn bytes_feature(value: &[u8]) -> proto::Feature {
    proto::Feature {
        kind: Some(Kind::BytesList(proto::BytesList {
            value: vec![value.to_vec()],
        })),
    }
}

fn int64_feature(value: i64) -> proto::Feature {
    proto::Feature {
        kind: Some(Kind::Int64List(proto::Int64List { value: vec![value] })),
    }
}

/// Serialize one `(image, label)` pair. Labels are not range-checked.
pub fn encode_record(image: &[u8], label: i64) -> Vec<u8> {
    let mut feature = BTreeMap::new();
    feature.insert(IMAGE_FEATURE.to_string(), bytes_feature(image));
    feature.insert(LABEL_FEATURE.to_string(), int64_feature(label));
    let example = proto::Example {
        features: Some(proto::Features { feature }),
    };
    example.encode_to_vec()
}

/// Parse a serialized record back into its image and label.
///
/// `source` only labels errors.
///
/// # Errors
///
/// Returns `Format` when the bytes are not an `Example`, or when the feature set
/// does not hold exactly one `image` bytes value and one `label` int64 value.
pub fn decode_record(bytes: &[u8], source: &Path) -> Result<Record> {
    let example = proto::Example::decode(bytes)
        .map_err(|e| ConvertError::format(source, format!("decode Example: {e}")))?;
    let mut features = example.features.map(|f| f.feature).unwrap_or_default();
    if features.len() != 2 {
        return Err(ConvertError::format(
            source,
            format!("expected 2 features, found {}", features.len()),
        ));
    }

    let image = match features.remove(IMAGE_FEATURE).and_then(|f| f.kind) {
        Some(Kind::BytesList(mut list)) if list.value.len() == 1 => list.value.remove(0),
        _ => {
            return Err(ConvertError::format(
                source,
                "feature `image` is not a single bytes value",
            ));
        }
    };
    let label = match features.remove(LABEL_FEATURE).and_then(|f| f.kind) {
        Some(Kind::Int64List(list)) if list.value.len() == 1 => list.value[0],
        _ => {
            return Err(ConvertError::format(
                source,
                "feature `label` is not a single int64 value",
            ));
        }
    };
    Ok(Record { image, label })
}
