//! Batch Reader: one archive member decoded into typed image and label data.
//!
//! Member files follow this layout (format version 1):
//!
//! | key      | accepted encodings                                                 |
//! |----------|--------------------------------------------------------------------|
//! | `data`   | raw bytes, or a C-ordered numpy array with a one-byte element type |
//! | `labels` | list of ints, or a one-dimensional integer numpy array             |
//!
//! Keys may be pickled as text or as byte strings; any other keys are ignored.
//! Images are packed back to back, so the stride of one image is
//! `data.len() / labels.len()` and must divide evenly.

use crate::error::{ConvertError, Result};
use crate::pickle::{self, Value};
use log::debug;
use std::fs;
use std::io;
use std::path::Path;

/// Key holding the flat image buffer.
pub const DATA_KEY: &str = "data";
/// Key holding the label sequence.
pub const LABELS_KEY: &str = "labels";

/// A validated batch of fixed-stride images with one label each.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    data: Vec<u8>,
    labels: Vec<i64>,
    stride: usize,
}

impl Batch {
    /// Build a batch from a flat buffer and its labels.
    ///
    /// # Errors
    ///
    /// Returns `Format` (attributed to `source`) when the buffer does not split
    /// evenly into one image per label.
    pub fn new(data: Vec<u8>, labels: Vec<i64>, source: &Path) -> Result<Self> {
        let stride = match (data.len(), labels.len()) {
            (0, 0) => 0,
            (len, 0) => {
                return Err(ConvertError::format(
                    source,
                    format!("{len} data bytes but no labels"),
                ));
            }
            (len, n) if len % n != 0 => {
                return Err(ConvertError::format(
                    source,
                    format!("{len} data bytes do not divide evenly among {n} labels"),
                ));
            }
            (len, n) => len / n,
        };
        Ok(Self {
            data,
            labels,
            stride,
        })
    }

    /// Interpret a decoded pickle as a batch.
    ///
    /// # Errors
    ///
    /// Returns `Format` when the value is not a dict, lacks `data` or `labels`,
    /// or either entry has an incompatible type or shape.
    pub fn from_value(value: Value, source: &Path) -> Result<Self> {
        let items = match value {
            Value::Dict(items) => items,
            other => {
                return Err(ConvertError::format(
                    source,
                    format!("expected a dict at top level, found {}", other.kind()),
                ));
            }
        };
        let mut data = None;
        let mut labels = None;
        for (key, entry) in items {
            match key.as_key() {
                Some(DATA_KEY) => data = Some(entry),
                Some(LABELS_KEY) => labels = Some(entry),
                _ => {}
            }
        }
        let data = data.ok_or_else(|| ConvertError::format(source, "missing key `data`"))?;
        let labels = labels.ok_or_else(|| ConvertError::format(source, "missing key `labels`"))?;

        let labels = labels_from_value(&labels, source)?;
        let (data, rows) = data_from_value(data, source)?;
        if let Some(rows) = rows
            && rows != labels.len()
        {
            return Err(ConvertError::format(
                source,
                format!("data holds {rows} images but there are {} labels", labels.len()),
            ));
        }
        Self::new(data, labels, source)
    }

    /// Number of images (and labels) in the batch.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Bytes per image.
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn labels(&self) -> &[i64] {
        &self.labels
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Image bytes of row `index`.
    pub fn image(&self, index: usize) -> Option<&[u8]> {
        if index >= self.len() {
            return None;
        }
        let start = index * self.stride;
        self.data.get(start..start + self.stride)
    }

    /// Rows in ascending index order as `(image_bytes, label)`.
    pub fn rows(&self) -> impl Iterator<Item = (&[u8], i64)> + '_ {
        (0..self.len()).map(move |i| {
            let start = i * self.stride;
            (&self.data[start..start + self.stride], self.labels[i])
        })
    }
}

/// Read one archive member from disk.
///
/// # Errors
///
/// Returns `NotFound` when `path` does not exist, `Io` for other read failures,
/// and `Format` when the file is not a valid batch pickle.
pub fn read_batch(path: impl AsRef<Path>) -> Result<Batch> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ConvertError::NotFound {
            path: path.to_path_buf(),
        },
        _ => ConvertError::io(path, e),
    })?;
    let value = pickle::from_slice(&bytes).map_err(|e| ConvertError::format(path, e.to_string()))?;
    let batch = Batch::from_value(value, path)?;
    debug!(
        "read {}: {} images, stride {} bytes",
        path.display(),
        batch.len(),
        batch.stride()
    );
    Ok(batch)
}

fn labels_from_value(value: &Value, source: &Path) -> Result<Vec<i64>> {
    match value {
        Value::List(items) | Value::Tuple(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Int(n) => Ok(*n),
                Value::Bool(b) => Ok(i64::from(*b)),
                other => Err(ConvertError::format(
                    source,
                    format!("label #{i} is {} instead of int", other.kind()),
                )),
            })
            .collect(),
        Value::NdArray(arr) => {
            if arr.shape.len() != 1 {
                return Err(ConvertError::format(
                    source,
                    format!("labels array has {} dimensions, expected 1", arr.shape.len()),
                ));
            }
            arr.to_i64_vec().ok_or_else(|| {
                ConvertError::format(source, format!("labels array has dtype {}", arr.dtype))
            })
        }
        other => Err(ConvertError::format(
            source,
            format!("`labels` is {} instead of a list of ints", other.kind()),
        )),
    }
}

/// Returns the flat buffer and, for arrays, the number of rows it declares.
fn data_from_value(value: Value, source: &Path) -> Result<(Vec<u8>, Option<usize>)> {
    match value {
        Value::Bytes(b) => Ok((b, None)),
        Value::NdArray(arr) => {
            if arr.dtype.item_size != 1 {
                return Err(ConvertError::format(
                    source,
                    format!("`data` has dtype {}, expected one-byte pixels", arr.dtype),
                ));
            }
            if arr.fortran_order && arr.shape.len() > 1 {
                return Err(ConvertError::format(
                    source,
                    "`data` is Fortran-ordered; images would not be contiguous",
                ));
            }
            let Some(needed) = arr.element_count() else {
                return Err(ConvertError::format(
                    source,
                    format!("`data` shape {:?} overflows the address space", arr.shape),
                ));
            };
            if arr.data.len() != needed {
                return Err(ConvertError::format(
                    source,
                    format!(
                        "`data` buffer holds {} bytes but shape {:?} needs {needed}",
                        arr.data.len(),
                        arr.shape,
                    ),
                ));
            }
            let rows = if arr.shape.len() > 1 {
                arr.shape.first().copied()
            } else {
                None
            };
            Ok((arr.data, rows))
        }
        other => Err(ConvertError::format(
            source,
            format!("`data` is {} instead of a byte buffer", other.kind()),
        )),
    }
}
