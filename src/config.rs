//! Dataset layout and run options.
//!
//! [`DatasetConfig`] describes where the archive lives and how its members map
//! onto output splits. The built-in default matches the published artist
//! prediction archive; a JSON file can override any field:
//!
//! ```no_run
//! use tfrecord_convert::config::DatasetConfig;
//! # fn main() -> tfrecord_convert::Result<()> {
//! let config = DatasetConfig::from_json_file("layout.json")?;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

use crate::error::{ConvertError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Remote archive published for the artist prediction dataset.
pub const DEFAULT_URL: &str = "https://predictartist.s3.amazonaws.com/artistprediction.zip";

/// Directory the archive unpacks into.
pub const DEFAULT_EXTRACTED_DIR: &str = "ARTIST-batches-py";

/// Extension of every output container.
pub const DEFAULT_OUTPUT_EXTENSION: &str = "tfrecords";

/// One of the output partitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Validation,
    Eval,
}

impl Split {
    /// All splits in conversion order.
    pub const ALL: [Split; 3] = [Split::Train, Split::Validation, Split::Eval];

    pub fn name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "validation",
            Split::Eval => "eval",
        }
    }

    /// Member files this split reads from in the standard archive layout.
    pub fn default_members(self) -> Vec<String> {
        match self {
            Split::Train => (1..=4).map(|i| format!("data_batch_{i}")).collect(),
            Split::Validation => vec!["data_batch_5".to_string()],
            Split::Eval => vec!["test_batch".to_string()],
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A split together with the ordered list of members feeding it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitSpec {
    pub split: Split,
    pub members: Vec<String>,
}

impl From<Split> for SplitSpec {
    fn from(split: Split) -> Self {
        Self {
            split,
            members: split.default_members(),
        }
    }
}

/// Where the dataset comes from and how it is partitioned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Remote archive location.
    pub url: String,
    /// Local file name for the downloaded archive. Derived from `url` when empty.
    pub archive_name: String,
    /// Directory (relative to the data dir) the archive unpacks into.
    pub extracted_dir: String,
    /// Extension for output containers, without the dot.
    pub output_extension: String,
    /// Splits in conversion order.
    pub splits: Vec<SplitSpec>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            archive_name: String::new(),
            extracted_dir: DEFAULT_EXTRACTED_DIR.to_string(),
            output_extension: DEFAULT_OUTPUT_EXTENSION.to_string(),
            splits: Split::ALL.into_iter().map(SplitSpec::from).collect(),
        }
    }
}

impl DatasetConfig {
    /// Load a layout from a JSON file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read and `Config` if it is not valid JSON.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ConvertError::io(path, e))?;
        serde_json::from_str(&text)
            .map_err(|e| ConvertError::config(format!("parse {}: {e}", path.display())))
    }

    /// File name of the downloaded archive.
    pub fn archive_file_name(&self) -> &str {
        if !self.archive_name.is_empty() {
            return &self.archive_name;
        }
        self.url
            .rsplit('/')
            .find(|seg| !seg.is_empty())
            .unwrap_or(self.url.as_str())
    }

    pub fn archive_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(self.archive_file_name())
    }

    pub fn input_dir(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.extracted_dir)
    }

    /// Output container path for `split`, e.g. `<data_dir>/train.tfrecords`.
    pub fn output_path(&self, data_dir: &Path, split: Split) -> PathBuf {
        data_dir.join(format!("{}.{}", split.name(), self.output_extension))
    }

    /// Check the layout before any work starts.
    ///
    /// # Errors
    ///
    /// Returns `Config` when a split is repeated or empty, when a member name is
    /// not a plain file name, or when a member is listed more than once across
    /// all splits.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(ConvertError::config("url is empty"));
        }
        if self.archive_file_name().is_empty() || self.extracted_dir.trim().is_empty() {
            return Err(ConvertError::config("archive name and extracted dir must be set"));
        }
        if self.splits.is_empty() {
            return Err(ConvertError::config("no splits configured"));
        }

        let mut seen_splits = HashSet::new();
        let mut seen_members = HashSet::new();
        for spec in &self.splits {
            if !seen_splits.insert(spec.split) {
                return Err(ConvertError::config(format!(
                    "split {} is listed more than once",
                    spec.split
                )));
            }
            if spec.members.is_empty() {
                return Err(ConvertError::config(format!(
                    "split {} has no members",
                    spec.split
                )));
            }
            for member in &spec.members {
                if !is_plain_file_name(member) {
                    return Err(ConvertError::config(format!(
                        "member {member:?} of split {} is not a plain file name",
                        spec.split
                    )));
                }
                if !seen_members.insert(member.as_str()) {
                    return Err(ConvertError::config(format!(
                        "member {member} is assigned more than once"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
}

/// Options for one conversion run.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Root for download, extraction and output. Empty means the current directory.
    pub data_dir: PathBuf,
    /// Leave the archive and extracted directory in place after conversion.
    pub keep_sources: bool,
    /// Re-read every container after writing it.
    pub verify: bool,
    /// Write collected metrics as JSON to this path.
    pub metrics_out: Option<PathBuf>,
}

impl RunOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// The data directory, with an empty path resolved to `.`.
    pub fn resolved_data_dir(&self) -> PathBuf {
        if self.data_dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            self.data_dir.clone()
        }
    }
}
