use serde::{Deserialize, Serialize};

/// Input data to materialize under `/volume` before the job starts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "volume_type", rename_all = "snake_case")]
pub enum Volume {
    /// base64-encoded zip archive
    Inline {
        contents: String,
        #[serde(default)]
        relative_path: Option<String>,
    },
    /// url of a zip archive
    ZipUrl {
        contents: String,
        #[serde(default)]
        relative_path: Option<String>,
    },
    SingleFile { url: String, relative_path: String },
    Multi { volumes: Vec<VolumePart> },
}

/// A member of a multi volume. There is no `Multi` variant: multi volumes do not nest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "volume_type", rename_all = "snake_case")]
pub enum VolumePart {
    Inline {
        contents: String,
        #[serde(default)]
        relative_path: Option<String>,
    },
    ZipUrl {
        contents: String,
        #[serde(default)]
        relative_path: Option<String>,
    },
    SingleFile { url: String, relative_path: String },
}
