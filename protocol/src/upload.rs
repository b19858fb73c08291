use serde::{Deserialize, Serialize};

/// Where to send the contents of `/output` once a job succeeds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "output_upload_type", rename_all = "snake_case")]
pub enum OutputUpload {
    SingleFilePut { url: String, relative_path: String },
    /// zip the whole output directory and PUT the archive
    ZipAndHttpPut { url: String },
    MultiUpload { uploads: Vec<SingleFileUpload> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "output_upload_type", rename_all = "snake_case")]
pub enum SingleFileUpload {
    SingleFilePut { url: String, relative_path: String },
}
