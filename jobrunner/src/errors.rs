use std::{io, result, time::Duration};
use thiserror::Error;

use crate::download::DownloadError;
use crate::runtime::RuntimeError;
use crate::session::SessionError;
use crate::upload::UploadError;

/// Whether an input failure came from the data itself or from the machinery around it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputErrorKind {
    Data,
    Infrastructure,
}

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("Received multiple volumes")]
    MultipleVolumes,
    #[error("Input volume too large")]
    TooLarge,
    #[error("refusing to materialize into {0}")]
    UnsafeMountRoot(String),
    #[error("invalid inline volume: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("invalid volume archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("volume relative path escapes the mount root: {0}")]
    PathEscape(String),
    #[error("{0}")]
    Download(DownloadError),
    #[error("input volume unpacking exceeded {0:?}")]
    Timeout(Duration),
    #[error("io error while unpacking volume: {0}")]
    Io(#[from] io::Error),
    #[error("unpacking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<DownloadError> for VolumeError {
    fn from(err: DownloadError) -> Self {
        match err {
            DownloadError::TooLarge { .. } => VolumeError::TooLarge,
            other => VolumeError::Download(other),
        }
    }
}

impl VolumeError {
    pub fn kind(&self) -> InputErrorKind {
        match self {
            VolumeError::MultipleVolumes
            | VolumeError::TooLarge
            | VolumeError::Decode(_)
            | VolumeError::Archive(_)
            | VolumeError::PathEscape(_)
            | VolumeError::Download(_) => InputErrorKind::Data,
            VolumeError::UnsafeMountRoot(_)
            | VolumeError::Timeout(_)
            | VolumeError::Io(_)
            | VolumeError::Task(_) => InputErrorKind::Infrastructure,
        }
    }

    /// The text reported back to the dispatcher in place of the job's stdout.
    pub fn description(&self) -> String {
        match (self.kind(), self) {
            (_, VolumeError::Timeout(_)) => "Input volume downloading took too long".to_string(),
            (InputErrorKind::Data, err) => err.to_string(),
            (InputErrorKind::Infrastructure, _) => {
                "Unknown error happened while downloading input volume".to_string()
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("image {0} is not from a trusted registry")]
    ImageNotAllowed(String),
    #[error("host failed the container escape probe")]
    UnsafeHost,
    #[error("failed to prepare job: {0}")]
    Prepare(String),
    #[error("Invalid preset: {0}")]
    InvalidPreset(String),
    #[error(transparent)]
    Input(#[from] VolumeError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = result::Result<T, JobError>;
