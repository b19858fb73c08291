//! Shipping a finished job's output directory to wherever the dispatcher asked.

use async_trait::async_trait;
use protocol::{OutputUpload, SingleFileUpload};
use std::io::{self, Cursor, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("upload rejected: {0}")]
    Rejected(String),
    #[error("upload request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("output path {0} is not inside the output directory")]
    PathEscape(String),
    #[error("reading output failed: {0}")]
    Io(#[from] io::Error),
    #[error("archiving output failed: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("archiving task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl UploadError {
    /// Text reported back in place of the job's stdout.
    pub fn description(&self) -> String {
        format!("Uploading output failed: {}", self)
    }
}

#[async_trait]
pub trait OutputUploader: Send + Sync {
    async fn upload(&self, upload: &OutputUpload, output_dir: &Path) -> Result<(), UploadError>;
}

/// Uploads over plain HTTP PUTs.
#[derive(Clone, Default)]
pub struct HttpOutputUploader {
    client: reqwest::Client,
}

impl HttpOutputUploader {
    pub fn new() -> Self {
        Self::default()
    }

    async fn put(&self, url: &str, body: Vec<u8>) -> Result<(), UploadError> {
        let response = self.client.put(url).body(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UploadError::Rejected(format!("{} answered {}: {}", url, status, text)));
        }
        Ok(())
    }

    async fn put_file(&self, url: &str, output_dir: &Path, relative_path: &str) -> Result<(), UploadError> {
        let path = resolve(output_dir, relative_path)?;
        let body = tokio::fs::read(&path).await?;
        tracing::debug!(url, path = %path.display(), bytes = body.len(), "uploading output file");
        self.put(url, body).await
    }
}

#[async_trait]
impl OutputUploader for HttpOutputUploader {
    async fn upload(&self, upload: &OutputUpload, output_dir: &Path) -> Result<(), UploadError> {
        match upload {
            OutputUpload::SingleFilePut { url, relative_path } => {
                self.put_file(url, output_dir, relative_path).await
            }
            OutputUpload::ZipAndHttpPut { url } => {
                let dir = output_dir.to_path_buf();
                let archive = tokio::task::spawn_blocking(move || zip_directory(&dir)).await??;
                tracing::debug!(url, bytes = archive.len(), "uploading zipped output");
                self.put(url, archive).await
            }
            OutputUpload::MultiUpload { uploads } => {
                for single in uploads {
                    let SingleFileUpload::SingleFilePut { url, relative_path } = single;
                    self.put_file(url, output_dir, relative_path).await?;
                }
                Ok(())
            }
        }
    }
}

fn resolve(root: &Path, relative_path: &str) -> Result<PathBuf, UploadError> {
    let relative = Path::new(relative_path);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(UploadError::PathEscape(relative_path.to_string()));
    }
    Ok(root.join(relative))
}

fn zip_directory(dir: &Path) -> Result<Vec<u8>, UploadError> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default();
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let name = entry
            .path()
            .strip_prefix(dir)
            .map_err(|_| UploadError::PathEscape(entry.path().display().to_string()))?
            .to_string_lossy()
            .into_owned();
        if entry.file_type().is_dir() {
            writer.add_directory(name, options)?;
        } else if entry.file_type().is_file() {
            writer.start_file(name, options)?;
            writer.write_all(&std::fs::read(entry.path())?)?;
        }
    }
    Ok(writer.finish()?.into_inner())
}
