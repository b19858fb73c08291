//! Turning a declarative [`Volume`] into files under the job's input mount.

use crate::download::Downloader;
use crate::errors::VolumeError;
use base64::{engine::general_purpose::STANDARD, Engine};
use protocol::{Volume, VolumePart};
use std::io::{self, Cursor, Read, Seek, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use walkdir::WalkDir;

pub type Result<T> = std::result::Result<T, VolumeError>;

/// Pick the job's volume. Volumes in both request phases are rejected even when identical.
pub fn resolve_volume<'a>(
    initial: Option<&'a Volume>,
    payload: Option<&'a Volume>,
) -> Result<Option<&'a Volume>> {
    match (initial, payload) {
        (Some(_), Some(_)) => Err(VolumeError::MultipleVolumes),
        (initial, payload) => Ok(payload.or(initial)),
    }
}

/// Blocking filesystem work that a timed out materialization can stop and wait out.
#[derive(Clone, Default)]
struct BlockingWork {
    cancelled: Arc<AtomicBool>,
    in_flight: Arc<RwLock<()>>,
}

impl BlockingWork {
    async fn run<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&AtomicBool) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.in_flight.clone().read_owned().await;
        let cancelled = self.cancelled.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            work(cancelled.as_ref())
        })
        .await?
    }

    /// Returns once nothing started through `run` is still touching the disk.
    async fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _idle = self.in_flight.write().await;
    }
}

pub struct VolumeMaterializer {
    mount_root: PathBuf,
    /// Made world-writable after unpacking so the unprivileged job can write its output.
    work_root: PathBuf,
    downloader: Arc<Downloader>,
    deadline: Duration,
    blocking: BlockingWork,
}

impl VolumeMaterializer {
    pub fn new(
        mount_root: impl Into<PathBuf>,
        work_root: impl Into<PathBuf>,
        downloader: Arc<Downloader>,
        deadline: Duration,
    ) -> Self {
        Self {
            mount_root: mount_root.into(),
            work_root: work_root.into(),
            downloader,
            deadline,
            blocking: BlockingWork::default(),
        }
    }

    /// Wipe the mount root and unpack `volume` into it, all within the deadline.
    pub async fn materialize(&self, volume: Option<&Volume>) -> Result<()> {
        match tokio::time::timeout(self.deadline, self.materialize_now(volume)).await {
            Ok(result) => result,
            Err(_) => {
                self.blocking.cancel().await;
                Err(VolumeError::Timeout(self.deadline))
            }
        }
    }

    async fn materialize_now(&self, volume: Option<&Volume>) -> Result<()> {
        self.clear_mount_root().await?;
        match volume {
            None => {}
            Some(Volume::Inline {
                contents,
                relative_path,
            }) => self.unpack_inline(contents, relative_path.as_deref()).await?,
            Some(Volume::ZipUrl {
                contents,
                relative_path,
            }) => self.unpack_zip_url(contents, relative_path.as_deref()).await?,
            Some(Volume::SingleFile { url, relative_path }) => {
                self.unpack_single_file(url, relative_path).await?
            }
            Some(Volume::Multi { volumes }) => {
                tracing::debug!(parts = volumes.len(), "unpacking multi volume");
                // later members overwrite earlier ones
                for part in volumes {
                    self.unpack_part(part).await?;
                }
            }
        }
        let work_root = self.work_root.clone();
        self.blocking
            .run(move |_| make_world_writable(&work_root))
            .await
    }

    async fn unpack_part(&self, part: &VolumePart) -> Result<()> {
        match part {
            VolumePart::Inline {
                contents,
                relative_path,
            } => self.unpack_inline(contents, relative_path.as_deref()).await,
            VolumePart::ZipUrl {
                contents,
                relative_path,
            } => self.unpack_zip_url(contents, relative_path.as_deref()).await,
            VolumePart::SingleFile { url, relative_path } => {
                self.unpack_single_file(url, relative_path).await
            }
        }
    }

    async fn clear_mount_root(&self) -> Result<()> {
        let root = checked_mount_root(&self.mount_root, dirs::home_dir().as_deref()).await?;
        let mut entries = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(entry.path()).await?;
            } else {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }

    fn target(&self, relative_path: Option<&str>) -> Result<PathBuf> {
        match relative_path {
            None | Some("") => Ok(self.mount_root.clone()),
            Some(relative) => {
                let path = Path::new(relative);
                if path
                    .components()
                    .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
                {
                    return Err(VolumeError::PathEscape(relative.to_string()));
                }
                Ok(self.mount_root.join(path))
            }
        }
    }

    async fn unpack_inline(&self, contents: &str, relative_path: Option<&str>) -> Result<()> {
        let target = self.target(relative_path)?;
        let contents = contents.to_owned();
        self.blocking
            .run(move |cancelled| {
                let archive = STANDARD.decode(contents.trim())?;
                extract(Cursor::new(archive), &target, cancelled)
            })
            .await
    }

    async fn unpack_zip_url(&self, url: &str, relative_path: Option<&str>) -> Result<()> {
        let target = self.target(relative_path)?;
        let scratch = tokio::task::spawn_blocking(tempfile::tempfile).await??;
        let mut scratch = tokio::fs::File::from_std(scratch);
        self.downloader.download(url, &mut scratch).await?;
        let scratch = scratch.into_std().await;
        self.blocking
            .run(move |cancelled| extract(scratch, &target, cancelled))
            .await
    }

    async fn unpack_single_file(&self, url: &str, relative_path: &str) -> Result<()> {
        let path = self.target(Some(relative_path))?;
        if path == self.mount_root {
            return Err(VolumeError::PathEscape(relative_path.to_string()));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&path).await?;
        self.downloader.download(url, &mut file).await?;
        Ok(())
    }
}

/// The canonical form of `root`, refused when it resolves to the filesystem root or to `home`.
async fn checked_mount_root(root: &Path, home: Option<&Path>) -> Result<PathBuf> {
    let refuse = || VolumeError::UnsafeMountRoot(root.display().to_string());
    if root.as_os_str() == "~" {
        return Err(refuse());
    }
    tokio::fs::create_dir_all(root).await?;
    let resolved = tokio::fs::canonicalize(root).await?;
    let is_home = match home {
        Some(home) => tokio::fs::canonicalize(home)
            .await
            .map_or(false, |home| home == resolved),
        None => false,
    };
    if resolved.parent().is_none() || is_home {
        return Err(refuse());
    }
    Ok(resolved)
}

fn cancelled_error() -> VolumeError {
    io::Error::new(io::ErrorKind::Interrupted, "volume unpacking cancelled").into()
}

/// Unpack every entry under `target`, giving up between chunks once `cancelled` is set.
fn extract<R: Read + Seek>(reader: R, target: &Path, cancelled: &AtomicBool) -> Result<()> {
    let mut archive = zip::ZipArchive::new(reader)?;
    std::fs::create_dir_all(target)?;
    let mut buffer = vec![0u8; 64 * 1024];
    for index in 0..archive.len() {
        if cancelled.load(Ordering::SeqCst) {
            return Err(cancelled_error());
        }
        let mut entry = archive.by_index(index)?;
        let relative = entry
            .enclosed_name()
            .map(Path::to_path_buf)
            .ok_or_else(|| VolumeError::PathEscape(entry.name().to_string()))?;
        let path = target.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&path)?;
            continue;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(&path)?;
        loop {
            if cancelled.load(Ordering::SeqCst) {
                return Err(cancelled_error());
            }
            let read = entry.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])?;
        }
        if let Some(mode) = entry.unix_mode() {
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

/// chmod -R 777 on `root`.
fn make_world_writable(root: &Path) -> Result<()> {
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.path_is_symlink() {
            continue;
        }
        std::fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(0o777))?;
    }
    Ok(())
}
