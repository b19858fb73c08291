//! The narrow seam between job orchestration and the container engine.

use crate::actors::worker::{WorkerError, WorkerHandle};
use crate::events::{ProcessOutcome, ProcessStatus};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Where the per-job directories appear inside the job container.
pub const VOLUME_MOUNT: &str = "/volume/";
pub const OUTPUT_MOUNT: &str = "/output/";
pub const SPECS_MOUNT: &str = "/specs/";
pub const SCRIPT_MOUNT: &str = "/script.py";

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("`{command}` failed with status {status:?}: stdout={stdout:?} stderr={stderr:?}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("failed to spawn container runtime: {0}")]
    Spawn(#[from] io::Error),
    #[error("lost track of container process: {0}")]
    Worker(#[from] WorkerError),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    pub fn new(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }

    pub fn read_only(self) -> Self {
        Self {
            read_only: true,
            ..self
        }
    }

    fn to_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.host.display(), self.container);
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

/// One sandboxed container launch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    /// Flags from the resource preset, placed before everything else.
    pub extra_flags: Vec<String>,
    pub mounts: Vec<Mount>,
    pub command: Vec<String>,
    pub network_disabled: bool,
}

impl RunSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            extra_flags: Vec::new(),
            mounts: Vec::new(),
            command: Vec::new(),
            network_disabled: true,
        }
    }

    /// Arguments for `docker`, container always removed on exit.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string()];
        args.extend(self.extra_flags.iter().cloned());
        args.push("--name".to_string());
        args.push(self.name.clone());
        args.push("--rm".to_string());
        if self.network_disabled {
            args.push("--network".to_string());
            args.push("none".to_string());
        }
        for mount in &self.mounts {
            args.push("-v".to_string());
            args.push(mount.to_arg());
        }
        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull(&self, image: &str) -> Result<()>;

    /// Run a container to completion, killing it once `deadline` passes.
    async fn run(&self, spec: &RunSpec, deadline: Duration) -> Result<ProcessOutcome>;

    /// Force-remove a container by name. Removing a missing container is not an error.
    async fn remove(&self, name: &str) -> Result<()>;

    /// Delete everything below `dir`, including files owned by container users.
    async fn wipe_directory(&self, dir: &Path) -> Result<()>;
}

/// Drives the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker_bin: PathBuf,
    cleanup_image: String,
}

impl DockerRuntime {
    pub fn new(docker_bin: impl Into<PathBuf>, cleanup_image: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            cleanup_image: cleanup_image.into(),
        }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(&self.docker_bin);
        command.args(args);
        command
    }

    async fn run_checked(&self, args: Vec<String>) -> Result<String> {
        let output = self.command(&args).output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command: format!("{} {}", self.docker_bin.display(), args.join(" ")),
                status: output.status.code(),
                stdout,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(stdout)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull(&self, image: &str) -> Result<()> {
        tracing::debug!(image, "pulling image");
        self.run_checked(vec!["pull".to_string(), image.to_string()])
            .await
            .map(|_| ())
    }

    async fn run(&self, spec: &RunSpec, deadline: Duration) -> Result<ProcessOutcome> {
        let worker = WorkerHandle::spawn(self.command(&spec.to_args()))?;
        let (collected, timed_out) = match tokio::time::timeout(deadline, worker.wait()).await {
            Ok(collected) => (collected?, false),
            Err(_) => {
                tracing::warn!(container = %spec.name, ?deadline, "container did not finish in time, killing it");
                // killing the CLI process alone leaves the container running
                let _ = worker.stop().await;
                if let Err(err) = self.remove(&spec.name).await {
                    tracing::warn!(container = %spec.name, error = %err, "failed to remove timed out container");
                }
                (worker.wait().await?, true)
            }
        };
        let exit_status = match (timed_out, collected.status) {
            (false, ProcessStatus::Exited { code }) => Some(code),
            _ => None,
        };
        Ok(ProcessOutcome {
            exit_status,
            timed_out,
            stdout: String::from_utf8_lossy(&collected.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&collected.stderr).into_owned(),
        })
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let output = self
            .command(&["rm".to_string(), "-f".to_string(), name.to_string()])
            .output()
            .await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || stderr.contains("No such container") {
            Ok(())
        } else {
            Err(RuntimeError::CommandFailed {
                command: format!("{} rm -f {}", self.docker_bin.display(), name),
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: stderr.into_owned(),
            })
        }
    }

    async fn wipe_directory(&self, dir: &Path) -> Result<()> {
        let mount = Mount::new(dir, "/temp_dir/");
        self.run_checked(vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            mount.to_arg(),
            self.cleanup_image.clone(),
            "find".to_string(),
            "/temp_dir".to_string(),
            "-mindepth".to_string(),
            "1".to_string(),
            "-delete".to_string(),
        ])
        .await
        .map(|_| ())
    }
}
