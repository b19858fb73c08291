//! One job, from pulling its base image to deleting its working tree.

use crate::config::{ExecutorConfig, TruncationConfig};
use crate::download::Downloader;
use crate::errors::{JobError, Result};
use crate::events::JobState;
use crate::runtime::{self, ContainerRuntime, Mount, RunSpec};
use crate::types::JobResult;
use crate::upload::OutputUploader;
use crate::volume::{resolve_volume, VolumeMaterializer};
use protocol::{InitialJobRequest, JobRequest};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Container launch flags for a named resource preset.
pub fn preset_flags(preset: &str) -> Result<Vec<String>> {
    match preset {
        "none" => Ok(Vec::new()),
        "nvidia_all" => Ok(vec!["--runtime=nvidia".into(), "--gpus".into(), "all".into()]),
        other => Err(JobError::InvalidPreset(other.to_string())),
    }
}

/// Shorten `text` for a response message, keeping its head and tail.
pub fn truncate(text: &str, budget: TruncationConfig) -> String {
    let len = text.chars().count();
    if len <= budget.max_chars {
        return text.to_string();
    }
    let prefix: String = text.chars().take(budget.prefix_chars).collect();
    let suffix: String = text.chars().skip(len - budget.suffix_chars.min(len)).collect();
    format!("{} ... {}", prefix, suffix)
}

pub struct JobRunner {
    config: Arc<ExecutorConfig>,
    initial: InitialJobRequest,
    runtime: Arc<dyn ContainerRuntime>,
    uploader: Arc<dyn OutputUploader>,
    downloader: Arc<Downloader>,
    root: PathBuf,
    state: JobState,
}

impl JobRunner {
    pub fn new(
        config: Arc<ExecutorConfig>,
        initial: InitialJobRequest,
        runtime: Arc<dyn ContainerRuntime>,
        uploader: Arc<dyn OutputUploader>,
    ) -> Result<Self> {
        let base = config.work_root.clone().unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&base)?;
        let root = tempfile::Builder::new()
            .prefix("job-")
            .tempdir_in(&base)?
            .into_path();
        let downloader = Arc::new(Downloader::new(config.download.clone()));
        Ok(Self {
            config,
            initial,
            runtime,
            uploader,
            downloader,
            root,
            state: JobState::Created,
        })
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn volume_dir(&self) -> PathBuf {
        self.root.join("volume")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn specs_dir(&self) -> PathBuf {
        self.root.join("specs")
    }

    fn container_name(&self) -> String {
        format!("{}-job", self.config.executor_token)
    }

    fn transition(&mut self, state: JobState) {
        tracing::debug!(job_uuid = %self.initial.job_uuid, from = %self.state, to = %state, "job state changed");
        self.state = state;
    }

    /// Create the working tree and pull the base image, if one was named.
    pub async fn prepare(&mut self) -> Result<()> {
        for dir in [self.volume_dir(), self.output_dir(), self.specs_dir()] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        if let Some(image) = &self.initial.base_docker_image_name {
            if let Err(err) = self.runtime.pull(image).await {
                tracing::error!(job_uuid = %self.initial.job_uuid, error = %err, "failed to pull base image");
                return Err(JobError::Prepare(err.to_string()));
            }
        }
        self.transition(JobState::Prepared);
        Ok(())
    }

    /// Run the job to a terminal result.
    ///
    /// Problems with the job's own input come back as an unsuccessful [`JobResult`]; an `Err` means
    /// the machinery around the job broke.
    pub async fn run_job(&mut self, payload: &JobRequest) -> Result<JobResult> {
        let job_uuid = self.initial.job_uuid.clone();
        let flags = match preset_flags(&payload.docker_run_options_preset) {
            Ok(flags) => flags,
            Err(err) => {
                tracing::error!(job_uuid = %job_uuid, error = %err, "job error");
                return Ok(self.stop_before_start(err.to_string()));
            }
        };
        if let Err(err) = self.stage_volume(payload).await {
            tracing::error!(job_uuid = %job_uuid, error = %err, kind = ?err.kind(), "job error");
            return Ok(self.stop_before_start(err.description()));
        }
        self.transition(JobState::VolumeReady);

        let spec = match self.run_spec(payload, flags).await? {
            Some(spec) => spec,
            None => return Ok(self.stop_before_start("No docker image to run")),
        };
        let deadline = Duration::from_secs(self.initial.timeout_seconds);
        self.transition(JobState::Running);
        let started = Instant::now();
        let outcome = self.runtime.run(&spec, deadline).await?;
        let elapsed = started.elapsed().as_secs_f64();

        let output_dir = self.output_dir();
        tokio::fs::write(output_dir.join("stdout.txt"), &outcome.stdout).await?;
        tokio::fs::write(output_dir.join("stderr.txt"), &outcome.stderr).await?;

        let mut result = JobResult {
            success: outcome.exit_status == Some(0) && !outcome.timed_out,
            exit_status: outcome.exit_status,
            timeout: outcome.timed_out,
            stdout: truncate(&outcome.stdout, self.config.truncation),
            stderr: truncate(&outcome.stderr, self.config.truncation),
            specs: None,
        };

        if result.success {
            if let Some(upload) = &payload.output_upload {
                if let Err(err) = self.uploader.upload(upload, &output_dir).await {
                    tracing::warn!(job_uuid = %job_uuid, error = %err, "uploading output failed");
                    result.success = false;
                    result.stdout = err.description();
                    result.stderr = String::new();
                }
            }
        }

        if result.success {
            tracing::info!(job_uuid = %job_uuid, elapsed, "job finished successfully");
            self.transition(JobState::Finished);
        } else if result.timeout {
            tracing::error!(job_uuid = %job_uuid, elapsed, "job did not finish in time and was killed");
            self.transition(JobState::TimedOut);
        } else {
            tracing::error!(
                job_uuid = %job_uuid,
                elapsed,
                command = %spec.to_args().join(" "),
                status = ?result.exit_status,
                stdout = %result.stdout,
                stderr = %result.stderr,
                "job failed"
            );
            self.transition(JobState::Failed);
        }
        Ok(result)
    }

    fn stop_before_start(&mut self, description: impl Into<String>) -> JobResult {
        self.transition(JobState::Failed);
        JobResult::not_started(description)
    }

    async fn stage_volume(&self, payload: &JobRequest) -> crate::volume::Result<()> {
        let volume = resolve_volume(self.initial.volume.as_ref(), payload.volume.as_ref())?;
        let materializer = VolumeMaterializer::new(
            self.volume_dir(),
            self.root.clone(),
            self.downloader.clone(),
            self.config.volume_unpack_timeout,
        );
        materializer.materialize(volume).await
    }

    /// `None` when neither the payload nor the initial request names something runnable.
    async fn run_spec(&self, payload: &JobRequest, flags: Vec<String>) -> Result<Option<RunSpec>> {
        let mut image = payload
            .docker_image_name
            .clone()
            .or_else(|| self.initial.base_docker_image_name.clone());
        let mut command = payload.docker_run_cmd.clone();
        let mut mounts = vec![
            Mount::new(self.volume_dir(), runtime::VOLUME_MOUNT),
            Mount::new(self.output_dir(), runtime::OUTPUT_MOUNT),
            Mount::new(self.specs_dir(), runtime::SPECS_MOUNT),
        ];

        if let Some(script) = &payload.raw_script {
            if payload.docker_image_name.is_none() {
                image = Some(self.config.raw_script_image.clone());
            }
            let script_path = self.root.join("script.py");
            tokio::fs::write(&script_path, script).await?;
            mounts.push(Mount::new(script_path, runtime::SCRIPT_MOUNT).read_only());
            if command.is_empty() {
                command = vec!["python".to_string(), runtime::SCRIPT_MOUNT.to_string()];
            }
        }

        Ok(image.map(|image| {
            let mut spec = RunSpec::new(self.container_name(), image);
            spec.extra_flags = flags;
            spec.mounts = mounts;
            spec.command = command;
            spec
        }))
    }

    /// Delete the working tree. Safe to call any number of times.
    pub async fn clean(&mut self) -> Result<()> {
        if tokio::fs::metadata(&self.root).await.is_err() {
            self.state = JobState::Cleaned;
            return Ok(());
        }
        // job containers leave files the executor's own user cannot delete
        self.runtime.wipe_directory(&self.root).await?;
        tokio::fs::remove_dir(&self.root).await?;
        self.transition(JobState::Cleaned);
        Ok(())
    }
}
