use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TRUSTED_IMAGE_PREFIXES: &[&str] =
    &["backenddevelopersltd/", "docker.io/backenddevelopersltd/"];
pub const ESCAPE_PROBE_IMAGE: &str =
    "us-central1-docker.pkg.dev/twistlock-secresearch/public/can-ctr-escape-cve-2022-0492:latest";
pub const ESCAPE_PROBE_SENTINEL: &str = "Contained: cannot escape via CVE-2022-0492";

/// Limits for the resumable downloader.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Downloads allowed in flight at once.
    pub concurrency: usize,
    pub max_attempts: u32,
    /// First retry waits this long; every later retry doubles it.
    pub backoff_base: Duration,
    /// Zero disables the cap.
    pub max_size_bytes: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            max_size_bytes: 0,
        }
    }
}

/// Settings for the container escape probe.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub image: String,
    pub sentinel: String,
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            image: ESCAPE_PROBE_IMAGE.to_string(),
            sentinel: ESCAPE_PROBE_SENTINEL.to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

/// How much of a process' output goes into the response message.
#[derive(Debug, Clone, Copy)]
pub struct TruncationConfig {
    pub max_chars: usize,
    pub prefix_chars: usize,
    pub suffix_chars: usize,
}

impl Default for TruncationConfig {
    fn default() -> Self {
        Self {
            max_chars: 1000,
            prefix_chars: 100,
            suffix_chars: 100,
        }
    }
}

/// Immutable executor settings, built once at startup and shared by every component.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Used to derive container names; one executor token maps to one job.
    pub executor_token: String,
    pub trusted_image_prefixes: Vec<String>,
    pub download: DownloadConfig,
    pub volume_unpack_timeout: Duration,
    pub probe: ProbeConfig,
    pub truncation: TruncationConfig,
    /// Image used for jobs that only ship a raw script.
    pub raw_script_image: String,
    /// Disposable image used to wipe directories written by job containers.
    pub cleanup_image: String,
    /// Image `nvidia-smi` runs in when collecting machine specs.
    pub gpu_probe_image: String,
    pub docker_bin: PathBuf,
    /// Parent of the per-job working directory, the system temp dir when unset.
    pub work_root: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            executor_token: "executor".to_string(),
            trusted_image_prefixes: DEFAULT_TRUSTED_IMAGE_PREFIXES
                .iter()
                .map(|prefix| prefix.to_string())
                .collect(),
            download: DownloadConfig::default(),
            volume_unpack_timeout: Duration::from_secs(300),
            probe: ProbeConfig::default(),
            truncation: TruncationConfig::default(),
            raw_script_image: "python:3.11-slim".to_string(),
            cleanup_image: "alpine:3.19".to_string(),
            gpu_probe_image: "ubuntu".to_string(),
            docker_bin: PathBuf::from("docker"),
            work_root: None,
        }
    }
}

impl ExecutorConfig {
    pub fn new(executor_token: impl Into<String>) -> Self {
        Self {
            executor_token: executor_token.into(),
            ..Default::default()
        }
    }

    pub fn with_max_volume_size(mut self, max_size_bytes: u64) -> Self {
        self.download.max_size_bytes = max_size_bytes;
        self
    }

    pub fn with_trusted_prefix(mut self, prefix: &str) -> Self {
        self.trusted_image_prefixes.push(prefix.to_string());
        self
    }
}
