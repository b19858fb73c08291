use clap::Parser;
use jobrunner::ExecutorConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Run one job handed out by a dispatcher
#[derive(Debug, Parser)]
#[clap(name = "executor")]
pub struct Args {
    /// Websocket address of the dispatcher, e.g. ws://miner:8000
    #[clap(long, env = "MINER_ADDRESS")]
    pub miner_address: String,

    /// Token identifying this executor to the dispatcher
    #[clap(long, env = "EXECUTOR_TOKEN")]
    pub executor_token: String,

    /// Largest input volume to download, in bytes; 0 disables the limit
    #[clap(long, env = "VOLUME_MAX_SIZE_BYTES", default_value = "0")]
    pub volume_max_size_bytes: u64,

    /// Downloads allowed to run at once
    #[clap(long, env = "DOWNLOAD_CONCURRENCY", default_value = "3")]
    pub download_concurrency: usize,

    /// Seconds allowed for downloading and unpacking the input volume
    #[clap(long, env = "VOLUME_UNPACK_TIMEOUT", default_value = "300")]
    pub volume_unpack_timeout: u64,

    /// Additional trusted image prefix, may be repeated
    #[clap(long = "trusted-image-prefix", multiple_occurrences(true))]
    pub trusted_image_prefixes: Vec<String>,

    #[clap(long, env = "DOCKER_BIN", default_value = "docker")]
    pub docker_bin: PathBuf,

    /// Directory the job's working tree is created in, the system temp dir by default
    #[clap(long, env = "EXECUTOR_WORK_DIR")]
    pub work_dir: Option<PathBuf>,
}

impl Args {
    pub fn dispatcher_url(&self) -> String {
        format!(
            "{}/v0.1/executor_interface/{}",
            self.miner_address.trim_end_matches('/'),
            self.executor_token
        )
    }

    pub fn config(&self) -> ExecutorConfig {
        let mut config = ExecutorConfig::new(&self.executor_token)
            .with_max_volume_size(self.volume_max_size_bytes);
        for prefix in &self.trusted_image_prefixes {
            config = config.with_trusted_prefix(prefix);
        }
        config.download.concurrency = self.download_concurrency.max(1);
        config.volume_unpack_timeout = Duration::from_secs(self.volume_unpack_timeout);
        config.docker_bin = self.docker_bin.clone();
        config.work_root = self.work_dir.clone();
        config
    }
}
