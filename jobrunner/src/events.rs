use std::fmt;

/// Where a job is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Created,
    Prepared,
    VolumeReady,
    Running,
    Finished,
    Failed,
    TimedOut,
    Cleaned,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Created => "created",
            JobState::Prepared => "prepared",
            JobState::VolumeReady => "volume_ready",
            JobState::Running => "running",
            JobState::Finished => "finished",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed_out",
            JobState::Cleaned => "cleaned",
        };
        f.write_str(name)
    }
}

/// How a supervised process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited { code: i32 },
    Killed { signal: i32 },
    /// waiting on the child failed, so its fate is unknown
    Unknown,
}

/// Everything a supervised process left behind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// `None` when the process was killed or never reported a status.
    pub exit_status: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
}

/// A chunk of output read from one of a process' pipes.
#[derive(Clone, Debug)]
pub enum Output {
    Stdout(crate::types::OutputBlob),
    Stderr(crate::types::OutputBlob),
}
