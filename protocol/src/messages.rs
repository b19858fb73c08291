use crate::{JobUuid, MachineSpecs, OutputUpload, Volume};
use serde::{Deserialize, Serialize};

/// Phase one of a job: enough to pull the base image and get ready.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InitialJobRequest {
    pub job_uuid: JobUuid,
    #[serde(default)]
    pub base_docker_image_name: Option<String>,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub volume: Option<Volume>,
}

/// Phase two of a job: what to actually run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_uuid: JobUuid,
    #[serde(default)]
    pub docker_image_name: Option<String>,
    #[serde(default)]
    pub docker_run_cmd: Vec<String>,
    pub docker_run_options_preset: String,
    #[serde(default)]
    pub raw_script: Option<String>,
    #[serde(default)]
    pub volume: Option<Volume>,
    #[serde(default)]
    pub output_upload: Option<OutputUpload>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type")]
pub enum DispatcherMessage {
    #[serde(rename = "V0InitialJobRequest")]
    InitialJobRequest(InitialJobRequest),
    #[serde(rename = "V0JobRequest")]
    JobRequest(JobRequest),
    GenericError { details: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type")]
pub enum ExecutorMessage {
    #[serde(rename = "V0ReadyRequest")]
    Ready { job_uuid: Option<JobUuid> },
    #[serde(rename = "V0MachineSpecsRequest")]
    MachineSpecs {
        job_uuid: Option<JobUuid>,
        specs: MachineSpecs,
    },
    #[serde(rename = "V0FinishedRequest")]
    Finished {
        job_uuid: Option<JobUuid>,
        docker_process_stdout: String,
        docker_process_stderr: String,
    },
    #[serde(rename = "V0FailedRequest")]
    Failed {
        job_uuid: Option<JobUuid>,
        docker_process_exit_status: Option<i32>,
        timeout: bool,
        docker_process_stdout: String,
        docker_process_stderr: String,
    },
    #[serde(rename = "V0FailedToPrepare")]
    FailedToPrepare { job_uuid: Option<JobUuid> },
    GenericError { details: String },
}

impl ExecutorMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "V0ReadyRequest",
            Self::MachineSpecs { .. } => "V0MachineSpecsRequest",
            Self::Finished { .. } => "V0FinishedRequest",
            Self::Failed { .. } => "V0FailedRequest",
            Self::FailedToPrepare { .. } => "V0FailedToPrepare",
            Self::GenericError { .. } => "GenericError",
        }
    }
}
