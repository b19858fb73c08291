use protocol::MachineSpecs;

pub use protocol::JobUuid;
pub type OutputBlob = bytes::Bytes;

/// The terminal outcome of one job run.
///
/// `stdout`/`stderr` hold the wire-sized (truncated) output; the full streams live in the output
/// directory.
#[derive(Clone, Debug, PartialEq)]
pub struct JobResult {
    pub success: bool,
    pub exit_status: Option<i32>,
    pub timeout: bool,
    pub stdout: String,
    pub stderr: String,
    pub specs: Option<MachineSpecs>,
}

impl JobResult {
    /// A run that never launched a container, e.g. because its input could not be prepared.
    pub fn not_started(description: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_status: None,
            timeout: false,
            stdout: description.into(),
            stderr: String::new(),
            specs: None,
        }
    }

    pub fn with_specs(self, specs: Option<MachineSpecs>) -> Self {
        Self { specs, ..self }
    }
}
