//! Wire types exchanged between an executor and its dispatcher.
//!
//! Every message is a JSON object tagged with `message_type`.

mod messages;
mod specs;
mod upload;
mod volume;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use messages::{DispatcherMessage, ExecutorMessage, InitialJobRequest, JobRequest};
pub use specs::MachineSpecs;
pub use upload::{OutputUpload, SingleFileUpload};
pub use volume::{Volume, VolumePart};

/// Opaque job token chosen by the dispatcher. Only ever compared for equality.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobUuid(String);

impl JobUuid {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobUuid {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Message types the executor accepts from the dispatcher.
pub const ACCEPTED_MESSAGE_TYPES: &[&str] = &["V0InitialJobRequest", "V0JobRequest", "GenericError"];
