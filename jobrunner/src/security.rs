//! Refuses jobs whose image is untrusted or whose host can be escaped from.

use crate::config::ProbeConfig;
use crate::errors::JobError;
use crate::runtime::{ContainerRuntime, RunSpec};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeVerdict {
    Safe,
    Unsafe { reason: String },
}

pub struct SecurityGate {
    trusted_prefixes: Vec<String>,
    probe: ProbeConfig,
    probe_container: String,
    runtime: Arc<dyn ContainerRuntime>,
}

impl SecurityGate {
    pub fn new(
        trusted_prefixes: Vec<String>,
        probe: ProbeConfig,
        probe_container: impl Into<String>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            trusted_prefixes,
            probe,
            probe_container: probe_container.into(),
            runtime,
        }
    }

    /// An absent image is allowed, anything else must come from a trusted registry prefix.
    pub fn check_image(&self, image: Option<&str>) -> Result<(), JobError> {
        match image {
            None => Ok(()),
            Some(image) if self.trusted_prefixes.iter().any(|p| image.starts_with(p.as_str())) => {
                Ok(())
            }
            Some(image) => {
                tracing::warn!(image, "blocked image from an untrusted registry");
                Err(JobError::ImageNotAllowed(image.to_string()))
            }
        }
    }

    /// Run the disposable escape-probe container. Anything short of the sentinel is unsafe.
    pub async fn probe_escape_vulnerability(&self) -> ProbeVerdict {
        let mut spec = RunSpec::new(&self.probe_container, &self.probe.image);
        spec.network_disabled = false;
        let verdict = match self.runtime.run(&spec, self.probe.timeout).await {
            Err(err) => ProbeVerdict::Unsafe {
                reason: format!("probe could not run: {}", err),
            },
            Ok(outcome) if outcome.timed_out => ProbeVerdict::Unsafe {
                reason: format!("probe timed out after {:?}", self.probe.timeout),
            },
            Ok(outcome) if outcome.exit_status != Some(0) => ProbeVerdict::Unsafe {
                reason: format!(
                    "probe exited with {:?}: stdout={:?} stderr={:?}",
                    outcome.exit_status, outcome.stdout, outcome.stderr
                ),
            },
            Ok(outcome) if !outcome.stdout.contains(&self.probe.sentinel) => ProbeVerdict::Unsafe {
                reason: format!(
                    "{:?} not in probe output: stdout={:?} stderr={:?}",
                    self.probe.sentinel, outcome.stdout, outcome.stderr
                ),
            },
            Ok(_) => ProbeVerdict::Safe,
        };
        if let ProbeVerdict::Unsafe { reason } = &verdict {
            tracing::error!(reason = %reason, "container escape probe failed");
        }
        verdict
    }
}
