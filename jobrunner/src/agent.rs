//! The executor's single job, supervised end to end.

use crate::config::ExecutorConfig;
use crate::errors::{JobError, Result};
use crate::runner::JobRunner;
use crate::runtime::{ContainerRuntime, DockerRuntime};
use crate::security::{ProbeVerdict, SecurityGate};
use crate::session::ProtocolSession;
use crate::specs::{HostSpecsProbe, SpecsProbe};
use crate::upload::{HttpOutputUploader, OutputUploader};
use protocol::InitialJobRequest;
use std::sync::Arc;

pub struct Executor {
    config: Arc<ExecutorConfig>,
    session: ProtocolSession,
    runtime: Arc<dyn ContainerRuntime>,
    uploader: Arc<dyn OutputUploader>,
    specs: Arc<dyn SpecsProbe>,
    gate: SecurityGate,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        session: ProtocolSession,
        runtime: Arc<dyn ContainerRuntime>,
        uploader: Arc<dyn OutputUploader>,
        specs: Arc<dyn SpecsProbe>,
    ) -> Self {
        let gate = SecurityGate::new(
            config.trusted_image_prefixes.clone(),
            config.probe.clone(),
            format!("{}-probe", config.executor_token),
            runtime.clone(),
        );
        Self {
            config: Arc::new(config),
            session,
            runtime,
            uploader,
            specs,
            gate,
        }
    }

    /// An executor that drives the local docker daemon.
    pub fn with_docker(config: ExecutorConfig, session: ProtocolSession) -> Self {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::new(
            config.docker_bin.clone(),
            config.cleanup_image.clone(),
        ));
        let specs = HostSpecsProbe::new(
            runtime.clone(),
            config.gpu_probe_image.clone(),
            format!("{}-specs", config.executor_token),
            config.work_root.clone().unwrap_or_else(std::env::temp_dir),
        );
        Self::new(
            config,
            session,
            runtime,
            Arc::new(HttpOutputUploader::new()),
            Arc::new(specs),
        )
    }

    /// Wait for a job, run it and report exactly one outcome.
    ///
    /// Only a lost dispatcher connection surfaces as an error: there is nobody left to report to.
    pub async fn run(&self) -> Result<()> {
        let initial = self.session.initial_request().await?;
        let job_uuid = &initial.job_uuid;

        if let Err(err) = self.gate.check_image(initial.base_docker_image_name.as_deref()) {
            tracing::error!(job_uuid = %job_uuid, error = %err, "refusing job");
            self.session.send_failed_to_prepare().await?;
            return Ok(());
        }
        tracing::debug!(job_uuid = %job_uuid, "checking for container escape vulnerability");
        if let ProbeVerdict::Unsafe { reason } = self.gate.probe_escape_vulnerability().await {
            tracing::error!(job_uuid = %job_uuid, reason = %reason, "{}", JobError::UnsafeHost);
            self.session.send_failed_to_prepare().await?;
            return Ok(());
        }

        let mut runner = match JobRunner::new(
            self.config.clone(),
            initial.clone(),
            self.runtime.clone(),
            self.uploader.clone(),
        ) {
            Ok(runner) => runner,
            Err(err) => {
                tracing::error!(job_uuid = %job_uuid, error = %err, "failed to create job directory");
                self.session.send_generic_error("Unexpected error").await?;
                return Ok(());
            }
        };
        let outcome = self.supervise(&mut runner, &initial).await;
        let reported = match outcome {
            Ok(()) => Ok(()),
            Err(JobError::Session(err)) => Err(err.into()),
            Err(err) => {
                tracing::error!(job_uuid = %job_uuid, error = %err, "unhandled error while working on job");
                self.session
                    .send_generic_error("Unexpected error")
                    .await
                    .map_err(JobError::from)
            }
        };
        if let Err(err) = runner.clean().await {
            tracing::error!(job_uuid = %job_uuid, error = %err, "failed to clean up job directory");
        }
        reported
    }

    async fn supervise(&self, runner: &mut JobRunner, initial: &InitialJobRequest) -> Result<()> {
        let job_uuid = &initial.job_uuid;
        tracing::debug!(job_uuid = %job_uuid, "preparing job");
        match runner.prepare().await {
            Ok(()) => {}
            Err(err @ JobError::Prepare(_)) => {
                tracing::error!(job_uuid = %job_uuid, error = %err, "job preparation failed");
                self.session.send_failed_to_prepare().await?;
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        tracing::debug!(job_uuid = %job_uuid, "collecting machine specs");
        let specs = self.specs.collect().await;
        self.session.send_ready().await?;
        tracing::debug!(job_uuid = %job_uuid, "ready for job payload");

        let payload = self.session.job_payload().await?;
        if let Err(err) = self.gate.check_image(payload.docker_image_name.as_deref()) {
            tracing::error!(job_uuid = %job_uuid, error = %err, "refusing job");
            self.session.send_failed_to_prepare().await?;
            return Ok(());
        }

        tracing::debug!(job_uuid = %job_uuid, "running job");
        let result = runner.run_job(&payload).await?.with_specs(Some(specs));
        tracing::debug!(job_uuid = %job_uuid, state = %runner.state(), success = result.success, "reporting job result");
        if result.success {
            self.session.send_finished(&result).await?;
        } else {
            self.session.send_failed(&result).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ESCAPE_PROBE_SENTINEL;
    use crate::session::{Outbox, SessionError};
    use crate::testing::{exited, job_id, FakeRuntime, FakeUploader};
    use async_trait::async_trait;
    use protocol::{DispatcherMessage, ExecutorMessage, JobRequest, MachineSpecs};
    use serde_json::json;
    use tempfile::TempDir;

    struct FixedSpecs;

    #[async_trait]
    impl SpecsProbe for FixedSpecs {
        async fn collect(&self) -> MachineSpecs {
            MachineSpecs {
                specs: json!({"gpu": {"count": 1}}),
            }
        }
    }

    struct Harness {
        work: TempDir,
        work_root: Option<std::path::PathBuf>,
        runtime: Arc<FakeRuntime>,
        session: ProtocolSession,
        outbox: Outbox,
    }

    impl Harness {
        fn new(runtime: FakeRuntime) -> Self {
            let (session, outbox) = ProtocolSession::new();
            Self {
                work: tempfile::tempdir().expect("tempdir"),
                work_root: None,
                runtime: Arc::new(runtime),
                session,
                outbox,
            }
        }

        async fn deliver(&self, initial: InitialJobRequest, payload: Option<JobRequest>) {
            self.session
                .handle_message(DispatcherMessage::InitialJobRequest(initial))
                .await;
            if let Some(payload) = payload {
                self.session
                    .handle_message(DispatcherMessage::JobRequest(payload))
                    .await;
            }
        }

        /// Run the executor to completion and return everything it sent.
        async fn run(self) -> (Result<()>, Vec<ExecutorMessage>, Arc<FakeRuntime>, TempDir) {
            let mut config = ExecutorConfig::new("tok");
            config.work_root = Some(
                self.work_root
                    .clone()
                    .unwrap_or_else(|| self.work.path().to_path_buf()),
            );
            let executor = Executor::new(
                config,
                self.session,
                self.runtime.clone(),
                Arc::new(FakeUploader::default()),
                Arc::new(FixedSpecs),
            );
            let mut outbox = self.outbox;
            let transport = tokio::spawn(async move {
                let mut sent = Vec::new();
                while let Some(envelope) = outbox.recv().await {
                    sent.push(envelope.message.clone());
                    envelope.delivered();
                }
                sent
            });
            let result = executor.run().await;
            drop(executor);
            (result, transport.await.unwrap(), self.runtime, self.work)
        }
    }

    fn safe_host() -> FakeRuntime {
        FakeRuntime::with_outcome(exited(0, ESCAPE_PROBE_SENTINEL))
    }

    fn initial(image: &str) -> InitialJobRequest {
        InitialJobRequest {
            job_uuid: job_id(),
            base_docker_image_name: Some(image.into()),
            timeout_seconds: 5,
            volume: None,
        }
    }

    fn payload(initial: &InitialJobRequest, image: &str) -> JobRequest {
        JobRequest {
            job_uuid: initial.job_uuid.clone(),
            docker_image_name: Some(image.into()),
            docker_run_cmd: vec![],
            docker_run_options_preset: "none".into(),
            raw_script: None,
            volume: None,
            output_upload: None,
        }
    }

    fn types(sent: &[ExecutorMessage]) -> Vec<&'static str> {
        sent.iter().map(|m| m.message_type()).collect()
    }

    fn leftovers(work: &TempDir) -> usize {
        std::fs::read_dir(work.path()).unwrap().count()
    }

    #[tokio::test]
    async fn happy_path_reports_specs_and_finish() {
        let harness = Harness::new(safe_host().then(exited(0, "42")));
        let job = initial("backenddevelopersltd/base");
        harness
            .deliver(job.clone(), Some(payload(&job, "backenddevelopersltd/app")))
            .await;

        let (result, sent, runtime, work) = harness.run().await;

        result.expect("run");
        assert_eq!(types(&sent), vec!["V0ReadyRequest", "V0MachineSpecsRequest", "V0FinishedRequest"]);
        match &sent[2] {
            ExecutorMessage::Finished {
                job_uuid,
                docker_process_stdout,
                ..
            } => {
                assert_eq!(*job_uuid, Some(job.job_uuid.clone()));
                assert_eq!(docker_process_stdout, "42");
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(runtime.runs().len(), 2);
        assert_eq!(leftovers(&work), 0);
    }

    #[tokio::test]
    async fn untrusted_base_image_is_refused_before_anything_runs() {
        let harness = Harness::new(safe_host());
        let job = initial("evil/miner");
        harness.deliver(job, None).await;

        let (result, sent, runtime, _work) = harness.run().await;

        result.expect("run");
        assert_eq!(types(&sent), vec!["V0FailedToPrepare"]);
        assert!(runtime.runs().is_empty());
        assert!(runtime.pulled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn untrusted_job_image_is_refused_before_launch() {
        let harness = Harness::new(safe_host());
        let job = initial("backenddevelopersltd/base");
        harness.deliver(job.clone(), Some(payload(&job, "docker.io/evil/app"))).await;

        let (result, sent, runtime, work) = harness.run().await;

        result.expect("run");
        assert_eq!(types(&sent), vec!["V0ReadyRequest", "V0FailedToPrepare"]);
        // only the escape probe ran
        assert_eq!(runtime.runs().len(), 1);
        assert_eq!(leftovers(&work), 0);
    }

    #[tokio::test]
    async fn vulnerable_host_is_refused() {
        let harness = Harness::new(FakeRuntime::with_outcome(exited(0, "escaped")));
        let job = initial("backenddevelopersltd/base");
        harness.deliver(job, None).await;

        let (_, sent, runtime, _work) = harness.run().await;

        assert_eq!(types(&sent), vec!["V0FailedToPrepare"]);
        assert!(runtime.pulled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_pull_is_refused_and_cleaned() {
        let runtime = FakeRuntime {
            fail_pull: true,
            ..safe_host()
        };
        let harness = Harness::new(runtime);
        harness.deliver(initial("backenddevelopersltd/base"), None).await;

        let (_, sent, _, work) = harness.run().await;

        assert_eq!(types(&sent), vec!["V0FailedToPrepare"]);
        assert_eq!(leftovers(&work), 0);
    }

    #[tokio::test]
    async fn failed_job_is_reported_with_status() {
        let harness = Harness::new(safe_host().then(exited(3, "traceback")));
        let job = initial("backenddevelopersltd/base");
        harness
            .deliver(job.clone(), Some(payload(&job, "backenddevelopersltd/app")))
            .await;

        let (_, sent, _, _work) = harness.run().await;

        assert_eq!(types(&sent), vec!["V0ReadyRequest", "V0FailedRequest"]);
        assert!(matches!(
            &sent[1],
            ExecutorMessage::Failed { docker_process_exit_status: Some(3), timeout: false, .. }
        ));
    }

    #[tokio::test]
    async fn unexpected_failure_is_a_generic_error() {
        let harness = Harness::new(safe_host().then_fail("docker daemon is gone"));
        let job = initial("backenddevelopersltd/base");
        harness
            .deliver(job.clone(), Some(payload(&job, "backenddevelopersltd/app")))
            .await;

        let (result, sent, _, work) = harness.run().await;

        result.expect("reported");
        assert_eq!(types(&sent), vec!["V0ReadyRequest", "GenericError"]);
        assert_eq!(
            sent[1],
            ExecutorMessage::GenericError {
                details: "Unexpected error".into()
            }
        );
        assert_eq!(leftovers(&work), 0);
    }

    #[tokio::test]
    async fn closed_session_is_an_error() {
        let harness = Harness::new(safe_host());
        harness.session.close();

        let (result, sent, _, _work) = harness.run().await;

        assert!(matches!(result, Err(JobError::Session(SessionError::Closed))));
        assert!(sent.is_empty());
    }

    #[tokio::test]
    async fn unusable_work_root_is_a_generic_error() {
        let mut harness = Harness::new(safe_host());
        let blocker = harness.work.path().join("not-a-directory");
        std::fs::write(&blocker, "x").expect("write");
        harness.work_root = Some(blocker);
        harness.deliver(initial("backenddevelopersltd/base"), None).await;

        let (result, sent, runtime, _work) = harness.run().await;

        result.expect("reported");
        assert_eq!(types(&sent), vec!["GenericError"]);
        assert!(runtime.pulled.lock().unwrap().is_empty());
    }
}
