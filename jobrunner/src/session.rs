//! The executor's side of the dispatcher conversation.
//!
//! Inbound, the dispatcher sends exactly two messages: an initial job request and then the full job
//! payload. Each lands in a one-shot [`Slot`] that the job supervisor awaits. Outbound messages go
//! through a single ordered queue drained by the transport.

mod slot;

use crate::types::{JobResult, JobUuid};
use protocol::{DispatcherMessage, ExecutorMessage, InitialJobRequest, JobRequest, ACCEPTED_MESSAGE_TYPES};
use slot::Slot;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("unsupported message received: {0}")]
    UnsupportedMessage(String),
    #[error("session closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// An outbound message waiting for the transport.
#[derive(Debug)]
pub struct Envelope {
    pub message: ExecutorMessage,
    delivered: Option<oneshot::Sender<()>>,
}

impl Envelope {
    /// Tell the sender its message reached the wire. Dropping the envelope signals failure.
    pub fn delivered(mut self) {
        if let Some(tx) = self.delivered.take() {
            let _ = tx.send(());
        }
    }
}

pub type Outbox = mpsc::UnboundedReceiver<Envelope>;

struct Inner {
    outbox: mpsc::UnboundedSender<Envelope>,
    /// Job the session is bound to. Held while handling inbound requests.
    bound: Mutex<Option<JobUuid>>,
    initial: Slot<InitialJobRequest>,
    payload: Slot<JobRequest>,
}

/// Cheap to clone; every clone talks to the same dispatcher connection.
#[derive(Clone)]
pub struct ProtocolSession {
    inner: Arc<Inner>,
}

impl ProtocolSession {
    /// A session plus the queue its outbound messages appear on.
    pub fn new() -> (Self, Outbox) {
        let (outbox, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            outbox,
            bound: Mutex::new(None),
            initial: Slot::new(),
            payload: Slot::new(),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub async fn job_uuid(&self) -> Option<JobUuid> {
        self.inner.bound.lock().await.clone()
    }

    /// Decode and dispatch one inbound text frame.
    ///
    /// Malformed frames are answered with a generic error; a well-formed frame of a type this
    /// session does not accept ends the session.
    pub async fn handle_text(&self, text: &str) -> Result<()> {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(error = %err, "received malformed message");
                self.send_deferred(ExecutorMessage::GenericError {
                    details: format!("Malformed message: {}", err),
                });
                return Ok(());
            }
        };
        let message_type = value
            .get("message_type")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        if !ACCEPTED_MESSAGE_TYPES.contains(&message_type.as_str()) {
            tracing::error!(message_type = %message_type, "unsupported message received");
            return Err(SessionError::UnsupportedMessage(message_type));
        }
        match serde_json::from_value::<DispatcherMessage>(value) {
            Ok(message) => {
                self.handle_message(message).await;
                Ok(())
            }
            Err(err) => {
                tracing::error!(message_type = %message_type, error = %err, "received invalid message");
                self.send_deferred(ExecutorMessage::GenericError {
                    details: format!("Invalid {}: {}", message_type, err),
                });
                Ok(())
            }
        }
    }

    pub async fn handle_message(&self, message: DispatcherMessage) {
        match message {
            DispatcherMessage::InitialJobRequest(request) => self.on_initial_request(request).await,
            DispatcherMessage::JobRequest(request) => self.on_job_payload(request).await,
            DispatcherMessage::GenericError { details } => {
                tracing::warn!(details = %details, "dispatcher reported an error");
            }
        }
    }

    async fn on_initial_request(&self, request: InitialJobRequest) {
        let mut bound = self.inner.bound.lock().await;
        if self.inner.initial.is_filled() {
            let details = format!(
                "Received duplicate initial job request: first job_uuid={:?} and then job_uuid={}",
                *bound, request.job_uuid
            );
            tracing::error!("{}", details);
            self.send_deferred(ExecutorMessage::GenericError { details });
            return;
        }
        tracing::debug!(job_uuid = %request.job_uuid, "received initial job request");
        *bound = Some(request.job_uuid.clone());
        if let Err(request) = self.inner.initial.fill(request) {
            tracing::warn!(job_uuid = %request.job_uuid, "session closed before the initial job request arrived");
        }
    }

    async fn on_job_payload(&self, request: JobRequest) {
        let bound = self.inner.bound.lock().await;
        let problem = match &*bound {
            None => Some(format!(
                "Received job request before an initial job request job_uuid={}",
                request.job_uuid
            )),
            Some(job_uuid) if *job_uuid != request.job_uuid => Some(format!(
                "Received job request for job_uuid={} while working on job_uuid={}",
                request.job_uuid, job_uuid
            )),
            Some(job_uuid) if self.inner.payload.is_filled() => Some(format!(
                "Received duplicate full job payload request: first job_uuid={} and then job_uuid={}",
                job_uuid, request.job_uuid
            )),
            Some(_) => None,
        };
        if let Some(details) = problem {
            tracing::error!("{}", details);
            self.send_deferred(ExecutorMessage::GenericError { details });
            return;
        }
        tracing::debug!(job_uuid = %request.job_uuid, "received full job payload");
        if let Err(request) = self.inner.payload.fill(request) {
            tracing::warn!(job_uuid = %request.job_uuid, "session closed before the job payload arrived");
        }
    }

    pub async fn initial_request(&self) -> Result<InitialJobRequest> {
        self.inner.initial.wait().await.ok_or(SessionError::Closed)
    }

    pub async fn job_payload(&self) -> Result<JobRequest> {
        self.inner.payload.wait().await.ok_or(SessionError::Closed)
    }

    /// The connection is gone: release anyone still waiting for a request.
    pub fn close(&self) {
        self.inner.initial.close();
        self.inner.payload.close();
    }

    pub async fn send_ready(&self) -> Result<()> {
        let job_uuid = self.job_uuid().await;
        self.send(ExecutorMessage::Ready { job_uuid }).await
    }

    /// Machine specs go out first, when there are any.
    pub async fn send_finished(&self, result: &JobResult) -> Result<()> {
        let job_uuid = self.job_uuid().await;
        if let Some(specs) = &result.specs {
            self.send(ExecutorMessage::MachineSpecs {
                job_uuid: job_uuid.clone(),
                specs: specs.clone(),
            })
            .await?;
        }
        self.send(ExecutorMessage::Finished {
            job_uuid,
            docker_process_stdout: result.stdout.clone(),
            docker_process_stderr: result.stderr.clone(),
        })
        .await
    }

    pub async fn send_failed(&self, result: &JobResult) -> Result<()> {
        let job_uuid = self.job_uuid().await;
        self.send(ExecutorMessage::Failed {
            job_uuid,
            docker_process_exit_status: result.exit_status,
            timeout: result.timeout,
            docker_process_stdout: result.stdout.clone(),
            docker_process_stderr: result.stderr.clone(),
        })
        .await
    }

    pub async fn send_failed_to_prepare(&self) -> Result<()> {
        let job_uuid = self.job_uuid().await;
        self.send(ExecutorMessage::FailedToPrepare { job_uuid }).await
    }

    pub async fn send_generic_error(&self, details: impl Into<String>) -> Result<()> {
        self.send(ExecutorMessage::GenericError {
            details: details.into(),
        })
        .await
    }

    /// Queue a message and wait until the transport has written it.
    async fn send(&self, message: ExecutorMessage) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        tracing::debug!(message_type = message.message_type(), "sending message");
        self.inner
            .outbox
            .send(Envelope {
                message,
                delivered: Some(tx),
            })
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Queue a message without waiting for it to be written.
    fn send_deferred(&self, message: ExecutorMessage) {
        let _ = self.inner.outbox.send(Envelope {
            message,
            delivered: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::job_id;
    use protocol::MachineSpecs;
    use serde_json::json;

    fn initial(job_uuid: &JobUuid) -> DispatcherMessage {
        DispatcherMessage::InitialJobRequest(InitialJobRequest {
            job_uuid: job_uuid.clone(),
            base_docker_image_name: None,
            timeout_seconds: 10,
            volume: None,
        })
    }

    fn payload(job_uuid: &JobUuid) -> DispatcherMessage {
        DispatcherMessage::JobRequest(JobRequest {
            job_uuid: job_uuid.clone(),
            docker_image_name: Some("backenddevelopersltd/app".into()),
            docker_run_cmd: vec![],
            docker_run_options_preset: "none".into(),
            raw_script: None,
            volume: None,
            output_upload: None,
        })
    }

    /// Drain whatever is queued right now, acknowledging each message.
    fn drain(outbox: &mut Outbox) -> Vec<ExecutorMessage> {
        let mut messages = Vec::new();
        while let Ok(envelope) = outbox.try_recv() {
            messages.push(envelope.message.clone());
            envelope.delivered();
        }
        messages
    }

    /// Acknowledge messages in the background so awaiting senders complete.
    fn spawn_transport(mut outbox: Outbox) -> tokio::task::JoinHandle<Vec<ExecutorMessage>> {
        tokio::spawn(async move {
            let mut messages = Vec::new();
            while let Some(envelope) = outbox.recv().await {
                messages.push(envelope.message.clone());
                envelope.delivered();
            }
            messages
        })
    }

    fn is_generic_error(message: &ExecutorMessage) -> bool {
        matches!(message, ExecutorMessage::GenericError { .. })
    }

    #[tokio::test]
    async fn duplicate_initial_requests_keep_the_first() {
        let (session, mut outbox) = ProtocolSession::new();
        let first = job_id();

        session.handle_message(initial(&first)).await;
        for _ in 0..3 {
            session.handle_message(initial(&job_id())).await;
        }

        let sent = drain(&mut outbox);
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(is_generic_error));
        assert_eq!(session.job_uuid().await, Some(first.clone()));
        assert_eq!(session.initial_request().await.unwrap().job_uuid, first);
    }

    #[tokio::test]
    async fn payload_before_initial_request_is_rejected() {
        let (session, mut outbox) = ProtocolSession::new();
        let job = job_id();

        session.handle_message(payload(&job)).await;

        let sent = drain(&mut outbox);
        assert_eq!(sent.len(), 1);
        assert!(is_generic_error(&sent[0]));
        assert!(!session.inner.payload.is_filled());

        // the proper sequence still works afterwards
        session.handle_message(initial(&job)).await;
        session.handle_message(payload(&job)).await;
        assert_eq!(session.job_payload().await.unwrap().job_uuid, job);
        assert!(drain(&mut outbox).is_empty());
    }

    #[tokio::test]
    async fn payload_for_another_job_is_rejected() {
        let (session, mut outbox) = ProtocolSession::new();
        session.handle_message(initial(&job_id())).await;

        session.handle_message(payload(&job_id())).await;

        assert!(!session.inner.payload.is_filled());
        assert!(is_generic_error(&drain(&mut outbox)[0]));
    }

    #[tokio::test]
    async fn duplicate_payload_is_rejected() {
        let (session, mut outbox) = ProtocolSession::new();
        let job = job_id();
        session.handle_message(initial(&job)).await;
        session.handle_message(payload(&job)).await;

        let DispatcherMessage::JobRequest(mut second) = payload(&job) else {
            unreachable!()
        };
        second.docker_run_cmd = vec!["other".into()];
        session
            .handle_message(DispatcherMessage::JobRequest(second))
            .await;

        assert_eq!(drain(&mut outbox).len(), 1);
        assert!(session.job_payload().await.unwrap().docker_run_cmd.is_empty());
    }

    #[tokio::test]
    async fn concurrent_initial_requests_fill_once() {
        let (session, mut outbox) = ProtocolSession::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move { session.handle_message(initial(&job_id())).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(drain(&mut outbox).len(), 7);
        let accepted = session.initial_request().await.unwrap().job_uuid;
        assert_eq!(session.job_uuid().await, Some(accepted));
    }

    #[tokio::test]
    async fn text_frames_are_validated() {
        let (session, mut outbox) = ProtocolSession::new();

        session.handle_text("{not json").await.expect("malformed is recoverable");
        assert!(is_generic_error(&drain(&mut outbox)[0]));

        let missing_fields = json!({"message_type": "V0InitialJobRequest"}).to_string();
        session.handle_text(&missing_fields).await.expect("invalid is recoverable");
        assert!(is_generic_error(&drain(&mut outbox)[0]));

        let unsupported = json!({"message_type": "V0JobFinishedReceiptRequest"}).to_string();
        assert!(matches!(
            session.handle_text(&unsupported).await,
            Err(SessionError::UnsupportedMessage(t)) if t == "V0JobFinishedReceiptRequest"
        ));

        let job = job_id();
        let valid = json!({
            "message_type": "V0InitialJobRequest",
            "job_uuid": job,
            "base_docker_image_name": "backenddevelopersltd/base",
            "timeout_seconds": 5,
        })
        .to_string();
        session.handle_text(&valid).await.expect("valid");
        assert_eq!(session.initial_request().await.unwrap().job_uuid, job);
    }

    #[tokio::test]
    async fn job_ids_are_opaque_tokens() {
        let (session, mut outbox) = ProtocolSession::new();
        let valid = json!({
            "message_type": "V0InitialJobRequest",
            "job_uuid": "job-42",
            "timeout_seconds": 5,
        })
        .to_string();

        session.handle_text(&valid).await.expect("valid");

        assert!(drain(&mut outbox).is_empty());
        assert_eq!(session.job_uuid().await, Some(JobUuid::from("job-42")));
        session.handle_message(payload(&JobUuid::from("job-42"))).await;
        assert_eq!(session.job_payload().await.unwrap().job_uuid.as_str(), "job-42");
        session.handle_message(payload(&JobUuid::from("job-43"))).await;
        assert!(is_generic_error(&drain(&mut outbox)[0]));
    }

    #[tokio::test]
    async fn closing_releases_waiters() {
        let (session, _outbox) = ProtocolSession::new();
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.initial_request().await })
        };
        tokio::task::yield_now().await;
        session.close();
        assert!(matches!(waiter.await.unwrap(), Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn finished_sends_specs_first() {
        let (session, outbox) = ProtocolSession::new();
        let transport = spawn_transport(outbox);
        let job = job_id();
        session.handle_message(initial(&job)).await;

        let result = JobResult {
            success: true,
            exit_status: Some(0),
            timeout: false,
            stdout: "done".into(),
            stderr: String::new(),
            specs: Some(MachineSpecs {
                specs: json!({"gpu": {"count": 0}}),
            }),
        };
        session.send_ready().await.unwrap();
        session.send_finished(&result).await.unwrap();
        drop(session);

        let sent = transport.await.unwrap();
        let types: Vec<_> = sent.iter().map(|m| m.message_type()).collect();
        assert_eq!(types, vec!["V0ReadyRequest", "V0MachineSpecsRequest", "V0FinishedRequest"]);
        assert!(matches!(&sent[0], ExecutorMessage::Ready { job_uuid } if *job_uuid == Some(job)));
    }

    #[tokio::test]
    async fn send_fails_once_transport_is_gone() {
        let (session, outbox) = ProtocolSession::new();
        drop(outbox);
        assert!(matches!(session.send_failed_to_prepare().await, Err(SessionError::Closed)));
    }
}
