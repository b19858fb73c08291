mod actor;
mod messages;

use crate::events::ProcessStatus;
use crate::types::OutputBlob;
use actor::Actor;
use messages::WorkerMessage;
use std::{io, process::Stdio};
use thiserror::Error;
use tokio::{
    process,
    sync::{mpsc, oneshot},
};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("process already stopped")]
    AlreadyStopped,
    #[error("worker exited")]
    Gone,
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Everything a finished process produced.
#[derive(Clone, Debug)]
pub struct Collected {
    pub status: ProcessStatus,
    pub stdout: OutputBlob,
    pub stderr: OutputBlob,
}

/// Supervises one child process: collects its output and kills it on request.
///
/// This struct is an actor handle. Dropping every clone of it kills the child if it is still running.
#[derive(Clone)]
pub struct WorkerHandle {
    sender: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerHandle {
    pub fn spawn(mut command: process::Command) -> io::Result<Self> {
        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let (sender, inbox) = mpsc::unbounded_channel();
        Actor::spawn(inbox, child);
        Ok(Self { sender })
    }

    /// Kill the process. Its output so far stays available through `wait`.
    pub async fn stop(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WorkerMessage::Stop { response: tx })
            .map_err(|_| WorkerError::Gone)?;
        rx.await.map_err(|_| WorkerError::Gone)?
    }

    /// Resolves once the process has exited and its pipes are drained.
    pub async fn wait(&self) -> Result<Collected> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WorkerMessage::Wait { response: tx })
            .map_err(|_| WorkerError::Gone)?;
        rx.await.map_err(|_| WorkerError::Gone)
    }
}
