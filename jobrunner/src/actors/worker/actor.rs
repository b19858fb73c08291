use super::messages::WorkerMessage;
use super::{Collected, WorkerError};
use crate::events::{Output, ProcessStatus};
use crate::types::OutputBlob;

use bytes::BytesMut;
use futures::future::FutureExt;
use std::os::unix::process::ExitStatusExt;
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Child,
    select,
    sync::{mpsc, oneshot},
    time::Instant,
};

/// How long to keep reading pipes after the child exits. Grandchildren may hold them open.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

pub struct Actor {
    inbox: mpsc::UnboundedReceiver<WorkerMessage>,
    kill_tx: Option<oneshot::Sender<()>>,
    status: ProcessStatus,
    stdout: BytesMut,
    stderr: BytesMut,
    waiters: Vec<oneshot::Sender<Collected>>,
}

impl Actor {
    pub fn spawn(inbox: mpsc::UnboundedReceiver<WorkerMessage>, child: Child) {
        tokio::spawn(async move {
            let actor = Self {
                inbox,
                kill_tx: None,
                status: ProcessStatus::Running,
                stdout: BytesMut::new(),
                stderr: BytesMut::new(),
                waiters: Vec::new(),
            };
            actor.run(child).await;
        });
    }

    async fn run(mut self, mut child: Child) {
        let (kill_tx, kill_rx) = oneshot::channel();
        self.kill_tx = Some(kill_tx);
        let (child_exit_tx, child_exit_rx) = oneshot::channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let maybe_stdout = child.stdout.take();
        let maybe_stderr = child.stderr.take();
        let mut kill_rx = kill_rx.fuse();

        tokio::spawn(async move {
            loop {
                select! {
                    _ = &mut kill_rx => {
                        let _ = child.start_kill();
                    }
                    exit_status = child.wait() => {
                        let status = match exit_status {
                            Ok(exit_status) => match (exit_status.code(), exit_status.signal()) {
                                (Some(code), _) => ProcessStatus::Exited { code },
                                (None, Some(signal)) => ProcessStatus::Killed { signal },
                                (None, None) => ProcessStatus::Unknown,
                            },
                            Err(err) => {
                                tracing::error!(error = %err, "waiting on child process failed");
                                ProcessStatus::Unknown
                            }
                        };
                        let _ = child_exit_tx.send(status);
                        break;
                    }
                }
            }
        });

        if let Some(stdout) = maybe_stdout {
            pipe(stdout, output_tx.clone(), Output::Stdout);
        }
        if let Some(stderr) = maybe_stderr {
            pipe(stderr, output_tx, Output::Stderr);
        }
        self.handle_messages(child_exit_rx, output_rx).await;
    }

    async fn handle_messages(
        &mut self,
        child_exit_rx: oneshot::Receiver<ProcessStatus>,
        mut output_rx: mpsc::UnboundedReceiver<Output>,
    ) {
        use WorkerMessage::*;
        let mut child_exit_rx = child_exit_rx.fuse();
        let mut output_open = true;
        let mut drain_deadline: Option<Instant> = None;
        loop {
            if self.status != ProcessStatus::Running && !output_open {
                let collected = self.collected();
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(collected.clone());
                }
            }
            select! {
                maybe_msg = self.inbox.recv() => {
                    match maybe_msg {
                        Some(Stop { response }) => {
                            match (self.status, self.kill_tx.take()) {
                                (ProcessStatus::Running, Some(kill_tx)) => {
                                    let _ = kill_tx.send(());
                                    let _ = response.send(Ok(()));
                                }
                                _ => {
                                    let _ = response.send(Err(WorkerError::AlreadyStopped));
                                }
                            }
                        }
                        Some(Wait { response }) => self.waiters.push(response),
                        None => {
                            // every handle dropped: make sure the child does not outlive us
                            if let Some(kill_tx) = self.kill_tx.take() {
                                let _ = kill_tx.send(());
                            }
                            return;
                        }
                    }
                }
                maybe_output = output_rx.recv(), if output_open => {
                    match maybe_output {
                        Some(Output::Stdout(blob)) => self.stdout.extend_from_slice(&blob),
                        Some(Output::Stderr(blob)) => self.stderr.extend_from_slice(&blob),
                        None => output_open = false,
                    }
                }
                status = &mut child_exit_rx => {
                    self.status = status.unwrap_or(ProcessStatus::Unknown);
                    drain_deadline = Some(Instant::now() + DRAIN_GRACE);
                }
                _ = tokio::time::sleep_until(drain_deadline.unwrap_or_else(Instant::now)),
                    if drain_deadline.is_some() && output_open => {
                    tracing::warn!("child exited but its pipes stayed open, dropping the rest of its output");
                    output_open = false;
                }
            }
        }
    }

    fn collected(&self) -> Collected {
        Collected {
            status: self.status,
            stdout: OutputBlob::copy_from_slice(&self.stdout),
            stderr: OutputBlob::copy_from_slice(&self.stderr),
        }
    }
}

/// Forward everything read from `reader` to the actor until EOF.
fn pipe<R>(mut reader: R, output_tx: mpsc::UnboundedSender<Output>, wrap: fn(OutputBlob) -> Output)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            match reader.read_buf(&mut buf).await {
                Ok(n) if n > 0 => {
                    // move the bytes out of buf and into a message
                    let _ = output_tx.send(wrap(buf.split().freeze()));
                }
                _ => break,
            }
        }
    });
}
