//! Test doubles shared by the unit tests.

use crate::events::ProcessOutcome;
use crate::runtime::{self, ContainerRuntime, RunSpec};
use crate::upload::{OutputUploader, UploadError};
use async_trait::async_trait;
use protocol::{JobUuid, OutputUpload};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wiremock::{MockServer, Request, Respond, ResponseTemplate};

pub fn job_id() -> JobUuid {
    JobUuid::new(uuid::Uuid::new_v4().to_string())
}

/// Honors `Range: bytes=N-` with a 206, otherwise sends the whole body.
pub struct RangedBody(pub Vec<u8>);

impl Respond for RangedBody {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let offset = range_of(request)
            .as_deref()
            .and_then(|range| range.strip_prefix("bytes="))
            .and_then(|range| range.trim_end_matches('-').parse::<usize>().ok());
        match offset {
            Some(offset) => ResponseTemplate::new(206)
                .insert_header(
                    "content-range",
                    format!("bytes {}-{}/{}", offset, self.0.len() - 1, self.0.len()),
                )
                .set_body_bytes(self.0[offset..].to_vec()),
            None => ResponseTemplate::new(200).set_body_bytes(self.0.clone()),
        }
    }
}

pub fn range_of(request: &Request) -> Option<String> {
    request
        .headers
        .get("range")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Accepts the request and never answers.
pub fn hang() -> ResponseTemplate {
    ResponseTemplate::new(200).set_delay(Duration::from_secs(3600))
}

/// Requests `server` has seen so far.
pub async fn received(server: &MockServer) -> Vec<Request> {
    server.received_requests().await.unwrap_or_default()
}

pub async fn wait_for_requests(server: &MockServer, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while received(server).await.len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("requests never arrived");
}

/// A response that ends the connection before the body is complete.
#[derive(Clone, Debug)]
pub enum Cut {
    /// Declares `declared` bytes, sends `body`, then hangs up.
    Truncated { body: Vec<u8>, declared: usize },
    /// No Content-Length, the body ends when the connection closes.
    Unsized(Vec<u8>),
}

/// Cuts the first connections short and forwards every later one to `upstream`.
pub struct FlakyFront {
    addr: SocketAddr,
    cut: Arc<AtomicUsize>,
}

impl FlakyFront {
    pub async fn start(cuts: Vec<Cut>, upstream: Option<SocketAddr>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let cut = Arc::new(AtomicUsize::new(0));
        let served = cut.clone();
        tokio::spawn(async move {
            let mut cuts = VecDeque::from(cuts);
            while let Ok((stream, _)) = listener.accept().await {
                match (cuts.pop_front(), upstream) {
                    (Some(reply), _) => {
                        served.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(cut_short(stream, reply));
                    }
                    (None, Some(upstream)) => {
                        tokio::spawn(forward(stream, upstream));
                    }
                    (None, None) => drop(stream),
                }
            }
        });
        Self { addr, cut }
    }

    pub fn url(&self) -> String {
        format!("http://{}/file", self.addr)
    }

    /// Connections answered with a cut response.
    pub fn cut_count(&self) -> usize {
        self.cut.load(Ordering::SeqCst)
    }
}

async fn cut_short(mut stream: TcpStream, reply: Cut) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    let (headers, body) = match reply {
        Cut::Truncated { body, declared } => (format!("Content-Length: {}\r\n", declared), body),
        Cut::Unsized(body) => (String::new(), body),
    };
    let response_head = format!("HTTP/1.1 200 OK\r\nConnection: close\r\n{}\r\n", headers);
    let _ = stream.write_all(response_head.as_bytes()).await;
    let _ = stream.write_all(&body).await;
    let _ = stream.flush().await;
    let _ = stream.shutdown().await;
}

async fn forward(mut stream: TcpStream, upstream: SocketAddr) {
    if let Ok(mut upstream) = TcpStream::connect(upstream).await {
        let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
    }
}

/// Container runtime that records what it was asked to do and never starts a container.
#[derive(Default)]
pub struct FakeRuntime {
    pub pulled: Mutex<Vec<String>>,
    pub runs: Mutex<Vec<RunSpec>>,
    pub wiped: Mutex<Vec<PathBuf>>,
    pub fail_pull: bool,
    /// Outcomes handed out in order, `Err` text becomes a failed launch. The default is a clean exit.
    pub outcomes: Mutex<VecDeque<Result<ProcessOutcome, String>>>,
    /// Files written into the output mount when a job runs, relative to it.
    pub writes_output: Vec<(String, String)>,
}

impl FakeRuntime {
    pub fn with_outcome(outcome: ProcessOutcome) -> Self {
        Self::default().then(outcome)
    }

    pub fn then(self, outcome: ProcessOutcome) -> Self {
        self.outcomes.lock().unwrap().push_back(Ok(outcome));
        self
    }

    pub fn then_fail(self, reason: &str) -> Self {
        self.outcomes.lock().unwrap().push_back(Err(reason.to_string()));
        self
    }

    pub fn runs(&self) -> Vec<RunSpec> {
        self.runs.lock().unwrap().clone()
    }
}

pub fn exited(code: i32, stdout: &str) -> ProcessOutcome {
    ProcessOutcome {
        exit_status: Some(code),
        timed_out: false,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull(&self, image: &str) -> runtime::Result<()> {
        self.pulled.lock().unwrap().push(image.to_string());
        if self.fail_pull {
            return Err(runtime::RuntimeError::CommandFailed {
                command: format!("docker pull {}", image),
                status: Some(1),
                stdout: String::new(),
                stderr: "manifest unknown".to_string(),
            });
        }
        Ok(())
    }

    async fn run(&self, spec: &RunSpec, _deadline: Duration) -> runtime::Result<ProcessOutcome> {
        self.runs.lock().unwrap().push(spec.clone());
        if let Some(output) = spec.mounts.iter().find(|m| m.container == runtime::OUTPUT_MOUNT) {
            for (name, contents) in &self.writes_output {
                std::fs::write(output.host.join(name), contents)?;
            }
        }
        match self.outcomes.lock().unwrap().pop_front() {
            None => Ok(exited(0, "")),
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(reason)) => Err(runtime::RuntimeError::CommandFailed {
                command: format!("docker {}", spec.to_args().join(" ")),
                status: Some(125),
                stdout: String::new(),
                stderr: reason,
            }),
        }
    }

    async fn remove(&self, _name: &str) -> runtime::Result<()> {
        Ok(())
    }

    async fn wipe_directory(&self, dir: &Path) -> runtime::Result<()> {
        self.wiped.lock().unwrap().push(dir.to_path_buf());
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                std::fs::remove_dir_all(path)?;
            } else {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

/// Uploader that records the descriptor and optionally fails.
#[derive(Default)]
pub struct FakeUploader {
    pub uploads: Mutex<Vec<(OutputUpload, PathBuf)>>,
    pub failure: Option<String>,
}

#[async_trait]
impl OutputUploader for FakeUploader {
    async fn upload(&self, upload: &OutputUpload, output_dir: &Path) -> Result<(), UploadError> {
        self.uploads
            .lock()
            .unwrap()
            .push((upload.clone(), output_dir.to_path_buf()));
        match &self.failure {
            Some(reason) => Err(UploadError::Rejected(reason.clone())),
            None => Ok(()),
        }
    }
}
