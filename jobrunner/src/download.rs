//! Resumable, size-capped HTTP downloads with a global concurrency limit.

use crate::config::DownloadConfig;
use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use reqwest::{header, StatusCode};
use std::io::{self, SeekFrom};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Input volume too large")]
    TooLarge { limit: u64 },
    #[error("downloading {url} failed: {source}")]
    Http { url: String, source: reqwest::Error },
    #[error("downloading {url} failed with HTTP status {status}")]
    Status { url: String, status: StatusCode },
    #[error("writing downloaded data failed: {0}")]
    Sink(#[source] io::Error),
    #[error("downloader is shut down")]
    Closed,
}

impl DownloadError {
    fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Http { .. } => true,
            DownloadError::Status { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;

/// Destination of a download that can be rewound when a resume is refused.
#[async_trait]
pub trait DownloadSink: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Discard everything written so far.
    async fn reset(&mut self) -> io::Result<()>;

    async fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl DownloadSink for tokio::fs::File {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.write_all(chunk).await
    }

    async fn reset(&mut self) -> io::Result<()> {
        self.seek(SeekFrom::Start(0)).await?;
        self.set_len(0).await
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.flush().await
    }
}

#[async_trait]
impl DownloadSink for Vec<u8> {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.extend_from_slice(chunk);
        Ok(())
    }

    async fn reset(&mut self) -> io::Result<()> {
        self.clear();
        Ok(())
    }
}

enum AttemptError {
    /// The server refused to resume, start over from byte zero.
    Restart,
    Failed(DownloadError),
}

impl From<DownloadError> for AttemptError {
    fn from(err: DownloadError) -> Self {
        AttemptError::Failed(err)
    }
}

pub struct Downloader {
    client: reqwest::Client,
    semaphore: Semaphore,
    config: DownloadConfig,
}

impl Downloader {
    pub fn new(config: DownloadConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            semaphore: Semaphore::new(config.concurrency.max(1)),
            config,
        }
    }

    /// Stream `url` into `sink`, resuming after transient failures. Returns the byte count.
    pub async fn download<S>(&self, url: &str, sink: &mut S) -> Result<u64>
    where
        S: DownloadSink + ?Sized,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| DownloadError::Closed)?;
        let mut received = 0u64;
        let mut failures = 0u32;
        loop {
            match self.attempt(url, sink, &mut received).await {
                Ok(()) => {
                    sink.finish().await.map_err(DownloadError::Sink)?;
                    tracing::debug!(url, bytes = received, "download complete");
                    return Ok(received);
                }
                Err(AttemptError::Restart) => {
                    tracing::debug!(url, offset = received, "server cannot resume, restarting download");
                    sink.reset().await.map_err(DownloadError::Sink)?;
                    received = 0;
                }
                Err(AttemptError::Failed(err)) if err.is_retryable() => {
                    failures += 1;
                    if failures >= self.config.max_attempts {
                        tracing::warn!(url, attempts = failures, error = %err, "giving up on download");
                        return Err(err);
                    }
                    let delay = self.backoff(failures);
                    tracing::info!(url, offset = received, ?delay, error = %err, "download interrupted, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(AttemptError::Failed(err)) => return Err(err),
            }
        }
    }

    /// base * 2^(n-1), plus up to 10% jitter.
    fn backoff(&self, failures: u32) -> Duration {
        let exp = self.config.backoff_base * 2u32.saturating_pow(failures.saturating_sub(1));
        let jitter: f64 = rand::thread_rng().gen_range(0.0..=0.1);
        exp.mul_f64(1.0 + jitter)
    }

    fn exceeds_limit(&self, size: u64) -> bool {
        self.config.max_size_bytes > 0 && size > self.config.max_size_bytes
    }

    async fn attempt<S>(
        &self,
        url: &str,
        sink: &mut S,
        received: &mut u64,
    ) -> std::result::Result<(), AttemptError>
    where
        S: DownloadSink + ?Sized,
    {
        let http_err = |source| DownloadError::Http {
            url: url.to_string(),
            source,
        };
        let mut request = self.client.get(url);
        if *received > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", received));
        }
        let response = request.send().await.map_err(http_err)?;
        let status = response.status();

        if *received > 0 {
            match status {
                StatusCode::PARTIAL_CONTENT => {}
                StatusCode::RANGE_NOT_SATISFIABLE => return Err(AttemptError::Restart),
                StatusCode::OK => {
                    // full body instead of a range: rewind and take it from the top
                    sink.reset().await.map_err(DownloadError::Sink)?;
                    *received = 0;
                }
                _ if status.is_success() => return Err(AttemptError::Restart),
                _ => {}
            }
        }
        if !status.is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status,
            }
            .into());
        }
        if *received == 0 {
            if let Some(declared) = response.content_length() {
                if self.exceeds_limit(declared) {
                    return Err(DownloadError::TooLarge {
                        limit: self.config.max_size_bytes,
                    }
                    .into());
                }
            }
        }

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(http_err)?;
            *received += chunk.len() as u64;
            if self.exceeds_limit(*received) {
                return Err(DownloadError::TooLarge {
                    limit: self.config.max_size_bytes,
                }
                .into());
            }
            sink.write_chunk(&chunk).await.map_err(DownloadError::Sink)?;
        }
        Ok(())
    }
}
