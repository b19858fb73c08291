//! Websocket plumbing between a [`ProtocolSession`] and the dispatcher.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use jobrunner::{Outbox, ProtocolSession, SessionError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, WebSocketStream};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Reader and writer tasks for one dispatcher connection.
pub struct Transport {
    stop_reading: oneshot::Sender<()>,
    reader: JoinHandle<Result<()>>,
    writer: JoinHandle<Result<()>>,
}

impl Transport {
    pub async fn connect(url: &str, session: ProtocolSession, outbox: Outbox) -> Result<Self> {
        let (stream, _) = connect_async(url).await?;
        Ok(Self::spawn(stream, session, outbox))
    }

    pub fn spawn<S>(stream: WebSocketStream<S>, session: ProtocolSession, outbox: Outbox) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = stream.split();
        let (stop_reading, stop) = oneshot::channel();
        Self {
            stop_reading,
            reader: tokio::spawn(read_loop(stream, session, stop)),
            writer: tokio::spawn(write_loop(sink, outbox)),
        }
    }

    /// Stop reading, flush what is queued and close the connection.
    ///
    /// The writer only finishes once every session handle is gone.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.stop_reading.send(());
        let read = self.reader.await?;
        self.writer.await??;
        read
    }
}

async fn write_loop<S>(mut sink: SplitSink<WebSocketStream<S>, Message>, mut outbox: Outbox) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(envelope) = outbox.recv().await {
        let text = serde_json::to_string(&envelope.message)?;
        sink.send(Message::Text(text)).await?;
        envelope.delivered();
    }
    sink.close().await?;
    Ok(())
}

async fn read_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    session: ProtocolSession,
    mut stop: oneshot::Receiver<()>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = loop {
        let next = tokio::select! {
            _ = &mut stop => break Ok(()),
            next = stream.next() => next,
        };
        let frame = match next {
            None => break Ok(()),
            Some(Err(err)) => {
                tracing::warn!(error = %err, "websocket receive error");
                break Err(err.into());
            }
            Some(Ok(frame)) => frame,
        };
        match frame {
            Message::Text(text) => {
                if let Err(err) = session.handle_text(&text).await {
                    break Err(err.into());
                }
            }
            Message::Close(_) => {
                tracing::info!("dispatcher closed the connection");
                break Ok(());
            }
            Message::Binary(_) => tracing::warn!("ignoring binary frame"),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    };
    session.close();
    result
}
