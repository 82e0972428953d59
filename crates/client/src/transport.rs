//! WebSocket transport to the verdict service.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use verdict_core::VerdictError;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type FrameSink = SplitSink<WsStream, Message>;
pub type FrameSource = SplitStream<WsStream>;

/// Upper bound on the close handshake; the peer may already be gone.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Open a WebSocket connection and split it into its write and read halves.
///
/// # Errors
///
/// `Timeout` if the handshake does not finish within `timeout`, `Transport`
/// if the endpoint cannot be reached or refuses the upgrade.
pub async fn connect(url: &str, timeout: Duration) -> Result<(FrameSink, FrameSource), VerdictError> {
    debug!(url, "opening websocket");
    let (stream, response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| VerdictError::Timeout)?
        .map_err(VerdictError::transport)?;
    trace!(status = %response.status(), "websocket upgraded");
    Ok(stream.split())
}

/// Serialized write half. Callers queue on the lock for the duration of one frame.
pub struct FrameWriter {
    sink: Mutex<Option<FrameSink>>,
}

impl FrameWriter {
    #[must_use]
    pub fn new(sink: FrameSink) -> Self {
        Self {
            sink: Mutex::new(Some(sink)),
        }
    }

    /// Send one text frame.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` once the writer is closed or the socket is gone.
    pub async fn send_text(&self, text: String) -> Result<(), VerdictError> {
        self.send(Message::Text(text)).await
    }

    pub async fn ping(&self) -> Result<(), VerdictError> {
        self.send(Message::Ping(Vec::new())).await
    }

    async fn send(&self, msg: Message) -> Result<(), VerdictError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(VerdictError::ConnectionClosed)?;
        sink.send(msg).await.map_err(map_send_error)
    }

    /// Send a close frame and drop the write half. Idempotent.
    pub async fn close(&self) {
        let Some(mut sink) = self.sink.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
            Ok(Ok(())) => trace!("websocket closed"),
            Ok(Err(e)) => debug!(%e, "websocket close failed"),
            Err(_) => debug!("websocket close timed out"),
        }
    }
}

fn map_send_error(e: tungstenite::Error) -> VerdictError {
    match e {
        tungstenite::Error::ConnectionClosed
        | tungstenite::Error::AlreadyClosed
        | tungstenite::Error::Io(_) => VerdictError::ConnectionClosed,
        other => VerdictError::transport(other),
    }
}
