//! The receive loop: sole reader of the inbound half of the socket.

use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, trace, warn};
use verdict_core::VerdictError;

use crate::correlator::Correlator;
use crate::protocol::{self, AuthResponse, ServerMessage};

pub type AuthReply = Result<AuthResponse, VerdictError>;

/// Read frames until the socket ends.
///
/// The first text frame is the handshake result and goes to `auth`; every
/// later frame is routed through `correlator`. Frames are handled one at a
/// time in arrival order. When the stream ends every pending request fails
/// with `ConnectionClosed`.
pub async fn run<S>(mut source: S, correlator: Arc<Correlator>, auth: oneshot::Sender<AuthReply>)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let mut auth = Some(auth);

    while let Some(frame) = source.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(frame)) => {
                debug!(?frame, "server closed connection");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                trace!("control frame");
                continue;
            }
            Ok(Message::Binary(_) | Message::Frame(_)) => {
                trace!("ignoring non-text frame");
                continue;
            }
            Err(e) => {
                debug!(%e, "read failed");
                break;
            }
        };

        if let Some(tx) = auth.take() {
            let _ = tx.send(protocol::decode_auth(&text));
            continue;
        }
        dispatch(&correlator, &text);
    }

    correlator.fail_all(|| VerdictError::ConnectionClosed);
    debug!("receive loop ended");
}

fn dispatch(correlator: &Correlator, text: &str) {
    match protocol::decode(text) {
        Ok(ServerMessage::VerdictResponse(resp)) => {
            trace!(guid = %resp.guid, verdict = %resp.verdict, "verdict response");
            correlator.resolve(resp);
        }
        Err(e) => warn!(%e, "dropping undecodable frame"),
    }
}
