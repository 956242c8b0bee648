//! Live WebSocket push connection

use std::sync::Arc;

use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use super::frame::{decode, subscribe_frame, Frame};
use super::Shared;
use crate::error::ConnectionError;

type PushStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Reader and writer tasks of one live connection
pub(super) struct LiveConnection {
    pub(super) id: u64,
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl LiveConnection {
    pub(super) fn is_open(&self) -> bool {
        !self.reader.is_finished() && !self.writer.is_finished()
    }

    pub(super) fn send_subscribe(&self, channel: &str) {
        if self.outbound.send(Message::text(subscribe_frame(channel))).is_err() {
            tracing::debug!(%channel, "Push writer closed before subscribe");
        }
    }

    pub(super) fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }

    pub(super) fn abort_writer(&self) {
        self.writer.abort();
    }
}

/// Open the socket and start its tasks. The reader waits for the returned
/// sender before delivering anything, so the caller can register the
/// connection first.
pub(super) async fn open(
    shared: &Arc<Shared>,
    id: u64,
    push_url: &str,
    auth_token: Option<&str>,
) -> Result<(LiveConnection, oneshot::Sender<()>), ConnectionError> {
    let url = Url::parse(push_url).map_err(|error| ConnectionError::InvalidUrl(error.to_string()))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(ConnectionError::InvalidUrl(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|error| ConnectionError::InvalidUrl(error.to_string()))?;
    if let Some(token) = auth_token.map(str::trim).filter(|token| !token.is_empty()) {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|error| ConnectionError::Handshake(format!("invalid auth token: {error}")))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (socket, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|error| ConnectionError::Handshake(error.to_string()))?;
    let (mut sink, stream) = socket.split();

    let (outbound, mut queue) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = queue.recv().await {
            if let Err(error) = sink.send(message).await {
                tracing::debug!(%error, "Push writer stopped");
                break;
            }
        }
    });

    for channel in shared.channel_names() {
        let _ = outbound.send(Message::text(subscribe_frame(&channel)));
    }

    let (ready_tx, ready_rx) = oneshot::channel();
    let reader = tokio::spawn(read_loop(Arc::clone(shared), stream, id, ready_rx));

    Ok((
        LiveConnection {
            id,
            outbound,
            reader,
            writer,
        },
        ready_tx,
    ))
}

async fn read_loop(shared: Arc<Shared>, mut stream: PushStream, id: u64, ready: oneshot::Receiver<()>) {
    if ready.await.is_err() {
        return;
    }

    let reason = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match decode(text.as_str()) {
                Some(Frame::Event(event)) => shared.dispatch(event),
                Some(Frame::Control(name)) => tracing::debug!(event = %name, "Push control frame"),
                None => tracing::debug!("Ignored non-event push frame"),
            },
            Some(Ok(Message::Close(frame))) => {
                break frame.map_or_else(
                    || "closed by server".to_string(),
                    |frame| format!("closed by server: {}", frame.reason.as_str()),
                );
            }
            Some(Ok(_)) => {}
            Some(Err(error)) => break error.to_string(),
            None => break "stream ended".to_string(),
        }
    };

    shared.on_live_closed(id, &reason);
}
