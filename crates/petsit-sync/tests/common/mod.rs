//! Shared harness: in-process REST and push collaborators.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures::{SinkExt, StreamExt};
use petsit_sync::client::RetryPolicy;
use petsit_sync::{
    ApiClient, Clock, ManualClock, ReconciliationEngine, ServiceContext, SqliteStore, StaticToken,
    SyncConfig,
};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("petsit_sync=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Serve `router` on an ephemeral port and return its base URL.
pub async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Engine, client and clock for `user_id` against `base_url`
pub fn context(base_url: &str, user_id: &str) -> ServiceContext {
    init_tracing();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_at(1_000));
    let engine = Arc::new(ReconciliationEngine::new(
        Arc::new(SqliteStore::open_in_memory().unwrap()),
        Arc::clone(&clock),
    ));
    let client = ApiClient::new(
        &SyncConfig::new(base_url),
        Arc::new(StaticToken::new("test-token")),
    )
    .unwrap()
    .with_retry_policy(RetryPolicy::no_retry());
    ServiceContext::new(engine, Arc::new(client), clock, user_id)
}

/// One accepted push connection
pub struct PushPeer {
    pub authorization: Option<String>,
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl PushPeer {
    /// Next text frame sent by the client, parsed as JSON
    pub async fn recv_json(&mut self) -> Value {
        let text = tokio::time::timeout(WAIT, self.inbound.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("client connection closed");
        serde_json::from_str(&text).unwrap()
    }

    pub fn send_json(&self, value: &Value) {
        self.outbound
            .send(Message::text(value.to_string()))
            .unwrap();
    }

    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }
}

/// WebSocket push server accepting any number of connections
pub struct PushServer {
    pub url: String,
    peers: mpsc::UnboundedReceiver<PushPeer>,
}

impl PushServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/app", listener.local_addr().unwrap());
        let (peers_tx, peers) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let mut authorization = None;
                let capture = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                    authorization = request
                        .headers()
                        .get("authorization")
                        .and_then(|value| value.to_str().ok())
                        .map(ToString::to_string);
                    Ok(response)
                };
                let accepted = tokio_tungstenite::accept_hdr_async(stream, capture).await;
                let Ok(socket) = accepted else {
                    continue;
                };
                let (mut sink, mut stream) = socket.split();

                let (inbound_tx, inbound) = mpsc::unbounded_channel();
                tokio::spawn(async move {
                    while let Some(Ok(message)) = stream.next().await {
                        if let Message::Text(text) = message {
                            let _ = inbound_tx.send(text.as_str().to_string());
                        }
                    }
                });

                let (outbound, mut queue) = mpsc::unbounded_channel::<Message>();
                tokio::spawn(async move {
                    while let Some(message) = queue.recv().await {
                        let closing = matches!(message, Message::Close(_));
                        if sink.send(message).await.is_err() || closing {
                            break;
                        }
                    }
                });

                let peer = PushPeer {
                    authorization,
                    inbound,
                    outbound,
                };
                if peers_tx.send(peer).is_err() {
                    break;
                }
            }
        });

        Self { url, peers }
    }

    pub async fn next_peer(&mut self) -> PushPeer {
        tokio::time::timeout(WAIT, self.peers.recv())
            .await
            .expect("timed out waiting for push connection")
            .expect("push server stopped")
    }
}
