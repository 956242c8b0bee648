//! Polling fallback

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::time::MissedTickBehavior;

use super::frame::ChannelEvent;
use super::{Shared, TransportState};
use crate::client::ApiClient;
use crate::error::ClientError;
use crate::sync::Diagnostic;
use crate::util::key_text;

/// "Fetch latest" function polled while live push is unavailable
pub trait PollSource: Send + Sync {
    fn fetch_latest(&self) -> BoxFuture<'_, Result<Vec<ChannelEvent>, ClientError>>;
}

impl<F> PollSource for F
where
    F: Fn() -> BoxFuture<'static, Result<Vec<ChannelEvent>, ClientError>> + Send + Sync,
{
    fn fetch_latest(&self) -> BoxFuture<'_, Result<Vec<ChannelEvent>, ClientError>> {
        self()
    }
}

/// Polls `GET /api/sync/latest?since=<cursor>`.
///
/// The response carries `events: [{event, channel?, data}]` and an optional
/// `cursor` passed back on the next call.
pub struct ApiPollSource {
    client: Arc<ApiClient>,
    cursor: Mutex<Option<String>>,
}

impl ApiPollSource {
    pub const PATH: &'static str = "/api/sync/latest";

    pub const fn new(client: Arc<ApiClient>) -> Self {
        Self {
            client,
            cursor: Mutex::new(None),
        }
    }

    fn cursor(&self) -> Option<String> {
        self.cursor.lock().ok().and_then(|cursor| cursor.clone())
    }

    async fn fetch(&self) -> Result<Vec<ChannelEvent>, ClientError> {
        let query: Vec<(&str, String)> = self
            .cursor()
            .map(|cursor| vec![("since", cursor)])
            .unwrap_or_default();
        let body = self.client.get(Self::PATH, &query).await?;

        if let Some(cursor) = body.get("cursor").and_then(key_text) {
            if let Ok(mut current) = self.cursor.lock() {
                *current = Some(cursor);
            }
        }

        let events = body
            .get("events")
            .and_then(Value::as_array)
            .map(|events| events.iter().filter_map(parse_polled_event).collect())
            .unwrap_or_default();
        Ok(events)
    }
}

impl PollSource for ApiPollSource {
    fn fetch_latest(&self) -> BoxFuture<'_, Result<Vec<ChannelEvent>, ClientError>> {
        Box::pin(self.fetch())
    }
}

fn parse_polled_event(value: &Value) -> Option<ChannelEvent> {
    let event = value.get("event")?.as_str()?.trim();
    if event.is_empty() {
        return None;
    }
    let channel = value
        .get("channel")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|channel| !channel.is_empty())
        .unwrap_or(event);
    let data = value.get("data").cloned().unwrap_or(Value::Null);
    Some(ChannelEvent::new(channel, event, data))
}

/// Poll until stopped or until `max_poll_failures` consecutive failures.
pub(super) async fn run(shared: Arc<Shared>, source: Arc<dyn PollSource>, announce_recovery: bool) {
    let mut ticker = tokio::time::interval(shared.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures: u32 = 0;
    let mut recovery_pending = announce_recovery;

    loop {
        ticker.tick().await;
        match source.fetch_latest().await {
            Ok(events) => {
                if recovery_pending {
                    recovery_pending = false;
                    tracing::info!("Polling recovered");
                    shared.diagnostics.publish(Diagnostic::TransportRecovered);
                }
                failures = 0;
                tracing::trace!(count = events.len(), "Poll fetched events");
                for event in events {
                    shared.dispatch(event);
                }
            }
            Err(error) => {
                failures += 1;
                tracing::warn!(attempt = failures, %error, "Poll fetch failed");
                if failures >= shared.max_poll_failures {
                    shared.set_state(TransportState::Degraded {
                        consecutive_failures: failures,
                    });
                    shared.diagnostics.publish(Diagnostic::TransportDegraded {
                        consecutive_failures: failures,
                        last_error: error.to_string(),
                    });
                    tracing::warn!(failures, "Polling paused; transport degraded");
                    return;
                }
            }
        }
    }
}
