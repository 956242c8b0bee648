//! Event transport: live WebSocket push with a polling fallback.
//!
//! Handlers subscribe to named channels. A frame is delivered to handlers
//! registered under its channel name and under its event name. Duplicate and
//! stale record events are dropped before any handler runs.

mod dedupe;
mod frame;
mod live;
mod polling;
mod state;

pub use dedupe::{Deduper, Marks};
pub use frame::{decode, subscribe_frame, ChannelEvent, Frame};
pub use polling::{ApiPollSource, PollSource};
pub use state::{Connected, ConnectionMode, TransportState};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::error::{ConnectionError, StorageError};
use crate::sync::{Diagnostic, Diagnostics};
use live::LiveConnection;

/// Channel handler. An error means the event was not stored, so its record
/// versions stay eligible for redelivery.
pub type EventHandler = Arc<dyn Fn(&ChannelEvent) -> Result<(), StorageError> + Send + Sync>;

struct HandlerEntry {
    channel: String,
    handler: EventHandler,
    live: Arc<AtomicBool>,
}

#[derive(Default)]
struct Tasks {
    live: Option<LiveConnection>,
    poll: Option<JoinHandle<()>>,
}

pub(crate) struct Shared {
    push_url: Option<String>,
    poll_source: Option<Arc<dyn PollSource>>,
    poll_interval: Duration,
    max_poll_failures: u32,
    handlers: Mutex<BTreeMap<u64, HandlerEntry>>,
    next_id: AtomicU64,
    dedupe: Deduper,
    state: watch::Sender<TransportState>,
    tasks: Mutex<Tasks>,
    diagnostics: Diagnostics,
}

impl Shared {
    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handlers(&self) -> MutexGuard<'_, BTreeMap<u64, HandlerEntry>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: TransportState) -> TransportState {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Transport state changed");
        }
        previous
    }

    fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers()
            .values()
            .map(|entry| entry.channel.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    fn live_is_open(&self) -> bool {
        self.tasks().live.as_ref().is_some_and(LiveConnection::is_open)
    }

    fn poll_is_running(&self) -> bool {
        self.tasks()
            .poll
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Deliver an event to every live handler on its channel or event name,
    /// in registration order, without holding the handler lock. When a
    /// handler fails, the event's versions are released from dedupe.
    fn dispatch(&self, event: ChannelEvent) {
        let Some((event, marks)) = self.dedupe.admit(event) else {
            tracing::debug!("Dropped duplicate or stale push event");
            return;
        };

        let targets: Vec<(Arc<AtomicBool>, EventHandler)> = self
            .handlers()
            .values()
            .filter(|entry| entry.channel == event.channel || entry.channel == event.event)
            .map(|entry| (Arc::clone(&entry.live), Arc::clone(&entry.handler)))
            .collect();

        if targets.is_empty() {
            tracing::trace!(channel = %event.channel, event = %event.event, "No handler for push event");
        }
        let mut failed = false;
        for (live, handler) in targets {
            if !live.load(Ordering::Acquire) {
                continue;
            }
            if let Err(error) = handler(&event) {
                tracing::warn!(
                    channel = %event.channel,
                    event = %event.event,
                    %error,
                    "Push handler failed to store event"
                );
                failed = true;
            }
        }
        if failed {
            self.dedupe.release(marks);
        }
    }

    fn start_polling(self: &Arc<Self>, announce_recovery: bool) -> bool {
        let Some(source) = self.poll_source.clone() else {
            return false;
        };
        let handle = tokio::spawn(polling::run(Arc::clone(self), source, announce_recovery));
        if let Some(previous) = self.tasks().poll.replace(handle) {
            previous.abort();
        }
        self.set_state(TransportState::Polling);
        tracing::info!(interval = ?self.poll_interval, "Polling for updates");
        true
    }

    fn on_live_closed(self: &Arc<Self>, id: u64, reason: &str) {
        let closed = {
            let mut tasks = self.tasks();
            if tasks.live.as_ref().is_some_and(|connection| connection.id == id) {
                tasks.live.take()
            } else {
                None
            }
        };
        let Some(connection) = closed else {
            return;
        };
        connection.abort_writer();
        tracing::warn!(%reason, "Live push connection dropped");

        if !self.start_polling(false) {
            self.set_state(TransportState::Disconnected);
        }
    }

    fn fall_back(self: &Arc<Self>, error: ConnectionError) -> Result<Connected, ConnectionError> {
        if self.poll_source.is_none() {
            self.set_state(TransportState::Disconnected);
            return Err(error);
        }
        tracing::warn!(%error, "Live push unavailable; falling back to polling");
        let polling = self.poll_is_running() && *self.state.borrow() == TransportState::Polling;
        if !polling {
            self.start_polling(false);
        }
        Ok(Connected {
            mode: ConnectionMode::Polling,
        })
    }

    fn shutdown(&self) -> bool {
        let (live, poll) = {
            let mut tasks = self.tasks();
            (tasks.live.take(), tasks.poll.take())
        };
        let was_running = live.is_some() || poll.is_some();
        if let Some(connection) = live {
            connection.abort();
        }
        if let Some(handle) = poll {
            handle.abort();
        }
        self.dedupe.clear();
        self.set_state(TransportState::Disconnected);
        was_running
    }
}

/// Push transport owned by the embedding app.
///
/// Dropping the transport stops its tasks.
pub struct EventTransport {
    shared: Arc<Shared>,
}

impl EventTransport {
    pub fn new(
        config: &SyncConfig,
        diagnostics: Diagnostics,
        poll_source: Option<Arc<dyn PollSource>>,
    ) -> Self {
        let (state, _) = watch::channel(TransportState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                push_url: config.push_url.clone(),
                poll_source,
                poll_interval: config.poll_interval,
                max_poll_failures: config.max_poll_failures.max(1),
                handlers: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                dedupe: Deduper::new(),
                state,
                tasks: Mutex::new(Tasks::default()),
                diagnostics,
            }),
        }
    }

    pub fn state(&self) -> TransportState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.shared.state.subscribe()
    }

    /// Open the live connection, or fall back to polling when it cannot be
    /// established and a poll source exists. Calling again while live is a
    /// no-op; calling while polling retries the live connection.
    pub async fn connect(&self, auth_token: Option<&str>) -> Result<Connected, ConnectionError> {
        if self.shared.live_is_open() {
            return Ok(Connected {
                mode: ConnectionMode::Live,
            });
        }
        let Some(push_url) = self.shared.push_url.clone() else {
            return self.shared.fall_back(ConnectionError::Unreachable(
                "no push URL configured".to_string(),
            ));
        };

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        match live::open(&self.shared, id, &push_url, auth_token).await {
            Ok((connection, ready)) => {
                {
                    let mut tasks = self.shared.tasks();
                    if let Some(poll) = tasks.poll.take() {
                        poll.abort();
                    }
                    if let Some(previous) = tasks.live.replace(connection) {
                        previous.abort();
                    }
                }
                let _ = ready.send(());
                let previous = self.shared.set_state(TransportState::Live);
                if matches!(
                    previous,
                    TransportState::Polling | TransportState::Degraded { .. }
                ) {
                    self.shared.diagnostics.publish(Diagnostic::TransportRecovered);
                }
                tracing::info!(url = %push_url, "Live push connected");
                Ok(Connected {
                    mode: ConnectionMode::Live,
                })
            }
            Err(error) => self.shared.fall_back(error),
        }
    }

    /// Stop the live connection and polling. Safe to call at any time.
    pub fn disconnect(&self) {
        if self.shared.shutdown() {
            tracing::info!("Transport disconnected");
        }
    }

    /// Restart polling after it paused in the degraded state.
    ///
    /// Returns `false` when no poll source is configured or live push is up.
    pub fn resume_polling(&self) -> bool {
        if self.shared.live_is_open() {
            return false;
        }
        let degraded = matches!(self.state(), TransportState::Degraded { .. });
        self.shared.start_polling(degraded)
    }

    /// Call `handler` once per event received on `channel`.
    pub fn subscribe(
        &self,
        channel: impl Into<String>,
        handler: impl Fn(&ChannelEvent) -> Result<(), StorageError> + Send + Sync + 'static,
    ) -> TransportSubscription {
        let channel = channel.into();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let live = Arc::new(AtomicBool::new(true));

        let is_new_channel = {
            let mut handlers = self.shared.handlers();
            let is_new = !handlers.values().any(|entry| entry.channel == channel);
            handlers.insert(
                id,
                HandlerEntry {
                    channel: channel.clone(),
                    handler: Arc::new(handler),
                    live: Arc::clone(&live),
                },
            );
            is_new
        };
        if is_new_channel {
            if let Some(connection) = self.shared.tasks().live.as_ref() {
                connection.send_subscribe(&channel);
            }
        }

        TransportSubscription {
            id,
            live,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Deliver an event obtained out of band (e.g. from a REST response)
    /// through the same dedupe and fan-out path as pushed events.
    pub fn deliver(&self, event: ChannelEvent) {
        self.shared.dispatch(event);
    }
}

impl Drop for EventTransport {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl std::fmt::Debug for EventTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTransport")
            .field("push_url", &self.shared.push_url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Handle for one channel handler
pub struct TransportSubscription {
    id: u64,
    live: Arc<AtomicBool>,
    shared: Weak<Shared>,
}

impl TransportSubscription {
    /// Stop delivery immediately
    pub fn unsubscribe(&self) {
        self.live.store(false, Ordering::Release);
        if let Some(shared) = self.shared.upgrade() {
            shared.handlers().remove(&self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}
