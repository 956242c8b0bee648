//! One signed-in user's sync stack, wired from a [`SyncConfig`].

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::client::{ApiClient, AuthProvider};
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::error::{ConnectionError, Result};
use crate::services::{LocationService, MessagingService, NotificationService, ServiceContext};
use crate::store::{LocalStore, SqliteStore};
use crate::sync::{spawn_tombstone_gc, ReconciliationEngine};
use crate::transport::{ApiPollSource, Connected, EventTransport, TransportSubscription};

const GC_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Store, engine, client, transport and services for one user.
///
/// Must be opened inside a Tokio runtime. Dropping the session stops the
/// transport and the tombstone GC task.
pub struct SyncSession {
    engine: Arc<ReconciliationEngine>,
    client: Arc<ApiClient>,
    transport: EventTransport,
    notifications: NotificationService,
    locations: LocationService,
    messaging: MessagingService,
    bindings: Vec<TransportSubscription>,
    gc: JoinHandle<()>,
}

impl SyncSession {
    pub fn open(
        config: &SyncConfig,
        auth: Arc<dyn AuthProvider>,
        user_id: impl Into<String>,
    ) -> Result<Self> {
        Self::open_with_clock(config, auth, Arc::new(SystemClock::new()), user_id)
    }

    pub fn open_with_clock(
        config: &SyncConfig,
        auth: Arc<dyn AuthProvider>,
        clock: Arc<dyn Clock>,
        user_id: impl Into<String>,
    ) -> Result<Self> {
        let store: Arc<dyn LocalStore> = match &config.db_path {
            Some(path) => Arc::new(SqliteStore::open_or_recover(path)?),
            None => {
                tracing::info!("Running with an in-memory local store");
                Arc::new(SqliteStore::open_in_memory()?)
            }
        };
        let engine = Arc::new(ReconciliationEngine::new(store, Arc::clone(&clock)));
        let client = Arc::new(ApiClient::new(config, auth)?);
        let transport = EventTransport::new(
            config,
            engine.diagnostics().clone(),
            Some(Arc::new(ApiPollSource::new(Arc::clone(&client)))),
        );

        let ctx = ServiceContext::new(Arc::clone(&engine), Arc::clone(&client), clock, user_id);
        let notifications = NotificationService::new(ctx.clone());
        let locations = LocationService::new(ctx.clone());
        let messaging = MessagingService::new(ctx);

        let mut bindings = notifications.bind(&transport);
        bindings.extend(messaging.bind(&transport));
        bindings.push(locations.bind(&transport));

        let gc = spawn_tombstone_gc(Arc::clone(&engine), GC_INTERVAL, config.tombstone_retention);

        Ok(Self {
            engine,
            client,
            transport,
            notifications,
            locations,
            messaging,
            bindings,
            gc,
        })
    }

    /// Connect the transport with the client's current token
    pub async fn connect(&self) -> std::result::Result<Connected, ConnectionError> {
        let token = self.client.auth().token();
        self.transport.connect(token.as_deref()).await
    }

    /// Stop receiving pushes; local reads keep working
    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    pub const fn engine(&self) -> &Arc<ReconciliationEngine> {
        &self.engine
    }

    pub const fn transport(&self) -> &EventTransport {
        &self.transport
    }

    pub const fn notifications(&self) -> &NotificationService {
        &self.notifications
    }

    pub const fn locations(&self) -> &LocationService {
        &self.locations
    }

    pub const fn messaging(&self) -> &MessagingService {
        &self.messaging
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        for binding in &self.bindings {
            binding.unsubscribe();
        }
        self.gc.abort();
    }
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("client", &self.client)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::client::StaticToken;
    use crate::models::{Collection, Coordinates, Record};
    use crate::transport::{ChannelEvent, TransportState};

    #[tokio::test]
    async fn session_persists_to_configured_path() {
        let dir = tempdir().unwrap();
        let config = SyncConfig::new("http://127.0.0.1:9").with_db_path(dir.path().join("petsit.db"));

        {
            let session = SyncSession::open(&config, Arc::new(StaticToken::anonymous()), "7").unwrap();
            let record = Record::remote("n-1", "7", json!({
                "kind": "system", "event": "system", "title": "Hi", "message": "Welcome"
            }), 10);
            session.engine().reconcile(Collection::Notifications, record).unwrap();
        }

        let session = SyncSession::open(&config, Arc::new(StaticToken::anonymous()), "7").unwrap();
        assert_eq!(session.notifications().unread_count().unwrap(), 1);
        assert_eq!(session.transport().state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn bound_services_receive_delivered_events() {
        let session = SyncSession::open(
            &SyncConfig::new("http://127.0.0.1:9"),
            Arc::new(StaticToken::anonymous()),
            "7",
        )
        .unwrap();

        session.transport().deliver(ChannelEvent::new(
            "notifications",
            "record",
            json!({"id": "n-2", "owner_scope": "7", "updated_at": 20, "payload": {
                "kind": "system", "event": "system", "title": "Hi", "message": "Pushed"
            }}),
        ));
        assert_eq!(session.notifications().list().unwrap().len(), 1);

        session.transport().deliver(ChannelEvent::new(
            "sitter_locations",
            "record",
            json!({"id": "s-4", "owner_scope": "s-4", "updated_at": 30, "payload": {
                "latitude": 14.5995, "longitude": 120.9842, "online": true
            }}),
        ));
        let center = Coordinates::new(14.5995, 120.9842);
        assert_eq!(session.locations().nearby(center, 1.0).unwrap().len(), 1);
    }
}
